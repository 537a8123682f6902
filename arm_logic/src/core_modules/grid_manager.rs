// THEORY:
// The `GridManager` turns a stream of frames into a single number: how much the scene
// is moving right now. It is the sensor behind motion-triggered events.
//
// Key architectural principles:
// 1.  **Orchestration**: It owns a 2D grid of `SmartChunk`s and, for every frame, slices
//     the image into cells, averages each cell's luminance and feeds it to that cell's
//     chunk. It analyses nothing itself.
// 2.  **Spatial Pooling**: Averaging a cell cancels single-pixel sensor noise before any
//     temporal reasoning happens.
// 3.  **Aggregation**: The per-frame motion level is the mean luminance delta over moving
//     cells, weighted by the fraction of the grid that is moving. A short history of
//     levels is averaged so one noisy frame cannot fire an event by itself.
// 4.  **Self-Healing Geometry**: A frame of a different size rebuilds the grid rather
//     than indexing out of bounds.

use crate::core_modules::smart_chunk::{ChunkStatus, SmartChunk};
use image::GrayImage;
use std::collections::VecDeque;

const MOTION_HISTORY_LENGTH: usize = 5;

/// Summary of one processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionReport {
    /// Instantaneous motion of this frame.
    pub frame_level: f64,
    /// Motion level averaged over recent frames.
    pub level: f64,
    pub moving_chunks: usize,
    pub total_chunks: usize,
}

/// Manages the grid of `SmartChunk`s for scene-wide motion detection.
pub struct GridManager {
    image_width: u32,
    image_height: u32,
    grid_width: u32,
    grid_height: u32,
    chunk_size: u32,
    smart_chunks: Vec<SmartChunk>,
    level_history: VecDeque<f64>,
}

impl GridManager {
    pub fn new(image_width: u32, image_height: u32, chunk_size: u32) -> Self {
        let chunk_size = chunk_size.max(1);
        let grid_width = image_width / chunk_size;
        let grid_height = image_height / chunk_size;
        let smart_chunks = (0..grid_width * grid_height)
            .map(|i| SmartChunk::new(i % grid_width, i / grid_width))
            .collect();
        Self {
            image_width,
            image_height,
            grid_width,
            grid_height,
            chunk_size,
            smart_chunks,
            level_history: VecDeque::with_capacity(MOTION_HISTORY_LENGTH + 1),
        }
    }

    /// Processes a frame and returns the updated motion summary.
    pub fn process_frame(&mut self, frame: &GrayImage) -> MotionReport {
        if frame.dimensions() != (self.image_width, self.image_height) {
            *self = GridManager::new(frame.width(), frame.height(), self.chunk_size);
        }

        let mut moving_chunks = 0;
        let mut moving_delta_sum = 0.0;
        for chunk in self.smart_chunks.iter_mut() {
            let luminance = average_luminance(frame, chunk.chunk_x, chunk.chunk_y, self.chunk_size);
            chunk.update(luminance);
            if let ChunkStatus::Moving(delta) = chunk.status {
                moving_chunks += 1;
                moving_delta_sum += delta;
            }
        }

        let total_chunks = self.smart_chunks.len();
        let frame_level = if moving_chunks == 0 || total_chunks == 0 {
            0.0
        } else {
            let coverage = moving_chunks as f64 / total_chunks as f64;
            (moving_delta_sum / moving_chunks as f64) * coverage.sqrt()
        };

        self.level_history.push_back(frame_level);
        if self.level_history.len() > MOTION_HISTORY_LENGTH {
            self.level_history.pop_front();
        }

        MotionReport {
            frame_level,
            level: self.motion_level(),
            moving_chunks,
            total_chunks,
        }
    }

    /// Smoothed motion level over the recent history. Zero before any frame.
    pub fn motion_level(&self) -> f64 {
        if self.level_history.is_empty() {
            return 0.0;
        }
        self.level_history.iter().sum::<f64>() / self.level_history.len() as f64
    }

    pub fn grid_dimensions(&self) -> (u32, u32) {
        (self.grid_width, self.grid_height)
    }
}

fn average_luminance(frame: &GrayImage, chunk_x: u32, chunk_y: u32, chunk_size: u32) -> f64 {
    let (x0, y0) = (chunk_x * chunk_size, chunk_y * chunk_size);
    let mut sum = 0u64;
    for y in y0..y0 + chunk_size {
        for x in x0..x0 + chunk_size {
            sum += frame.get_pixel(x, y).0[0] as u64;
        }
    }
    sum as f64 / (chunk_size * chunk_size) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn uniform(width: u32, height: u32, value: u8) -> GrayImage {
        ImageBuffer::from_pixel(width, height, Luma([value]))
    }

    #[test]
    fn still_scene_has_no_motion() {
        let mut grid = GridManager::new(64, 48, 16);
        assert_eq!(grid.grid_dimensions(), (4, 3));
        let frame = uniform(64, 48, 80);
        for _ in 0..10 {
            grid.process_frame(&frame);
        }
        assert_eq!(grid.motion_level(), 0.0);
    }

    #[test]
    fn moving_square_raises_motion_level() {
        let mut grid = GridManager::new(64, 64, 16);
        for _ in 0..8 {
            grid.process_frame(&uniform(64, 64, 50));
        }
        let mut report = None;
        for step in 0..4u32 {
            let frame: GrayImage = ImageBuffer::from_fn(64, 64, |x, y| {
                let left = step * 16;
                if x >= left && x < left + 16 && y < 32 { Luma([250u8]) } else { Luma([50u8]) }
            });
            report = Some(grid.process_frame(&frame));
        }
        let report = report.unwrap();
        assert!(report.moving_chunks > 0);
        assert!(report.level > 0.0);
    }

    #[test]
    fn resized_frame_rebuilds_grid() {
        let mut grid = GridManager::new(32, 32, 16);
        let report = grid.process_frame(&uniform(64, 32, 10));
        assert_eq!(report.total_chunks, 8);
    }
}
