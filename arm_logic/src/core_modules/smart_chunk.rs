// THEORY:
// The `SmartChunk` is the per-region memory of the motion detector. It watches one
// fixed cell of the image grid, remembers how bright that cell has been over the last
// few frames, and classifies each new frame's change as noise or real movement.
//
// Key architectural principles:
// 1.  **Stateful Memory**: A chunk keeps a sliding window of its frame-to-frame
//     luminance deltas, so the statistics it learns are specific to its patch of the
//     world (a flickering screen in one corner does not desensitise the rest).
// 2.  **Adaptive Threshold**: A delta counts as movement when it clears both a fixed
//     noise floor and the chunk's own learned spread (mean + k standard deviations).
// 3.  **Temporal Focus**: A chunk knows *when* its region changes, never *what* changed
//     or where its neighbours are. Aggregation happens in the `GridManager`.

use std::collections::VecDeque;

const HISTORY_WINDOW_SIZE: usize = 20;
const LEARNING_FRAMES: usize = 3;
const NOISE_FLOOR: f64 = 2.0;
const MOVEMENT_STD_DEVS: f64 = 3.0;

/// Classification of a chunk's latest change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkStatus {
    /// Not enough history yet to judge.
    Learning,
    /// Change is within sensor noise or the chunk's learned variation.
    Stable,
    /// Change is real movement; carries the absolute luminance delta.
    Moving(f64),
}

/// Luminance-change analyser for one cell of the grid.
pub struct SmartChunk {
    /// The column index of this chunk in the grid.
    pub chunk_x: u32,
    /// The row index of this chunk in the grid.
    pub chunk_y: u32,
    last_luminance: Option<f64>,
    delta_history: VecDeque<f64>,
    /// Learned mean of the luminance delta.
    pub mean_delta: f64,
    /// Learned standard deviation of the luminance delta.
    pub std_dev_delta: f64,
    pub status: ChunkStatus,
}

impl SmartChunk {
    pub fn new(chunk_x: u32, chunk_y: u32) -> Self {
        Self {
            chunk_x,
            chunk_y,
            last_luminance: None,
            delta_history: VecDeque::with_capacity(HISTORY_WINDOW_SIZE + 1),
            mean_delta: 0.0,
            std_dev_delta: 0.0,
            status: ChunkStatus::Learning,
        }
    }

    /// Feeds the chunk's average luminance for a new frame and returns the raw delta.
    pub fn update(&mut self, luminance: f64) -> f64 {
        let Some(previous) = self.last_luminance.replace(luminance) else {
            return 0.0;
        };
        let delta = (luminance - previous).abs();

        // Classify against the statistics learned *before* this frame.
        self.status = if self.delta_history.len() < LEARNING_FRAMES {
            ChunkStatus::Learning
        } else if delta > NOISE_FLOOR
            && delta > self.mean_delta + MOVEMENT_STD_DEVS * self.std_dev_delta.max(0.5)
        {
            ChunkStatus::Moving(delta)
        } else if delta > NOISE_FLOOR * 4.0 {
            // Large but habitual change, e.g. a region that has been moving for a while.
            ChunkStatus::Moving(delta)
        } else {
            ChunkStatus::Stable
        };

        self.delta_history.push_back(delta);
        if self.delta_history.len() > HISTORY_WINDOW_SIZE {
            self.delta_history.pop_front();
        }
        (self.mean_delta, self.std_dev_delta) = mean_and_std_dev(&self.delta_history);
        delta
    }

    pub fn is_moving(&self) -> bool {
        matches!(self.status, ChunkStatus::Moving(_))
    }
}

fn mean_and_std_dev(history: &VecDeque<f64>) -> (f64, f64) {
    let count = history.len() as f64;
    if count < 1.0 {
        return (0.0, 0.0);
    }
    let mean = history.iter().sum::<f64>() / count;
    let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_region_settles_to_stable() {
        let mut chunk = SmartChunk::new(0, 0);
        for _ in 0..10 {
            chunk.update(120.0);
        }
        assert_eq!(chunk.status, ChunkStatus::Stable);
        assert_eq!(chunk.mean_delta, 0.0);
    }

    #[test]
    fn sudden_change_is_reported_as_movement() {
        let mut chunk = SmartChunk::new(2, 3);
        for _ in 0..8 {
            chunk.update(100.0);
        }
        let delta = chunk.update(160.0);
        assert_eq!(delta, 60.0);
        assert_eq!(chunk.status, ChunkStatus::Moving(60.0));
    }

    #[test]
    fn first_frames_are_learning() {
        let mut chunk = SmartChunk::new(0, 0);
        assert_eq!(chunk.update(10.0), 0.0);
        chunk.update(200.0);
        assert_eq!(chunk.status, ChunkStatus::Learning);
    }
}
