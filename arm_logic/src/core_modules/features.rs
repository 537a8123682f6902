// THEORY:
// The `features` module is the lowest layer of the planar tracking engine. It turns a
// grayscale image into a sparse set of distinctive, repeatable points ("keypoints"),
// each paired with a compact binary fingerprint ("descriptor") of its neighbourhood.
//
// Key architectural principles:
// 1.  **Corner Detection (FAST-9)**: A pixel is a corner when nine contiguous pixels on
//     the 16-pixel Bresenham circle around it are all brighter, or all darker, than the
//     centre by more than a threshold. The corner score is the summed excess contrast,
//     used for non-maximum suppression and for keeping only the strongest responses.
// 2.  **Orientation**: Each keypoint gets an angle from the intensity centroid of its
//     local disk, so descriptors can be sampled in a rotation-normalised frame.
// 3.  **Binary Descriptors (steered BRIEF)**: 256 fixed point-pair intensity comparisons
//     on a lightly blurred copy of the image, rotated by the keypoint angle. The pattern
//     is generated once from a fixed seed and cached in a `OnceLock`, so every process
//     produces identical descriptors for identical input.
// 4.  **Stateless Utility**: Detection has no memory between frames. Matching and
//     geometry live in higher layers (`plane_tracker`, `homography`).

use crate::core_modules::geometry::Point2;
use image::{GrayImage, imageops};
use std::sync::OnceLock;

const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];
const ARC_LENGTH: usize = 9;
const DESCRIPTOR_PAIRS: usize = 256;
const PATTERN_EXTENT: i32 = 12;
// Rotated samples reach PATTERN_EXTENT * sqrt(2) from the keypoint.
const BORDER: u32 = 19;
const ORIENTATION_RADIUS: i32 = 7;
const DESCRIPTOR_BLUR_SIGMA: f32 = 2.0;
const PATTERN_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// A 256-bit binary descriptor. Distance between descriptors is Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// A detected keypoint together with its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub point: Point2,
    pub score: u32,
    /// Orientation in radians, from the intensity centroid.
    pub angle: f64,
    pub descriptor: Descriptor,
}

/// FAST corner detector with steered BRIEF descriptors.
#[derive(Debug, Clone)]
pub struct FeatureDetector {
    /// Upper bound on features kept per image, strongest first.
    pub max_features: usize,
    /// Minimum contrast between the centre and the arc pixels.
    pub threshold: u8,
}

impl Default for FeatureDetector {
    fn default() -> Self {
        Self {
            max_features: 500,
            threshold: 20,
        }
    }
}

impl FeatureDetector {
    pub fn new(max_features: usize, threshold: u8) -> Self {
        Self {
            max_features,
            threshold,
        }
    }

    /// Detects keypoints and computes their descriptors. Images too small to hold a
    /// descriptor patch yield no features.
    pub fn detect(&self, image: &GrayImage) -> Vec<Feature> {
        let (width, height) = image.dimensions();
        if width <= 2 * BORDER || height <= 2 * BORDER || self.max_features == 0 {
            return Vec::new();
        }

        // --- 1. Corner scores ---
        let mut scores = vec![0u32; (width * height) as usize];
        for y in BORDER..height - BORDER {
            for x in BORDER..width - BORDER {
                if let Some(score) = corner_score(image, x, y, self.threshold) {
                    scores[(y * width + x) as usize] = score;
                }
            }
        }

        // --- 2. Non-maximum suppression over the 8-neighbourhood ---
        let mut corners: Vec<(u32, u32, u32)> = Vec::new();
        for y in BORDER..height - BORDER {
            for x in BORDER..width - BORDER {
                let score = scores[(y * width + x) as usize];
                if score == 0 {
                    continue;
                }
                if is_local_maximum(&scores, width, x, y, score) {
                    corners.push((x, y, score));
                }
            }
        }
        corners.sort_by(|a, b| b.2.cmp(&a.2).then(a.1.cmp(&b.1)).then(a.0.cmp(&b.0)));
        corners.truncate(self.max_features);

        // --- 3. Orientation and descriptors ---
        let smoothed = imageops::blur(image, DESCRIPTOR_BLUR_SIGMA);
        corners
            .into_iter()
            .map(|(x, y, score)| {
                let angle = intensity_angle(image, x, y);
                Feature {
                    point: Point2::new(x as f64, y as f64),
                    score,
                    angle,
                    descriptor: describe(&smoothed, x, y, angle),
                }
            })
            .collect()
    }
}

fn luma(image: &GrayImage, x: i32, y: i32) -> i16 {
    image.get_pixel(x as u32, y as u32).0[0] as i16
}

/// Returns the FAST score of a pixel, or `None` if it is not a corner.
fn corner_score(image: &GrayImage, x: u32, y: u32, threshold: u8) -> Option<u32> {
    let (cx, cy) = (x as i32, y as i32);
    let centre = luma(image, cx, cy);
    let t = threshold as i16;

    let mut ring = [0i16; 16];
    for (slot, (dx, dy)) in ring.iter_mut().zip(CIRCLE.iter()) {
        *slot = luma(image, cx + dx, cy + dy);
    }

    let brighter = longest_circular_run(&ring, |v| v > centre + t);
    let darker = longest_circular_run(&ring, |v| v < centre - t);

    if brighter >= ARC_LENGTH {
        Some(
            ring.iter()
                .map(|&v| (v - centre - t).max(0) as u32)
                .sum(),
        )
    } else if darker >= ARC_LENGTH {
        Some(
            ring.iter()
                .map(|&v| (centre - v - t).max(0) as u32)
                .sum(),
        )
    } else {
        None
    }
}

fn longest_circular_run(ring: &[i16; 16], predicate: impl Fn(i16) -> bool) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for i in 0..ring.len() * 2 {
        if predicate(ring[i % ring.len()]) {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest.min(ring.len())
}

/// Equal scores are broken in favour of the pixel that comes first in scan order.
fn is_local_maximum(scores: &[u32], width: u32, x: u32, y: u32, score: u32) -> bool {
    for dy in -1i32..=1 {
        for dx in -1i32..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = (x as i32 + dx) as u32;
            let ny = (y as i32 + dy) as u32;
            let neighbour = scores[(ny * width + nx) as usize];
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if neighbour > score || (earlier && neighbour == score) {
                return false;
            }
        }
    }
    true
}

fn intensity_angle(image: &GrayImage, x: u32, y: u32) -> f64 {
    let (cx, cy) = (x as i32, y as i32);
    let mut m10 = 0.0;
    let mut m01 = 0.0;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > ORIENTATION_RADIUS * ORIENTATION_RADIUS {
                continue;
            }
            let value = luma(image, cx + dx, cy + dy) as f64;
            m10 += dx as f64 * value;
            m01 += dy as f64 * value;
        }
    }
    m01.atan2(m10)
}

fn describe(smoothed: &GrayImage, x: u32, y: u32, angle: f64) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let rotate = |(dx, dy): (i32, i32)| -> (i32, i32) {
        let rx = (cos * dx as f64 - sin * dy as f64).round() as i32;
        let ry = (sin * dx as f64 + cos * dy as f64).round() as i32;
        (x as i32 + rx, y as i32 + ry)
    };

    let mut bits = [0u64; 4];
    for (i, (a, b)) in sampling_pattern().iter().enumerate() {
        let (ax, ay) = rotate(*a);
        let (bx, by) = rotate(*b);
        if luma(smoothed, ax, ay) < luma(smoothed, bx, by) {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    Descriptor(bits)
}

type PointPair = ((i32, i32), (i32, i32));

/// The fixed BRIEF comparison pattern, concentrated towards the patch centre.
fn sampling_pattern() -> &'static [PointPair; DESCRIPTOR_PAIRS] {
    static PATTERN: OnceLock<[PointPair; DESCRIPTOR_PAIRS]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut state = PATTERN_SEED;
        let mut next_offset = || {
            // Sum of three uniforms in [-4, 4] approximates a Gaussian inside the patch.
            let mut total = 0;
            for _ in 0..3 {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                total += (state % 9) as i32 - 4;
            }
            total.clamp(-PATTERN_EXTENT, PATTERN_EXTENT)
        };
        let mut pattern = [((0, 0), (0, 0)); DESCRIPTOR_PAIRS];
        for pair in pattern.iter_mut() {
            let a = (next_offset(), next_offset());
            let mut b = (next_offset(), next_offset());
            if a == b {
                b = (-a.0, -a.1 + 1);
            }
            *pair = (a, b);
        }
        pattern
    })
}
