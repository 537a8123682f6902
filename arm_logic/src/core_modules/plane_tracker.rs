// THEORY:
// The `PlaneTracker` is the recognition engine for flat, textured objects. It owns a
// set of registered targets (a reference image region plus its features) and, for any
// frame, answers "which targets are visible, and where is each one's outline?"
//
// Key architectural principles:
// 1.  **Registration**: `add_target` detects features on the full reference image and
//     keeps only those inside the user's rectangle. A target with no features is legal;
//     it simply never matches.
// 2.  **Matching**: Frame descriptors are matched against the pooled descriptors of every
//     target with a brute-force two-nearest-neighbour search, parallelised across CPU
//     cores for large frames. Lowe's ratio test discards ambiguous matches.
// 3.  **Verification**: Surviving matches are grouped per target; each group with enough
//     support is passed to RANSAC. Only targets whose homography keeps enough inliers are
//     reported, with their reference rectangle projected into the frame.
// 4.  **Omission, not failure**: Nothing here returns an error. An unseen target is just
//     absent from the result list, which is ordered most-confident first.

use crate::core_modules::features::{Descriptor, Feature, FeatureDetector};
use crate::core_modules::geometry::{Point2, Quad, Rect};
use crate::core_modules::homography::{Homography, RansacParams, find_homography};
use image::GrayImage;
use std::time::Instant;

pub const MIN_MATCH_COUNT: usize = 10;
const PARALLEL_MATCH_THRESHOLD: usize = 256;

/// Tunable behaviour of the tracker.
#[derive(Debug, Clone)]
pub struct TrackerParams {
    pub max_features: usize,
    pub fast_threshold: u8,
    /// Minimum features, matches and RANSAC inliers a detection needs.
    pub min_match_count: usize,
    /// A match survives only if its distance is below `ratio * second_best`.
    pub ratio: f64,
    pub ransac: RansacParams,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_features: 500,
            fast_threshold: 20,
            min_match_count: MIN_MATCH_COUNT,
            ratio: 0.75,
            ransac: RansacParams::default(),
        }
    }
}

/// A registered planar target.
#[derive(Debug, Clone)]
pub struct PlanarTarget {
    /// Caller-provided identity, typically the trackable's object ID.
    pub id: String,
    /// Reference rectangle in the target image.
    pub rect: Rect,
    /// Features detected inside `rect`.
    pub features: Vec<Feature>,
}

/// One frame's detection of a registered target.
#[derive(Debug, Clone)]
pub struct TrackedTarget {
    pub target_id: String,
    /// Inlier points in the reference image.
    pub p0: Vec<Point2>,
    /// The corresponding inlier points in the frame.
    pub p1: Vec<Point2>,
    pub homography: Homography,
    /// The reference rectangle projected into the frame.
    pub quad: Quad,
    /// The reference rectangle's centre projected into the frame.
    pub center: Point2,
    /// Sequence number of the frame this detection came from. Stamped by the caller.
    pub frame_id: u64,
    pub detected_at: Instant,
}

impl TrackedTarget {
    /// Number of RANSAC inliers, the confidence measure used by every query.
    pub fn match_count(&self) -> usize {
        self.p0.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct Match {
    query: usize,
    target: usize,
    train: usize,
}

pub struct PlaneTracker {
    detector: FeatureDetector,
    params: TrackerParams,
    targets: Vec<PlanarTarget>,
}

impl PlaneTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            detector: FeatureDetector::new(params.max_features, params.fast_threshold),
            params,
            targets: Vec::new(),
        }
    }

    pub fn targets(&self) -> &[PlanarTarget] {
        &self.targets
    }

    /// Registers a new target and returns how many features it kept.
    pub fn add_target(&mut self, image: &GrayImage, rect: Rect, id: impl Into<String>) -> usize {
        let features: Vec<Feature> = self
            .detector
            .detect(image)
            .into_iter()
            .filter(|f| rect.contains(&f.point))
            .collect();
        let kept = features.len();
        let id = id.into();
        tracing::debug!(target_id = %id, features = kept, "registered planar target");
        self.targets.push(PlanarTarget { id, rect, features });
        kept
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }

    /// Finds every registered target in the frame, most inliers first.
    pub fn track(&self, frame: &GrayImage) -> Vec<TrackedTarget> {
        if self.targets.is_empty() {
            return Vec::new();
        }
        let min_count = self.params.min_match_count;
        let frame_features = self.detector.detect(frame);
        if frame_features.len() < min_count {
            return Vec::new();
        }

        let matches = self.match_features(&frame_features);
        if matches.len() < min_count {
            return Vec::new();
        }

        let mut by_target: Vec<Vec<Match>> = vec![Vec::new(); self.targets.len()];
        for m in matches {
            by_target[m.target].push(m);
        }

        let detected_at = Instant::now();
        let mut tracked: Vec<TrackedTarget> = by_target
            .iter()
            .enumerate()
            .filter(|(_, group)| group.len() >= min_count)
            .filter_map(|(index, group)| {
                let target = &self.targets[index];
                let p0: Vec<Point2> = group.iter().map(|m| target.features[m.train].point).collect();
                let p1: Vec<Point2> = group.iter().map(|m| frame_features[m.query].point).collect();
                let fit = find_homography(&p0, &p1, &self.params.ransac)?;
                if fit.inlier_count() < min_count {
                    return None;
                }
                let quad_points: Vec<Point2> = target
                    .rect
                    .corners()
                    .iter()
                    .map(|c| fit.homography.project(c))
                    .collect::<Option<Vec<_>>>()?;
                let center = fit.homography.project(&target.rect.center())?;
                let (p0, p1) = p0
                    .into_iter()
                    .zip(p1)
                    .zip(fit.inliers.iter())
                    .filter(|(_, inlier)| **inlier)
                    .map(|(pair, _)| pair)
                    .unzip();
                Some(TrackedTarget {
                    target_id: target.id.clone(),
                    p0,
                    p1,
                    homography: fit.homography,
                    quad: [quad_points[0], quad_points[1], quad_points[2], quad_points[3]],
                    center,
                    frame_id: 0,
                    detected_at,
                })
            })
            .collect();

        tracked.sort_by(|a, b| b.match_count().cmp(&a.match_count()));
        tracked
    }

    fn match_features(&self, frame_features: &[Feature]) -> Vec<Match> {
        let pool: Vec<(usize, usize, Descriptor)> = self
            .targets
            .iter()
            .enumerate()
            .flat_map(|(t, target)| {
                target
                    .features
                    .iter()
                    .enumerate()
                    .map(move |(i, f)| (t, i, f.descriptor))
            })
            .collect();
        if pool.len() < 2 {
            return Vec::new();
        }

        let ratio = self.params.ratio;
        let match_range = |offset: usize, slice: &[Feature]| -> Vec<Match> {
            slice
                .iter()
                .enumerate()
                .filter_map(|(i, f)| best_match(&f.descriptor, &pool, ratio).map(|(target, train)| Match {
                    query: offset + i,
                    target,
                    train,
                }))
                .collect()
        };

        let workers = num_cpus::get().max(1);
        if frame_features.len() < PARALLEL_MATCH_THRESHOLD || workers == 1 {
            return match_range(0, frame_features);
        }

        let chunk_size = frame_features.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = frame_features
                .chunks(chunk_size)
                .enumerate()
                .map(|(n, slice)| {
                    let match_range = &match_range;
                    scope.spawn(move || match_range(n * chunk_size, slice))
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_default())
                .collect()
        })
    }
}

/// Two-nearest-neighbour search with the ratio test. Returns `(target, train)` indices.
fn best_match(query: &Descriptor, pool: &[(usize, usize, Descriptor)], ratio: f64) -> Option<(usize, usize)> {
    let mut best: Option<(u32, usize)> = None;
    let mut second = u32::MAX;
    for (index, (_, _, descriptor)) in pool.iter().enumerate() {
        let distance = query.hamming(descriptor);
        match best {
            Some((best_distance, _)) if distance >= best_distance => {
                second = second.min(distance);
            }
            Some((best_distance, _)) => {
                second = best_distance;
                best = Some((distance, index));
            }
            None => best = Some((distance, index)),
        }
    }
    let (distance, index) = best?;
    if second == u32::MAX || (distance as f64) >= ratio * second as f64 {
        return None;
    }
    let (target, train, _) = pool[index];
    Some((target, train))
}
