// THEORY:
// The `homography` module estimates the planar perspective transform that carries a
// target's reference-image points onto the live frame. It is the geometric heart of
// recognition: descriptor matches are only evidence, the homography is the verdict.
//
// Key architectural principles:
// 1.  **Normalized DLT**: Point sets are translated to their centroid and scaled so the
//     mean distance is sqrt(2) before solving, which keeps the 8x8 normal equations well
//     conditioned for frame-sized pixel coordinates. The last matrix entry is fixed at 1.
// 2.  **RANSAC**: Minimal four-point samples are drawn with a seeded xorshift generator,
//     each candidate is scored by counting correspondences whose reprojection error is
//     within the threshold, and the iteration budget shrinks adaptively as the inlier
//     ratio of the best model grows.
// 3.  **Refinement**: The winning model is refit on all of its inliers. A refit that
//     scores worse than the minimal-sample model is discarded.
// 4.  **No faults**: Degenerate geometry (collinear samples, singular systems) simply
//     produces no model. Callers treat `None` as "not found".

use crate::core_modules::geometry::Point2;

const SAMPLE_SIZE: usize = 4;
const CONFIDENCE: f64 = 0.995;
const PIVOT_EPSILON: f64 = 1e-12;
const COLLINEAR_EPSILON: f64 = 1e-3;

/// A 3x3 projective transform stored row-major, normalised so that `h[8] == 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(pub [f64; 9]);

impl Homography {
    pub const IDENTITY: Homography =
        Homography([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);

    /// Maps a point through the transform. Returns `None` for points sent to infinity.
    pub fn project(&self, p: &Point2) -> Option<Point2> {
        let h = &self.0;
        let w = h[6] * p.x + h[7] * p.y + h[8];
        if w.abs() < PIVOT_EPSILON {
            return None;
        }
        let x = (h[0] * p.x + h[1] * p.y + h[2]) / w;
        let y = (h[3] * p.x + h[4] * p.y + h[5]) / w;
        (x.is_finite() && y.is_finite()).then_some(Point2::new(x, y))
    }

    fn multiply(&self, other: &Homography) -> Homography {
        let (a, b) = (&self.0, &other.0);
        let mut out = [0.0; 9];
        for row in 0..3 {
            for col in 0..3 {
                out[row * 3 + col] = (0..3).map(|k| a[row * 3 + k] * b[k * 3 + col]).sum();
            }
        }
        Homography(out)
    }

    fn normalized(self) -> Option<Homography> {
        let scale = self.0[8];
        if scale.abs() < PIVOT_EPSILON {
            return None;
        }
        let mut h = self.0;
        h.iter_mut().for_each(|v| *v /= scale);
        h.iter().all(|v| v.is_finite()).then_some(Homography(h))
    }

    /// Least-squares fit over four or more correspondences.
    pub fn fit(src: &[Point2], dst: &[Point2]) -> Option<Homography> {
        if src.len() != dst.len() || src.len() < SAMPLE_SIZE {
            return None;
        }
        let (t_src, n_src) = conditioning(src)?;
        let (t_dst, n_dst) = conditioning(dst)?;

        // Normal equations (A^T A) h = A^T b with h[8] = 1.
        let mut ata = [[0.0f64; 8]; 8];
        let mut atb = [0.0f64; 8];
        for (p, q) in n_src.iter().zip(n_dst.iter()) {
            let rows = [
                ([p.x, p.y, 1.0, 0.0, 0.0, 0.0, -q.x * p.x, -q.x * p.y], q.x),
                ([0.0, 0.0, 0.0, p.x, p.y, 1.0, -q.y * p.x, -q.y * p.y], q.y),
            ];
            for (row, rhs) in rows.iter() {
                for i in 0..8 {
                    atb[i] += row[i] * rhs;
                    for j in 0..8 {
                        ata[i][j] += row[i] * row[j];
                    }
                }
            }
        }
        let solution = solve_linear(ata, atb)?;
        let mut h = [1.0; 9];
        h[..8].copy_from_slice(&solution);
        let normalized_model = Homography(h);

        // Undo conditioning: H = T_dst^-1 * Hn * T_src.
        let t_dst_inv = invert_conditioning(&t_dst);
        t_dst_inv
            .multiply(&normalized_model)
            .multiply(&t_src)
            .normalized()
    }
}

/// Result of a robust fit: the model plus a per-correspondence inlier mask.
#[derive(Debug, Clone)]
pub struct RansacFit {
    pub homography: Homography,
    pub inliers: Vec<bool>,
}

impl RansacFit {
    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|&&inlier| inlier).count()
    }
}

/// RANSAC settings. `threshold` is the maximum reprojection error in pixels.
#[derive(Debug, Clone, Copy)]
pub struct RansacParams {
    pub threshold: f64,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            max_iterations: 500,
            seed: 0x2545_F491_4F6C_DD1D,
        }
    }
}

/// Robustly estimates the homography mapping `src` onto `dst`.
pub fn find_homography(src: &[Point2], dst: &[Point2], params: &RansacParams) -> Option<RansacFit> {
    let n = src.len();
    if n != dst.len() || n < SAMPLE_SIZE {
        return None;
    }

    let mut rng = XorShift::new(params.seed ^ n as u64);
    let mut best: Option<RansacFit> = None;
    let mut best_count = 0;
    let mut budget = params.max_iterations;
    let mut iteration = 0;

    while iteration < budget {
        iteration += 1;
        let sample = rng.sample_distinct(n);
        let s_src: Vec<Point2> = sample.iter().map(|&i| src[i]).collect();
        let s_dst: Vec<Point2> = sample.iter().map(|&i| dst[i]).collect();
        if is_degenerate(&s_src) || is_degenerate(&s_dst) {
            continue;
        }
        let Some(model) = Homography::fit(&s_src, &s_dst) else {
            continue;
        };
        let inliers = inlier_mask(&model, src, dst, params.threshold);
        let count = inliers.iter().filter(|&&b| b).count();
        if count > best_count {
            best_count = count;
            best = Some(RansacFit {
                homography: model,
                inliers,
            });
            budget = budget.min(adaptive_budget(count, n).max(iteration));
        }
    }

    let mut best = best?;
    if best_count >= SAMPLE_SIZE {
        let (r_src, r_dst): (Vec<Point2>, Vec<Point2>) = src
            .iter()
            .zip(dst.iter())
            .zip(best.inliers.iter())
            .filter(|(_, inlier)| **inlier)
            .map(|((p, q), _)| (*p, *q))
            .unzip();
        if let Some(refined) = Homography::fit(&r_src, &r_dst) {
            let inliers = inlier_mask(&refined, src, dst, params.threshold);
            if inliers.iter().filter(|&&b| b).count() >= best_count {
                best = RansacFit {
                    homography: refined,
                    inliers,
                };
            }
        }
    }
    Some(best)
}

fn inlier_mask(model: &Homography, src: &[Point2], dst: &[Point2], threshold: f64) -> Vec<bool> {
    src.iter()
        .zip(dst.iter())
        .map(|(p, q)| {
            model
                .project(p)
                .map(|projected| projected.distance(q) <= threshold)
                .unwrap_or(false)
        })
        .collect()
}

fn adaptive_budget(inliers: usize, total: usize) -> usize {
    let ratio = inliers as f64 / total as f64;
    let all_inliers = ratio.powi(SAMPLE_SIZE as i32);
    if all_inliers >= 1.0 - f64::EPSILON {
        return 1;
    }
    let needed = (1.0 - CONFIDENCE).ln() / (1.0 - all_inliers).ln();
    if needed.is_finite() && needed > 0.0 {
        needed.ceil() as usize
    } else {
        usize::MAX
    }
}

/// Any three of the four sample points lying on a line makes the fit meaningless.
fn is_degenerate(points: &[Point2]) -> bool {
    for i in 0..points.len() {
        for j in i + 1..points.len() {
            for k in j + 1..points.len() {
                let (a, b, c) = (points[i], points[j], points[k]);
                let area = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
                if area.abs() < COLLINEAR_EPSILON {
                    return true;
                }
            }
        }
    }
    false
}

/// Returns the similarity transform that conditions a point set, and the conditioned points.
fn conditioning(points: &[Point2]) -> Option<(Homography, Vec<Point2>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_distance = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_distance < PIVOT_EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_distance;
    let transform = Homography([s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0]);
    let conditioned = points
        .iter()
        .map(|p| Point2::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    Some((transform, conditioned))
}

fn invert_conditioning(t: &Homography) -> Homography {
    let s = t.0[0];
    let (tx, ty) = (t.0[2], t.0[5]);
    Homography([1.0 / s, 0.0, -tx / s, 0.0, 1.0 / s, -ty / s, 0.0, 0.0, 1.0])
}

/// Gaussian elimination with partial pivoting. `None` when the system is singular.
pub(crate) fn solve_linear<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Option<[f64; N]> {
    for col in 0..N {
        let pivot = (col..N).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..N {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let tail: f64 = (row + 1..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x853C_49E6_748F_EA9B } else { seed })
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn sample_distinct(&mut self, n: usize) -> [usize; SAMPLE_SIZE] {
        let mut picked = [usize::MAX; SAMPLE_SIZE];
        let mut filled = 0;
        while filled < SAMPLE_SIZE {
            let candidate = (self.next_u64() % n as u64) as usize;
            if !picked[..filled].contains(&candidate) {
                picked[filled] = candidate;
                filled += 1;
            }
        }
        picked
    }
}
