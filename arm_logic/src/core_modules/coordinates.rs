// THEORY:
// The `coordinates` module bridges image space and robot space. Calibration produces a
// list of point pairs: where the robot's marker appeared in the camera frame (pixels)
// and where the robot actually was (cm). From those pairs we fit an affine map by
// least squares, and use it to turn a tracked object's pixel centre into a position
// the arm can move to, or the reverse.
//
// The fit is recomputed per call; calibration sets are tens of pairs, so this is cheap
// and keeps the module stateless.

use crate::core_modules::geometry::Point2;
use crate::core_modules::homography::solve_linear;
use serde::{Deserialize, Serialize};

/// One calibration sample: the marker's pixel position and the robot's position.
/// Saved as a `[[u, v], [x, y, z]]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "([f64; 2], [f64; 3])", into = "([f64; 2], [f64; 3])")]
pub struct PointPair {
    pub camera: [f64; 2],
    pub robot: [f64; 3],
}

impl From<([f64; 2], [f64; 3])> for PointPair {
    fn from((camera, robot): ([f64; 2], [f64; 3])) -> Self {
        Self { camera, robot }
    }
}

impl From<PointPair> for ([f64; 2], [f64; 3]) {
    fn from(pair: PointPair) -> Self {
        (pair.camera, pair.robot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    CameraToRobot,
    RobotToCamera,
}

/// Maps a point through the calibration. Camera-to-robot takes `(u, v)` and yields
/// `[x, y, z]`; robot-to-camera takes `(x, y)` and yields `[u, v, 0]`.
/// `None` when the calibration is too small or degenerate to fit.
pub fn position_transform(
    point: Point2,
    pairs: &[PointPair],
    direction: TransformDirection,
) -> Option<[f64; 3]> {
    let (inputs, outputs, output_dims): (Vec<[f64; 2]>, Vec<[f64; 3]>, usize) = match direction {
        TransformDirection::CameraToRobot => (
            pairs.iter().map(|p| p.camera).collect(),
            pairs.iter().map(|p| p.robot).collect(),
            3,
        ),
        TransformDirection::RobotToCamera => (
            pairs.iter().map(|p| [p.robot[0], p.robot[1]]).collect(),
            pairs.iter().map(|p| [p.camera[0], p.camera[1], 0.0]).collect(),
            2,
        ),
    };
    if inputs.len() < 3 {
        return None;
    }

    // Least squares on [a, b, c] per output: out = a*in0 + b*in1 + c.
    let mut ata = [[0.0f64; 3]; 3];
    for input in &inputs {
        let row = [input[0], input[1], 1.0];
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += row[i] * row[j];
            }
        }
    }

    let mut result = [0.0; 3];
    for (dim, slot) in result.iter_mut().enumerate().take(output_dims) {
        let mut atb = [0.0f64; 3];
        for (input, output) in inputs.iter().zip(outputs.iter()) {
            let row = [input[0], input[1], 1.0];
            for i in 0..3 {
                atb[i] += row[i] * output[dim];
            }
        }
        let [a, b, c] = solve_linear(ata, atb)?;
        *slot = a * point.x + b * point.y + c;
    }
    Some(result)
}
