// THEORY:
// `core_modules` holds the self-contained engines the interpreter builds on: planar
// recognition (features, homography, plane tracker), scene motion (grid manager and
// smart chunks), camera/robot coordinate mapping and recorded motion paths. None of
// these know about programs, events or commands.

pub mod coordinates;
pub mod features;
pub mod geometry;
pub mod grid_manager;
pub mod homography;
pub mod motion_path;
pub mod plane_tracker;
pub mod smart_chunk;
