//! Benchmark a reconstructed scene (point cloud and camera trajectory) against ground truth.
//!
//! The reconstruction is first roughly aligned to the ground truth from the camera trajectories
//! ([align]), the alignment is refined by multi-stage ICP on the point clouds ([refine]) and the
//! aligned clouds are scored with precision, recall and F-score at the scene's distance unit
//! ([score]). [evaluate] runs the whole pipeline for one scene, [dataset] for many.

extern crate nalgebra as na;
#[macro_use]
extern crate log;

pub mod align;
pub mod crop;
pub mod dataset;
pub mod densify;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod native;
pub mod pointset;
pub mod refine;
pub mod report;
pub mod score;
pub mod trajectory;

#[cfg(test)]
mod testing;

pub use crate::crop::CropVolume;
pub use crate::engine::GeometryEngine;
pub use crate::error::{Error, Result};
pub use crate::evaluate::{evaluate, Evaluation, EvaluationConfig, SceneInputs, ScenePaths};
pub use crate::native::NativeEngine;
pub use crate::pointset::PointSet;
pub use crate::score::ScoreReport;
pub use crate::trajectory::{CameraPose, Trajectory};
