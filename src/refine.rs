//! Multi-stage ICP refinement of an initial alignment.

use na::Matrix4;
use serde::{Deserialize, Serialize};

use crate::crop::CropVolume;
use crate::engine::{GeometryEngine, IcpCriteria};
use crate::error::{Error, Result};
use crate::pointset::PointSet;

/// How a stage thins out its point sets before ICP.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Downsample {
    /// Voxel grid with the given edge length.
    Voxel(f64),
    /// Keep every k-th point so that at most `max_points` remain. Sets already within budget are
    /// kept whole.
    Uniform { max_points: usize },
}

impl Downsample {
    pub fn apply<E: GeometryEngine + ?Sized>(&self, engine: &E, pcd: &PointSet) -> PointSet {
        match *self {
            Downsample::Voxel(size) => engine.voxel_down_sample(pcd, size),
            Downsample::Uniform { max_points } => {
                let every_k = if pcd.len() > max_points {
                    (pcd.len() as f64 / max_points as f64).ceil() as usize
                } else {
                    1
                };
                engine.uniform_down_sample(pcd, every_k)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegistrationStage {
    pub downsample: Downsample,
    /// ICP max correspondence distance.
    pub threshold: f64,
    pub max_iterations: usize,
}

impl RegistrationStage {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0) {
            return Err(Error::config(format!(
                "registration threshold must be positive, got {}",
                self.threshold
            )));
        }
        match self.downsample {
            Downsample::Voxel(size) if !(size > 0.0) => Err(Error::config(format!(
                "voxel size must be positive, got {}",
                size
            ))),
            Downsample::Uniform { max_points: 0 } => {
                Err(Error::config("uniform downsampling budget must be positive"))
            }
            _ => Ok(()),
        }
    }
}

/// Point budget of the final, uniformly downsampled stage.
pub const UNIFORM_POINT_BUDGET: usize = 4_000_000;

/// Coarse to fine schedule for scene unit `tau`.
pub fn canonical_schedule(tau: f64) -> Vec<RegistrationStage> {
    vec![
        RegistrationStage {
            downsample: Downsample::Voxel(tau),
            threshold: 80.0 * tau,
            max_iterations: 20,
        },
        RegistrationStage {
            downsample: Downsample::Voxel(tau / 2.0),
            threshold: 20.0 * tau,
            max_iterations: 20,
        },
        RegistrationStage {
            downsample: Downsample::Uniform {
                max_points: UNIFORM_POINT_BUDGET,
            },
            threshold: 2.0 * tau,
            max_iterations: 20,
        },
    ]
}

/// Improve `init` by running `schedule` in order.
///
/// Each stage moves `source` by the transform so far, crops both sets to `crop` (given in the
/// target frame), downsamples them and runs ICP from identity. The residual it finds is
/// left-multiplied onto the running transform.
pub fn refine<E: GeometryEngine + ?Sized>(
    engine: &E,
    source: &PointSet,
    target: &PointSet,
    init: &Matrix4<f64>,
    crop: Option<&CropVolume>,
    schedule: &[RegistrationStage],
) -> Result<Matrix4<f64>> {
    for stage in schedule {
        stage.validate()?;
    }
    let target = match crop {
        Some(c) => c.crop(target),
        None => target.clone(),
    };

    let mut transformation = *init;
    for (i, stage) in schedule.iter().enumerate() {
        let moved = source.transform(&transformation);
        let moved = match crop {
            Some(c) => c.crop(&moved),
            None => moved,
        };
        if moved.is_empty() || target.is_empty() {
            return Err(Error::degenerate(format!(
                "registration stage {} has {} source and {} target points after cropping",
                i,
                moved.len(),
                target.len()
            )));
        }

        let s = stage.downsample.apply(engine, &moved);
        let t = stage.downsample.apply(engine, &target);
        debug!(
            "Stage {}: {:?}, {} -> {} source and {} -> {} target points",
            i,
            stage.downsample,
            moved.len(),
            s.len(),
            target.len(),
            t.len()
        );

        let result = engine.registration_icp(
            &s,
            &t,
            stage.threshold,
            &Matrix4::identity(),
            &IcpCriteria::with_max_iterations(stage.max_iterations),
        )?;
        debug!(
            "Stage {}: fitness {:.6}, inlier rmse {:.6}",
            i, result.fitness, result.inlier_rmse
        );
        transformation = result.transformation * transformation;
    }
    Ok(transformation)
}
