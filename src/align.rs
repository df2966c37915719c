//! Rough similarity alignment between two camera trajectories that are in correspondence by
//! frame index.

use na::{Matrix4, Point3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::{GeometryEngine, RansacCriteria};
use crate::error::{Error, Result};
use crate::pointset::PointSet;
use crate::trajectory::Trajectory;

/// Parameters of the trajectory alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignOptions {
    /// Inlier distance for RANSAC, in target units.
    pub max_correspondence_distance: f64,
    pub max_iterations: usize,
    pub max_validation: usize,
    pub ransac_n: usize,
    /// Multiplicative perturbation of source positions, for robustness experiments only.
    pub jitter: f64,
    /// Seeds both the jitter and the RANSAC sampling.
    pub seed: u64,
}

impl Default for AlignOptions {
    fn default() -> Self {
        AlignOptions {
            max_correspondence_distance: 0.2,
            max_iterations: 100_000,
            max_validation: 100_000,
            ransac_n: 6,
            jitter: 0.0,
            seed: 0,
        }
    }
}

impl AlignOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_correspondence_distance > 0.0) {
            return Err(Error::config(format!(
                "alignment correspondence distance must be positive, got {}",
                self.max_correspondence_distance
            )));
        }
        if !(self.jitter >= 0.0) {
            return Err(Error::config(format!(
                "jitter must be non-negative, got {}",
                self.jitter
            )));
        }
        if self.ransac_n < 3 {
            return Err(Error::config(format!(
                "RANSAC needs at least 3 correspondences per sample, got {}",
                self.ransac_n
            )));
        }
        Ok(())
    }

    fn criteria(&self) -> RansacCriteria {
        RansacCriteria {
            max_iterations: self.max_iterations,
            max_validation: self.max_validation,
            ransac_n: self.ransac_n,
            seed: self.seed,
        }
    }
}

/// Scale every coordinate by an independent factor drawn from `[1 - jitter/2, 1 + jitter/2]`.
fn jitter_positions(points: &mut [Point3<f64>], jitter: f64, rng: &mut StdRng) {
    if jitter <= 0.0 {
        return;
    }
    for p in points.iter_mut() {
        for i in 0..3 {
            p[i] *= rng.gen_range(1.0 - jitter / 2.0, 1.0 + jitter / 2.0);
        }
    }
}

/// Similarity transform taking the camera positions of `source` onto those of `target` after
/// `target_align` has been applied to the latter.
///
/// Pose `i` of `source` corresponds to pose `i` of `target`. Both trajectories must have the same
/// length and at least 3 poses; this is checked before the engine is called.
pub fn align_trajectories<E: GeometryEngine + ?Sized>(
    engine: &E,
    source: &Trajectory,
    target: &Trajectory,
    target_align: &Matrix4<f64>,
    opts: &AlignOptions,
) -> Result<Matrix4<f64>> {
    if source.len() != target.len() {
        return Err(Error::config(format!(
            "cannot align trajectories of different lengths ({} source vs {} target poses)",
            source.len(),
            target.len()
        )));
    }
    if source.len() < 3 {
        return Err(Error::config(format!(
            "trajectory alignment needs at least 3 poses, got {}",
            source.len()
        )));
    }
    opts.validate()?;

    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut source_positions = source.positions();
    jitter_positions(&mut source_positions, opts.jitter, &mut rng);
    let source_pcd = PointSet::new(source_positions);
    let target_pcd = target.to_point_set().transform(target_align);

    let correspondences = (0..source.len()).map(|i| (i, i)).collect::<Vec<_>>();
    let result = engine.registration_ransac_based_on_correspondence(
        &source_pcd,
        &target_pcd,
        &correspondences,
        opts.max_correspondence_distance,
        &opts.criteria(),
    )?;
    info!(
        "Trajectory alignment over {} poses: fitness {:.4}, inlier rmse {:.6}",
        source.len(),
        result.fitness,
        result.inlier_rmse
    );
    Ok(result.transformation)
}
