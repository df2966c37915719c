//! The geometry processing primitives the benchmark pipeline is built on.
//!
//! The pipeline never reaches for a concrete point cloud library. Every downsampling, distance
//! query and registration goes through a [GeometryEngine], so the alignment and scoring logic can
//! be driven by a deterministic fake in tests. [crate::native::NativeEngine] is the implementation
//! used by the command line tools.

use na::Matrix4;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pointset::PointSet;

/// Outcome of a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResult {
    /// Maps the source onto the target.
    pub transformation: Matrix4<f64>,
    /// Fraction of source points (or correspondences) that are inliers.
    pub fitness: f64,
    /// RMS distance over inliers.
    pub inlier_rmse: f64,
}

/// Stopping rule for ICP. Iteration stops once both the fitness and the inlier RMSE change by
/// less than the relative tolerances, or after `max_iterations`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IcpCriteria {
    pub relative_fitness: f64,
    pub relative_rmse: f64,
    pub max_iterations: usize,
}

impl IcpCriteria {
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        IcpCriteria {
            max_iterations,
            ..IcpCriteria::default()
        }
    }
}

impl Default for IcpCriteria {
    fn default() -> Self {
        IcpCriteria {
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
            max_iterations: 30,
        }
    }
}

/// Budget for correspondence based RANSAC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RansacCriteria {
    pub max_iterations: usize,
    /// Upper bound on the number of hypotheses that are scored against all correspondences.
    pub max_validation: usize,
    /// Number of correspondences drawn per hypothesis.
    pub ransac_n: usize,
    pub seed: u64,
}

impl Default for RansacCriteria {
    fn default() -> Self {
        RansacCriteria {
            max_iterations: 100_000,
            max_validation: 100_000,
            ransac_n: 6,
            seed: 0,
        }
    }
}

/// Point cloud processing capabilities used by the pipeline.
///
/// All registrations estimate a similarity transform (rotation, uniform scale and translation)
/// from point-to-point correspondences.
pub trait GeometryEngine {
    /// Replace all points that fall in the same voxel of edge length `voxel_size` by their mean.
    fn voxel_down_sample(&self, pcd: &PointSet, voxel_size: f64) -> PointSet;

    /// Keep every `every_k_points`-th point, starting with the first.
    fn uniform_down_sample(&self, pcd: &PointSet, every_k_points: usize) -> PointSet;

    /// Estimate unit normals from the `knn` nearest neighbours of every point.
    fn estimate_normals(&self, pcd: &PointSet, knn: usize) -> PointSet;

    /// For every point of `source` the distance to its nearest point in `target`.
    fn compute_point_cloud_distance(&self, source: &PointSet, target: &PointSet) -> Vec<f64>;

    /// Iterative closest point starting from `init`.
    fn registration_icp(
        &self,
        source: &PointSet,
        target: &PointSet,
        max_correspondence_distance: f64,
        init: &Matrix4<f64>,
        criteria: &IcpCriteria,
    ) -> Result<RegistrationResult>;

    /// RANSAC over known `(source_index, target_index)` correspondences.
    fn registration_ransac_based_on_correspondence(
        &self,
        source: &PointSet,
        target: &PointSet,
        correspondences: &[(usize, usize)],
        max_correspondence_distance: f64,
        criteria: &RansacCriteria,
    ) -> Result<RegistrationResult>;
}
