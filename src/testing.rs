//! Deterministic geometry engine for pipeline tests.

use na::Matrix4;

use std::cell::RefCell;

use crate::engine::{GeometryEngine, IcpCriteria, RansacCriteria, RegistrationResult};
use crate::error::{Error, Result};
use crate::native::estimate_similarity;
use crate::pointset::PointSet;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Voxel(f64),
    Uniform(usize),
    Normals(usize),
    Distance,
    /// source size, target size, threshold, iterations
    Icp(usize, usize, f64, usize),
    Ransac(usize),
}

/// Downsampling keeps every point, ICP fits a similarity on index correspondences in one step and
/// distances are computed by brute force. Every call is recorded.
#[derive(Debug, Default)]
pub struct CountingEngine {
    log: RefCell<Vec<Call>>,
}

impl CountingEngine {
    pub fn calls(&self) -> usize {
        self.log.borrow().len()
    }

    pub fn log(&self) -> Vec<Call> {
        self.log.borrow().clone()
    }

    fn record(&self, call: Call) {
        self.log.borrow_mut().push(call);
    }
}

impl GeometryEngine for CountingEngine {
    fn voxel_down_sample(&self, pcd: &PointSet, voxel_size: f64) -> PointSet {
        self.record(Call::Voxel(voxel_size));
        pcd.clone()
    }

    fn uniform_down_sample(&self, pcd: &PointSet, every_k_points: usize) -> PointSet {
        self.record(Call::Uniform(every_k_points));
        pcd.clone()
    }

    fn estimate_normals(&self, pcd: &PointSet, knn: usize) -> PointSet {
        self.record(Call::Normals(knn));
        let mut out = pcd.clone();
        out.normals = Some(vec![na::Vector3::z(); pcd.len()]);
        out
    }

    fn compute_point_cloud_distance(&self, source: &PointSet, target: &PointSet) -> Vec<f64> {
        self.record(Call::Distance);
        source
            .points
            .iter()
            .map(|p| {
                target
                    .points
                    .iter()
                    .map(|q| (p - q).norm())
                    .fold(std::f64::INFINITY, f64::min)
            })
            .collect()
    }

    fn registration_icp(
        &self,
        source: &PointSet,
        target: &PointSet,
        max_correspondence_distance: f64,
        init: &Matrix4<f64>,
        criteria: &IcpCriteria,
    ) -> Result<RegistrationResult> {
        self.record(Call::Icp(
            source.len(),
            target.len(),
            max_correspondence_distance,
            criteria.max_iterations,
        ));
        let moved = source.transform(init);
        let update = estimate_similarity(&moved.points, &target.points)
            .ok_or_else(|| Error::degenerate("fake ICP needs matching point sets"))?;
        Ok(RegistrationResult {
            transformation: update * init,
            fitness: 1.0,
            inlier_rmse: 0.0,
        })
    }

    fn registration_ransac_based_on_correspondence(
        &self,
        source: &PointSet,
        target: &PointSet,
        correspondences: &[(usize, usize)],
        _max_correspondence_distance: f64,
        _criteria: &RansacCriteria,
    ) -> Result<RegistrationResult> {
        self.record(Call::Ransac(correspondences.len()));
        let (src, tgt): (Vec<_>, Vec<_>) = correspondences
            .iter()
            .map(|&(s, t)| (source.points[s], target.points[t]))
            .unzip();
        let transformation = estimate_similarity(&src, &tgt)
            .ok_or_else(|| Error::degenerate("fake RANSAC needs 3 distinct points"))?;
        Ok(RegistrationResult {
            transformation,
            fitness: 1.0,
            inlier_rmse: 0.0,
        })
    }
}
