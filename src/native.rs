//! A self-contained [GeometryEngine] built on an R*-tree for nearest neighbour queries and a
//! closed form similarity estimate (Umeyama) for registration.

use na::{Matrix3, Matrix4, Point3, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rstar::RTree;

use std::collections::HashMap;

use crate::engine::{GeometryEngine, IcpCriteria, RansacCriteria, RegistrationResult};
use crate::error::{Error, Result};
use crate::pointset::PointSet;

// wrapper to store indexed points in the rtree
#[derive(Debug, Clone, PartialEq, Copy)]
struct WrappedPoint(Point3<f64>, usize);

impl rstar::Point for WrappedPoint {
    type Scalar = f64;
    const DIMENSIONS: usize = 3;

    fn generate(generator: impl Fn(usize) -> Self::Scalar) -> Self {
        WrappedPoint(
            Point3::new(generator(0), generator(1), generator(2)),
            std::usize::MAX,
        )
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        let WrappedPoint(p, _) = self;
        match index {
            0 => p.x,
            1 => p.y,
            2 => p.z,
            _ => unreachable!(),
        }
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        let WrappedPoint(p, _) = self;
        match index {
            0 => &mut p.x,
            1 => &mut p.y,
            2 => &mut p.z,
            _ => unreachable!(),
        }
    }
}

fn build_tree(points: &[Point3<f64>]) -> RTree<WrappedPoint> {
    RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(i, p)| WrappedPoint(*p, i))
            .collect(),
    )
}

/// Index of and distance to the nearest point in `tree`.
fn nearest(tree: &RTree<WrappedPoint>, p: &Point3<f64>) -> Option<(usize, f64)> {
    tree.nearest_neighbor(&WrappedPoint(*p, std::usize::MAX))
        .map(|WrappedPoint(q, i)| (*i, (q - p).norm()))
}

/// Least squares similarity transform (rotation, uniform scale, translation) taking `source[i]`
/// to `target[i]`. `None` for fewer than 3 pairs or a source without spatial extent.
pub fn estimate_similarity(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
) -> Option<Matrix4<f64>> {
    if source.len() < 3 || source.len() != target.len() {
        return None;
    }
    let n = source.len() as f64;
    let mu_s = source.iter().fold(Vector3::zeros(), |a, p| a + p.coords) / n;
    let mu_t = target.iter().fold(Vector3::zeros(), |a, p| a + p.coords) / n;

    let mut cov = Matrix3::zeros();
    let mut var_s = 0.0;
    for (s, t) in source.iter().zip(target) {
        let ds = s.coords - mu_s;
        let dt = t.coords - mu_t;
        cov += dt * ds.transpose();
        var_s += ds.norm_squared();
    }
    cov /= n;
    var_s /= n;
    if var_s <= std::f64::EPSILON {
        return None;
    }

    let svd = cov.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    // singular values are sorted in decreasing order, so a reflection flips the last axis
    let mut d = Matrix3::identity();
    if u.determinant() * v_t.determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let r = u * d * v_t;
    let scale = (svd.singular_values.component_mul(&d.diagonal())).sum() / var_s;
    if !scale.is_finite() || scale <= 0.0 {
        return None;
    }
    let t = mu_t - scale * r * mu_s;

    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&(r * scale));
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    Some(m)
}

/// Correspondences, fitness and RMSE of `points` against `tree` within `max_distance`.
struct Evaluation {
    correspondences: Vec<(usize, usize)>,
    fitness: f64,
    rmse: f64,
}

fn evaluate(points: &[Point3<f64>], tree: &RTree<WrappedPoint>, max_distance: f64) -> Evaluation {
    let mut correspondences = Vec::new();
    let mut error2 = 0.0;
    for (i, p) in points.iter().enumerate() {
        if let Some((j, d)) = nearest(tree, p) {
            if d <= max_distance {
                correspondences.push((i, j));
                error2 += d * d;
            }
        }
    }
    let rmse = if correspondences.is_empty() {
        0.0
    } else {
        (error2 / correspondences.len() as f64).sqrt()
    };
    Evaluation {
        fitness: correspondences.len() as f64 / points.len().max(1) as f64,
        rmse,
        correspondences,
    }
}

/// Number of RANSAC iterations needed to reach `confidence` at the given inlier ratio, clamped
/// to `[iters_so_far, max_iters]`.
fn required_iterations(
    confidence: f64,
    inlier_ratio: f64,
    sample_size: usize,
    iters_so_far: usize,
    max_iters: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(sample_size as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }
    let n = ((1.0 - confidence).ln() / denom).ceil();
    if !n.is_finite() {
        return max_iters;
    }
    (n as usize).max(iters_so_far).min(max_iters)
}

/// Geometry engine implemented in pure Rust.
#[derive(Debug, Clone)]
pub struct NativeEngine {
    /// Stop RANSAC early once this confidence of having drawn an all-inlier sample is reached.
    /// Zero runs the full iteration budget.
    pub ransac_confidence: f64,
}

impl NativeEngine {
    pub fn new() -> Self {
        NativeEngine::default()
    }
}

impl Default for NativeEngine {
    fn default() -> Self {
        NativeEngine {
            ransac_confidence: 0.999,
        }
    }
}

impl GeometryEngine for NativeEngine {
    fn voxel_down_sample(&self, pcd: &PointSet, voxel_size: f64) -> PointSet {
        let (min, _) = match pcd.extent() {
            Some(e) => e,
            None => return PointSet::default(),
        };
        if voxel_size <= 0.0 {
            return pcd.clone();
        }
        let origin = min - Vector3::repeat(voxel_size * 0.5);

        struct Cell {
            point: Vector3<f64>,
            normal: Vector3<f64>,
            color: Vector3<f64>,
            count: f64,
        }
        let mut index: HashMap<(i64, i64, i64), usize> = HashMap::new();
        let mut cells: Vec<Cell> = Vec::new();
        for (i, p) in pcd.points.iter().enumerate() {
            let v = (p.coords - origin) / voxel_size;
            let key = (v.x.floor() as i64, v.y.floor() as i64, v.z.floor() as i64);
            let c = *index.entry(key).or_insert_with(|| {
                cells.push(Cell {
                    point: Vector3::zeros(),
                    normal: Vector3::zeros(),
                    color: Vector3::zeros(),
                    count: 0.0,
                });
                cells.len() - 1
            });
            let cell = &mut cells[c];
            cell.point += p.coords;
            if let Some(normals) = &pcd.normals {
                cell.normal += normals[i];
            }
            if let Some(colors) = &pcd.colors {
                let [r, g, b] = colors[i];
                cell.color += Vector3::new(r as f64, g as f64, b as f64);
            }
            cell.count += 1.0;
        }

        PointSet {
            points: cells
                .iter()
                .map(|c| Point3::from(c.point / c.count))
                .collect(),
            normals: pcd.normals.as_ref().map(|_| {
                cells
                    .iter()
                    .map(|c| {
                        let n = c.normal / c.count;
                        let norm = n.norm();
                        if norm > 0.0 {
                            n / norm
                        } else {
                            n
                        }
                    })
                    .collect()
            }),
            colors: pcd.colors.as_ref().map(|_| {
                cells
                    .iter()
                    .map(|c| {
                        let m = c.color / c.count;
                        [m.x.round() as u8, m.y.round() as u8, m.z.round() as u8]
                    })
                    .collect()
            }),
        }
    }

    fn uniform_down_sample(&self, pcd: &PointSet, every_k_points: usize) -> PointSet {
        if every_k_points <= 1 {
            return pcd.clone();
        }
        let indices = (0..pcd.len()).step_by(every_k_points).collect::<Vec<_>>();
        pcd.select(&indices)
    }

    fn estimate_normals(&self, pcd: &PointSet, knn: usize) -> PointSet {
        let tree = build_tree(&pcd.points);
        let normals = pcd
            .points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let neighbours = tree
                    .nearest_neighbor_iter(&WrappedPoint(*p, std::usize::MAX))
                    .take(knn.max(3))
                    .map(|WrappedPoint(q, _)| q.coords)
                    .collect::<Vec<_>>();
                if neighbours.len() < 3 {
                    return Vector3::z();
                }
                let mean = neighbours.iter().sum::<Vector3<f64>>() / neighbours.len() as f64;
                let cov = neighbours
                    .iter()
                    .map(|q| (q - mean) * (q - mean).transpose())
                    .sum::<Matrix3<f64>>();
                let eigen = SymmetricEigen::new(cov);
                let (smallest, _) = eigen
                    .eigenvalues
                    .iter()
                    .enumerate()
                    .fold((0, std::f64::INFINITY), |best, (k, &v)| {
                        if v < best.1 {
                            (k, v)
                        } else {
                            best
                        }
                    });
                let mut n = eigen.eigenvectors.column(smallest).into_owned();
                // keep the orientation of any existing normal
                if let Some(previous) = pcd.normals.as_ref().map(|ns| ns[i]) {
                    if n.dot(&previous) < 0.0 {
                        n = -n;
                    }
                }
                n
            })
            .collect();
        PointSet {
            points: pcd.points.clone(),
            normals: Some(normals),
            colors: pcd.colors.clone(),
        }
    }

    fn compute_point_cloud_distance(&self, source: &PointSet, target: &PointSet) -> Vec<f64> {
        if target.is_empty() {
            return vec![std::f64::INFINITY; source.len()];
        }
        let tree = build_tree(&target.points);
        source
            .points
            .iter()
            .map(|p| nearest(&tree, p).map(|(_, d)| d).unwrap_or(std::f64::INFINITY))
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
        if source.is_empty() || target.is_empty() {
            return Err(Error::degenerate(format!(
                "ICP needs points in both sets, got {} source and {} target points",
                source.len(),
                target.len()
            )));
        }
        let tree = build_tree(&target.points);
        let mut transformation = *init;
        let mut points = source
            .points
            .iter()
            .map(|p| init.transform_point(p))
            .collect::<Vec<_>>();
        let mut eval = evaluate(&points, &tree, max_correspondence_distance);

        for i in 0..criteria.max_iterations {
            let (src, tgt): (Vec<_>, Vec<_>) = eval
                .correspondences
                .iter()
                .map(|&(s, t)| (points[s], target.points[t]))
                .unzip();
            let update = estimate_similarity(&src, &tgt).unwrap_or_else(Matrix4::identity);
            transformation = update * transformation;
            for p in points.iter_mut() {
                *p = update.transform_point(p);
            }

            let previous = eval;
            eval = evaluate(&points, &tree, max_correspondence_distance);
            debug!(
                "ICP iteration {}: fitness {:.6} inlier rmse {:.6}",
                i, eval.fitness, eval.rmse
            );
            if (previous.fitness - eval.fitness).abs() < criteria.relative_fitness
                && (previous.rmse - eval.rmse).abs() < criteria.relative_rmse
            {
                break;
            }
        }

        Ok(RegistrationResult {
            transformation,
            fitness: eval.fitness,
            inlier_rmse: eval.rmse,
        })
    }

    fn registration_ransac_based_on_correspondence(
        &self,
        source: &PointSet,
        target: &PointSet,
        correspondences: &[(usize, usize)],
        max_correspondence_distance: f64,
        criteria: &RansacCriteria,
    ) -> Result<RegistrationResult> {
        if correspondences.len() < 3 {
            return Err(Error::degenerate(format!(
                "RANSAC needs at least 3 correspondences, got {}",
                correspondences.len()
            )));
        }
        if let Some((s, t)) = correspondences
            .iter()
            .find(|(s, t)| *s >= source.len() || *t >= target.len())
        {
            return Err(Error::config(format!(
                "correspondence ({}, {}) is out of range",
                s, t
            )));
        }

        let score = |m: &Matrix4<f64>| {
            let mut inliers = Vec::new();
            let mut error2 = 0.0;
            for (k, &(s, t)) in correspondences.iter().enumerate() {
                let d = (m.transform_point(&source.points[s]) - target.points[t]).norm();
                if d < max_correspondence_distance {
                    inliers.push(k);
                    error2 += d * d;
                }
            }
            let rmse = if inliers.is_empty() {
                0.0
            } else {
                (error2 / inliers.len() as f64).sqrt()
            };
            (inliers.len() as f64 / correspondences.len() as f64, rmse, inliers)
        };
        let fit = |ks: &[usize]| {
            let (src, tgt): (Vec<_>, Vec<_>) = ks
                .iter()
                .map(|&k| {
                    let (s, t) = correspondences[k];
                    (source.points[s], target.points[t])
                })
                .unzip();
            estimate_similarity(&src, &tgt)
        };

        let sample_size = criteria.ransac_n.max(3).min(correspondences.len());
        let mut rng = StdRng::seed_from_u64(criteria.seed);
        let mut best: Option<(Matrix4<f64>, f64, f64, Vec<usize>)> = None;
        let mut max_iterations = criteria.max_iterations;
        let mut validations = 0;
        let mut iteration = 0;
        while iteration < max_iterations && validations < criteria.max_validation {
            iteration += 1;
            let sample = rand::seq::index::sample(&mut rng, correspondences.len(), sample_size)
                .into_vec();
            let m = match fit(&sample) {
                Some(m) => m,
                None => continue,
            };
            validations += 1;
            let (fitness, rmse, inliers) = score(&m);
            let better = match &best {
                None => true,
                Some((_, f, r, _)) => fitness > *f || (fitness == *f && rmse < *r),
            };
            if better {
                max_iterations = required_iterations(
                    self.ransac_confidence,
                    fitness,
                    sample_size,
                    iteration,
                    max_iterations,
                );
                best = Some((m, fitness, rmse, inliers));
            }
        }

        let (m, fitness, rmse, inliers) = best.ok_or_else(|| {
            Error::degenerate("RANSAC found no non-degenerate sample of correspondences")
        })?;
        debug!(
            "RANSAC stopped after {} iterations with fitness {:.4}",
            iteration, fitness
        );

        // refit on the consensus set when that does not lose inliers
        if let Some(refined) = fit(&inliers) {
            let (f, r, _) = score(&refined);
            if f >= fitness {
                return Ok(RegistrationResult {
                    transformation: refined,
                    fitness: f,
                    inlier_rmse: r,
                });
            }
        }
        Ok(RegistrationResult {
            transformation: m,
            fitness,
            inlier_rmse: rmse,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use na::{Translation3, UnitQuaternion};

    fn grid(n: usize, spacing: f64) -> PointSet {
        let mut points = Vec::new();
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    // skew the grid so that it has no rotational symmetry
                    points.push(Point3::new(
                        i as f64 * spacing,
                        j as f64 * spacing * 1.3,
                        k as f64 * spacing * 0.7 + (i * j) as f64 * 0.01,
                    ));
                }
            }
        }
        PointSet::new(points)
    }

    fn similarity(scale: f64) -> Matrix4<f64> {
        let r = UnitQuaternion::from_euler_angles(0.05, -0.03, 0.08).to_homogeneous();
        let t = Translation3::new(0.02, -0.01, 0.03).to_homogeneous();
        let mut s = Matrix4::identity() * scale;
        s[(3, 3)] = 1.0;
        t * r * s
    }

    #[test]
    fn similarity_recovered_exactly() {
        let src = grid(3, 1.0);
        let truth = similarity(1.7);
        let tgt = src.transform(&truth);
        let m = estimate_similarity(&src.points, &tgt.points).unwrap();
        assert_relative_eq!(m, truth, epsilon = 1e-9);
    }

    #[test]
    fn similarity_rejects_degenerate_input() {
        let p = vec![Point3::new(1.0, 1.0, 1.0); 4];
        assert!(estimate_similarity(&p, &p).is_none());
        assert!(estimate_similarity(&p[..2], &p[..2]).is_none());
    }

    #[test]
    fn icp_recovers_small_offset() {
        let engine = NativeEngine::new();
        let target = grid(5, 0.5);
        // small enough that every initial nearest neighbour is the true counterpart
        let truth = Translation3::new(0.02, -0.01, 0.01).to_homogeneous()
            * UnitQuaternion::from_euler_angles(0.01, -0.005, 0.015).to_homogeneous();
        let source = target.transform(&truth.try_inverse().unwrap());
        let result = engine
            .registration_icp(
                &source,
                &target,
                0.3,
                &Matrix4::identity(),
                &IcpCriteria::with_max_iterations(50),
            )
            .unwrap();
        assert_relative_eq!(result.transformation, truth, epsilon = 1e-6);
        assert_relative_eq!(result.fitness, 1.0);
    }

    #[test]
    fn icp_on_empty_is_degenerate() {
        let engine = NativeEngine::new();
        let r = engine.registration_icp(
            &PointSet::default(),
            &grid(2, 1.0),
            1.0,
            &Matrix4::identity(),
            &IcpCriteria::default(),
        );
        assert!(matches!(r, Err(Error::GeometricDegeneracy(_))));
    }

    #[test]
    fn ransac_ignores_outliers() {
        let engine = NativeEngine::new();
        let source = grid(3, 1.0);
        let truth = similarity(2.0);
        let mut target = source.transform(&truth);
        target.points[4] += Vector3::new(5.0, 0.0, 0.0);
        target.points[11] += Vector3::new(0.0, -7.0, 0.0);
        let corres = (0..source.len()).map(|i| (i, i)).collect::<Vec<_>>();
        let criteria = RansacCriteria {
            max_iterations: 2000,
            max_validation: 2000,
            ransac_n: 4,
            seed: 7,
        };
        let result = engine
            .registration_ransac_based_on_correspondence(&source, &target, &corres, 0.2, &criteria)
            .unwrap();
        assert_relative_eq!(result.transformation, truth, epsilon = 1e-9);
        assert_relative_eq!(result.fitness, 25.0 / 27.0);
    }

    #[test]
    fn voxel_down_sample_averages_cells() {
        let engine = NativeEngine::new();
        let pcd = PointSet::new(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.2, 0.0, 0.0),
            Point3::new(5.0, 5.0, 5.0),
        ]);
        let down = engine.voxel_down_sample(&pcd, 1.0);
        assert_eq!(down.len(), 2);
        assert_relative_eq!(down.points[0], Point3::new(0.1, 0.0, 0.0));
        assert_eq!(engine.voxel_down_sample(&PointSet::default(), 1.0).len(), 0);
    }

    #[test]
    fn uniform_down_sample_keeps_every_kth() {
        let engine = NativeEngine::new();
        let pcd = grid(2, 1.0);
        let down = engine.uniform_down_sample(&pcd, 3);
        assert_eq!(down.len(), 3);
        assert_eq!(down.points[1], pcd.points[3]);
    }

    #[test]
    fn normals_of_a_plane() {
        let engine = NativeEngine::new();
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..6 {
                points.push(Point3::new(i as f64, j as f64, 2.0));
            }
        }
        let pcd = engine.estimate_normals(&PointSet::new(points), 8);
        for n in pcd.normals.unwrap() {
            assert_relative_eq!(n.z.abs(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn nearest_distances() {
        let engine = NativeEngine::new();
        let a = PointSet::new(vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)]);
        let b = PointSet::new(vec![Point3::new(0.0, 1.0, 0.0)]);
        let d = engine.compute_point_cloud_distance(&a, &b);
        assert_relative_eq!(d[0], 1.0);
        assert_relative_eq!(d[1], 10f64.sqrt());
    }
}
