//! Precision, recall and F-score of an aligned reconstruction.

use serde::{Deserialize, Serialize};

use crate::crop::CropVolume;
use crate::engine::GeometryEngine;
use crate::error::{Error, Result};
use crate::pointset::PointSet;

/// Number of histogram bins per threshold.
const BINS_PER_THRESHOLD: f64 = 100.0;

/// Scores of one evaluated scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub precision: f64,
    pub recall: f64,
    pub fscore: f64,
    pub threshold: f64,
    pub stretch: f64,
    pub histogram_edges_source: Vec<f64>,
    pub histogram_edges_target: Vec<f64>,
    /// Fraction of source points within each histogram edge of the target.
    pub cumulative_source: Vec<f64>,
    /// Fraction of target points within each histogram edge of the source.
    pub cumulative_target: Vec<f64>,
}

impl ScoreReport {
    /// Report for a scene where one side has no points left to compare.
    pub fn degenerate(threshold: f64, stretch: f64) -> ScoreReport {
        ScoreReport {
            precision: 0.0,
            recall: 0.0,
            fscore: 0.0,
            threshold,
            stretch,
            histogram_edges_source: vec![0.0],
            histogram_edges_target: vec![0.0],
            cumulative_source: vec![0.0],
            cumulative_target: vec![0.0],
        }
    }
}

impl std::fmt::Display for ScoreReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "precision {:.4} recall {:.4} f-score {:.4} (tau {})",
            self.precision, self.recall, self.fscore, self.threshold
        )
    }
}

/// Harmonic mean of precision and recall, zero when both are zero.
pub fn fscore(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

/// Fraction of `distances` strictly below `threshold`.
pub fn fraction_within(distances: &[f64], threshold: f64) -> f64 {
    if distances.is_empty() {
        return 0.0;
    }
    distances.iter().filter(|&&d| d < threshold).count() as f64 / distances.len() as f64
}

/// Bin edges `0, tau/100, 2 tau/100, ...` strictly below `tau * stretch`.
pub fn histogram_edges(threshold: f64, stretch: f64) -> Vec<f64> {
    let step = threshold / BINS_PER_THRESHOLD;
    let n = ((threshold * stretch) / step).ceil().max(0.0) as usize;
    (0..n).map(|i| i as f64 * step).collect()
}

/// Cumulative histogram of `distances` over `edges`, normalized by the number of distances.
///
/// Bins are half open `[edges[i], edges[i+1])` except the last, which also includes its upper
/// edge. Values outside the edges are not counted, so the result may end below 1. The output has
/// one value fewer than `edges`.
pub fn cumulative_histogram(distances: &[f64], edges: &[f64]) -> Vec<f64> {
    if edges.len() < 2 {
        return Vec::new();
    }
    let mut counts = vec![0usize; edges.len() - 1];
    let last = edges[edges.len() - 1];
    for &d in distances {
        if d < edges[0] || d > last || d.is_nan() {
            continue;
        }
        let bin = if d == last {
            counts.len() - 1
        } else {
            edges.partition_point(|&e| e <= d) - 1
        };
        counts[bin] += 1;
    }
    let n = distances.len().max(1) as f64;
    counts
        .iter()
        .scan(0usize, |acc, &c| {
            *acc += c;
            Some(*acc as f64 / n)
        })
        .collect()
}

/// Scoring parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreParams {
    /// Voxel size of the final downsampling.
    pub voxel_size: f64,
    /// Distance below which a point counts as matched (tau).
    pub threshold: f64,
    /// Histogram range as a multiple of `threshold`.
    pub stretch: f64,
    /// Neighbourhood size for normal estimation.
    pub normals_knn: usize,
}

impl ScoreParams {
    pub fn new(threshold: f64) -> Self {
        ScoreParams {
            voxel_size: threshold / 2.0,
            threshold,
            stretch: 5.0,
            normals_knn: 20,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0) {
            return Err(Error::config(format!(
                "threshold must be positive, got {}",
                self.threshold
            )));
        }
        if !(self.stretch > 0.0) {
            return Err(Error::config(format!(
                "stretch must be positive, got {}",
                self.stretch
            )));
        }
        if !(self.voxel_size > 0.0) {
            return Err(Error::config(format!(
                "score voxel size must be positive, got {}",
                self.voxel_size
            )));
        }
        Ok(())
    }
}

/// Everything produced while scoring, for reporting.
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub report: ScoreReport,
    /// Cropped, downsampled source with normals.
    pub source: PointSet,
    /// Cropped, downsampled target with normals.
    pub target: PointSet,
    /// Per source point distance to the target.
    pub distance_source_to_target: Vec<f64>,
    /// Per target point distance to the source.
    pub distance_target_to_source: Vec<f64>,
}

/// Score an aligned `source` against `target`.
///
/// Both sets are cropped, voxel downsampled and given normals. Precision is the fraction of
/// source points closer than the threshold to the target, recall the fraction of target points
/// closer than the threshold to the source. If either side is empty after downsampling all scores
/// are zero.
pub fn score<E: GeometryEngine + ?Sized>(
    engine: &E,
    source: &PointSet,
    target: &PointSet,
    crop: Option<&CropVolume>,
    params: &ScoreParams,
) -> Result<ScoreOutcome> {
    params.validate()?;

    let prepare = |pcd: &PointSet| {
        let cropped = match crop {
            Some(c) => c.crop(pcd),
            None => pcd.clone(),
        };
        let down = engine.voxel_down_sample(&cropped, params.voxel_size);
        engine.estimate_normals(&down, params.normals_knn)
    };
    let source = prepare(source);
    let target = prepare(target);
    debug!(
        "Scoring {} source against {} target points",
        source.len(),
        target.len()
    );

    if source.is_empty() || target.is_empty() {
        warn!(
            "Nothing to score ({} source, {} target points), reporting zeros",
            source.len(),
            target.len()
        );
        return Ok(ScoreOutcome {
            report: ScoreReport::degenerate(params.threshold, params.stretch),
            source,
            target,
            distance_source_to_target: Vec::new(),
            distance_target_to_source: Vec::new(),
        });
    }

    let d_st = engine.compute_point_cloud_distance(&source, &target);
    let d_ts = engine.compute_point_cloud_distance(&target, &source);

    let precision = fraction_within(&d_st, params.threshold);
    let recall = fraction_within(&d_ts, params.threshold);
    let edges = histogram_edges(params.threshold, params.stretch);
    let report = ScoreReport {
        precision,
        recall,
        fscore: fscore(precision, recall),
        threshold: params.threshold,
        stretch: params.stretch,
        cumulative_source: cumulative_histogram(&d_st, &edges),
        cumulative_target: cumulative_histogram(&d_ts, &edges),
        histogram_edges_source: edges.clone(),
        histogram_edges_target: edges,
    };

    Ok(ScoreOutcome {
        report,
        source,
        target,
        distance_source_to_target: d_st,
        distance_target_to_source: d_ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeEngine;
    use crate::testing::{Call, CountingEngine};
    use approx::assert_relative_eq;
    use na::{Point3, Vector3};

    fn plane(offset: f64) -> PointSet {
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                points.push(Point3::new(i as f64 * 0.1, j as f64 * 0.1, offset));
            }
        }
        PointSet::new(points)
    }

    fn monotone_and_bounded(v: &[f64]) -> bool {
        v.windows(2).all(|w| w[0] <= w[1]) && v.iter().all(|&x| (0.0..=1.0).contains(&x))
    }

    #[test]
    fn fscore_fallback() {
        assert_eq!(fscore(0.0, 0.0), 0.0);
        assert_relative_eq!(fscore(1.0, 1.0), 1.0);
        assert_relative_eq!(fscore(0.5, 1.0), 2.0 / 3.0);
    }

    #[test]
    fn edges_follow_arange() {
        let edges = histogram_edges(1.0, 5.0);
        assert_eq!(edges.len(), 500);
        assert_eq!(edges[0], 0.0);
        assert_relative_eq!(edges[1], 0.01);
        assert!(*edges.last().unwrap() < 5.0);
    }

    #[test]
    fn cumulative_histogram_bins() {
        let edges = vec![0.0, 1.0, 2.0, 3.0];
        let cum = cumulative_histogram(&[0.5, 1.0, 2.5, 3.0, 7.0], &edges);
        assert_eq!(cum.len(), 3);
        assert_relative_eq!(cum[0], 0.2);
        assert_relative_eq!(cum[1], 0.4);
        // 3.0 lands in the closed last bin, 7.0 is outside the range
        assert_relative_eq!(cum[2], 0.8);
    }

    #[test]
    fn identical_sets_score_one() {
        let engine = NativeEngine::new();
        let pcd = plane(0.0);
        let out = score(&engine, &pcd, &pcd, None, &ScoreParams::new(0.05)).unwrap();
        assert_relative_eq!(out.report.precision, 1.0);
        assert_relative_eq!(out.report.recall, 1.0);
        assert_relative_eq!(out.report.fscore, 1.0);
        assert_eq!(
            out.report.cumulative_source.len(),
            out.report.histogram_edges_source.len() - 1
        );
        assert!(monotone_and_bounded(&out.report.cumulative_source));
        assert!(monotone_and_bounded(&out.report.cumulative_target));
        assert!(out.source.has_normals());
    }

    #[test]
    fn disjoint_sets_score_zero() {
        let engine = CountingEngine::default();
        let out = score(
            &engine,
            &plane(0.0),
            &plane(1.0),
            None,
            &ScoreParams::new(0.05),
        )
        .unwrap();
        assert_eq!(out.report.precision, 0.0);
        assert_eq!(out.report.recall, 0.0);
        assert_eq!(out.report.fscore, 0.0);
        assert!(monotone_and_bounded(&out.report.cumulative_target));
    }

    #[test]
    fn partial_overlap() {
        let engine = CountingEngine::default();
        let mut source = plane(0.0);
        for p in source.points.iter_mut().take(25) {
            p.z = 2.0;
        }
        let out = score(&engine, &source, &plane(0.0), None, &ScoreParams::new(0.05)).unwrap();
        // the lifted points leave their target counterparts uncovered as well
        assert_relative_eq!(out.report.precision, 0.75);
        assert_relative_eq!(out.report.recall, 0.75);
        assert_relative_eq!(out.report.fscore, 0.75);
        assert_relative_eq!(*out.report.cumulative_source.last().unwrap(), 0.75);
    }

    #[test]
    fn empty_crop_is_zero_score() {
        let engine = CountingEngine::default();
        let crop = CropVolume::axis_aligned(
            Vector3::new(10.0, 10.0, 10.0),
            Vector3::new(11.0, 11.0, 11.0),
        )
        .unwrap();
        let out = score(
            &engine,
            &plane(0.0),
            &plane(0.0),
            Some(&crop),
            &ScoreParams::new(0.05),
        )
        .unwrap();
        assert_eq!(out.report, ScoreReport::degenerate(0.05, 5.0));
        assert_eq!(out.report.cumulative_source, vec![0.0]);
        assert_eq!(out.report.histogram_edges_target, vec![0.0]);
    }

    #[test]
    fn one_side_cropped_away_is_zero_score() {
        let crop = CropVolume::axis_aligned(
            Vector3::new(-1.0, -1.0, -0.5),
            Vector3::new(2.0, 2.0, 0.5),
        )
        .unwrap();
        let params = ScoreParams::new(0.05);
        for (source, target) in &[(plane(0.0), plane(5.0)), (plane(5.0), plane(0.0))] {
            let engine = CountingEngine::default();
            let out = score(&engine, source, target, Some(&crop), &params).unwrap();
            assert_eq!(out.report, ScoreReport::degenerate(0.05, 5.0));
            assert!(out.source.is_empty() != out.target.is_empty());
            assert!(!engine.log().iter().any(|c| matches!(c, Call::Distance)));
        }
    }

    #[test]
    fn non_positive_threshold_rejected() {
        let engine = CountingEngine::default();
        let pcd = plane(0.0);
        let r = score(&engine, &pcd, &pcd, None, &ScoreParams::new(0.0));
        assert!(matches!(r, Err(Error::Configuration(_))));
        assert_eq!(engine.calls(), 0);
    }
}
