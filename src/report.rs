//! Per scene output files.
//!
//! For a scene named `s` the output directory receives
//!
//! * `s.precision.ply` / `s.recall.ply`: the scored source / target points colored by distance,
//! * `s.precision.txt` / `s.recall.txt`: the cumulative histograms, one value per line,
//! * `s.prf_tau_plotstr.txt`: `precision recall fscore threshold stretch` on one line,
//! * `s.transformation.txt`: the final alignment matrix,
//! * `s.score.json`: the full [ScoreReport].

use itertools::Itertools;
use na::Matrix4;

use std::fs::File;
use std::io::prelude::*;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::pointset::PointSet;
use crate::score::{ScoreOutcome, ScoreReport};
use crate::trajectory::write_alignment;

/// The "hot" colormap: black through red and yellow to white.
fn hot(v: f64) -> [f64; 3] {
    let v = v.max(0.0).min(1.0);
    let ramp = |lo: f64, hi: f64| ((v - lo) / (hi - lo)).max(0.0).min(1.0);
    let red = 0.0416 + (1.0 - 0.0416) * v / 0.365079;
    [
        red.min(1.0),
        ramp(0.365079, 0.746032),
        ramp(0.746032, 1.0),
    ]
}

/// Color for a distance, white at zero fading to dark red at `max_distance` and beyond.
pub fn distance_color(distance: f64, max_distance: f64) -> [u8; 3] {
    let x = if max_distance > 0.0 {
        distance.min(max_distance) / max_distance
    } else {
        1.0
    };
    let c = hot(1.0 - x);
    [
        (c[0] * 255.0).round() as u8,
        (c[1] * 255.0).round() as u8,
        (c[2] * 255.0).round() as u8,
    ]
}

/// Copy of `pcd` colored by the per point `distances`.
pub fn colorize(pcd: &PointSet, distances: &[f64], max_distance: f64) -> PointSet {
    let mut out = pcd.clone();
    out.colors = Some(
        pcd.points
            .iter()
            .enumerate()
            .map(|(i, _)| {
                distances
                    .get(i)
                    .map(|&d| distance_color(d, max_distance))
                    .unwrap_or([0, 0, 0])
            })
            .collect(),
    );
    out
}

fn write_lines(path: &Path, values: &[f64]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for v in values {
        writeln!(file, "{}", v)?;
    }
    file.flush()?;
    Ok(())
}

/// Writes the artifacts of scored scenes into one directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
    /// Distance mapped to the end of the color ramp.
    pub color_max_distance: f64,
}

impl ReportWriter {
    pub fn new<P: AsRef<Path>>(dir: P, color_max_distance: f64) -> Self {
        ReportWriter {
            dir: dir.as_ref().to_path_buf(),
            color_max_distance,
        }
    }

    /// Path of the artifact `<scene>.<suffix>`.
    pub fn path(&self, scene: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", scene, suffix))
    }

    pub fn write_summary(&self, scene: &str, report: &ScoreReport) -> Result<()> {
        let mut file = BufWriter::new(File::create(self.path(scene, "prf_tau_plotstr.txt"))?);
        let values = [
            report.precision,
            report.recall,
            report.fscore,
            report.threshold,
            report.stretch,
        ];
        writeln!(file, "{}", values.iter().join(" "))?;
        file.flush()?;
        Ok(())
    }

    pub fn write_histograms(&self, scene: &str, report: &ScoreReport) -> Result<()> {
        write_lines(&self.path(scene, "precision.txt"), &report.cumulative_source)?;
        write_lines(&self.path(scene, "recall.txt"), &report.cumulative_target)
    }

    pub fn write_json(&self, scene: &str, report: &ScoreReport) -> Result<()> {
        let file = BufWriter::new(File::create(self.path(scene, "score.json"))?);
        serde_json::to_writer_pretty(file, report)?;
        Ok(())
    }

    pub fn write_colored(&self, scene: &str, outcome: &ScoreOutcome) -> Result<()> {
        colorize(
            &outcome.source,
            &outcome.distance_source_to_target,
            self.color_max_distance,
        )
        .write_ply(&self.path(scene, "precision.ply"))?;
        colorize(
            &outcome.target,
            &outcome.distance_target_to_source,
            self.color_max_distance,
        )
        .write_ply(&self.path(scene, "recall.ply"))
    }

    /// Write every artifact of a scored scene.
    pub fn write_all(
        &self,
        scene: &str,
        transformation: &Matrix4<f64>,
        outcome: &ScoreOutcome,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        write_alignment(&self.path(scene, "transformation.txt"), transformation)?;
        self.write_colored(scene, outcome)?;
        self.write_histograms(scene, &outcome.report)?;
        self.write_summary(scene, &outcome.report)?;
        self.write_json(scene, &outcome.report)?;
        Ok(())
    }
}
