//! Benchmark datasets laid out one directory per scene, and batch evaluation over them.
//!
//! ```txt
//! <ground_truth>/<scene>/<scene>.ply
//! <ground_truth>/<scene>/<scene>.json                       crop volume
//! <ground_truth>/<scene>/<scene>_COLMAP_SfM.log             reference trajectory
//! <ground_truth>/<scene>/<scene>_trans.txt                  reference trajectory to ground truth
//! <ground_truth>/<scene>/<scene>_mapping_reference.txt      optional frame mapping
//! <reconstruction>/<scene>/<scene>.ply
//! <reconstruction>/<scene>/<scene>.log
//! ```
//!
//! Only the two point clouds are required, every other file is used when present.

use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;

use std::path::{Path, PathBuf};

use crate::engine::GeometryEngine;
use crate::error::{Error, Result};
use crate::evaluate::{evaluate, EvaluationConfig, Evaluation, ScenePaths};
use crate::report::ReportWriter;

/// Distance unit of the Tanks and Temples training scenes.
pub fn known_tau(scene: &str) -> Option<f64> {
    match scene {
        "Barn" => Some(0.01),
        "Caterpillar" => Some(0.005),
        "Church" => Some(0.025),
        "Courthouse" => Some(0.025),
        "Ignatius" => Some(0.003),
        "Meetingroom" => Some(0.01),
        "Truck" => Some(0.005),
        _ => None,
    }
}

pub(crate) fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {pos}/{len} ({eta})")
            .progress_chars("#-"),
    );
    pb.set_message(message);
    pb
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    if path.is_file() {
        Some(path)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub ground_truth: PathBuf,
    pub reconstruction: PathBuf,
}

impl Dataset {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(ground_truth: P, reconstruction: Q) -> Self {
        Dataset {
            ground_truth: ground_truth.as_ref().to_path_buf(),
            reconstruction: reconstruction.as_ref().to_path_buf(),
        }
    }

    /// Scenes that have a directory in both the ground truth and the reconstruction, sorted.
    pub fn scenes(&self) -> Result<Vec<String>> {
        if !self.reconstruction.is_dir() {
            return Err(Error::config(format!(
                "reconstruction directory {} does not exist",
                self.reconstruction.display()
            )));
        }
        let mut scenes = Vec::new();
        for entry in std::fs::read_dir(&self.reconstruction)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if self.ground_truth.join(name).is_dir() {
                    scenes.push(name.to_string());
                }
            }
        }
        scenes.sort();
        Ok(scenes)
    }

    /// Paths of `scene`. Optional files are only named if they exist.
    pub fn scene_paths(&self, scene: &str) -> ScenePaths {
        let gt = self.ground_truth.join(scene);
        let recon = self.reconstruction.join(scene);
        ScenePaths {
            name: scene.to_string(),
            ground_truth: gt.join(format!("{}.ply", scene)),
            reconstruction: recon.join(format!("{}.ply", scene)),
            ground_truth_trajectory: existing(gt.join(format!("{}_COLMAP_SfM.log", scene))),
            reconstruction_trajectory: existing(recon.join(format!("{}.log", scene))),
            alignment: existing(gt.join(format!("{}_trans.txt", scene))),
            crop: existing(gt.join(format!("{}.json", scene))),
            mapping: existing(gt.join(format!("{}_mapping_reference.txt", scene))),
        }
    }
}

/// Configuration for `scene`. The distance unit is `tau` if given, else the one set in `base`,
/// else the scene's known unit.
pub fn scene_config(
    base: &EvaluationConfig,
    scene: &str,
    tau: Option<f64>,
) -> Result<EvaluationConfig> {
    let tau = tau
        .or_else(|| if base.tau > 0.0 { Some(base.tau) } else { None })
        .or_else(|| known_tau(scene))
        .ok_or_else(|| {
            Error::config(format!(
                "no distance unit known for scene {}, pass one explicitly",
                scene
            ))
        })?;
    let config = base.clone().with_tau(tau);
    config.validate()?;
    Ok(config)
}

/// Evaluate `scenes` of `dataset` in parallel. Each scene writes into `out/<scene>/`. A failing
/// scene does not stop the others.
pub fn evaluate_batch<E: GeometryEngine + Sync + ?Sized>(
    engine: &E,
    dataset: &Dataset,
    scenes: &[String],
    base: &EvaluationConfig,
    tau: Option<f64>,
    out: &Path,
    verbose: bool,
) -> Vec<(String, Result<Evaluation>)> {
    scenes
        .par_iter()
        .progress_with(progress_bar(scenes.len() as u64, "Evaluating scenes", verbose))
        .map(|scene| {
            let run = || -> Result<Evaluation> {
                let config = scene_config(base, scene, tau)?;
                let inputs = dataset.scene_paths(scene).load()?;
                let writer =
                    ReportWriter::new(out.join(scene), config.color_max_distance());
                evaluate(engine, &inputs, &config, &writer)
            };
            let result = run();
            if let Err(e) = &result {
                error!("{}: {}", scene, e);
            }
            (scene.clone(), result)
        })
        .collect()
}
