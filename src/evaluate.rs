//! The full benchmark run for one scene: pre-alignment, refinement, scoring and reporting.

use na::Matrix4;
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::align::{align_trajectories, AlignOptions};
use crate::crop::CropVolume;
use crate::engine::GeometryEngine;
use crate::error::{Error, Result};
use crate::pointset::PointSet;
use crate::refine::{canonical_schedule, refine, RegistrationStage};
use crate::report::ReportWriter;
use crate::score::{score, ScoreParams, ScoreReport};
use crate::trajectory::{read_alignment, FrameMapping, Trajectory};

/// Parameters of an evaluation run. Unset fields are derived from `tau`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Scene distance unit (dTau). Precision and recall count points closer than this.
    pub tau: f64,
    /// Refinement stages. Defaults to [canonical_schedule] of `tau`.
    pub schedule: Option<Vec<RegistrationStage>>,
    /// Voxel size used before scoring. Defaults to `tau / 2`.
    pub score_voxel_size: Option<f64>,
    /// Histogram range as a multiple of `tau`.
    pub stretch: f64,
    pub normals_knn: usize,
    /// Distance at the end of the color ramp of the diagnostic point clouds. Defaults to
    /// `3 * tau`.
    pub color_max_distance: Option<f64>,
    /// Score with the pre-alignment, without ICP refinement.
    pub skip_refinement: bool,
    pub align: AlignOptions,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        EvaluationConfig {
            tau: 0.0,
            schedule: None,
            score_voxel_size: None,
            stretch: 5.0,
            normals_knn: 20,
            color_max_distance: None,
            skip_refinement: false,
            align: AlignOptions::default(),
        }
    }
}

impl EvaluationConfig {
    pub fn from_tau(tau: f64) -> Self {
        EvaluationConfig {
            tau,
            ..EvaluationConfig::default()
        }
    }

    pub fn with_tau(mut self, tau: f64) -> Self {
        self.tau = tau;
        self
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn read(path: &Path) -> Result<EvaluationConfig> {
        let file = BufReader::new(File::open(path).map_err(|e| {
            Error::config(format!("cannot open config {}: {}", path.display(), e))
        })?);
        Ok(serde_json::from_reader(file)?)
    }

    pub fn schedule(&self) -> Vec<RegistrationStage> {
        self.schedule
            .clone()
            .unwrap_or_else(|| canonical_schedule(self.tau))
    }

    pub fn score_params(&self) -> ScoreParams {
        ScoreParams {
            voxel_size: self.score_voxel_size.unwrap_or(self.tau / 2.0),
            threshold: self.tau,
            stretch: self.stretch,
            normals_knn: self.normals_knn,
        }
    }

    pub fn color_max_distance(&self) -> f64 {
        self.color_max_distance.unwrap_or(3.0 * self.tau)
    }

    /// Check every parameter before any work is done.
    pub fn validate(&self) -> Result<()> {
        if !(self.tau > 0.0) {
            return Err(Error::config(format!("tau must be positive, got {}", self.tau)));
        }
        self.score_params().validate()?;
        let schedule = self.schedule();
        if schedule.is_empty() && !self.skip_refinement {
            return Err(Error::config("registration schedule is empty"));
        }
        for stage in &schedule {
            stage.validate()?;
        }
        if !(self.color_max_distance() > 0.0) {
            return Err(Error::config("color ramp distance must be positive"));
        }
        self.align.validate()
    }
}

/// Everything needed to evaluate one scene.
#[derive(Debug, Clone)]
pub struct SceneInputs {
    pub name: String,
    pub ground_truth: PointSet,
    pub reconstruction: PointSet,
    pub ground_truth_trajectory: Option<Trajectory>,
    /// Already subsampled to the ground truth frames.
    pub reconstruction_trajectory: Option<Trajectory>,
    /// Maps the ground truth trajectory into the frame of the ground truth points.
    pub alignment: Option<Matrix4<f64>>,
    /// Region of interest in the ground truth frame.
    pub crop: Option<CropVolume>,
}

/// Files of one scene.
#[derive(Debug, Clone, Default)]
pub struct ScenePaths {
    pub name: String,
    pub ground_truth: PathBuf,
    pub reconstruction: PathBuf,
    pub ground_truth_trajectory: Option<PathBuf>,
    pub reconstruction_trajectory: Option<PathBuf>,
    pub alignment: Option<PathBuf>,
    pub crop: Option<PathBuf>,
    /// Subsamples a dense reconstruction trajectory to the ground truth frames.
    pub mapping: Option<PathBuf>,
}

fn require(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::config(format!(
            "{} {} does not exist",
            what,
            path.display()
        )))
    }
}

impl ScenePaths {
    /// Check that every named file exists.
    pub fn check(&self) -> Result<()> {
        require(&self.ground_truth, "ground truth point cloud")?;
        require(&self.reconstruction, "reconstruction point cloud")?;
        let optional = [
            (&self.ground_truth_trajectory, "ground truth trajectory"),
            (&self.reconstruction_trajectory, "reconstruction trajectory"),
            (&self.alignment, "alignment matrix"),
            (&self.crop, "crop volume"),
            (&self.mapping, "frame mapping"),
        ];
        for (path, what) in optional.iter() {
            if let Some(p) = path {
                require(p, what)?;
            }
        }
        if self.mapping.is_some() && self.reconstruction_trajectory.is_none() {
            return Err(Error::config(
                "a frame mapping needs a reconstruction trajectory",
            ));
        }
        Ok(())
    }

    /// Read all inputs. The small text inputs are parsed before the point clouds so that
    /// malformed files fail fast.
    pub fn load(&self) -> Result<SceneInputs> {
        self.check()?;
        let crop = self.crop.as_ref().map(|p| CropVolume::read(p)).transpose()?;
        let alignment = self.alignment.as_ref().map(|p| read_alignment(p)).transpose()?;
        let ground_truth_trajectory = self
            .ground_truth_trajectory
            .as_ref()
            .map(|p| Trajectory::read_log(p))
            .transpose()?;
        let reconstruction_trajectory = self
            .reconstruction_trajectory
            .as_ref()
            .map(|p| Trajectory::read_log(p))
            .transpose()?;
        let reconstruction_trajectory = match (&self.mapping, reconstruction_trajectory) {
            (Some(path), Some(traj)) => {
                let mapping = FrameMapping::read(path)?;
                if mapping.n_total != traj.len() {
                    warn!(
                        "Frame mapping expects {} frames but the trajectory has {}",
                        mapping.n_total,
                        traj.len()
                    );
                }
                Some(traj.subsample(&mapping)?)
            }
            (_, traj) => traj,
        };

        let ground_truth = PointSet::from_ply(&self.ground_truth)?;
        let reconstruction = PointSet::from_ply(&self.reconstruction)?;
        Ok(SceneInputs {
            name: self.name.clone(),
            ground_truth,
            reconstruction,
            ground_truth_trajectory,
            reconstruction_trajectory,
            alignment,
            crop,
        })
    }
}

/// Result of a completed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub scene: String,
    /// Maps the reconstruction into the ground truth frame.
    pub transformation: Matrix4<f64>,
    pub report: ScoreReport,
}

/// Initial reconstruction to ground truth transform.
///
/// With both trajectories the reconstruction trajectory is aligned to the ground truth trajectory
/// after the explicit alignment (or identity) has been applied to it. Without trajectories the
/// explicit alignment is used as is, and without either the identity.
pub fn pre_align<E: GeometryEngine + ?Sized>(
    engine: &E,
    inputs: &SceneInputs,
    config: &EvaluationConfig,
) -> Result<Matrix4<f64>> {
    match (
        &inputs.reconstruction_trajectory,
        &inputs.ground_truth_trajectory,
        &inputs.alignment,
    ) {
        (Some(source), Some(target), alignment) => align_trajectories(
            engine,
            source,
            target,
            &alignment.unwrap_or_else(Matrix4::identity),
            &config.align,
        ),
        (_, _, Some(alignment)) => Ok(*alignment),
        _ => {
            warn!(
                "{}: no trajectories or alignment matrix, assuming the reconstruction is already aligned",
                inputs.name
            );
            Ok(Matrix4::identity())
        }
    }
}

/// Run the whole pipeline on one scene and write its artifacts with `writer`.
pub fn evaluate<E: GeometryEngine + ?Sized>(
    engine: &E,
    inputs: &SceneInputs,
    config: &EvaluationConfig,
    writer: &ReportWriter,
) -> Result<Evaluation> {
    config.validate()?;
    if let (Some(r), Some(g)) = (
        &inputs.reconstruction_trajectory,
        &inputs.ground_truth_trajectory,
    ) {
        if r.len() != g.len() {
            return Err(Error::config(format!(
                "{}: reconstruction trajectory has {} poses but the ground truth has {}",
                inputs.name,
                r.len(),
                g.len()
            )));
        }
    }
    info!(
        "{}: loaded {} reconstruction and {} ground truth points",
        inputs.name,
        inputs.reconstruction.len(),
        inputs.ground_truth.len()
    );

    let pre = pre_align(engine, inputs, config)?;
    info!("{}: pre-aligned", inputs.name);
    debug!("{}: pre-alignment\n{}", inputs.name, pre);

    let transformation = if config.skip_refinement {
        info!("{}: skipping refinement", inputs.name);
        pre
    } else {
        let refined = refine(
            engine,
            &inputs.reconstruction,
            &inputs.ground_truth,
            &pre,
            inputs.crop.as_ref(),
            &config.schedule(),
        )?;
        info!("{}: refined", inputs.name);
        refined
    };

    let aligned = inputs.reconstruction.transform(&transformation);
    let outcome = score(
        engine,
        &aligned,
        &inputs.ground_truth,
        inputs.crop.as_ref(),
        &config.score_params(),
    )?;
    info!("{}: scored, {}", inputs.name, outcome.report);

    writer.write_all(&inputs.name, &transformation, &outcome)?;
    info!("{}: reported", inputs.name);

    Ok(Evaluation {
        scene: inputs.name.clone(),
        transformation,
        report: outcome.report,
    })
}
