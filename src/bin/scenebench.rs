extern crate env_logger;
extern crate nalgebra as na;
extern crate scenebench;
extern crate structopt;

use scenebench::align::{align_trajectories, AlignOptions};
use scenebench::dataset::{evaluate_batch, scene_config, Dataset};
use scenebench::densify::{canonical_images, densify, match_views, read_pose_list};
use scenebench::report::ReportWriter;
use scenebench::trajectory::{read_alignment, write_alignment, FrameMapping};
use scenebench::*;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
struct ScoringOpt {
    /// Scene distance unit. Defaults to the config file, then to the known unit of the scene.
    #[structopt(long = "tau")]
    tau: Option<f64>,

    /// JSON file with evaluation parameters.
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Histogram range as a multiple of tau.
    #[structopt(long = "stretch")]
    stretch: Option<f64>,

    /// Score with the pre-alignment only.
    #[structopt(long = "skip-refinement")]
    skip_refinement: bool,

    /// Seed for the trajectory alignment.
    #[structopt(long = "seed")]
    seed: Option<u64>,

    /// Multiplicative jitter applied to reconstruction camera positions before alignment.
    #[structopt(long = "jitter")]
    jitter: Option<f64>,
}

impl ScoringOpt {
    /// Config file values overridden by command line flags.
    fn base_config(&self) -> Result<EvaluationConfig> {
        let mut config = match &self.config {
            Some(path) => EvaluationConfig::read(path)?,
            None => EvaluationConfig::default(),
        };
        if let Some(stretch) = self.stretch {
            config.stretch = stretch;
        }
        if self.skip_refinement {
            config.skip_refinement = true;
        }
        if let Some(seed) = self.seed {
            config.align.seed = seed;
        }
        if let Some(jitter) = self.jitter {
            config.align.jitter = jitter;
        }
        Ok(config)
    }
}

#[derive(StructOpt, Debug)]
struct EvaluateOpt {
    /// Ground truth point cloud in .ply format.
    #[structopt(name = "GT", parse(from_os_str))]
    ground_truth: PathBuf,

    /// Reconstructed point cloud in .ply format.
    #[structopt(name = "RECON", parse(from_os_str))]
    reconstruction: PathBuf,

    /// Output directory.
    #[structopt(name = "OUT", parse(from_os_str))]
    out: PathBuf,

    /// Reference camera trajectory (.log) in the ground truth's reconstruction frame.
    #[structopt(long = "gt-log", parse(from_os_str))]
    gt_log: Option<PathBuf>,

    /// Reconstructed camera trajectory (.log).
    #[structopt(long = "log", parse(from_os_str))]
    log: Option<PathBuf>,

    /// Alignment matrix taking the reference trajectory to the ground truth point cloud, or the
    /// reconstruction to the ground truth when no trajectories are given.
    #[structopt(long = "alignment", parse(from_os_str))]
    alignment: Option<PathBuf>,

    /// Crop volume (.json) in the ground truth frame.
    #[structopt(long = "crop", parse(from_os_str))]
    crop: Option<PathBuf>,

    /// Frame mapping that subsamples the reconstructed trajectory.
    #[structopt(long = "mapping", parse(from_os_str))]
    mapping: Option<PathBuf>,

    /// Scene name used for output files. Defaults to the reconstruction's file stem.
    #[structopt(long = "scene")]
    scene: Option<String>,

    #[structopt(flatten)]
    scoring: ScoringOpt,
}

#[derive(StructOpt, Debug)]
struct BatchOpt {
    /// Directory with one ground truth directory per scene.
    #[structopt(name = "GT_DIR", parse(from_os_str))]
    ground_truth: PathBuf,

    /// Directory with one reconstruction directory per scene.
    #[structopt(name = "RECON_DIR", parse(from_os_str))]
    reconstruction: PathBuf,

    /// Output directory. Each scene writes into its own subdirectory.
    #[structopt(name = "OUT", parse(from_os_str))]
    out: PathBuf,

    /// Scenes to evaluate. Defaults to every scene present in both directories.
    #[structopt(long = "scene", number_of_values = 1)]
    scenes: Vec<String>,

    /// Show a progress bar.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    #[structopt(flatten)]
    scoring: ScoringOpt,
}

#[derive(StructOpt, Debug)]
struct DensifyOpt {
    /// Recovered camera poses (camera to world) as CSV with header image,qw,qx,qy,qz,tx,ty,tz.
    #[structopt(name = "POSES", parse(from_os_str))]
    poses: PathBuf,

    /// Directory of input images, or a text file listing them.
    #[structopt(name = "IMAGES", parse(from_os_str))]
    images: PathBuf,

    /// Output trajectory in .log format.
    #[structopt(name = "OUT", parse(from_os_str))]
    out: PathBuf,

    /// Number of frames to write. Defaults to the number of images.
    #[structopt(long = "frames")]
    frames: Option<usize>,
}

#[derive(StructOpt, Debug)]
struct AlignOpt {
    /// Trajectory to align (.log).
    #[structopt(name = "SOURCE", parse(from_os_str))]
    source: PathBuf,

    /// Reference trajectory (.log).
    #[structopt(name = "TARGET", parse(from_os_str))]
    target: PathBuf,

    /// Output alignment matrix.
    #[structopt(name = "OUT", parse(from_os_str))]
    out: PathBuf,

    /// Matrix applied to the reference trajectory before alignment.
    #[structopt(long = "target-alignment", parse(from_os_str))]
    target_alignment: Option<PathBuf>,

    /// Frame mapping that subsamples the source trajectory.
    #[structopt(long = "mapping", parse(from_os_str))]
    mapping: Option<PathBuf>,

    #[structopt(long = "seed", default_value = "0")]
    seed: u64,

    #[structopt(long = "jitter", default_value = "0")]
    jitter: f64,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "scenebench",
    about = "Benchmark a reconstructed point cloud and camera trajectory against ground truth."
)]
enum Opt {
    /// Align, refine and score one scene.
    Evaluate(EvaluateOpt),
    /// Evaluate every scene of a dataset directory.
    Batch(BatchOpt),
    /// Turn a list of recovered camera poses into a trajectory with one pose per image.
    Densify(DensifyOpt),
    /// Compute the rough similarity between two trajectories.
    Align(AlignOpt),
}

fn run_evaluate(opt: EvaluateOpt) -> Result<()> {
    let scene = match &opt.scene {
        Some(s) => s.clone(),
        None => opt
            .reconstruction
            .file_stem()
            .and_then(|s| s.to_str())
            .map(String::from)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "cannot derive a scene name from {}",
                    opt.reconstruction.display()
                ))
            })?,
    };
    let config = scene_config(&opt.scoring.base_config()?, &scene, opt.scoring.tau)?;

    let paths = ScenePaths {
        name: scene.clone(),
        ground_truth: opt.ground_truth,
        reconstruction: opt.reconstruction,
        ground_truth_trajectory: opt.gt_log,
        reconstruction_trajectory: opt.log,
        alignment: opt.alignment,
        crop: opt.crop,
        mapping: opt.mapping,
    };
    let inputs = paths.load()?;
    let writer = ReportWriter::new(&opt.out, config.color_max_distance());
    let result = evaluate(&NativeEngine::new(), &inputs, &config, &writer)?;

    println!("{}: {}", scene, result.report);
    println!("Alignment:{}", result.transformation);
    Ok(())
}

fn run_batch(opt: BatchOpt) -> Result<()> {
    let dataset = Dataset::new(&opt.ground_truth, &opt.reconstruction);
    let scenes = if opt.scenes.is_empty() {
        dataset.scenes()?
    } else {
        opt.scenes.clone()
    };
    if scenes.is_empty() {
        return Err(Error::Configuration(format!(
            "no scenes found in {}",
            opt.reconstruction.display()
        )));
    }
    let base = opt.scoring.base_config()?;

    let results = evaluate_batch(
        &NativeEngine::new(),
        &dataset,
        &scenes,
        &base,
        opt.scoring.tau,
        &opt.out,
        opt.verbose,
    );

    println!("{:<16} {:>9} {:>9} {:>9}", "scene", "precision", "recall", "f-score");
    let mut failed = 0;
    for (scene, result) in &results {
        match result {
            Ok(e) => println!(
                "{:<16} {:>9.4} {:>9.4} {:>9.4}",
                scene, e.report.precision, e.report.recall, e.report.fscore
            ),
            Err(e) => {
                failed += 1;
                println!("{:<16} failed: {}", scene, e);
            }
        }
    }
    if failed > 0 {
        return Err(Error::Configuration(format!(
            "{} of {} scenes failed",
            failed,
            results.len()
        )));
    }
    Ok(())
}

fn run_densify(opt: DensifyOpt) -> Result<()> {
    let views = read_pose_list(&opt.poses)?;
    let canonical = canonical_images(&opt.images)?;
    let n_frames = opt.frames.unwrap_or_else(|| canonical.len());
    let matches = match_views(&views, &canonical);
    let trajectory = densify(&views, &matches, n_frames)?;
    trajectory.write_log(&opt.out)?;
    println!(
        "Wrote {} frames, {} recovered, to {}",
        trajectory.len(),
        matches.len(),
        opt.out.display()
    );
    Ok(())
}

fn run_align(opt: AlignOpt) -> Result<()> {
    let mut source = Trajectory::read_log(&opt.source)?;
    if let Some(mapping) = &opt.mapping {
        source = source.subsample(&FrameMapping::read(mapping)?)?;
    }
    let target = Trajectory::read_log(&opt.target)?;
    let target_align = match &opt.target_alignment {
        Some(path) => read_alignment(path)?,
        None => na::Matrix4::identity(),
    };
    let align = AlignOptions {
        seed: opt.seed,
        jitter: opt.jitter,
        ..AlignOptions::default()
    };
    let m = align_trajectories(&NativeEngine::new(), &source, &target, &target_align, &align)?;
    write_alignment(&opt.out, &m)?;
    println!("Alignment:{}", m);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Opt::from_args() {
        Opt::Evaluate(opt) => run_evaluate(opt),
        Opt::Batch(opt) => run_batch(opt),
        Opt::Densify(opt) => run_densify(opt),
        Opt::Align(opt) => run_align(opt),
    }
}
