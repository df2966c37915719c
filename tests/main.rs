use assert_cmd::prelude::*;
use nalgebra::{Matrix3, Matrix4, Point3, Translation3, UnitQuaternion, Vector3};
use predicates::prelude::*;
use scenebench::trajectory::write_alignment;
use scenebench::{CameraPose, PointSet, Trajectory};
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn terrain() -> PointSet {
    let mut points = Vec::new();
    for i in 0..20 {
        for j in 0..20 {
            let (x, y) = (i as f64 * 0.05, j as f64 * 0.05);
            points.push(Point3::new(x, y, (3.0 * x).sin() * 0.2 + (2.0 * y).cos() * 0.1));
        }
    }
    PointSet::new(points)
}

fn cameras(m: &Matrix4<f64>) -> Trajectory {
    Trajectory::new(
        (0..12)
            .map(|i| {
                let a = i as f64 * 0.5;
                let p = CameraPose::from_parts(
                    &Matrix3::identity(),
                    &Vector3::new(0.5 + a.cos(), 0.5 + a.sin(), 1.0 + 0.05 * a),
                );
                CameraPose::new(m * p.pose)
            })
            .collect(),
    )
}

fn offset() -> Matrix4<f64> {
    Translation3::new(0.3, -0.2, 0.1).to_homogeneous()
        * UnitQuaternion::from_euler_angles(0.05, -0.02, 0.3).to_homogeneous()
}

/// Ground truth and a reconstruction displaced by `offset`, both with trajectories.
fn write_scene(gt: &Path, recon: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(gt)?;
    fs::create_dir_all(recon)?;
    let to_recon = offset().try_inverse().unwrap();
    terrain().write_ply(&gt.join(format!("{}.ply", name)))?;
    terrain()
        .transform(&to_recon)
        .write_ply(&recon.join(format!("{}.ply", name)))?;
    cameras(&Matrix4::identity()).write_log(&gt.join(format!("{}_COLMAP_SfM.log", name)))?;
    cameras(&to_recon).write_log(&recon.join(format!("{}.log", name)))?;
    write_alignment(&gt.join(format!("{}_trans.txt", name)), &Matrix4::identity())?;
    fs::write(
        gt.join(format!("{}.json", name)),
        r#"{"min_bound": [-0.1, -0.1, -1.0], "max_bound": [1.1, 1.1, 1.0]}"#,
    )?;
    Ok(())
}

#[test]
fn evaluate_identical_clouds() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let cloud = dir.path().join("cloud.ply");
    terrain().write_ply(&cloud)?;

    let mut cmd = Command::cargo_bin("scenebench")?;
    cmd.arg("evaluate")
        .arg(&cloud)
        .arg(&cloud)
        .arg(dir.path().join("out"))
        .arg("--tau")
        .arg("0.05")
        .arg("--skip-refinement");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("f-score 1.0000"));

    let summary = fs::read_to_string(dir.path().join("out").join("cloud.prf_tau_plotstr.txt"))?;
    assert_eq!(summary.trim(), "1 1 1 0.05 5");
    Ok(())
}

#[test]
fn evaluate_with_trajectories() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let gt = dir.path().join("gt");
    let recon = dir.path().join("recon");
    write_scene(&gt, &recon, "Toy")?;
    let out = dir.path().join("out");

    let mut cmd = Command::cargo_bin("scenebench")?;
    cmd.arg("evaluate")
        .arg(gt.join("Toy.ply"))
        .arg(recon.join("Toy.ply"))
        .arg(&out)
        .arg("--gt-log")
        .arg(gt.join("Toy_COLMAP_SfM.log"))
        .arg("--log")
        .arg(recon.join("Toy.log"))
        .arg("--alignment")
        .arg(gt.join("Toy_trans.txt"))
        .arg("--crop")
        .arg(gt.join("Toy.json"))
        .arg("--tau")
        .arg("0.05");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Toy: precision 1.0000"));

    for suffix in &[
        "precision.ply",
        "recall.ply",
        "precision.txt",
        "recall.txt",
        "prf_tau_plotstr.txt",
        "transformation.txt",
        "score.json",
    ] {
        assert!(out.join(format!("Toy.{}", suffix)).is_file());
    }
    let m = scenebench::trajectory::read_alignment(&out.join("Toy.transformation.txt"))?;
    assert!((m - offset()).amax() < 1e-6);
    let cumulative = fs::read_to_string(out.join("Toy.precision.txt"))?;
    assert_eq!(cumulative.lines().count(), 499);
    Ok(())
}

#[test]
fn batch_over_dataset() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let gt = dir.path().join("gt");
    let recon = dir.path().join("recon");
    write_scene(&gt.join("Toy"), &recon.join("Toy"), "Toy")?;
    let out = dir.path().join("out");

    let mut cmd = Command::cargo_bin("scenebench")?;
    cmd.arg("batch")
        .arg(&gt)
        .arg(&recon)
        .arg(&out)
        .arg("--tau")
        .arg("0.05");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Toy"))
        .stdout(predicate::str::contains("failed").not());
    assert!(out.join("Toy").join("Toy.score.json").is_file());
    Ok(())
}

#[test]
fn mismatched_trajectories_fail() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let gt = dir.path().join("gt");
    let recon = dir.path().join("recon");
    write_scene(&gt, &recon, "Toy")?;
    let short = Trajectory::new(cameras(&Matrix4::identity()).poses()[..5].to_vec());
    short.write_log(&gt.join("Toy_COLMAP_SfM.log"))?;
    let out = dir.path().join("out");

    let mut cmd = Command::cargo_bin("scenebench")?;
    cmd.arg("evaluate")
        .arg(gt.join("Toy.ply"))
        .arg(recon.join("Toy.ply"))
        .arg(&out)
        .arg("--gt-log")
        .arg(gt.join("Toy_COLMAP_SfM.log"))
        .arg("--log")
        .arg(recon.join("Toy.log"))
        .arg("--tau")
        .arg("0.05");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Configuration"));
    assert!(!out.join("Toy.score.json").exists());
    Ok(())
}

#[test]
fn missing_input_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mut cmd = Command::cargo_bin("scenebench")?;
    cmd.arg("evaluate")
        .arg(dir.path().join("nope.ply"))
        .arg(dir.path().join("nope.ply"))
        .arg(dir.path().join("out"))
        .arg("--tau")
        .arg("0.05");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
    Ok(())
}

#[test]
fn densify_pose_list() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let poses = dir.path().join("poses.csv");
    fs::write(
        &poses,
        "image,qw,qx,qy,qz,tx,ty,tz\n\
         frames/00002.jpg,1,0,0,0,1,2,3\n\
         frames/00000.jpg,1,0,0,0,-1,0,0\n\
         unrelated.jpg,1,0,0,0,0,0,0\n",
    )?;
    let images = dir.path().join("images.txt");
    fs::write(&images, "00000.jpg\n00001.jpg\n00002.jpg\n00003.jpg\n")?;
    let out = dir.path().join("dense.log");

    let mut cmd = Command::cargo_bin("scenebench")?;
    cmd.arg("densify").arg(&poses).arg(&images).arg(&out);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Wrote 4 frames, 2 recovered"));

    let traj = Trajectory::read_log(&out)?;
    assert_eq!(traj.len(), 4);
    assert_eq!(traj.poses()[1].pose, Matrix4::identity());
    assert!((traj.poses()[2].position() - Point3::new(-1.0, -2.0, -3.0)).norm() < 1e-12);
    assert!((traj.poses()[0].position() - Point3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
    Ok(())
}

#[test]
fn align_trajectories() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let source = dir.path().join("source.log");
    let target = dir.path().join("target.log");
    cameras(&Matrix4::identity()).write_log(&source)?;
    cameras(&offset()).write_log(&target)?;
    let out = dir.path().join("align.txt");

    let mut cmd = Command::cargo_bin("scenebench")?;
    cmd.arg("align").arg(&source).arg(&target).arg(&out);
    cmd.assert().success();

    let m = scenebench::trajectory::read_alignment(&out)?;
    assert!((m - offset()).amax() < 1e-8);
    Ok(())
}
