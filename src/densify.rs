//! Build a dense, frame indexed trajectory from the sparse output of a reconstruction.
//!
//! Reconstructions typically recover only some of the input images, in arbitrary order, and name
//! them by whatever path they were given. Each recovered view is matched to a frame of the
//! canonical (sorted) image list by file name. Frames nobody recovered get an identity pose.

use na::{Quaternion, UnitQuaternion, Vector3};
use serde::Deserialize;

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::trajectory::{CameraPose, Trajectory};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

/// A camera recovered by a reconstruction. `pose` maps camera to world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredView {
    pub image: String,
    pub pose: CameraPose,
}

#[derive(Debug, Deserialize)]
struct PoseRecord {
    image: String,
    qw: f64,
    qx: f64,
    qy: f64,
    qz: f64,
    tx: f64,
    ty: f64,
    tz: f64,
}

/// Read recovered views from a CSV file with header `image,qw,qx,qy,qz,tx,ty,tz`.
pub fn read_pose_list(path: &Path) -> Result<Vec<RecoveredView>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i, record)| {
            let r: PoseRecord = record?;
            let q = Quaternion::new(r.qw, r.qx, r.qy, r.qz);
            if !(q.norm() > 0.0) {
                return Err(Error::config(format!(
                    "pose {} ({}) of {} has a zero rotation quaternion",
                    i,
                    r.image,
                    path.display()
                )));
            }
            Ok(RecoveredView {
                image: r.image,
                pose: CameraPose::from_quaternion(
                    &UnitQuaternion::from_quaternion(q),
                    &Vector3::new(r.tx, r.ty, r.tz),
                ),
            })
        })
        .collect()
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Sorted canonical image names, either the image files of a directory or the non-empty lines of
/// a text file.
pub fn canonical_images(path: &Path) -> Result<Vec<String>> {
    let mut names = if path.is_dir() {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let p = entry?.path();
            if p.is_file() && has_image_extension(&p) {
                if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names
    } else {
        fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    };
    names.sort();
    Ok(names)
}

fn basename(name: &str) -> &str {
    name.rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(name)
}

/// Frame index of every recovered view that can be matched to `canonical`.
///
/// A view matches frame `k` if the base name of `canonical[k]` occurs in its image name. When
/// several frames match, the first one in sorted order wins. Views without a match are dropped.
pub fn match_views(views: &[RecoveredView], canonical: &[String]) -> Vec<(usize, usize)> {
    let mut order = (0..canonical.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| canonical[a].cmp(&canonical[b]));

    views
        .iter()
        .enumerate()
        .filter_map(|(v, view)| {
            let found = order
                .iter()
                .find(|&&k| view.image.contains(basename(&canonical[k])));
            match found {
                Some(&k) => Some((v, k)),
                None => {
                    warn!("Recovered view {} matches no canonical image, dropping it", view.image);
                    None
                }
            }
        })
        .collect()
}

/// Trajectory with exactly `n_frames` poses.
///
/// Frame `k` holds the inverse (world to camera) of the view matched to it, or the identity if
/// there is none. `matches` pairs indices into `views` with frame indices, as returned by
/// [match_views]. If several views claim the same frame the first one is used.
pub fn densify(
    views: &[RecoveredView],
    matches: &[(usize, usize)],
    n_frames: usize,
) -> Result<Trajectory> {
    let mut frames: Vec<Option<usize>> = vec![None; n_frames];
    for &(v, k) in matches {
        if v >= views.len() {
            return Err(Error::config(format!(
                "match refers to view {} but only {} views were recovered",
                v,
                views.len()
            )));
        }
        if k >= n_frames {
            return Err(Error::config(format!(
                "view {} is matched to frame {} but the trajectory has {} frames",
                views[v].image, k, n_frames
            )));
        }
        match frames[k] {
            None => frames[k] = Some(v),
            Some(first) => warn!(
                "Frame {} is claimed by both {} and {}, keeping the first",
                k, views[first].image, views[v].image
            ),
        }
    }

    let missing = frames.iter().filter(|f| f.is_none()).count();
    if missing > 0 {
        warn!("{} of {} frames were not recovered, using identity poses", missing, n_frames);
    }

    frames
        .iter()
        .enumerate()
        .map(|(k, f)| {
            let pose = match f {
                Some(v) => views[*v].pose.inverse()?,
                None => CameraPose::identity(),
            };
            Ok(pose.with_metadata([k as i64, k as i64, 0]))
        })
        .collect::<Result<Vec<_>>>()
        .map(Trajectory::new)
}
