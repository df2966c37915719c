//! Camera trajectories and the plain text formats used to exchange them.
//!
//! A trajectory log stores one 5-line record per frame:
//!
//! ```txt
//! <frame_id> <matched_id> 0
//! <m00> <m01> <m02> <m03>
//! <m10> <m11> <m12> <m13>
//! <m20> <m21> <m22> <m23>
//! <m30> <m31> <m32> <m33>
//! ```
//!
//! Matrix values are written with exactly 12 decimal digits and records are not separated by
//! blank lines.

use itertools::Itertools;
use na::{Matrix3, Matrix4, Point3, UnitQuaternion, Vector3};
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{map_res, opt, recognize};
use nom::error::VerboseError;
use nom::multi::{count, many0};
use nom::number::complete::double;
use nom::sequence::{pair, preceded};
use nom::IResult;

use std::fs::File;
use std::io::prelude::*;
use std::io::BufWriter;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::pointset::PointSet;

type ParseResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

fn integer(input: &str) -> ParseResult<i64> {
    preceded(
        multispace0,
        map_res(recognize(pair(opt(char('-')), digit1)), i64::from_str),
    )(input)
}

fn float(input: &str) -> ParseResult<f64> {
    preceded(multispace0, double)(input)
}

fn matrix(input: &str) -> ParseResult<Matrix4<f64>> {
    let (input, values) = count(float, 16)(input)?;
    Ok((input, Matrix4::from_row_slice(&values)))
}

/// Run a parser over the whole input, turning nom errors into [Error::Parse].
fn parse_all<'a, T, F>(contents: &'a str, what: &str, parser: F) -> Result<T>
where
    F: Fn(&'a str) -> ParseResult<'a, T>,
{
    match parser(contents) {
        Ok((rest, value)) => {
            let rest = rest.trim_start();
            if rest.trim_end().is_empty() {
                Ok(value)
            } else {
                let line = contents[..contents.len() - rest.len()].matches('\n').count() + 1;
                Err(Error::Parse(format!(
                    "unexpected content in {} near line {}: {:?}",
                    what,
                    line,
                    rest.lines().next().unwrap_or("")
                )))
            }
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::Parse(format!(
            "{}: {}",
            what,
            nom::error::convert_error(contents, e)
        ))),
        Err(nom::Err::Incomplete(x)) => Err(Error::Parse(format!("{}: {:?}", what, x))),
    }
}

/// A single camera pose stored as a 4x4 homogeneous matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    /// Integer triple carried through the log format.
    pub metadata: Option<[i64; 3]>,
    pub pose: Matrix4<f64>,
    pub focal_length: Option<f64>,
}

impl CameraPose {
    pub fn new(pose: Matrix4<f64>) -> Self {
        CameraPose {
            metadata: None,
            pose,
            focal_length: None,
        }
    }

    pub fn identity() -> Self {
        CameraPose::new(Matrix4::identity())
    }

    /// Pose from a rotation matrix and a translation.
    pub fn from_parts(rotation: &Matrix3<f64>, position: &Vector3<f64>) -> Self {
        let mut pose = Matrix4::identity();
        pose.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
        pose.fixed_view_mut::<3, 1>(0, 3).copy_from(position);
        CameraPose::new(pose)
    }

    /// Pose from a unit quaternion and a translation.
    pub fn from_quaternion(rotation: &UnitQuaternion<f64>, position: &Vector3<f64>) -> Self {
        CameraPose::from_parts(&rotation.to_rotation_matrix().into_inner(), position)
    }

    pub fn with_metadata(mut self, metadata: [i64; 3]) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Translation column of the pose.
    pub fn position(&self) -> Point3<f64> {
        Point3::new(self.pose[(0, 3)], self.pose[(1, 3)], self.pose[(2, 3)])
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        self.pose.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// True if the rotation block is orthonormal with determinant 1 and the bottom row is
    /// `0 0 0 1`, all within `eps`.
    pub fn is_rigid(&self, eps: f64) -> bool {
        let r = self.rotation();
        let bottom = self.pose.row(3);
        (r.transpose() * r - Matrix3::identity()).amax() < eps
            && (r.determinant() - 1.0).abs() < eps
            && bottom[0].abs() < eps
            && bottom[1].abs() < eps
            && bottom[2].abs() < eps
            && (bottom[3] - 1.0).abs() < eps
    }

    /// Inverse pose. Metadata and focal length are carried over.
    pub fn inverse(&self) -> Result<CameraPose> {
        let inv = self
            .pose
            .try_inverse()
            .ok_or_else(|| Error::config(format!("pose is not invertible: {}", self.pose)))?;
        Ok(CameraPose {
            metadata: self.metadata,
            pose: inv,
            focal_length: self.focal_length,
        })
    }
}

/// An ordered sequence of camera poses, one per frame. Immutable once built.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trajectory {
    poses: Vec<CameraPose>,
}

impl Trajectory {
    pub fn new(poses: Vec<CameraPose>) -> Self {
        Trajectory { poses }
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn poses(&self) -> &[CameraPose] {
        &self.poses
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CameraPose> {
        self.poses.iter()
    }

    /// Camera positions, in frame order.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.poses.iter().map(|p| p.position()).collect()
    }

    /// Camera positions as a point set.
    pub fn to_point_set(&self) -> PointSet {
        PointSet::new(self.positions())
    }

    /// Pick the frames named by `mapping` out of a dense trajectory.
    pub fn subsample(&self, mapping: &FrameMapping) -> Result<Trajectory> {
        mapping
            .frames
            .iter()
            .map(|&frame| {
                if frame == 0 || frame > self.len() {
                    Err(Error::config(format!(
                        "frame mapping refers to frame {} but the trajectory has {} frames",
                        frame,
                        self.len()
                    )))
                } else {
                    Ok(self.poses[frame - 1].clone())
                }
            })
            .collect::<Result<Vec<_>>>()
            .map(Trajectory::new)
    }

    /// Parse a trajectory from the contents of a log file.
    pub fn from_log_str(contents: &str) -> Result<Trajectory> {
        fn record(input: &str) -> ParseResult<CameraPose> {
            let (input, meta) = count(integer, 3)(input)?;
            let (input, pose) = matrix(input)?;
            Ok((
                input,
                CameraPose::new(pose).with_metadata([meta[0], meta[1], meta[2]]),
            ))
        }

        parse_all(contents, "trajectory log", many0(record)).map(Trajectory::new)
    }

    /// Read a trajectory log file.
    pub fn read_log(path: &Path) -> Result<Trajectory> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Trajectory::from_log_str(&contents)
    }

    /// Serialize to the log format. Poses without metadata are written as `i i 0`.
    pub fn write_log_to<W: Write>(&self, out: &mut W) -> Result<()> {
        for (i, pose) in self.poses.iter().enumerate() {
            let meta = pose.metadata.unwrap_or([i as i64, i as i64, 0]);
            writeln!(out, "{} {} {}", meta[0], meta[1], meta[2])?;
            write_matrix_rows(out, &pose.pose, 12)?;
        }
        Ok(())
    }

    /// Write a trajectory log file.
    pub fn write_log(&self, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        self.write_log_to(&mut file)?;
        file.flush()?;
        Ok(())
    }
}

impl std::fmt::Display for Trajectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trajectory with {} frames", self.len())
    }
}

fn write_matrix_rows<W: Write>(out: &mut W, m: &Matrix4<f64>, digits: usize) -> Result<()> {
    for r in 0..4 {
        writeln!(
            out,
            "{}",
            (0..4).map(|c| format!("{:.*}", digits, m[(r, c)])).join(" ")
        )?;
    }
    Ok(())
}

/// Subsampling of a dense (video) trajectory down to the reference frames.
///
/// ```txt
/// <n_sampled>
/// <n_total>
/// <sample_index> <frame_number>
/// ...
/// ```
/// Frame numbers are 1-based indices into the dense trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMapping {
    pub n_total: usize,
    pub frames: Vec<usize>,
}

impl FrameMapping {
    pub fn parse(contents: &str) -> Result<FrameMapping> {
        fn unsigned(input: &str) -> ParseResult<usize> {
            preceded(multispace0, map_res(digit1, usize::from_str))(input)
        }
        fn mapping(input: &str) -> ParseResult<(usize, Vec<usize>)> {
            let (input, n_sampled) = unsigned(input)?;
            let (input, n_total) = unsigned(input)?;
            let (input, rows) = count(pair(unsigned, unsigned), n_sampled)(input)?;
            Ok((input, (n_total, rows.into_iter().map(|(_, f)| f).collect())))
        }

        let (n_total, frames) = parse_all(contents, "frame mapping", mapping)?;
        if let Some(f) = frames.iter().find(|&&f| f > n_total) {
            return Err(Error::config(format!(
                "frame mapping refers to frame {} beyond its total of {}",
                f, n_total
            )));
        }
        Ok(FrameMapping { n_total, frames })
    }

    pub fn read(path: &Path) -> Result<FrameMapping> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        FrameMapping::parse(&contents)
    }
}

/// Parse a 4x4 alignment matrix (row-major, whitespace separated). The bottom row must be
/// `0 0 0 1`.
pub fn parse_alignment(contents: &str) -> Result<Matrix4<f64>> {
    let m = parse_all(contents, "alignment matrix", matrix)?;
    let bottom = m.row(3);
    if bottom[0] != 0.0 || bottom[1] != 0.0 || bottom[2] != 0.0 || bottom[3] != 1.0 {
        return Err(Error::config(format!(
            "alignment matrix bottom row must be 0 0 0 1, found {}",
            bottom
        )));
    }
    Ok(m)
}

pub fn read_alignment(path: &Path) -> Result<Matrix4<f64>> {
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    parse_alignment(&contents)
}

pub fn write_alignment(path: &Path, m: &Matrix4<f64>) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_matrix_rows(&mut file, m, 12)?;
    file.flush()?;
    Ok(())
}
