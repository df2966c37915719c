//! Regions of interest used to restrict point sets before registration and scoring.
//!
//! Crop files are JSON, either an oriented polygonal prism
//!
//! ```json
//! {
//!   "bounding_polygon": [[0, 0, 0], [1, 0, 0], [1, 1, 0], [0, 1, 0]],
//!   "orthogonal_axis": "Z",
//!   "axis_min": -1.0,
//!   "axis_max": 1.0
//! }
//! ```
//!
//! or an axis aligned box `{"min_bound": [x, y, z], "max_bound": [x, y, z]}`. Unknown fields are
//! ignored.

use na::{Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{Error, Result};
use crate::pointset::PointSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    /// Project onto the plane orthogonal to this axis.
    fn project(self, p: &Point3<f64>) -> Point2<f64> {
        match self {
            Axis::X => Point2::new(p.y, p.z),
            Axis::Y => Point2::new(p.x, p.z),
            Axis::Z => Point2::new(p.x, p.y),
        }
    }
}

impl std::str::FromStr for Axis {
    type Err = Error;

    fn from_str(s: &str) -> Result<Axis> {
        match s.trim() {
            "X" | "x" => Ok(Axis::X),
            "Y" | "y" => Ok(Axis::Y),
            "Z" | "z" => Ok(Axis::Z),
            other => Err(Error::config(format!(
                "orthogonal axis must be X, Y or Z, found {:?}",
                other
            ))),
        }
    }
}

/// On-disk layout of a crop file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CropFile {
    Polygon {
        bounding_polygon: Vec<[f64; 3]>,
        orthogonal_axis: String,
        axis_min: f64,
        axis_max: f64,
    },
    Box {
        min_bound: [f64; 3],
        max_bound: [f64; 3],
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CropVolume {
    AxisAligned {
        min_bound: Vector3<f64>,
        max_bound: Vector3<f64>,
    },
    /// A planar polygon extruded along `axis` between `axis_min` and `axis_max`.
    Prism {
        polygon: Vec<Point3<f64>>,
        axis: Axis,
        axis_min: f64,
        axis_max: f64,
    },
}

impl CropVolume {
    pub fn axis_aligned(min_bound: Vector3<f64>, max_bound: Vector3<f64>) -> Result<CropVolume> {
        let v = CropVolume::AxisAligned {
            min_bound,
            max_bound,
        };
        v.validate()?;
        Ok(v)
    }

    pub fn prism(
        polygon: Vec<Point3<f64>>,
        axis: Axis,
        axis_min: f64,
        axis_max: f64,
    ) -> Result<CropVolume> {
        let v = CropVolume::Prism {
            polygon,
            axis,
            axis_min,
            axis_max,
        };
        v.validate()?;
        Ok(v)
    }

    fn validate(&self) -> Result<()> {
        match self {
            CropVolume::AxisAligned {
                min_bound,
                max_bound,
            } => {
                if !min_bound.iter().chain(max_bound.iter()).all(|x| x.is_finite()) {
                    return Err(Error::config("crop box bounds must be finite"));
                }
                if (0..3).any(|i| min_bound[i] > max_bound[i]) {
                    return Err(Error::config(format!(
                        "crop box min bound {:?} exceeds max bound {:?}",
                        min_bound.as_slice(),
                        max_bound.as_slice()
                    )));
                }
            }
            CropVolume::Prism {
                polygon,
                axis_min,
                axis_max,
                ..
            } => {
                if polygon.len() < 3 {
                    return Err(Error::config(format!(
                        "crop polygon needs at least 3 vertices, found {}",
                        polygon.len()
                    )));
                }
                if !polygon.iter().all(|p| p.coords.iter().all(|x| x.is_finite()))
                    || !axis_min.is_finite()
                    || !axis_max.is_finite()
                {
                    return Err(Error::config("crop polygon must be finite"));
                }
                if axis_min > axis_max {
                    return Err(Error::config(format!(
                        "crop axis_min {} exceeds axis_max {}",
                        axis_min, axis_max
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn from_json(contents: &str) -> Result<CropVolume> {
        let file: CropFile = serde_json::from_str(contents)
            .map_err(|e| Error::config(format!("malformed crop volume: {}", e)))?;
        match file {
            CropFile::Polygon {
                bounding_polygon,
                orthogonal_axis,
                axis_min,
                axis_max,
            } => CropVolume::prism(
                bounding_polygon
                    .iter()
                    .map(|p| Point3::new(p[0], p[1], p[2]))
                    .collect(),
                orthogonal_axis.parse()?,
                axis_min,
                axis_max,
            ),
            CropFile::Box {
                min_bound,
                max_bound,
            } => CropVolume::axis_aligned(min_bound.into(), max_bound.into()),
        }
    }

    pub fn read(path: &Path) -> Result<CropVolume> {
        let mut contents = String::new();
        BufReader::new(File::open(path)?).read_to_string(&mut contents)?;
        CropVolume::from_json(&contents)
    }

    /// True if `p` lies inside the volume. Boundaries are inclusive.
    pub fn contains(&self, p: &Point3<f64>) -> bool {
        match self {
            CropVolume::AxisAligned {
                min_bound,
                max_bound,
            } => (0..3).all(|i| p[i] >= min_bound[i] && p[i] <= max_bound[i]),
            CropVolume::Prism {
                polygon,
                axis,
                axis_min,
                axis_max,
            } => {
                let h = p[axis.index()];
                h >= *axis_min && h <= *axis_max && in_polygon(polygon, *axis, &axis.project(p))
            }
        }
    }

    /// Points of `pcd` inside the volume, as a new point set.
    pub fn crop(&self, pcd: &PointSet) -> PointSet {
        let indices = pcd
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| self.contains(p))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        pcd.select(&indices)
    }
}

/// Crossing-number test of `q` against the polygon projected along `axis`.
fn in_polygon(polygon: &[Point3<f64>], axis: Axis, q: &Point2<f64>) -> bool {
    let n = polygon.len();
    let mut inside = false;
    for i in 0..n {
        let a = axis.project(&polygon[i]);
        let b = axis.project(&polygon[(i + 1) % n]);
        if (a.y > q.y) != (b.y > q.y) {
            let x = a.x + (q.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if q.x < x {
                inside = !inside;
            }
        }
    }
    inside
}
