//! Unordered 3D point sets with optional per-point normals and colors.
//!
//! Every operation that changes the geometry (transform, selection, crop, downsampling) returns a
//! new [PointSet]. Registration stages each work on their own copy so that no stage can observe
//! another stage's intermediate state.

use na::{Matrix4, Point3, Vector3};
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Ply, Property, PropertyDef, PropertyType, ScalarType,
};
use ply_rs::writer::Writer;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointSet {
    pub points: Vec<Point3<f64>>,
    /// Parallel to `points` when present.
    pub normals: Option<Vec<Vector3<f64>>>,
    /// Parallel to `points` when present.
    pub colors: Option<Vec<[u8; 3]>>,
}

impl PointSet {
    pub fn new(points: Vec<Point3<f64>>) -> Self {
        PointSet {
            points,
            normals: None,
            colors: None,
        }
    }

    /// Attach normals. Fails if the number of normals does not match the number of points.
    pub fn with_normals(mut self, normals: Vec<Vector3<f64>>) -> Result<Self> {
        if normals.len() != self.points.len() {
            return Err(Error::config(format!(
                "{} normals for {} points",
                normals.len(),
                self.points.len()
            )));
        }
        self.normals = Some(normals);
        Ok(self)
    }

    /// Attach colors. Fails if the number of colors does not match the number of points.
    pub fn with_colors(mut self, colors: Vec<[u8; 3]>) -> Result<Self> {
        if colors.len() != self.points.len() {
            return Err(Error::config(format!(
                "{} colors for {} points",
                colors.len(),
                self.points.len()
            )));
        }
        self.colors = Some(colors);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    /// Apply a homogeneous similarity transform. Normals are rotated and renormalized.
    pub fn transform(&self, m: &Matrix4<f64>) -> PointSet {
        let points = self.points.iter().map(|p| m.transform_point(p)).collect();
        let normals = self.normals.as_ref().map(|ns| {
            ns.iter()
                .map(|n| {
                    let v = m.transform_vector(n);
                    let norm = v.norm();
                    if norm > 0.0 {
                        v / norm
                    } else {
                        v
                    }
                })
                .collect()
        });
        PointSet {
            points,
            normals,
            colors: self.colors.clone(),
        }
    }

    /// New point set containing the points at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> PointSet {
        PointSet {
            points: indices.iter().map(|i| self.points[*i]).collect(),
            normals: self
                .normals
                .as_ref()
                .map(|ns| indices.iter().map(|i| ns[*i]).collect()),
            colors: self
                .colors
                .as_ref()
                .map(|cs| indices.iter().map(|i| cs[*i]).collect()),
        }
    }

    /// Smallest and largest coordinates of the point set. `None` when empty.
    pub fn extent(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        if self.points.is_empty() {
            return None;
        }
        let min = self.points.iter().fold(
            Vector3::repeat(std::f64::INFINITY),
            |x, p| x.inf(&p.coords),
        );
        let max = self.points.iter().fold(
            Vector3::repeat(-std::f64::INFINITY),
            |x, p| x.sup(&p.coords),
        );
        Some((min, max))
    }

    /// Read a point set from a PLY file. Coordinates may be stored as any scalar type. Normals
    /// (`nx`, `ny`, `nz`) and colors (`red`, `green`, `blue`) are read when present.
    pub fn from_ply(path: &Path) -> Result<PointSet> {
        let mut file = BufReader::new(File::open(path)?);
        let parser = ply_rs::parser::Parser::<DefaultElement>::new();
        let ply = parser.read_ply(&mut file)?;

        let vertices = ply.payload.get("vertex").ok_or_else(|| {
            Error::config(format!("{} has no vertex element", path.display()))
        })?;

        let mut points = Vec::with_capacity(vertices.len());
        let mut normals = Vec::new();
        let mut colors = Vec::new();
        for (i, v) in vertices.iter().enumerate() {
            let coord = |name: &str| {
                v.get(name).and_then(scalar).ok_or_else(|| {
                    Error::Parse(format!(
                        "vertex {} of {} is missing property {}",
                        i,
                        path.display(),
                        name
                    ))
                })
            };
            points.push(Point3::new(coord("x")?, coord("y")?, coord("z")?));

            if let (Some(nx), Some(ny), Some(nz)) = (
                v.get("nx").and_then(scalar),
                v.get("ny").and_then(scalar),
                v.get("nz").and_then(scalar),
            ) {
                normals.push(Vector3::new(nx, ny, nz));
            }
            if let (Some(r), Some(g), Some(b)) = (
                v.get("red").and_then(scalar),
                v.get("green").and_then(scalar),
                v.get("blue").and_then(scalar),
            ) {
                colors.push([r as u8, g as u8, b as u8]);
            }
        }

        let mut pcd = PointSet::new(points);
        if !normals.is_empty() {
            pcd = pcd.with_normals(normals)?;
        }
        if !colors.is_empty() {
            pcd = pcd.with_colors(colors)?;
        }
        Ok(pcd)
    }

    /// Write the point set to a PLY file, including normals and colors when present.
    pub fn write_ply(&self, path: &Path) -> Result<()> {
        let mut ply = Ply::<DefaultElement>::new();
        let mut point_element = ElementDef::new("vertex".to_string());
        let mut add_property = |name: &str, ty: ScalarType| {
            point_element
                .properties
                .add(PropertyDef::new(name.to_string(), PropertyType::Scalar(ty)));
        };
        for name in &["x", "y", "z"] {
            add_property(name, ScalarType::Double);
        }
        if self.normals.is_some() {
            for name in &["nx", "ny", "nz"] {
                add_property(name, ScalarType::Float);
            }
        }
        if self.colors.is_some() {
            for name in &["red", "green", "blue"] {
                add_property(name, ScalarType::UChar);
            }
        }
        ply.header.elements.add(point_element);

        let vertices = (0..self.len())
            .map(|i| {
                let mut point = DefaultElement::new();
                let p = self.points[i];
                point.insert("x".to_string(), Property::Double(p.x));
                point.insert("y".to_string(), Property::Double(p.y));
                point.insert("z".to_string(), Property::Double(p.z));
                if let Some(normals) = &self.normals {
                    point.insert("nx".to_string(), Property::Float(normals[i].x as f32));
                    point.insert("ny".to_string(), Property::Float(normals[i].y as f32));
                    point.insert("nz".to_string(), Property::Float(normals[i].z as f32));
                }
                if let Some(colors) = &self.colors {
                    point.insert("red".to_string(), Property::UChar(colors[i][0]));
                    point.insert("green".to_string(), Property::UChar(colors[i][1]));
                    point.insert("blue".to_string(), Property::UChar(colors[i][2]));
                }
                point
            })
            .collect();
        ply.payload.insert("vertex".to_string(), vertices);

        let mut file = BufWriter::new(File::create(path)?);
        let writer = Writer::new();
        writer.write_ply(&mut file, &mut ply)?;
        Ok(())
    }
}

fn scalar(p: &Property) -> Option<f64> {
    match p {
        Property::Char(x) => Some(*x as f64),
        Property::UChar(x) => Some(*x as f64),
        Property::Short(x) => Some(*x as f64),
        Property::UShort(x) => Some(*x as f64),
        Property::Int(x) => Some(*x as f64),
        Property::UInt(x) => Some(*x as f64),
        Property::Float(x) => Some(*x as f64),
        Property::Double(x) => Some(*x),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square() -> PointSet {
        PointSet::new(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ])
    }

    #[test]
    fn transform_returns_new_set() {
        let pcd = square();
        let mut m = Matrix4::identity();
        m[(0, 3)] = 2.0;
        let moved = pcd.transform(&m);
        assert_relative_eq!(moved.points[1].x, 3.0);
        assert_relative_eq!(pcd.points[1].x, 1.0);
    }

    #[test]
    fn mismatched_normals_rejected() {
        assert!(square().with_normals(vec![Vector3::z()]).is_err());
    }

    #[test]
    fn ply_round_trip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("square.ply");
        let pcd = square()
            .with_normals(vec![Vector3::z(); 4])?
            .with_colors(vec![[255, 0, 0]; 4])?;
        pcd.write_ply(&path)?;
        let read = PointSet::from_ply(&path)?;
        assert_eq!(read.len(), 4);
        assert_relative_eq!(read.points[2], pcd.points[2]);
        assert_eq!(read.colors.unwrap()[3], [255, 0, 0]);
        assert_relative_eq!(read.normals.unwrap()[0].z, 1.0);
        Ok(())
    }

    #[test]
    fn extent_of_square() {
        let (min, max) = square().extent().unwrap();
        assert_relative_eq!(min, Vector3::new(0.0, 0.0, 0.0));
        assert_relative_eq!(max, Vector3::new(1.0, 1.0, 0.0));
        assert!(PointSet::default().extent().is_none());
    }
}
