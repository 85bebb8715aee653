use crate::{CameraPose, FeatureReference, Result, SfmError, TrackList, Viewport};
use log::*;
use nalgebra::{Point2, Point3, Vector3};
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];

/// A reconstructed track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlePoint {
    pub position: Point3<f64>,
    pub color: [u8; 3],
    pub features: Vec<FeatureReference>,
}

/// The result of a reconstruction: one camera per input view, invalid (focal
/// length zero) for views which were not reconstructed, and the valid tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub cameras: Vec<CameraPose>,
    pub points: Vec<BundlePoint>,
}

impl Bundle {
    pub fn new(viewports: &[Viewport], tracks: &TrackList) -> Self {
        let cameras = viewports.iter().map(|v| v.camera).collect();
        let points = tracks
            .iter()
            .filter_map(|track| {
                Some(BundlePoint {
                    position: track.position()?,
                    color: track.color,
                    features: track.features.clone(),
                })
            })
            .collect();
        Self { cameras, points }
    }

    pub fn num_valid_cameras(&self) -> usize {
        self.cameras.iter().filter(|c| c.is_valid()).count()
    }

    /// Writes the points and a viewing frustum per valid camera as an ASCII PLY file.
    ///
    /// Each frustum is the camera center joined to the image corners, back projected
    /// to depth `camera_size`.
    pub fn export_ply(&self, mut writer: impl Write, camera_size: f64) -> Result<()> {
        let mut ply = Ply::<DefaultElement>::new();
        ply.header.encoding = Encoding::Ascii;
        ply.header.comments.push("Exported from cv-sfm".to_string());

        let mut vertex = ElementDef::new("vertex".to_string());
        for axis in ["x", "y", "z"] {
            let p = PropertyDef::new(axis.to_string(), PropertyType::Scalar(ScalarType::Double));
            vertex.properties.add(p);
        }
        for channel in ["red", "green", "blue"] {
            let p = PropertyDef::new(channel.to_string(), PropertyType::Scalar(ScalarType::UChar));
            vertex.properties.add(p);
        }
        ply.header.elements.add(vertex);
        let mut face = ElementDef::new("face".to_string());
        face.properties.add(PropertyDef::new(
            "vertex_index".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        ));
        ply.header.elements.add(face);

        let mut vertices = vec![];
        let mut faces = vec![];
        for camera in self.cameras.iter().filter(|c| c.is_valid()) {
            let apex = vertices.len() as i32;
            vertices.push(ply_vertex(camera.center(), CAMERA_COLOR));
            vertices.extend(
                frustum_corners(camera, camera_size)
                    .into_iter()
                    .map(|corner| ply_vertex(corner, CAMERA_COLOR)),
            );
            for k in 0..4 {
                let mut triangle = DefaultElement::new();
                triangle.insert(
                    "vertex_index".to_string(),
                    Property::ListInt(vec![apex, apex + 1 + k, apex + 1 + (k + 1) % 4]),
                );
                faces.push(triangle);
            }
        }
        vertices.extend(self.points.iter().map(|p| ply_vertex(p.position, p.color)));
        debug!(
            "writing {} vertices and {} faces",
            vertices.len(),
            faces.len()
        );
        ply.payload.insert("vertex".to_string(), vertices);
        ply.payload.insert("face".to_string(), faces);

        Writer::new()
            .write_ply(&mut writer, &mut ply)
            .map_err(SfmError::Export)?;
        Ok(())
    }
}

/// The image corners of `camera` at depth `depth` in front of it, in world coordinates.
///
/// The image is taken to span twice the principal point.
fn frustum_corners(camera: &CameraPose, depth: f64) -> [Point3<f64>; 4] {
    let [w, h] = [2.0 * camera.principal_point.x, 2.0 * camera.principal_point.y];
    let to_world = camera.rotation.transpose();
    [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)].map(|(x, y)| {
        let n = camera.normalize(&Point2::new(x, y));
        camera.center() + to_world * Vector3::new(n.x, n.y, 1.0) * depth
    })
}

fn ply_vertex(p: Point3<f64>, [r, g, b]: [u8; 3]) -> DefaultElement {
    let mut vertex = DefaultElement::new();
    vertex.insert("x".to_string(), Property::Double(p.x));
    vertex.insert("y".to_string(), Property::Double(p.y));
    vertex.insert("z".to_string(), Property::Double(p.z));
    vertex.insert("red".to_string(), Property::UChar(r));
    vertex.insert("green".to_string(), Property::UChar(g));
    vertex.insert("blue".to_string(), Property::UChar(b));
    vertex
}

/// Storage of the per-view cameras, written concurrently.
pub trait ViewSink: Sync {
    fn num_views(&self) -> usize;

    /// The camera the view currently has, invalid if none.
    fn camera(&self, view: usize) -> Result<CameraPose>;

    fn store_camera(&self, view: usize, camera: &CameraPose) -> Result<()>;
}

/// Hands every camera of the bundle to its view in parallel and returns how many
/// were stored. Views without a camera before and after are left alone.
pub fn apply_cameras(bundle: &Bundle, sink: &impl ViewSink) -> Result<usize> {
    if bundle.cameras.len() != sink.num_views() {
        return Err(SfmError::CameraCountMismatch {
            cameras: bundle.cameras.len(),
            views: sink.num_views(),
        });
    }
    let progress = Mutex::new(0usize);
    bundle
        .cameras
        .par_iter()
        .enumerate()
        .try_for_each(|(view, camera)| -> Result<()> {
            if !camera.is_valid() && !sink.camera(view)?.is_valid() {
                return Ok(());
            }
            sink.store_camera(view, camera)?;
            // Poisoning only happens if another writer panicked.
            let mut stored = progress.lock().unwrap_or_else(|e| e.into_inner());
            *stored += 1;
            info!("saved camera of view {} ({} stored)", view, *stored);
            Ok(())
        })?;
    Ok(progress.into_inner().unwrap_or_else(|e| e.into_inner()))
}
