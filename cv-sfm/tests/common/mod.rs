#![allow(dead_code)]

use cv_sfm::{CameraPose, DescriptorSet, Viewport};
use nalgebra::{Point2, Point3, Rotation3, Vector3};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

pub const FOCAL_LENGTH: f64 = 800.0;
pub const WIDTH: usize = 800;
pub const HEIGHT: usize = 600;
pub const DESCRIPTOR_DIM: usize = 64;

/// Ground truth cameras, points, and the viewports observing them.
pub struct Scene {
    pub cameras: Vec<CameraPose>,
    pub points: Vec<Point3<f64>>,
    pub viewports: Vec<Viewport>,
}

/// Cameras on an arc looking at a cloud of points around the origin.
pub fn cameras(num_views: usize) -> Vec<CameraPose> {
    (0..num_views)
        .map(|i| {
            let angle = (i as f64 - (num_views - 1) as f64 / 2.0) * 0.15;
            let rotation = Rotation3::from_euler_angles(0.0, angle, 0.0).into_inner();
            let center = Vector3::new(6.0 * angle.sin(), 0.1 * i as f64, -6.0 * angle.cos());
            CameraPose::new(FOCAL_LENGTH, Point2::new(WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0))
                .with_pose(rotation, -(rotation * center))
        })
        .collect()
}

fn unit_descriptor(rng: &mut impl Rng) -> Vec<f32> {
    let v: Vec<f32> = (0..DESCRIPTOR_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.into_iter().map(|x| x / norm).collect()
}

/// Every view sees every point. The features of a view are a rotation of the
/// point order, so feature indices differ between views.
pub fn scene(num_views: usize, num_points: usize, seed: u64) -> Scene {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let cameras = cameras(num_views);
    let points: Vec<Point3<f64>> = (0..num_points)
        .map(|_| {
            Point3::new(
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.5..1.5),
            )
        })
        .collect();
    let descriptors: Vec<Vec<f32>> = (0..num_points).map(|_| unit_descriptor(&mut rng)).collect();
    let colors: Vec<[u8; 3]> = (0..num_points).map(|_| rng.gen()).collect();

    let viewports = cameras
        .iter()
        .enumerate()
        .map(|(view, camera)| {
            let order: Vec<usize> = (0..num_points).map(|k| (k + 7 * view) % num_points).collect();
            let positions = order
                .iter()
                .map(|&p| camera.project(&points[p]).unwrap())
                .collect();
            let data = order.iter().flat_map(|&p| descriptors[p].iter().copied()).collect();
            Viewport::new(
                view,
                WIDTH,
                HEIGHT,
                positions,
                DescriptorSet::F32 {
                    dim: DESCRIPTOR_DIM,
                    data,
                },
                order.iter().map(|&p| colors[p]).collect(),
            )
            .unwrap()
            .with_focal_length_hint(FOCAL_LENGTH)
        })
        .collect();
    Scene {
        cameras,
        points,
        viewports,
    }
}

/// A viewport without any features.
pub fn empty_viewport(index: usize) -> Viewport {
    Viewport::new(
        index,
        WIDTH,
        HEIGHT,
        vec![],
        DescriptorSet::F32 {
            dim: DESCRIPTOR_DIM,
            data: vec![],
        },
        vec![],
    )
    .unwrap()
}
