mod common;

use approx::assert_relative_eq;
use common::*;
use cv_sfm::{
    compute_pairwise_matching, reconstruct, run, Bundle, DescriptorSet, PairwiseMatch, SfmError,
    SfmSettings, Viewport,
};
use nalgebra::{Point2, Point3};

fn max_reprojection_error(bundle: &Bundle, viewports: &[Viewport]) -> f64 {
    bundle
        .points
        .iter()
        .flat_map(|point| {
            point.features.iter().map(move |r| {
                let observed = viewports[r.view].positions[r.feature];
                bundle.cameras[r.view]
                    .squared_reprojection_error(&point.position, &observed)
                    .sqrt()
            })
        })
        .fold(0.0, f64::max)
}

#[test]
fn five_views_are_recovered() {
    let _ = pretty_env_logger::try_init();
    let scene = scene(5, 150, 0);
    let bundle = run(scene.viewports.clone(), &SfmSettings::default(), None, false)
        .unwrap()
        .unwrap();

    assert_eq!(bundle.num_valid_cameras(), 5);
    assert_eq!(bundle.points.len(), 150);
    assert!(bundle.points.iter().all(|p| p.features.len() == 5));
    assert!(max_reprojection_error(&bundle, &scene.viewports) < 1e-4);

    // Relative rotations do not depend on the gauge.
    for (estimated, truth) in bundle.cameras.iter().zip(&scene.cameras).skip(1) {
        let relative = estimated.rotation * bundle.cameras[0].rotation.transpose();
        let expected = truth.rotation * scene.cameras[0].rotation.transpose();
        assert_relative_eq!(relative, expected, epsilon = 1e-6);
        assert_relative_eq!(estimated.focal_length, FOCAL_LENGTH, epsilon = 1e-4);
    }

    // Normalization puts the mean camera center at the origin.
    let mean = bundle
        .cameras
        .iter()
        .map(|c| c.center().coords)
        .sum::<nalgebra::Vector3<f64>>()
        / 5.0;
    assert_relative_eq!(mean, nalgebra::Vector3::zeros(), epsilon = 1e-9);
}

#[test]
fn featureless_view_stays_invalid() {
    let scene = scene(4, 100, 1);
    let mut viewports = scene.viewports.clone();
    viewports.insert(2, empty_viewport(2));
    let bundle = run(viewports.clone(), &SfmSettings::default(), None, false)
        .unwrap()
        .unwrap();
    assert_eq!(bundle.cameras.len(), 5);
    assert!(!bundle.cameras[2].is_valid());
    assert_eq!(bundle.num_valid_cameras(), 4);
    assert!(bundle
        .points
        .iter()
        .all(|p| p.features.iter().all(|r| r.view != 2)));
    assert!(max_reprojection_error(&bundle, &viewports) < 1e-4);
}

#[test]
fn planar_pair_has_no_initial_pair() {
    let cameras = cameras(2);
    let plane: Vec<Point3<f64>> = (0..100)
        .map(|i| Point3::new((i % 10) as f64 * 0.25 - 1.25, (i / 10) as f64 * 0.2 - 1.0, 0.0))
        .collect();
    let viewports: Vec<Viewport> = cameras
        .iter()
        .enumerate()
        .map(|(view, camera)| {
            let positions: Vec<Point2<f64>> = plane.iter().map(|p| camera.project(p).unwrap()).collect();
            Viewport::new(
                view,
                WIDTH,
                HEIGHT,
                positions,
                DescriptorSet::F32 {
                    dim: 8,
                    data: vec![0.0; 8 * plane.len()],
                },
                vec![],
            )
            .unwrap()
        })
        .collect();
    let matching = vec![PairwiseMatch {
        view_a: 0,
        view_b: 1,
        matches: (0..plane.len()).map(|i| (i, i)).collect(),
    }];
    let result = reconstruct(viewports, matching, &SfmSettings::default());
    assert!(matches!(result, Err(SfmError::NoInitialPair)));
}

#[test]
fn no_matching_pairs_is_fatal() {
    let viewports = vec![empty_viewport(0), empty_viewport(1)];
    assert!(matches!(
        run(viewports, &SfmSettings::default(), None, false),
        Err(SfmError::NoVerifiedPairs)
    ));
}

#[test]
fn runs_are_deterministic() {
    let scene = scene(4, 120, 5);
    let settings = SfmSettings {
        always_full_ba: true,
        ..SfmSettings::default()
    };
    let first = run(scene.viewports.clone(), &settings, None, false).unwrap();
    let second = run(scene.viewports, &settings, None, false).unwrap();
    assert!(first.is_some());
    assert_eq!(first, second);
}

#[test]
fn forced_initial_pair_is_used() {
    let scene = scene(4, 100, 2);
    let settings = SfmSettings {
        initial_pair: Some((3, 1)),
        ..SfmSettings::default()
    };
    let bundle = run(scene.viewports.clone(), &settings, None, false)
        .unwrap()
        .unwrap();
    assert_eq!(bundle.num_valid_cameras(), 4);
    assert!(max_reprojection_error(&bundle, &scene.viewports) < 1e-4);
}

#[test]
fn unposable_view_is_passed_over() {
    let scene = scene(6, 150, 7);
    let settings = SfmSettings {
        initial_pair: Some((2, 3)),
        ..SfmSettings::default()
    };
    let matching = compute_pairwise_matching(&scene.viewports, &settings).unwrap();
    // View 0 keeps its matches, but every feature now sits where its neighbor was.
    let mut viewports = scene.viewports.clone();
    viewports[0].positions.rotate_left(1);

    let bundle = reconstruct(viewports, matching, &settings).unwrap();
    let posed: Vec<bool> = bundle.cameras.iter().map(|c| c.is_valid()).collect();
    assert_eq!(posed, vec![false, true, true, true, true, true]);
}

