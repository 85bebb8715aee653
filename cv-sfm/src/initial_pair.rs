use crate::{pair_seed, FourPoint, PairwiseMatch, Ransac, Result, SfmError, SfmSettings, Viewport};
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sample_consensus::Consensus;
use std::cmp::Reverse;

/// The fraction of a pair's correspondences explained by a single homography.
pub fn homography_inlier_ratio(
    pair: &PairwiseMatch,
    viewports: &[Viewport],
    settings: &SfmSettings,
) -> f64 {
    let matches = pair.feature_matches(viewports);
    if matches.is_empty() {
        return 0.0;
    }
    let mut ransac = Ransac::new(
        settings.homography_threshold,
        settings.homography_max_iterations,
        Xoshiro256PlusPlus::seed_from_u64(pair_seed(settings.sfm_seed, pair.view_a, pair.view_b)),
    );
    let inliers = ransac
        .model_inliers(&FourPoint::new(), matches.iter().copied())
        .map_or(0, |(_, inliers)| inliers.len());
    inliers as f64 / matches.len() as f64
}

/// Candidate initial pairs, best first.
///
/// Pairs are ranked by their number of verified correspondences. Pairs which are
/// well explained by a homography (planar scenes or pure rotations) are skipped.
/// The homography test runs lazily as the ranking is consumed.
pub fn rank_initial_pairs<'a>(
    matching: &'a [PairwiseMatch],
    viewports: &'a [Viewport],
    settings: &'a SfmSettings,
) -> impl Iterator<Item = &'a PairwiseMatch> + 'a {
    let mut candidates: Vec<&PairwiseMatch> = matching.iter().collect();
    candidates.sort_by_key(|m| (Reverse(m.matches.len()), m.view_a, m.view_b));
    candidates.into_iter().filter(move |pair| {
        let ratio = homography_inlier_ratio(pair, viewports, settings);
        let accepted = ratio <= settings.max_homography_inliers;
        info!(
            "initial pair candidate ({}, {}): {} matches, {:.1}% homography inliers{}",
            pair.view_a,
            pair.view_b,
            pair.matches.len(),
            100.0 * ratio,
            if accepted { "" } else { ", rejected" }
        );
        accepted
    })
}

/// Checks an explicitly requested initial pair and orders it.
pub fn validate_initial_pair((a, b): (usize, usize), num_views: usize) -> Result<(usize, usize)> {
    if a == b || a >= num_views || b >= num_views {
        return Err(SfmError::InitialPairOutOfRange(a, b, num_views));
    }
    Ok((a.min(b), a.max(b)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CameraPose, DescriptorSet};
    use nalgebra::{Point2, Point3, Rotation3, Vector3};

    fn viewport(ix: usize, positions: Vec<Point2<f64>>) -> Viewport {
        let count = positions.len();
        Viewport::new(
            ix,
            800,
            600,
            positions,
            DescriptorSet::F32 {
                dim: 8,
                data: vec![0.0; 8 * count],
            },
            vec![],
        )
        .unwrap()
    }

    /// Three views: 0 and 1 see a plane, 0 and 2 see a volume with fewer points.
    fn scene() -> (Vec<Viewport>, Vec<PairwiseMatch>) {
        let base = CameraPose::new(700.0, Point2::new(400.0, 300.0));
        let cameras = [
            base,
            base.with_pose(
                Rotation3::from_euler_angles(0.0, 0.1, 0.0).into_inner(),
                Vector3::new(-0.5, 0.0, 0.0),
            ),
            base.with_pose(
                Rotation3::from_euler_angles(0.0, -0.1, 0.0).into_inner(),
                Vector3::new(0.5, 0.0, 0.0),
            ),
        ];
        let planar: Vec<Point3<f64>> = (0..60)
            .map(|i| Point3::new((i % 10) as f64 * 0.2 - 1.0, (i / 10) as f64 * 0.2 - 0.6, 5.0))
            .collect();
        let volume: Vec<Point3<f64>> = (0..40)
            .map(|i| {
                let i = i as f64;
                Point3::new((i * 0.7).sin(), (i * 1.3).cos() * 0.7, 4.0 + 2.0 * (i * 0.37).sin())
            })
            .collect();
        let project = |c: &CameraPose, points: &[Point3<f64>]| -> Vec<Point2<f64>> {
            points.iter().map(|p| c.project(p).unwrap()).collect()
        };
        let first = [project(&cameras[0], &planar), project(&cameras[0], &volume)].concat();
        let viewports = vec![
            viewport(0, first),
            viewport(1, project(&cameras[1], &planar)),
            viewport(2, project(&cameras[2], &volume)),
        ];
        let matching = vec![
            PairwiseMatch {
                view_a: 0,
                view_b: 1,
                matches: (0..60).map(|i| (i, i)).collect(),
            },
            PairwiseMatch {
                view_a: 0,
                view_b: 2,
                matches: (0..40).map(|i| (60 + i, i)).collect(),
            },
        ];
        (viewports, matching)
    }

    #[test]
    fn planar_pair_is_skipped() {
        let (viewports, matching) = scene();
        let settings = SfmSettings::default();
        assert!(homography_inlier_ratio(&matching[0], &viewports, &settings) > 0.99);
        assert!(homography_inlier_ratio(&matching[1], &viewports, &settings) < 0.6);
        let best = rank_initial_pairs(&matching, &viewports, &settings)
            .next()
            .unwrap();
        assert_eq!((best.view_a, best.view_b), (0, 2));
    }

    #[test]
    fn explicit_pair_is_validated() {
        assert_eq!(validate_initial_pair((4, 1), 5).unwrap(), (1, 4));
        assert!(matches!(
            validate_initial_pair((1, 5), 5),
            Err(SfmError::InitialPairOutOfRange(1, 5, 5))
        ));
        assert!(validate_initial_pair((2, 2), 5).is_err());
    }
}
