use crate::{
    DescriptorElement, DescriptorSet, EightPoint, FeatureMatch, NearestNeighbor, NeighborResult,
    Ransac, Result, SfmError, SfmSettings, Viewport,
};
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use sample_consensus::Consensus;
use serde::{Deserialize, Serialize};

/// The geometrically verified correspondences of two viewports, `view_a < view_b`.
///
/// Each entry of `matches` is (feature in `view_a`, feature in `view_b`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseMatch {
    pub view_a: usize,
    pub view_b: usize,
    pub matches: Vec<(usize, usize)>,
}

impl PairwiseMatch {
    /// The pixel positions of every correspondence.
    pub fn feature_matches(&self, viewports: &[Viewport]) -> Vec<FeatureMatch> {
        let (a, b) = (&viewports[self.view_a], &viewports[self.view_b]);
        self.matches
            .iter()
            .map(|&(fa, fb)| FeatureMatch(a.positions[fa], b.positions[fb]))
            .collect()
    }
}

/// All unordered view pairs to match. With `video_matching` nonzero each view is
/// only paired with that many views preceding it.
pub fn candidate_pairs(num_views: usize, video_matching: usize) -> Vec<(usize, usize)> {
    (0..num_views)
        .flat_map(|b| {
            let first = if video_matching == 0 {
                0
            } else {
                b.saturating_sub(video_matching)
            };
            (first..b).map(move |a| (a, b))
        })
        .collect()
}

/// Derives the seed of one pair so the result does not depend on scheduling.
pub fn pair_seed(seed: u64, a: usize, b: usize) -> u64 {
    seed ^ (a as u64)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((b as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F))
}

/// Matches every candidate pair in parallel and keeps the verified ones, sorted by pair.
///
/// It is fatal if no pair survives verification.
pub fn compute_pairwise_matching(
    viewports: &[Viewport],
    settings: &SfmSettings,
) -> Result<Vec<PairwiseMatch>> {
    let pairs = candidate_pairs(viewports.len(), settings.video_matching);
    info!(
        "matching {} view pairs of {} viewports",
        pairs.len(),
        viewports.len()
    );
    let results: Vec<Option<PairwiseMatch>> = pairs
        .par_iter()
        .map(|&(a, b)| match_pair(viewports, a, b, settings))
        .collect::<Result<_>>()?;
    let mut matching: Vec<PairwiseMatch> = results.into_iter().flatten().collect();
    matching.sort_by_key(|m| (m.view_a, m.view_b));
    info!(
        "found {} verified pairs with {} correspondences",
        matching.len(),
        matching.iter().map(|m| m.matches.len()).sum::<usize>()
    );
    if matching.is_empty() {
        return Err(SfmError::NoVerifiedPairs);
    }
    Ok(matching)
}

/// Matches and verifies one pair, `None` if it does not hold enough inliers.
pub fn match_pair(
    viewports: &[Viewport],
    a: usize,
    b: usize,
    settings: &SfmSettings,
) -> Result<Option<PairwiseMatch>> {
    let descriptors_a = viewports[a].descriptor_set(a)?;
    let descriptors_b = viewports[b].descriptor_set(b)?;
    if descriptors_a.dim() != descriptors_b.dim() {
        warn!(
            "viewports {} and {} have descriptors of dimension {} and {}",
            a,
            b,
            descriptors_a.dim(),
            descriptors_b.dim()
        );
        return Ok(None);
    }
    let ratio = settings.lowe_ratio;
    let max_distance = settings.maximum_descriptor_distance;
    let matches = match (descriptors_a, descriptors_b) {
        (DescriptorSet::I16 { dim, data: da }, DescriptorSet::I16 { data: db, .. }) => {
            symmetric_matching(*dim, da, db, ratio, max_distance)?
        }
        (DescriptorSet::U16 { dim, data: da }, DescriptorSet::U16 { data: db, .. }) => {
            symmetric_matching(*dim, da, db, ratio, max_distance)?
        }
        (DescriptorSet::F32 { dim, data: da }, DescriptorSet::F32 { data: db, .. }) => {
            symmetric_matching(*dim, da, db, ratio, max_distance)?
        }
        _ => {
            warn!("viewports {} and {} use different descriptor encodings", a, b);
            return Ok(None);
        }
    };
    if matches.len() < settings.minimum_feature_matches {
        debug!(
            "pair ({}, {}): {} symmetric matches are not enough",
            a,
            b,
            matches.len()
        );
        return Ok(None);
    }

    let feature_matches: Vec<FeatureMatch> = matches
        .iter()
        .map(|&(fa, fb)| FeatureMatch(viewports[a].positions[fa], viewports[b].positions[fb]))
        .collect();
    let mut ransac = Ransac::new(
        settings.fundamental_threshold,
        settings.fundamental_max_iterations,
        Xoshiro256PlusPlus::seed_from_u64(pair_seed(settings.matching_seed, a, b)),
    );
    let inliers = match ransac.model_inliers(&EightPoint::new(), feature_matches.iter().copied())
    {
        Some((_, inliers)) => inliers,
        None => return Ok(None),
    };
    debug!(
        "pair ({}, {}): {} of {} matches agree with the fundamental matrix",
        a,
        b,
        inliers.len(),
        matches.len()
    );
    if inliers.len() < settings.minimum_matching_inliers {
        return Ok(None);
    }
    Ok(Some(PairwiseMatch {
        view_a: a,
        view_b: b,
        matches: inliers.into_iter().map(|ix| matches[ix]).collect(),
    }))
}

/// Finds, for every descriptor in `a`, its accepted nearest neighbor in `b`.
fn matching<T: DescriptorElement>(
    a: &NearestNeighbor<'_, T>,
    a_data: &[T],
    b: &NearestNeighbor<'_, T>,
    ratio: f64,
    max_distance: f64,
) -> Vec<Option<usize>> {
    a_data
        .chunks_exact(a.dim())
        .map(|query| accept::<T>(b.find(query), ratio, max_distance))
        .collect()
}

/// Accepts the best neighbor unless it is too far or too close to the second best.
fn accept<T: DescriptorElement>(
    result: NeighborResult<T::Distance>,
    ratio: f64,
    max_distance: f64,
) -> Option<usize> {
    let best = result.best?;
    let best_distance = T::unit_distance(best.distance);
    if best_distance > max_distance {
        return None;
    }
    if let Some(second) = result.second {
        // Both distances are squared, so the ratio is too.
        if best_distance > ratio * ratio * T::unit_distance(second.distance) {
            return None;
        }
    }
    Some(best.index)
}

/// Matches two descriptor blocks in both directions and keeps mutual best matches.
pub fn symmetric_matching<T: DescriptorElement>(
    dim: usize,
    a: &[T],
    b: &[T],
    ratio: f64,
    max_distance: f64,
) -> Result<Vec<(usize, usize)>> {
    let nn_a = NearestNeighbor::new(dim, a)?;
    let nn_b = NearestNeighbor::new(dim, b)?;
    // The best match for each feature in a to the features of b.
    let forward = matching(&nn_a, a, &nn_b, ratio, max_distance);
    // The best match for each feature in b to the features of a.
    let reverse = matching(&nn_b, b, &nn_a, ratio, max_distance);
    Ok(forward
        .into_iter()
        .enumerate()
        .filter_map(|(fa, fb)| fb.filter(|&fb| reverse[fb] == Some(fa)).map(|fb| (fa, fb)))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn all_pairs_and_video_window() {
        assert_eq!(
            candidate_pairs(4, 0),
            vec![(0, 1), (0, 2), (1, 2), (0, 3), (1, 3), (2, 3)]
        );
        assert_eq!(candidate_pairs(4, 1), vec![(0, 1), (1, 2), (2, 3)]);
        assert!(candidate_pairs(1, 0).is_empty());
    }

    #[test]
    fn pair_seeds_differ() {
        assert_ne!(pair_seed(0, 0, 1), pair_seed(0, 1, 0));
        assert_ne!(pair_seed(0, 0, 1), pair_seed(0, 0, 2));
        assert_eq!(pair_seed(7, 3, 9), pair_seed(7, 3, 9));
    }

    #[test]
    fn ambiguous_matches_are_rejected() {
        // Rows of b: a copy of a[0], and two equally near variants of a[1].
        let descriptor = |values: &[f32]| {
            let mut d = vec![0.0f32; 8];
            d[..values.len()].copy_from_slice(values);
            d
        };
        let a: Vec<f32> = [descriptor(&[1.0]), descriptor(&[0.0, 1.0])].concat();
        let b: Vec<f32> = [
            descriptor(&[1.0]),
            descriptor(&[0.0, 1.0, 0.01]),
            descriptor(&[0.0, 1.0, -0.01]),
        ]
        .concat();
        let matches = symmetric_matching(8, &a, &b, 0.8, 4.0).unwrap();
        assert_eq!(matches, vec![(0, 0)]);
    }

    #[test]
    fn empty_side_has_no_matches() {
        let a = vec![0i16; 16];
        let b: Vec<i16> = vec![];
        assert!(symmetric_matching(8, &a, &b, 0.8, 4.0).unwrap().is_empty());
        assert!(symmetric_matching(8, &b, &a, 0.8, 4.0).unwrap().is_empty());
    }

    #[test]
    fn differing_dimensions_are_not_matched() {
        let viewport = |ix: usize, dim: usize| {
            Viewport::new(
                ix,
                100,
                100,
                (0..40).map(|i| nalgebra::Point2::new(i as f64, 2.0 * i as f64)).collect(),
                DescriptorSet::F32 {
                    dim,
                    data: vec![0.5; 40 * dim],
                },
                vec![],
            )
            .unwrap()
        };
        let viewports = vec![viewport(0, 8), viewport(1, 16)];
        let result = match_pair(&viewports, 0, 1, &SfmSettings::default()).unwrap();
        assert!(result.is_none());
    }
}
