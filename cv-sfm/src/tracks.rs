use crate::{PairwiseMatch, Result, Viewport};
use log::*;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Color given to tracks whose features carry no color.
const DEFAULT_COLOR: [u8; 3] = [128, 128, 128];

/// One observation of a track: a feature of a viewport.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureReference {
    pub view: usize,
    pub feature: usize,
}

/// The reconstruction state of a track.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackState {
    /// Not triangulated yet.
    Unset,
    Valid(Point3<f64>),
    /// Excluded from the rest of the run, but keeps its index.
    Invalidated,
}

/// A 3D point seen by at most one feature per view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub state: TrackState,
    pub color: [u8; 3],
    pub features: Vec<FeatureReference>,
}

impl Track {
    pub fn position(&self) -> Option<Point3<f64>> {
        match self.state {
            TrackState::Valid(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.state, TrackState::Valid(_))
    }

    pub fn is_unset(&self) -> bool {
        matches!(self.state, TrackState::Unset)
    }
}

/// Index addressed store of tracks. Once built it is never compacted, so track
/// indices held by viewports stay valid for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackList {
    tracks: Vec<Track>,
}

impl TrackList {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, ix: usize) -> &Track {
        &self.tracks[ix]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> + Clone + '_ {
        self.tracks.iter()
    }

    pub fn set_position(&mut self, ix: usize, position: Point3<f64>) {
        self.tracks[ix].state = TrackState::Valid(position);
    }

    pub fn invalidate(&mut self, ix: usize) {
        self.tracks[ix].state = TrackState::Invalidated;
    }

    /// Removes the observation of `view` from a track. The viewport keeps its own
    /// reference until the caller clears it.
    pub fn detach(&mut self, ix: usize, view: usize) {
        self.tracks[ix].features.retain(|r| r.view != view);
    }

    pub fn num_valid(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_valid()).count()
    }

    /// Applies `f` to every valid position.
    pub fn map_positions(&mut self, f: impl Fn(Point3<f64>) -> Point3<f64>) {
        for track in &mut self.tracks {
            if let TrackState::Valid(p) = track.state {
                track.state = TrackState::Valid(f(p));
            }
        }
    }

    /// Merges pairwise correspondences into tracks and records the track of every
    /// feature in `viewports`.
    ///
    /// Edges are processed in view pair order. An edge which would put two features
    /// of one view into the same track is dropped.
    pub fn build(matching: &[PairwiseMatch], viewports: &mut [Viewport]) -> Result<Self> {
        for viewport in viewports.iter_mut() {
            viewport.track_ids.iter_mut().for_each(|id| *id = None);
        }
        let mut order: Vec<&PairwiseMatch> = matching.iter().collect();
        order.sort_by_key(|m| (m.view_a, m.view_b));

        let mut tracks: Vec<Vec<FeatureReference>> = vec![];
        let mut rejected = 0usize;
        for pair in order {
            let (va, vb) = (pair.view_a, pair.view_b);
            for &(fa, fb) in &pair.matches {
                let a = FeatureReference {
                    view: va,
                    feature: fa,
                };
                let b = FeatureReference {
                    view: vb,
                    feature: fb,
                };
                let ta = viewports[va].track_ids[fa];
                let tb = viewports[vb].track_ids[fb];
                match (ta, tb) {
                    (None, None) => {
                        viewports[va].track_ids[fa] = Some(tracks.len());
                        viewports[vb].track_ids[fb] = Some(tracks.len());
                        tracks.push(vec![a, b]);
                    }
                    (Some(t), None) | (None, Some(t)) => {
                        let new = if ta.is_some() { b } else { a };
                        if tracks[t].iter().any(|r| r.view == new.view) {
                            rejected += 1;
                        } else {
                            viewports[new.view].track_ids[new.feature] = Some(t);
                            tracks[t].push(new);
                        }
                    }
                    (Some(ta), Some(tb)) if ta == tb => {}
                    (Some(ta), Some(tb)) => {
                        let conflict = tracks[tb]
                            .iter()
                            .any(|rb| tracks[ta].iter().any(|ra| ra.view == rb.view));
                        if conflict {
                            rejected += 1;
                            continue;
                        }
                        // Move the smaller track into the larger one.
                        let (keep, drop) = if tracks[ta].len() >= tracks[tb].len() {
                            (ta, tb)
                        } else {
                            (tb, ta)
                        };
                        let moved = std::mem::take(&mut tracks[drop]);
                        for r in &moved {
                            viewports[r.view].track_ids[r.feature] = Some(keep);
                        }
                        tracks[keep].extend(moved);
                    }
                }
            }
        }

        // Drop the tracks emptied by merges and renumber the rest.
        let mut renumber = vec![None; tracks.len()];
        let mut list = Self::default();
        for (old, mut features) in tracks.into_iter().enumerate() {
            if features.len() < 2 {
                continue;
            }
            features.sort();
            renumber[old] = Some(list.tracks.len());
            let color = average_color(&features, viewports)?;
            list.tracks.push(Track {
                state: TrackState::Unset,
                color,
                features,
            });
        }
        for viewport in viewports.iter_mut() {
            for id in viewport.track_ids.iter_mut() {
                *id = id.and_then(|old| renumber[old]);
            }
        }
        info!(
            "built {} tracks, rejected {} conflicting correspondences",
            list.len(),
            rejected
        );
        Ok(list)
    }
}

fn average_color(features: &[FeatureReference], viewports: &[Viewport]) -> Result<[u8; 3]> {
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    for r in features {
        if let Some(color) = viewports[r.view].color(r.view, r.feature)? {
            for (s, c) in sum.iter_mut().zip(color) {
                *s += c as u64;
            }
            count += 1;
        }
    }
    Ok(if count == 0 {
        DEFAULT_COLOR
    } else {
        sum.map(|s| ((s + count / 2) / count) as u8)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::DescriptorSet;
    use nalgebra::Point2;
    use quickcheck_macros::quickcheck;
    use std::collections::HashSet;

    const VIEWS: usize = 4;
    const FEATURES: usize = 5;

    fn viewports() -> Vec<Viewport> {
        (0..VIEWS)
            .map(|ix| {
                Viewport::new(
                    ix,
                    100,
                    100,
                    vec![Point2::origin(); FEATURES],
                    DescriptorSet::F32 {
                        dim: 8,
                        data: vec![0.0; 8 * FEATURES],
                    },
                    vec![[ix as u8 * 10, 0, 255]; FEATURES],
                )
                .unwrap()
            })
            .collect()
    }

    fn pairwise(edges: &[(u8, u8, u8, u8)]) -> Vec<PairwiseMatch> {
        let mut matching: Vec<PairwiseMatch> = vec![];
        for &(va, vb, fa, fb) in edges {
            let (va, vb) = (va as usize % VIEWS, vb as usize % VIEWS);
            if va == vb {
                continue;
            }
            let (va, vb, fa, fb) = if va < vb {
                (va, vb, fa as usize % FEATURES, fb as usize % FEATURES)
            } else {
                (vb, va, fb as usize % FEATURES, fa as usize % FEATURES)
            };
            match matching
                .iter_mut()
                .find(|m| m.view_a == va && m.view_b == vb)
            {
                Some(m) => m.matches.push((fa, fb)),
                None => matching.push(PairwiseMatch {
                    view_a: va,
                    view_b: vb,
                    matches: vec![(fa, fb)],
                }),
            }
        }
        matching
    }

    #[quickcheck]
    fn tracks_see_each_view_once(edges: Vec<(u8, u8, u8, u8)>) -> bool {
        let mut viewports = viewports();
        let tracks = TrackList::build(&pairwise(&edges), &mut viewports).unwrap();
        let consistent = tracks.iter().enumerate().all(|(ix, track)| {
            let views: HashSet<usize> = track.features.iter().map(|r| r.view).collect();
            views.len() == track.features.len()
                && track.features.len() >= 2
                && track
                    .features
                    .iter()
                    .all(|r| viewports[r.view].track_ids[r.feature] == Some(ix))
        });
        consistent
    }

    #[test]
    fn conflicting_edge_is_dropped() {
        let mut viewports = viewports();
        // View 0 features 0 and 1 would both end up in the track through view 1.
        let matching = pairwise(&[(0, 1, 0, 0), (0, 2, 1, 0), (1, 2, 0, 0)]);
        let tracks = TrackList::build(&matching, &mut viewports).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(
            tracks.get(0).features,
            vec![
                FeatureReference {
                    view: 0,
                    feature: 0
                },
                FeatureReference {
                    view: 1,
                    feature: 0
                },
            ]
        );
        assert_eq!(viewports[2].track_ids[0], Some(1));
        assert_eq!(viewports[0].track_ids[1], Some(1));
    }

    #[test]
    fn transitive_matches_merge_and_average_color() {
        let mut viewports = viewports();
        let matching = pairwise(&[(0, 1, 2, 3), (2, 3, 4, 1), (1, 2, 3, 4)]);
        let tracks = TrackList::build(&matching, &mut viewports).unwrap();
        assert_eq!(tracks.len(), 1);
        let track = tracks.get(0);
        assert_eq!(track.features.len(), 4);
        assert_eq!(track.color, [15, 0, 255]);
        assert!(track.is_unset());
    }
}
