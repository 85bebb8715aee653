use crate::{
    max_ray_angle, validate_initial_pair, AbsolutePose, BundleAdjuster, BundleReport, CameraPose,
    EightPoint, EssentialMatrix, FeatureMatch, LambdaTwist, LinearEigenTriangulator, Observation,
    PoseCorrespondence, Ransac, Result, SfmError, SfmSettings, TrackList, Viewport,
};
use arrsac::Arrsac;
use float_ord::FloatOrd;
use log::*;
use nalgebra::{Point2, Point3, Vector3};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sample_consensus::Consensus;
use std::cmp::Reverse;
use std::collections::HashMap;

/// Views are never skipped for full bundle adjustment more often than this in a row.
const MAX_SKIPPED_FULL_BA: usize = 5;
/// One more skipped view is allowed for every this many reconstructed cameras.
const CAMERAS_PER_SKIPPED_FULL_BA: usize = 15;
/// The extent of the camera centers after normalization.
const NORMALIZED_EXTENT: f64 = 10.0;

/// The stages of one reconstruction run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReconstructionState {
    Uninitialized,
    /// Two cameras are posed.
    Seeded,
    Growing,
    Done,
    Failed,
}

/// Decides after which added views full bundle adjustment runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BundleSchedule {
    always_full: bool,
    skipped: usize,
}

impl BundleSchedule {
    pub fn new(always_full: bool) -> Self {
        Self {
            always_full,
            skipped: 0,
        }
    }

    /// How many views in a row may skip full bundle adjustment.
    pub fn skip_views(&self, num_reconstructed: usize) -> usize {
        if self.always_full {
            0
        } else {
            MAX_SKIPPED_FULL_BA.min(num_reconstructed / CAMERAS_PER_SKIPPED_FULL_BA)
        }
    }

    /// Records an added view and returns whether full bundle adjustment runs now.
    pub fn view_added(&mut self, num_reconstructed: usize) -> bool {
        if self.skipped < self.skip_views(num_reconstructed) {
            self.skipped += 1;
            false
        } else {
            self.skipped = 0;
            true
        }
    }

    /// Whether the last views skipped full bundle adjustment.
    pub fn needs_final(&self) -> bool {
        self.skipped > 0
    }
}

/// Grows a reconstruction one view at a time.
///
/// Owns the viewports and tracks for the duration of one run.
pub struct IncrementalReconstructor {
    settings: SfmSettings,
    viewports: Vec<Viewport>,
    tracks: TrackList,
    state: ReconstructionState,
    initial_pair: Option<(usize, usize)>,
    triangulator: LinearEigenTriangulator,
    rng: Xoshiro256PlusPlus,
}

impl IncrementalReconstructor {
    pub fn new(viewports: Vec<Viewport>, tracks: TrackList, settings: SfmSettings) -> Self {
        Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(settings.sfm_seed),
            settings,
            viewports,
            tracks,
            state: ReconstructionState::Uninitialized,
            initial_pair: None,
            triangulator: LinearEigenTriangulator::new(),
        }
    }

    pub fn state(&self) -> ReconstructionState {
        self.state
    }

    pub fn initial_pair(&self) -> Option<(usize, usize)> {
        self.initial_pair
    }

    pub fn viewports(&self) -> &[Viewport] {
        &self.viewports
    }

    pub fn tracks(&self) -> &TrackList {
        &self.tracks
    }

    pub fn into_parts(self) -> (Vec<Viewport>, TrackList) {
        (self.viewports, self.tracks)
    }

    pub fn num_reconstructed(&self) -> usize {
        self.viewports.iter().filter(|v| v.camera.is_valid()).count()
    }

    /// Runs the whole reconstruction: seeding, growth, and the final bundle adjustment.
    ///
    /// `candidates` are the ranked initial pairs, used when no pair is forced.
    pub fn run(&mut self, candidates: &[(usize, usize)]) -> Result<()> {
        self.seed(candidates)?;
        self.triangulate_new_tracks();
        self.invalidate_large_error_tracks();
        info!("running full bundle adjustment");
        self.bundle_adjustment_full();

        self.state = ReconstructionState::Growing;
        let mut schedule = BundleSchedule::new(self.settings.always_full_ba);
        loop {
            let next_views = self.find_next_views();
            if next_views.is_empty() {
                info!("no views left to add, reconstruction finished");
                break;
            }
            let Some(view) = next_views
                .into_iter()
                .find(|&view| self.reconstruct_next_view(view))
            else {
                info!("no remaining view could be posed, reconstruction finished");
                break;
            };

            self.bundle_adjustment_single_camera(view);
            self.triangulate_new_tracks();
            self.invalidate_large_error_tracks();
            let num_reconstructed = self.num_reconstructed();
            if schedule.view_added(num_reconstructed) {
                info!("running full bundle adjustment");
                self.bundle_adjustment_full();
            } else {
                info!(
                    "skipping full bundle adjustment (skipping {} views)",
                    schedule.skip_views(num_reconstructed)
                );
            }
        }
        if schedule.needs_final() {
            info!("running final bundle adjustment");
            self.bundle_adjustment_full();
        }
        self.state = ReconstructionState::Done;
        info!(
            "reconstructed {} of {} cameras and {} tracks",
            self.num_reconstructed(),
            self.viewports.len(),
            self.tracks.num_valid()
        );
        Ok(())
    }

    /// Poses the initial pair, either the forced one or the first candidate whose
    /// relative pose can be recovered.
    pub fn seed(&mut self, candidates: &[(usize, usize)]) -> Result<(usize, usize)> {
        let result = match self.settings.initial_pair {
            Some(pair) => validate_initial_pair(pair, self.viewports.len()).and_then(|(a, b)| {
                if self.reconstruct_initial_pair(a, b) {
                    Ok((a, b))
                } else {
                    Err(SfmError::InitialPoseFailed(a, b))
                }
            }),
            None => candidates
                .iter()
                .copied()
                .find(|&(a, b)| self.reconstruct_initial_pair(a, b))
                .ok_or(SfmError::NoInitialPair),
        };
        match result {
            Ok(pair) => {
                info!("using views {} and {} as initial pair", pair.0, pair.1);
                self.initial_pair = Some(pair);
                self.state = ReconstructionState::Seeded;
            }
            Err(_) => self.state = ReconstructionState::Failed,
        }
        result
    }

    /// The pixel positions of every track observed by both views.
    fn shared_observations(&self, a: usize, b: usize) -> Vec<FeatureMatch> {
        let (va, vb) = (&self.viewports[a], &self.viewports[b]);
        va.track_ids
            .iter()
            .enumerate()
            .filter_map(|(fa, track)| {
                let reference = self
                    .tracks
                    .get((*track)?)
                    .features
                    .iter()
                    .find(|r| r.view == b)?;
                Some(FeatureMatch(va.positions[fa], vb.positions[reference.feature]))
            })
            .collect()
    }

    /// Recovers the relative pose of two views from the tracks they share.
    /// The first camera is put at the origin and the baseline has unit length.
    pub fn reconstruct_initial_pair(&mut self, a: usize, b: usize) -> bool {
        let matches = self.shared_observations(a, b);
        info!(
            "computing pose of initial pair ({}, {}) from {} correspondences",
            a,
            b,
            matches.len()
        );
        if matches.len() < self.settings.minimum_matching_inliers {
            return false;
        }
        let camera_a = self.viewports[a].initial_camera(self.settings.fallback_focal_factor);
        let camera_b = self.viewports[b].initial_camera(self.settings.fallback_focal_factor);

        let mut ransac = Ransac::new(
            self.settings.fundamental_threshold,
            self.settings.fundamental_max_iterations,
            &mut self.rng,
        );
        let Some((fundamental, inliers)) =
            ransac.model_inliers(&EightPoint::new(), matches.iter().copied())
        else {
            return false;
        };
        if inliers.len() < self.settings.minimum_matching_inliers {
            info!("only {} fundamental matrix inliers", inliers.len());
            return false;
        }
        let Some(essential) =
            EssentialMatrix::from_fundamental(&fundamental, &camera_a, &camera_b).recondition(1e-12, 1000)
        else {
            return false;
        };
        let bearings: Vec<_> = inliers
            .iter()
            .map(|&ix| {
                let FeatureMatch(pa, pb) = &matches[ix];
                (camera_a.bearing(pa), camera_b.bearing(pb))
            })
            .collect();
        let Some(pose) = essential.solve_pose(&bearings, &self.triangulator) else {
            info!("no decomposition of the essential matrix passes the chirality test");
            return false;
        };
        self.viewports[a].camera = camera_a;
        self.viewports[b].camera = camera_b.with_pose(pose.rotation, pose.translation);
        true
    }

    /// Triangulates every unset track seen by at least two posed views.
    ///
    /// Tracks with a small triangulation angle or a large reprojection error are invalidated.
    pub fn triangulate_new_tracks(&mut self) -> usize {
        let min_angle = self.settings.min_triangulation_angle.to_radians();
        let max_squared_error = self.settings.new_track_error_threshold.powi(2);
        let (mut added, mut small_angle, mut large_error) = (0, 0, 0);
        for ix in 0..self.tracks.len() {
            let track = self.tracks.get(ix);
            if !track.is_unset() {
                continue;
            }
            let observations: Vec<(CameraPose, Point2<f64>)> = track
                .features
                .iter()
                .map(|r| (&self.viewports[r.view], r.feature))
                .filter(|(viewport, _)| viewport.camera.is_valid())
                .map(|(viewport, feature)| (viewport.camera, viewport.positions[feature]))
                .collect();
            if observations.len() < 2 {
                continue;
            }
            let Some(point) = self.triangulator.triangulate(
                observations
                    .iter()
                    .map(|(camera, pixel)| (camera.projection_matrix(), camera.bearing(pixel))),
            ) else {
                continue;
            };
            let angle = max_ray_angle(&point, observations.iter().map(|(camera, _)| camera.center()));
            if angle < min_angle {
                self.tracks.invalidate(ix);
                small_angle += 1;
                continue;
            }
            let error_ok = observations
                .iter()
                .all(|(camera, pixel)| camera.squared_reprojection_error(&point, pixel) <= max_squared_error);
            if !error_ok {
                self.tracks.invalidate(ix);
                large_error += 1;
                continue;
            }
            self.tracks.set_position(ix, point);
            added += 1;
        }
        info!(
            "triangulated {} new tracks, rejected {} for small angle and {} for large error",
            added, small_angle, large_error
        );
        added
    }

    /// The mean squared reprojection error of a valid track over its posed views.
    fn track_error(&self, ix: usize) -> Option<f64> {
        let track = self.tracks.get(ix);
        let point = track.position()?;
        let errors: Vec<f64> = track
            .features
            .iter()
            .map(|r| (&self.viewports[r.view], r.feature))
            .filter(|(viewport, _)| viewport.camera.is_valid())
            .map(|(viewport, feature)| {
                viewport
                    .camera
                    .squared_reprojection_error(&point, &viewport.positions[feature])
            })
            .collect();
        if errors.is_empty() {
            return None;
        }
        Some(errors.iter().sum::<f64>() / errors.len() as f64)
    }

    /// Invalidates valid tracks whose mean squared error is far above the median.
    pub fn invalidate_large_error_tracks(&mut self) -> usize {
        let errors: Vec<(usize, f64)> = (0..self.tracks.len())
            .filter_map(|ix| self.track_error(ix).map(|e| (ix, e)))
            .collect();
        if errors.is_empty() {
            return 0;
        }
        let mut sorted: Vec<f64> = errors.iter().map(|&(_, e)| e).collect();
        sorted.sort_by_key(|&e| FloatOrd(e));
        let median = sorted[sorted.len() / 2];
        let threshold = (median * self.settings.track_error_threshold_factor)
            .max(self.settings.min_track_error_threshold.powi(2));
        let mut invalidated = 0;
        for (ix, error) in errors {
            if error > threshold {
                self.tracks.invalidate(ix);
                invalidated += 1;
            }
        }
        info!(
            "invalidated {} tracks above a squared error of {:.3} (median {:.3})",
            invalidated, threshold, median
        );
        invalidated
    }

    /// Unposed views ranked by how many reconstructed tracks they observe.
    pub fn find_next_views(&self) -> Vec<usize> {
        let mut views: Vec<(usize, usize)> = self
            .viewports
            .iter()
            .enumerate()
            .filter(|(_, viewport)| !viewport.camera.is_valid())
            .map(|(view, viewport)| {
                let count = viewport
                    .track_ids
                    .iter()
                    .flatten()
                    .filter(|&&track| self.tracks.get(track).is_valid())
                    .count();
                (view, count)
            })
            .filter(|&(_, count)| count >= self.settings.minimum_pose_inliers.max(3))
            .collect();
        views.sort_by_key(|&(view, count)| (Reverse(count), view));
        views.into_iter().map(|(view, _)| view).collect()
    }

    /// Estimates the pose of a view from its reconstructed tracks.
    ///
    /// Observations which disagree with the pose are detached from their tracks.
    pub fn reconstruct_next_view(&mut self, view: usize) -> bool {
        let camera = self.viewports[view].initial_camera(self.settings.fallback_focal_factor);
        let (features, correspondences): (Vec<(usize, usize)>, Vec<PoseCorrespondence>) = self
            .viewports[view]
            .track_ids
            .iter()
            .enumerate()
            .filter_map(|(feature, track)| {
                let track = (*track)?;
                let point = self.tracks.get(track).position()?;
                let normalized = camera.normalize(&self.viewports[view].positions[feature]);
                Some(((feature, track), PoseCorrespondence { normalized, point }))
            })
            .unzip();
        info!(
            "estimating pose of view {} from {} 2D-3D correspondences",
            view,
            correspondences.len()
        );
        if correspondences.len() < self.settings.minimum_pose_inliers {
            return false;
        }

        let mut arrsac = Arrsac::new(self.settings.pose_threshold / camera.focal_length, &mut self.rng);
        let Some((pose, inliers)) =
            arrsac.model_inliers(&LambdaTwist::new(), correspondences.iter().copied())
        else {
            info!("pose estimation of view {} failed", view);
            return false;
        };
        if inliers.len() < self.settings.minimum_pose_inliers {
            info!(
                "pose of view {} has only {} inliers",
                view,
                inliers.len()
            );
            return false;
        }
        let AbsolutePose {
            rotation,
            translation,
        } = pose;
        self.viewports[view].camera = camera.with_pose(rotation, translation);

        let mut is_inlier = vec![false; correspondences.len()];
        for &ix in &inliers {
            is_inlier[ix] = true;
        }
        let mut detached = 0;
        for (&(feature, track), inlier) in features.iter().zip(is_inlier) {
            if !inlier {
                self.tracks.detach(track, view);
                self.viewports[view].track_ids[feature] = None;
                detached += 1;
            }
        }
        info!(
            "posed view {} with {} inliers, detached {} outlier observations",
            view,
            inliers.len(),
            detached
        );
        true
    }

    /// Jointly optimizes every posed camera and every valid track.
    pub fn bundle_adjustment_full(&mut self) -> BundleReport {
        let cameras: Vec<usize> = (0..self.viewports.len())
            .filter(|&v| self.viewports[v].camera.is_valid())
            .collect();
        let points: Vec<usize> = (0..self.tracks.len())
            .filter(|&t| self.tracks.get(t).is_valid())
            .collect();
        let adjuster = BundleAdjuster::new()
            .max_iterations(self.settings.full_ba_iterations)
            .fixed_intrinsics(self.settings.fixed_intrinsics);
        self.bundle_adjust(&cameras, &points, adjuster)
    }

    /// Optimizes the camera of one view with its tracks held fixed.
    pub fn bundle_adjustment_single_camera(&mut self, view: usize) -> BundleReport {
        let points: Vec<usize> = self.viewports[view]
            .track_ids
            .iter()
            .flatten()
            .copied()
            .filter(|&t| self.tracks.get(t).is_valid())
            .collect();
        let adjuster = BundleAdjuster::new()
            .max_iterations(self.settings.single_ba_iterations)
            .fixed_intrinsics(self.settings.fixed_intrinsics)
            .fixed_points(true);
        self.bundle_adjust(&[view], &points, adjuster)
    }

    fn bundle_adjust(&mut self, views: &[usize], tracks: &[usize], adjuster: BundleAdjuster) -> BundleReport {
        let camera_index: HashMap<usize, usize> =
            views.iter().enumerate().map(|(ix, &view)| (view, ix)).collect();
        let (camera_index, viewports, track_list) = (&camera_index, &self.viewports, &self.tracks);
        let mut cameras: Vec<CameraPose> = views.iter().map(|&v| self.viewports[v].camera).collect();
        let mut points: Vec<Point3<f64>> = tracks
            .iter()
            .filter_map(|&t| self.tracks.get(t).position())
            .collect();
        let observations: Vec<Observation> = tracks
            .iter()
            .enumerate()
            .flat_map(|(point, &t)| {
                track_list.get(t).features.iter().filter_map(move |r| {
                    Some(Observation {
                        camera: *camera_index.get(&r.view)?,
                        point,
                        pixel: viewports[r.view].positions[r.feature],
                    })
                })
            })
            .collect();
        let report = adjuster.optimize(&mut cameras, &mut points, &observations);
        info!(
            "bundle adjustment of {} cameras and {} points: rms error {:.4} -> {:.4} px in {} iterations",
            cameras.len(),
            points.len(),
            report.initial_rms,
            report.final_rms,
            report.iterations
        );
        for (&view, camera) in views.iter().zip(cameras) {
            self.viewports[view].camera = camera;
        }
        if !adjuster.fixed_points {
            for (&t, point) in tracks.iter().zip(points) {
                self.tracks.set_position(t, point);
            }
        }
        report
    }

    /// Moves the mean camera center to the origin and scales the extent of the
    /// camera centers to a fixed size.
    pub fn normalize_scene(&mut self) {
        let centers: Vec<Point3<f64>> = self
            .viewports
            .iter()
            .filter(|v| v.camera.is_valid())
            .map(|v| v.camera.center())
            .collect();
        if centers.is_empty() {
            return;
        }
        let mean = centers
            .iter()
            .fold(Vector3::zeros(), |acc, c| acc + c.coords)
            / centers.len() as f64;
        let (min, max) = centers.iter().fold(
            (Vector3::repeat(f64::INFINITY), Vector3::repeat(f64::NEG_INFINITY)),
            |(min, max), c| (min.inf(&c.coords), max.sup(&c.coords)),
        );
        let extent = (max - min).max();
        let scale = if extent > 0.0 {
            NORMALIZED_EXTENT / extent
        } else {
            1.0
        };
        let shift = -mean;
        for viewport in &mut self.viewports {
            if viewport.camera.is_valid() {
                viewport.camera = viewport.camera.transformed(&shift, scale);
            }
        }
        self.tracks
            .map_positions(|p| Point3::from((p.coords + shift) * scale));
        info!("normalized scene with scale {}", scale);
    }
}
