use serde::{Deserialize, Serialize};

/// The settings for the reconstruction process.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfmSettings {
    /// The maximum ratio between the best and second best squared descriptor distance
    /// is this value squared. Matches above it are ambiguous and rejected.
    #[serde(default = "default_lowe_ratio")]
    pub lowe_ratio: f64,
    /// The maximum squared descriptor distance (on unit descriptors) of an accepted match.
    #[serde(default = "default_maximum_descriptor_distance")]
    pub maximum_descriptor_distance: f64,
    /// The minimum number of symmetric descriptor matches to attempt geometric verification.
    #[serde(default = "default_minimum_feature_matches")]
    pub minimum_feature_matches: usize,
    /// The minimum number of fundamental matrix inliers for a pair to be kept.
    #[serde(default = "default_minimum_matching_inliers")]
    pub minimum_matching_inliers: usize,
    /// Sampson distance in pixels under which a match agrees with a fundamental matrix.
    #[serde(default = "default_fundamental_threshold")]
    pub fundamental_threshold: f64,
    /// Number of RANSAC iterations when fitting the fundamental matrix.
    #[serde(default = "default_fundamental_max_iterations")]
    pub fundamental_max_iterations: usize,
    /// Symmetric transfer error in pixels under which a match agrees with a homography.
    #[serde(default = "default_homography_threshold")]
    pub homography_threshold: f64,
    /// Number of RANSAC iterations when fitting a homography.
    #[serde(default = "default_homography_max_iterations")]
    pub homography_max_iterations: usize,
    /// Pairs whose homography inlier ratio is above this value are rejected as initial pairs.
    #[serde(default = "default_max_homography_inliers")]
    pub max_homography_inliers: f64,
    /// Reprojection error in pixels under which a 2D-3D correspondence supports a pose.
    #[serde(default = "default_pose_threshold")]
    pub pose_threshold: f64,
    /// The minimum number of 2D-3D inliers to accept the pose of a new view.
    #[serde(default = "default_minimum_pose_inliers")]
    pub minimum_pose_inliers: usize,
    /// The minimum angle in degrees between two observing rays of a triangulated track.
    #[serde(default = "default_min_triangulation_angle")]
    pub min_triangulation_angle: f64,
    /// The maximum reprojection error in pixels of a freshly triangulated track.
    #[serde(default = "default_new_track_error_threshold")]
    pub new_track_error_threshold: f64,
    /// Established tracks with a mean squared error above this factor times the
    /// median are invalidated.
    #[serde(default = "default_track_error_threshold_factor")]
    pub track_error_threshold_factor: f64,
    /// The lowest reprojection error in pixels an established-track threshold may reach.
    #[serde(default = "default_min_track_error_threshold")]
    pub min_track_error_threshold: f64,
    /// Run full bundle adjustment after every added view.
    #[serde(default)]
    pub always_full_ba: bool,
    /// Keep focal length and distortion out of bundle adjustment.
    #[serde(default)]
    pub fixed_intrinsics: bool,
    /// If nonzero, only match each view against this many preceding views.
    #[serde(default)]
    pub video_matching: usize,
    /// Forces the initial pair instead of searching for one.
    #[serde(default)]
    pub initial_pair: Option<(usize, usize)>,
    /// The pixel count cap used by feature extraction upstream. Carried, never applied.
    #[serde(default = "default_max_image_size")]
    pub max_image_size: usize,
    /// The focal length of views without a hint, as a factor of the larger image side.
    #[serde(default = "default_fallback_focal_factor")]
    pub fallback_focal_factor: f64,
    /// The maximum Levenberg-Marquardt iterations of full bundle adjustment.
    #[serde(default = "default_full_ba_iterations")]
    pub full_ba_iterations: usize,
    /// The maximum Levenberg-Marquardt iterations of single camera bundle adjustment.
    #[serde(default = "default_single_ba_iterations")]
    pub single_ba_iterations: usize,
    /// The seed of the per-pair random number generators used during matching.
    #[serde(default)]
    pub matching_seed: u64,
    /// The seed of the random number generator used by pose estimation.
    #[serde(default)]
    pub sfm_seed: u64,
}

impl Default for SfmSettings {
    fn default() -> Self {
        Self {
            lowe_ratio: default_lowe_ratio(),
            maximum_descriptor_distance: default_maximum_descriptor_distance(),
            minimum_feature_matches: default_minimum_feature_matches(),
            minimum_matching_inliers: default_minimum_matching_inliers(),
            fundamental_threshold: default_fundamental_threshold(),
            fundamental_max_iterations: default_fundamental_max_iterations(),
            homography_threshold: default_homography_threshold(),
            homography_max_iterations: default_homography_max_iterations(),
            max_homography_inliers: default_max_homography_inliers(),
            pose_threshold: default_pose_threshold(),
            minimum_pose_inliers: default_minimum_pose_inliers(),
            min_triangulation_angle: default_min_triangulation_angle(),
            new_track_error_threshold: default_new_track_error_threshold(),
            track_error_threshold_factor: default_track_error_threshold_factor(),
            min_track_error_threshold: default_min_track_error_threshold(),
            always_full_ba: false,
            fixed_intrinsics: false,
            video_matching: 0,
            initial_pair: None,
            max_image_size: default_max_image_size(),
            fallback_focal_factor: default_fallback_focal_factor(),
            full_ba_iterations: default_full_ba_iterations(),
            single_ba_iterations: default_single_ba_iterations(),
            matching_seed: 0,
            sfm_seed: 0,
        }
    }
}

fn default_lowe_ratio() -> f64 {
    0.8
}

fn default_maximum_descriptor_distance() -> f64 {
    4.0
}

fn default_minimum_feature_matches() -> usize {
    24
}

fn default_minimum_matching_inliers() -> usize {
    12
}

fn default_fundamental_threshold() -> f64 {
    3.0
}

fn default_fundamental_max_iterations() -> usize {
    1000
}

fn default_homography_threshold() -> f64 {
    1.0
}

fn default_homography_max_iterations() -> usize {
    1000
}

fn default_max_homography_inliers() -> f64 {
    0.6
}

fn default_pose_threshold() -> f64 {
    10.0
}

fn default_minimum_pose_inliers() -> usize {
    12
}

fn default_min_triangulation_angle() -> f64 {
    3.0
}

fn default_new_track_error_threshold() -> f64 {
    10.0
}

fn default_track_error_threshold_factor() -> f64 {
    25.0
}

fn default_min_track_error_threshold() -> f64 {
    0.5
}

fn default_max_image_size() -> usize {
    6_000_000
}

fn default_fallback_focal_factor() -> f64 {
    1.0
}

fn default_full_ba_iterations() -> usize {
    50
}

fn default_single_ba_iterations() -> usize {
    20
}
