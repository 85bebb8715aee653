use cv_sfm::{
    apply_cameras, CameraPose, DescriptorSet, Result as SfmResult, SfmSettings, ViewSink, Viewport,
};
use log::*;
use serde::Deserialize;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "sfmrecon",
    about = "Reconstructs camera poses and a sparse point cloud from image features"
)]
struct Opt {
    /// The JSON file holding the features of every view, in view order.
    #[structopt(parse(from_os_str))]
    features: PathBuf,
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_sfm::SfmSettings`. Missing fields take their defaults.
    #[structopt(short, long, default_value = "sfm-settings.json")]
    settings: PathBuf,
    /// The pre-bundle holding features and pairwise matching.
    ///
    /// If it exists, matching is skipped and its contents are used instead.
    #[structopt(long, default_value = "prebundle.sfm")]
    prebundle: PathBuf,
    /// Stop after the pre-bundle has been written.
    #[structopt(long)]
    skip_sfm: bool,
    /// Output JSON file for the bundle (cameras and points).
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Output PLY file to deposit the point cloud and cameras.
    #[structopt(long)]
    ply: Option<PathBuf>,
    /// The size of the camera pyramids in the PLY file.
    #[structopt(long, default_value = "0.1")]
    ply_camera_size: f64,
    /// Directory where each view's camera is written as `view_NNNN.json`.
    #[structopt(long)]
    cameras: Option<PathBuf>,
    /// Forces the initial pair, given as `A,B`.
    #[structopt(long, parse(try_from_str = parse_pair))]
    initial_pair: Option<(usize, usize)>,
    /// Reprojection error threshold in pixels for new tracks.
    #[structopt(long)]
    track_error_thres: Option<f64>,
    /// Factor of the median error above which established tracks are removed.
    #[structopt(long)]
    track_thres_factor: Option<f64>,
    /// Run full bundle adjustment after every added view.
    #[structopt(long)]
    always_full_ba: bool,
    /// Keep focal length and distortion fixed during bundle adjustment.
    #[structopt(long)]
    fixed_intrinsics: bool,
    /// Only match each view with this many preceding views.
    #[structopt(long)]
    video_matching: Option<usize>,
    /// The pixel count cap of the feature extraction which produced the features.
    #[structopt(long)]
    max_image_size: Option<usize>,
}

fn parse_pair(s: &str) -> Result<(usize, usize), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("expected two view indices separated by a comma, got {}", s))?;
    let parse = |n: &str| n.trim().parse::<usize>().map_err(|e| e.to_string());
    Ok((parse(a)?, parse(b)?))
}

/// The features of one view as produced by the feature extractor.
#[derive(Deserialize)]
struct ViewFeatures {
    width: usize,
    height: usize,
    /// Focal length in pixels from EXIF.
    #[serde(default)]
    focal_length: Option<f64>,
    positions: Vec<[f64; 2]>,
    descriptors: DescriptorSet,
    #[serde(default)]
    colors: Vec<[u8; 3]>,
}

fn load_viewports(path: &Path) -> Result<Vec<Viewport>, Box<dyn Error>> {
    let views: Vec<ViewFeatures> = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    info!("loaded features of {} views", views.len());
    views
        .into_iter()
        .enumerate()
        .map(|(ix, view)| {
            let positions = view.positions.iter().map(|&[x, y]| [x, y].into()).collect();
            let viewport = Viewport::new(
                ix,
                view.width,
                view.height,
                positions,
                view.descriptors,
                view.colors,
            )?;
            Ok(match view.focal_length {
                Some(f) => viewport.with_focal_length_hint(f),
                None => viewport,
            })
        })
        .collect()
}

/// Writes one camera file per view into a directory.
struct CameraDirectory {
    dir: PathBuf,
    num_views: usize,
}

impl CameraDirectory {
    fn path(&self, view: usize) -> PathBuf {
        self.dir.join(format!("view_{:04}.json", view))
    }
}

impl ViewSink for CameraDirectory {
    fn num_views(&self) -> usize {
        self.num_views
    }

    fn camera(&self, view: usize) -> SfmResult<CameraPose> {
        let path = self.path(view);
        if !path.exists() {
            return Ok(CameraPose::invalid());
        }
        let camera = serde_json::from_reader(BufReader::new(File::open(path)?)).map_err(io::Error::from)?;
        Ok(camera)
    }

    fn store_camera(&self, view: usize, camera: &CameraPose) -> SfmResult<()> {
        let file = BufWriter::new(File::create(self.path(view))?);
        serde_json::to_writer_pretty(file, camera).map_err(io::Error::from)?;
        Ok(())
    }
}

fn settings(opt: &Opt) -> SfmSettings {
    let settings = File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(BufReader::new(file)).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let mut settings: SfmSettings = settings.unwrap_or_default();

    if opt.initial_pair.is_some() {
        settings.initial_pair = opt.initial_pair;
    }
    if let Some(threshold) = opt.track_error_thres {
        settings.new_track_error_threshold = threshold;
    }
    if let Some(factor) = opt.track_thres_factor {
        settings.track_error_threshold_factor = factor;
    }
    settings.always_full_ba |= opt.always_full_ba;
    settings.fixed_intrinsics |= opt.fixed_intrinsics;
    if let Some(window) = opt.video_matching {
        settings.video_matching = window;
    }
    if let Some(size) = opt.max_image_size {
        settings.max_image_size = size;
    }
    settings
}

fn run(opt: &Opt) -> Result<(), Box<dyn Error>> {
    let settings = settings(opt);
    let viewports = load_viewports(&opt.features)?;
    let num_views = viewports.len();

    let Some(bundle) = cv_sfm::run(viewports, &settings, Some(&opt.prebundle), opt.skip_sfm)? else {
        return Ok(());
    };
    info!(
        "bundle has {} of {} cameras and {} points",
        bundle.num_valid_cameras(),
        bundle.cameras.len(),
        bundle.points.len()
    );

    if let Some(path) = &opt.output {
        info!("writing bundle to {}", path.display());
        serde_json::to_writer(BufWriter::new(File::create(path)?), &bundle)?;
    }
    if let Some(path) = &opt.ply {
        info!("exporting point cloud to {}", path.display());
        bundle.export_ply(BufWriter::new(File::create(path)?), opt.ply_camera_size)?;
    }
    if let Some(dir) = &opt.cameras {
        std::fs::create_dir_all(dir)?;
        let sink = CameraDirectory {
            dir: dir.clone(),
            num_views,
        };
        let stored = apply_cameras(&bundle, &sink)?;
        info!("stored {} cameras in {}", stored, dir.display());
    }
    Ok(())
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();
    if let Err(e) = run(&opt) {
        error!("{}", e);
        std::process::exit(1);
    }
}
