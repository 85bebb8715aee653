use crate::{
    check_writable, compute_pairwise_matching, load_prebundle, rank_initial_pairs, save_prebundle,
    Bundle, IncrementalReconstructor, PairwiseMatch, Result, SfmError, SfmSettings, TrackList,
    Viewport,
};
use log::*;
use std::path::Path;

/// Computes the pairwise matching of `viewports`, or restores both from the
/// pre-bundle at `prebundle` if one exists there. A computed matching is saved
/// to `prebundle`.
pub fn prepare(
    viewports: Vec<Viewport>,
    settings: &SfmSettings,
    prebundle: Option<&Path>,
) -> Result<(Vec<Viewport>, Vec<PairwiseMatch>)> {
    match prebundle {
        Some(path) if path.exists() => load_prebundle(path),
        Some(path) => {
            check_writable(path)?;
            let matching = compute_pairwise_matching(&viewports, settings)?;
            save_prebundle(path, &viewports, &matching)?;
            Ok((viewports, matching))
        }
        None => {
            let matching = compute_pairwise_matching(&viewports, settings)?;
            Ok((viewports, matching))
        }
    }
}

/// Builds tracks, selects the initial pair and grows the reconstruction.
///
/// Descriptors are released before track building and colors right after it.
pub fn reconstruct(
    mut viewports: Vec<Viewport>,
    mut matching: Vec<PairwiseMatch>,
    settings: &SfmSettings,
) -> Result<Bundle> {
    for viewport in &mut viewports {
        viewport.clear_descriptors();
    }
    if matching.is_empty() {
        return Err(SfmError::NoVerifiedPairs);
    }
    matching.sort_by_key(|m| (m.view_a, m.view_b));

    info!("computing feature tracks");
    let tracks = TrackList::build(&matching, &mut viewports)?;
    for viewport in &mut viewports {
        viewport.clear_colors();
    }

    let candidates: Vec<(usize, usize)> = if settings.initial_pair.is_some() {
        vec![]
    } else {
        rank_initial_pairs(&matching, &viewports, settings)
            .map(|pair| (pair.view_a, pair.view_b))
            .collect()
    };
    drop(matching);

    let mut reconstructor = IncrementalReconstructor::new(viewports, tracks, *settings);
    reconstructor.run(&candidates)?;
    reconstructor.normalize_scene();
    let (viewports, tracks) = reconstructor.into_parts();
    info!("creating bundle");
    Ok(Bundle::new(&viewports, &tracks))
}

/// The whole run. Returns `None` if `skip_sfm` stops it after matching.
///
/// With `skip_sfm` set and an existing pre-bundle nothing is computed at all.
pub fn run(
    viewports: Vec<Viewport>,
    settings: &SfmSettings,
    prebundle: Option<&Path>,
    skip_sfm: bool,
) -> Result<Option<Bundle>> {
    if skip_sfm {
        if prebundle.map_or(false, |path| !path.exists()) {
            prepare(viewports, settings, prebundle)?;
        }
        info!("pre-bundle finished, skipping reconstruction");
        return Ok(None);
    }
    let (viewports, matching) = prepare(viewports, settings, prebundle)?;
    reconstruct(viewports, matching, settings).map(Some)
}
