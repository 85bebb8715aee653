//! Persistence of the viewports and the pairwise matching, so a later run can skip
//! feature matching.

use crate::{PairwiseMatch, Result, SfmError, Viewport};
use log::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const SIGNATURE: &[u8] = b"SFM_PREBUNDLE\n";

#[derive(Serialize)]
struct PrebundleRef<'a> {
    viewports: &'a [Viewport],
    matching: &'a [PairwiseMatch],
}

#[derive(Deserialize)]
struct Prebundle {
    viewports: Vec<Viewport>,
    matching: Vec<PairwiseMatch>,
}

/// Fails unless a pre-bundle can be written to `path`.
///
/// A file which does not exist yet is created and removed again.
pub fn check_writable(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let not_writable = |source| SfmError::PrebundleNotWritable {
        path: path.display().to_string(),
        source,
    };
    File::create(path).map_err(not_writable)?;
    fs::remove_file(path).map_err(not_writable)
}

pub fn save_prebundle(path: &Path, viewports: &[Viewport], matching: &[PairwiseMatch]) -> Result<()> {
    info!("saving pre-bundle to {}", path.display());
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(SIGNATURE)?;
    bincode::serialize_into(&mut writer, &PrebundleRef { viewports, matching })?;
    writer.flush()?;
    Ok(())
}

pub fn load_prebundle(path: &Path) -> Result<(Vec<Viewport>, Vec<PairwiseMatch>)> {
    info!("loading pre-bundle from {}", path.display());
    let mut reader = BufReader::new(File::open(path)?);
    let mut signature = [0u8; SIGNATURE.len()];
    reader
        .read_exact(&mut signature)
        .map_err(|_| SfmError::NotAPrebundle(path.display().to_string()))?;
    if signature != SIGNATURE {
        return Err(SfmError::NotAPrebundle(path.display().to_string()));
    }
    let Prebundle {
        viewports,
        matching,
    } = bincode::deserialize_from(reader)?;
    info!(
        "loaded {} viewports and {} matched pairs",
        viewports.len(),
        matching.len()
    );
    Ok((viewports, matching))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::DescriptorSet;
    use nalgebra::Point2;

    #[test]
    fn writability_check_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prebundle.sfm");
        check_writable(&path).unwrap();
        assert!(!path.exists());
        let missing = dir.path().join("missing").join("prebundle.sfm");
        assert!(matches!(
            check_writable(&missing),
            Err(SfmError::PrebundleNotWritable { .. })
        ));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), b"not a prebundle at all").unwrap();
        assert!(matches!(
            load_prebundle(file.path()),
            Err(SfmError::NotAPrebundle(_))
        ));
    }

    #[test]
    fn cleared_descriptors_survive_round_trip() {
        let mut viewport = Viewport::new(
            0,
            32,
            32,
            vec![Point2::new(1.5, 2.5)],
            DescriptorSet::I16 {
                dim: 8,
                data: vec![3; 8],
            },
            vec![],
        )
        .unwrap();
        viewport.clear_descriptors();
        let file = tempfile::NamedTempFile::new().unwrap();
        save_prebundle(file.path(), &[viewport.clone()], &[]).unwrap();
        let (viewports, matching) = load_prebundle(file.path()).unwrap();
        assert_eq!(viewports, vec![viewport]);
        assert!(matching.is_empty());
    }
}
