use thiserror::Error;

/// Errors which abort a reconstruction run.
///
/// Recoverable situations (a view that cannot be posed, a track edge that would
/// break the one-feature-per-view rule, planar pairs) are never reported here.
#[derive(Debug, Error)]
pub enum SfmError {
    #[error("no verified view pairs after pairwise matching")]
    NoVerifiedPairs,
    #[error("no valid initial pair")]
    NoInitialPair,
    #[error("initial pair ({0}, {1}) is invalid for {2} views")]
    InitialPairOutOfRange(usize, usize, usize),
    #[error("relative pose for initial pair ({0}, {1}) could not be computed")]
    InitialPoseFailed(usize, usize),
    #[error("reconstruction has {cameras} cameras but the scene has {views} views")]
    CameraCountMismatch { cameras: usize, views: usize },
    #[error("descriptor dimension {0} is not a multiple of {1}")]
    InvalidDimension(usize, usize),
    #[error("descriptor block of length {len} is not a multiple of the dimension {dim}")]
    BlockLengthMismatch { len: usize, dim: usize },
    #[error("viewport {0} has {1} descriptors or colors for {2} positions")]
    FeatureCountMismatch(usize, usize, usize),
    #[error("descriptors of viewport {0} were accessed after being cleared")]
    DescriptorsCleared(usize),
    #[error("colors of viewport {0} were accessed after being cleared")]
    ColorsCleared(usize),
    #[error("pre-bundle file {path} is not writable: {source}")]
    PrebundleNotWritable {
        path: String,
        source: std::io::Error,
    },
    #[error("{0} is not a pre-bundle file")]
    NotAPrebundle(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("ply export failed: {0}")]
    Export(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SfmError>;
