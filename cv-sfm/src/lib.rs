//! Incremental structure from motion.
//!
//! Viewports (features of one image each) are matched pairwise, verified with a
//! fundamental matrix and merged into tracks. A well conditioned initial pair is
//! posed from its essential matrix, after which views are added one at a time with
//! P3P, new tracks are triangulated, bad tracks are pruned and bundle adjustment
//! refines everything on a throttled schedule.

mod bundle_adjustment;
mod camera;
mod descriptor;
mod error;
mod essential;
mod export;
mod fundamental;
mod geometry;
mod homography;
mod incremental;
mod initial_pair;
mod matching;
mod nearest_neighbor;
mod p3p;
mod pipeline;
mod prebundle;
mod ransac;
mod settings;
mod tracks;
mod triangulation;
mod viewport;

pub use bundle_adjustment::*;
pub use camera::*;
pub use descriptor::*;
pub use error::*;
pub use essential::*;
pub use export::*;
pub use fundamental::*;
pub use geometry::*;
pub use homography::*;
pub use incremental::*;
pub use initial_pair::*;
pub use matching::*;
pub use nearest_neighbor::*;
pub use p3p::*;
pub use pipeline::*;
pub use prebundle::*;
pub use ransac::*;
pub use settings::*;
pub use tracks::*;
pub use triangulation::*;
pub use viewport::*;
