use crate::{CameraPose, DescriptorSet, Result, SfmError};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// The descriptors of a viewport, released once pairwise matching is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Descriptors {
    Present(DescriptorSet),
    Cleared,
}

impl Descriptors {
    pub fn get(&self) -> Option<&DescriptorSet> {
        match self {
            Self::Present(set) => Some(set),
            Self::Cleared => None,
        }
    }
}

/// Per-feature colors of a viewport, released once tracks carry their own color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Colors {
    /// Either empty (no color information) or one color per feature.
    Present(Vec<[u8; 3]>),
    Cleared,
}

/// The features extracted from one input view and, once solved, its camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: usize,
    pub height: usize,
    /// Focal length in pixels derived from EXIF, if any.
    pub focal_length_hint: Option<f64>,
    /// Feature positions in pixels.
    pub positions: Vec<Point2<f64>>,
    descriptors: Descriptors,
    colors: Colors,
    /// For every feature, the track it belongs to.
    pub track_ids: Vec<Option<usize>>,
    pub camera: CameraPose,
}

impl Viewport {
    /// Creates a viewport, checking that every feature has a position and a descriptor.
    ///
    /// `colors` may be empty if the features carry no color.
    pub fn new(
        index: usize,
        width: usize,
        height: usize,
        positions: Vec<Point2<f64>>,
        descriptors: DescriptorSet,
        colors: Vec<[u8; 3]>,
    ) -> Result<Self> {
        descriptors.validate()?;
        if descriptors.len() != positions.len() {
            return Err(SfmError::FeatureCountMismatch(
                index,
                descriptors.len(),
                positions.len(),
            ));
        }
        if !colors.is_empty() && colors.len() != positions.len() {
            return Err(SfmError::FeatureCountMismatch(
                index,
                colors.len(),
                positions.len(),
            ));
        }
        Ok(Self {
            width,
            height,
            focal_length_hint: None,
            track_ids: vec![None; positions.len()],
            positions,
            descriptors: Descriptors::Present(descriptors),
            colors: Colors::Present(colors),
            camera: CameraPose::invalid(),
        })
    }

    pub fn with_focal_length_hint(self, focal_length: f64) -> Self {
        Self {
            focal_length_hint: Some(focal_length),
            ..self
        }
    }

    pub fn num_features(&self) -> usize {
        self.positions.len()
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    /// The descriptors, or the contract violation if they were released.
    pub fn descriptor_set(&self, index: usize) -> Result<&DescriptorSet> {
        self.descriptors
            .get()
            .ok_or(SfmError::DescriptorsCleared(index))
    }

    /// Transition `Present -> Cleared` for the descriptors.
    pub fn clear_descriptors(&mut self) {
        self.descriptors = Descriptors::Cleared;
    }

    /// The color of a feature, `None` if the viewport has no colors.
    pub fn color(&self, index: usize, feature: usize) -> Result<Option<[u8; 3]>> {
        match &self.colors {
            Colors::Present(colors) => Ok(colors.get(feature).copied()),
            Colors::Cleared => Err(SfmError::ColorsCleared(index)),
        }
    }

    /// Transition `Present -> Cleared` for the colors.
    pub fn clear_colors(&mut self) {
        self.colors = Colors::Cleared;
    }

    /// The principal point at the center of the image.
    pub fn image_center(&self) -> Point2<f64> {
        Point2::new(self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    /// The focal length to start from: the hint, or a factor of the larger image side.
    pub fn initial_focal_length(&self, fallback_factor: f64) -> f64 {
        self.focal_length_hint
            .filter(|&f| f > 0.0)
            .unwrap_or_else(|| fallback_factor * self.width.max(self.height) as f64)
    }

    /// An unposed camera with the initial intrinsics of this viewport.
    pub fn initial_camera(&self, fallback_factor: f64) -> CameraPose {
        CameraPose::new(
            self.initial_focal_length(fallback_factor),
            self.image_center(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn viewport() -> Viewport {
        Viewport::new(
            3,
            640,
            480,
            vec![Point2::new(1.0, 2.0)],
            DescriptorSet::F32 {
                dim: 8,
                data: vec![0.5; 8],
            },
            vec![[10, 20, 30]],
        )
        .unwrap()
    }

    #[test]
    fn cleared_state_is_detected() {
        let mut viewport = viewport();
        assert!(viewport.descriptor_set(3).is_ok());
        assert_eq!(viewport.color(3, 0).unwrap(), Some([10, 20, 30]));
        viewport.clear_descriptors();
        viewport.clear_colors();
        assert!(matches!(
            viewport.descriptor_set(3),
            Err(SfmError::DescriptorsCleared(3))
        ));
        assert!(matches!(viewport.color(3, 0), Err(SfmError::ColorsCleared(3))));
    }

    #[test]
    fn mismatched_feature_counts_are_rejected() {
        let result = Viewport::new(
            0,
            10,
            10,
            vec![Point2::origin(); 2],
            DescriptorSet::U16 {
                dim: 8,
                data: vec![0; 8],
            },
            vec![],
        );
        assert!(matches!(result, Err(SfmError::FeatureCountMismatch(0, 1, 2))));
    }

    #[test]
    fn fallback_focal_uses_larger_side() {
        let viewport = viewport();
        assert_eq!(viewport.initial_focal_length(1.2), 768.0);
        assert_eq!(
            viewport.with_focal_length_hint(900.0).initial_focal_length(1.2),
            900.0
        );
    }
}
