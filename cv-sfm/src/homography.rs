use crate::{
    hartley_normalization, matrix_from_row_major, smallest_eigenvector9, transform_point,
    FeatureMatch,
};
use nalgebra::{Matrix3, Point2, SMatrix, SVector};
use sample_consensus::{Estimator, Model};

/// A plane induced homography mapping pixels of the first view into the second.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Homography {
    pub matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Homography {
    pub fn new(matrix: Matrix3<f64>) -> Option<Self> {
        let inverse = matrix.try_inverse()?;
        Some(Self { matrix, inverse })
    }

    fn map(transform: &Matrix3<f64>, point: &Point2<f64>) -> Option<Point2<f64>> {
        let p = transform_point(transform, point);
        if p.z.abs() < 1e-12 {
            None
        } else {
            Some(Point2::new(p.x / p.z, p.y / p.z))
        }
    }

    /// The root mean square of the forward and backward transfer errors in pixels.
    pub fn symmetric_transfer_error(&self, FeatureMatch(a, b): &FeatureMatch) -> f64 {
        match (Self::map(&self.matrix, a), Self::map(&self.inverse, b)) {
            (Some(forward), Some(backward)) => {
                (((forward - b).norm_squared() + (backward - a).norm_squared()) / 2.0).sqrt()
            }
            _ => f64::INFINITY,
        }
    }
}

impl Model<FeatureMatch> for Homography {
    fn residual(&self, data: &FeatureMatch) -> f64 {
        self.symmetric_transfer_error(data)
    }
}

/// The normalized direct linear transform for homographies from four or more matches.
#[derive(Copy, Clone, Debug, Default)]
pub struct FourPoint;

impl FourPoint {
    pub fn new() -> Self {
        Self
    }

    pub fn from_matches(&self, matches: &[FeatureMatch]) -> Option<Homography> {
        if matches.len() < <Self as Estimator<FeatureMatch>>::MIN_SAMPLES {
            return None;
        }
        let ta = hartley_normalization(matches.iter().map(|m| m.0))?;
        let tb = hartley_normalization(matches.iter().map(|m| m.1))?;
        if matches.len() == 4 && has_collinear_triple(matches, &ta, &tb) {
            return None;
        }
        let mut normal = SMatrix::<f64, 9, 9>::zeros();
        for FeatureMatch(a, b) in matches {
            let a = transform_point(&ta, a);
            let b = transform_point(&tb, b);
            let first = SVector::<f64, 9>::from_column_slice(&[
                0.0,
                0.0,
                0.0,
                -b.z * a.x,
                -b.z * a.y,
                -b.z * a.z,
                b.y * a.x,
                b.y * a.y,
                b.y * a.z,
            ]);
            let second = SVector::<f64, 9>::from_column_slice(&[
                b.z * a.x,
                b.z * a.y,
                b.z * a.z,
                0.0,
                0.0,
                0.0,
                -b.x * a.x,
                -b.x * a.y,
                -b.x * a.z,
            ]);
            normal += first * first.transpose() + second * second.transpose();
        }
        let h = matrix_from_row_major(&smallest_eigenvector9(&normal)?);
        let h = tb.try_inverse()? * h * ta;
        let scale = h[(2, 2)];
        let h = if scale.abs() > 1e-12 { h / scale } else { h };
        Homography::new(h)
    }
}

/// Checks a minimal sample for three points on a line in either view.
fn has_collinear_triple(matches: &[FeatureMatch], ta: &Matrix3<f64>, tb: &Matrix3<f64>) -> bool {
    let a: Vec<_> = matches.iter().map(|m| transform_point(ta, &m.0)).collect();
    let b: Vec<_> = matches.iter().map(|m| transform_point(tb, &m.1)).collect();
    let triples = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    triples.iter().any(|&[i, j, k]| {
        [&a, &b]
            .iter()
            .any(|p| p[i].cross(&p[j]).dot(&p[k]).abs() < 1e-6)
    })
}

impl Estimator<FeatureMatch> for FourPoint {
    type Model = Homography;
    type ModelIter = Option<Homography>;
    const MIN_SAMPLES: usize = 4;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        self.from_matches(&data.collect::<Vec<_>>())
    }
}
