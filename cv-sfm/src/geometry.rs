use float_ord::FloatOrd;
use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// The pixel positions of one feature correspondence between two views.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatch(pub Point2<f64>, pub Point2<f64>);

/// Computes the similarity which moves the centroid of `points` to the origin and
/// scales their mean distance from it to `sqrt(2)`.
pub fn hartley_normalization(
    points: impl Iterator<Item = Point2<f64>> + Clone,
) -> Option<Matrix3<f64>> {
    let count = points.clone().count();
    if count == 0 {
        return None;
    }
    let centroid =
        Point2::from(points.clone().fold(Vector2::zeros(), |acc, p| acc + p.coords) / count as f64);
    let mean_distance = points.map(|p| (p - centroid).norm()).sum::<f64>() / count as f64;
    if mean_distance < 1e-12 {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_distance;
    Some(Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

/// Applies a projective transform to a point.
pub fn transform_point(transform: &Matrix3<f64>, point: &Point2<f64>) -> Vector3<f64> {
    transform * point.coords.push(1.0)
}

/// The unit eigenvector of the smallest eigenvalue of a symmetric 9x9 matrix,
/// the least squares null vector of a linear system given its normal matrix.
pub fn smallest_eigenvector9(normal: &SMatrix<f64, 9, 9>) -> Option<SVector<f64, 9>> {
    let eigens = normal.try_symmetric_eigen(1e-12, 1000)?;
    eigens
        .eigenvalues
        .iter()
        .enumerate()
        .min_by_key(|&(_, &n)| FloatOrd(n))
        .map(|(ix, _)| eigens.eigenvectors.column(ix).into_owned())
}

/// Rebuilds a row-major 3x3 matrix from a 9 vector.
pub fn matrix_from_row_major(v: &SVector<f64, 9>) -> Matrix3<f64> {
    Matrix3::from_row_slice(v.as_slice())
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn normalization_centers_and_scales() {
        let points = [
            Point2::new(10.0, 10.0),
            Point2::new(30.0, 10.0),
            Point2::new(30.0, 30.0),
            Point2::new(10.0, 30.0),
        ];
        let t = hartley_normalization(points.iter().copied()).unwrap();
        let moved: Vec<_> = points.iter().map(|p| transform_point(&t, p)).collect();
        let centroid = moved.iter().fold(Vector3::zeros(), |acc, p| acc + p) / 4.0;
        assert_relative_eq!(centroid.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(centroid.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(moved[0].xy().norm(), std::f64::consts::SQRT_2, epsilon = 1e-12);
    }

    #[test]
    fn coincident_points_cannot_be_normalized() {
        assert!(hartley_normalization(std::iter::repeat(Point2::new(1.0, 1.0)).take(5)).is_none());
    }
}
