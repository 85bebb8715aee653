use crate::{
    hartley_normalization, matrix_from_row_major, smallest_eigenvector9, transform_point,
    FeatureMatch,
};
use nalgebra::{Matrix3, SMatrix, SVector};
use sample_consensus::{Estimator, Model};

/// A fundamental matrix `F` relating pixel positions by `bᵀ F a = 0`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FundamentalMatrix(pub Matrix3<f64>);

impl FundamentalMatrix {
    /// The Sampson approximation of the geometric error in pixels.
    pub fn sampson_distance(&self, FeatureMatch(a, b): &FeatureMatch) -> f64 {
        let a = a.coords.push(1.0);
        let b = b.coords.push(1.0);
        let fa = self.0 * a;
        let ftb = self.0.transpose() * b;
        let epipolar = b.dot(&fa);
        let gradient = fa.x * fa.x + fa.y * fa.y + ftb.x * ftb.x + ftb.y * ftb.y;
        if gradient < f64::EPSILON {
            return f64::INFINITY;
        }
        (epipolar * epipolar / gradient).sqrt()
    }
}

impl Model<FeatureMatch> for FundamentalMatrix {
    fn residual(&self, data: &FeatureMatch) -> f64 {
        self.sampson_distance(data)
    }
}

/// The normalized eight-point algorithm for fundamental matrices.
///
/// Any number of matches from eight upwards is accepted, so the same estimator
/// refits a model to a full inlier set.
#[derive(Copy, Clone, Debug, Default)]
pub struct EightPoint;

impl EightPoint {
    pub fn new() -> Self {
        Self
    }

    pub fn from_matches(&self, matches: &[FeatureMatch]) -> Option<FundamentalMatrix> {
        if matches.len() < <Self as Estimator<FeatureMatch>>::MIN_SAMPLES {
            return None;
        }
        let ta = hartley_normalization(matches.iter().map(|m| m.0))?;
        let tb = hartley_normalization(matches.iter().map(|m| m.1))?;
        let mut normal = SMatrix::<f64, 9, 9>::zeros();
        for FeatureMatch(a, b) in matches {
            let a = transform_point(&ta, a);
            let b = transform_point(&tb, b);
            let row = SVector::<f64, 9>::from_iterator(
                (0..3).flat_map(|i| (0..3).map(move |j| b[i] * a[j])),
            );
            normal += row * row.transpose();
        }
        let f = matrix_from_row_major(&smallest_eigenvector9(&normal)?);
        // Enforce rank two by dropping the smallest singular value.
        let svd = f.svd(true, true);
        let (u, v_t) = (svd.u?, svd.v_t?);
        let mut singular_values = svd.singular_values;
        let smallest = singular_values.imin();
        singular_values[smallest] = 0.0;
        let f = u * Matrix3::from_diagonal(&singular_values) * v_t;
        let f = tb.transpose() * f * ta;
        let norm = f.norm();
        if norm < f64::EPSILON {
            return None;
        }
        Some(FundamentalMatrix(f / norm))
    }
}

impl Estimator<FeatureMatch> for EightPoint {
    type Model = FundamentalMatrix;
    type ModelIter = Option<FundamentalMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        self.from_matches(&data.collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CameraPose, Ransac};
    use nalgebra::{Point2, Point3, Rotation3, Vector3};
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;
    use sample_consensus::Consensus;

    fn scene(count: usize) -> Vec<FeatureMatch> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let a = CameraPose::new(800.0, Point2::new(400.0, 300.0));
        let b = a.with_pose(
            Rotation3::from_euler_angles(0.02, -0.15, 0.01).into_inner(),
            Vector3::new(-0.8, 0.05, 0.1),
        );
        (0..count)
            .map(|_| {
                let p = Point3::new(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(4.0..7.0),
                );
                FeatureMatch(a.project(&p).unwrap(), b.project(&p).unwrap())
            })
            .collect()
    }

    #[test]
    fn exact_matches_have_zero_residual() {
        let matches = scene(30);
        let f = EightPoint::new().from_matches(&matches).unwrap();
        for m in &matches {
            assert!(f.residual(m) < 1e-5, "residual {}", f.residual(m));
        }
        assert!(f.0.determinant().abs() < 1e-9);
    }

    #[test]
    fn ransac_rejects_outliers() {
        let mut matches = scene(60);
        for m in matches.iter_mut().step_by(5) {
            m.1 = Point2::new(m.1.y, m.1.x + 40.0);
        }
        let mut ransac = Ransac::new(1.0, 500, Xoshiro256PlusPlus::seed_from_u64(0));
        let (_, inliers) = ransac
            .model_inliers(&EightPoint::new(), matches.iter().copied())
            .unwrap();
        assert!((0..60).filter(|ix| ix % 5 != 0).all(|ix| inliers.contains(&ix)));
        assert!(inliers.iter().filter(|&&ix| ix % 5 == 0).count() <= 2);
    }
}
