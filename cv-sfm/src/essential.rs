use crate::{CameraPose, FundamentalMatrix, LinearEigenTriangulator};
use log::debug;
use nalgebra::{Matrix3, Matrix3x4, Unit, Vector3, SVD};

/// The relative pose of a second camera: `x_b = R x_a + t`, with `t` of unit length.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RelativePose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl RelativePose {
    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        let mut p = Matrix3x4::zeros();
        p.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        p.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        p
    }
}

/// This stores an essential matrix, which is satisfied by `bᵀ E a = 0` for bearings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EssentialMatrix(pub Matrix3<f64>);

impl EssentialMatrix {
    /// Upgrades a fundamental matrix with the intrinsics of both cameras: `E = K_bᵀ F K_a`.
    pub fn from_fundamental(
        fundamental: &FundamentalMatrix,
        a: &CameraPose,
        b: &CameraPose,
    ) -> Self {
        let intrinsics = |c: &CameraPose| {
            Matrix3::new(
                c.focal_length,
                0.0,
                c.principal_point.x,
                0.0,
                c.focal_length,
                c.principal_point.y,
                0.0,
                0.0,
                1.0,
            )
        };
        Self(intrinsics(b).transpose() * fundamental.0 * intrinsics(a))
    }

    /// Projects the matrix onto the essential manifold by averaging the two larger
    /// singular values and zeroing the smallest one.
    pub fn recondition(self, epsilon: f64, max_iterations: usize) -> Option<Self> {
        let mut svd = self.0.try_svd(true, true, epsilon, max_iterations)?;
        svd.singular_values[2] = 0.0;
        let new_singular = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
        svd.singular_values[0] = new_singular;
        svd.singular_values[1] = new_singular;
        let mat = svd.recompose().ok()?;
        Some(Self(mat))
    }

    /// Returns the two possible rotations and the translation direction up to sign.
    pub fn possible_rotations_unscaled_translation(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
        let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let wt = w.transpose();

        let svd = SVD::try_new(self.0, true, true, epsilon, max_iterations)?;
        let (mut u, mut v_t) = (svd.u?, svd.v_t?);
        // Both factors have to be proper rotations for the products to be rotations.
        if u.determinant() < 0.0 {
            for n in u.column_mut(2).iter_mut() {
                *n *= -1.0;
            }
        }
        if v_t.determinant() < 0.0 {
            for n in v_t.row_mut(2).iter_mut() {
                *n *= -1.0;
            }
        }
        Some((u * w * v_t, u * wt * v_t, u.column(2).into_owned()))
    }

    /// The four poses consistent with the matrix.
    pub fn possible_poses(&self, epsilon: f64, max_iterations: usize) -> Option<[RelativePose; 4]> {
        self.possible_rotations_unscaled_translation(epsilon, max_iterations)
            .map(|(rot_a, rot_b, t)| {
                [(rot_a, t), (rot_b, t), (rot_a, -t), (rot_b, -t)].map(|(rotation, translation)| {
                    RelativePose {
                        rotation,
                        translation,
                    }
                })
            })
    }

    /// Picks the pose which puts the most triangulated correspondences in front of
    /// both cameras. The pose must win a strict majority of the correspondences.
    pub fn solve_pose(
        &self,
        bearings: &[(Unit<Vector3<f64>>, Unit<Vector3<f64>>)],
        triangulator: &LinearEigenTriangulator,
    ) -> Option<RelativePose> {
        let first = Matrix3x4::identity();
        let (pose, count) = self
            .possible_poses(1e-12, 1000)?
            .into_iter()
            .map(|pose| {
                let second = pose.projection_matrix();
                let count = bearings
                    .iter()
                    .filter(|&&(a, b)| {
                        triangulator
                            .triangulate([(first, a), (second, b)].into_iter())
                            .is_some()
                    })
                    .count();
                (pose, count)
            })
            .max_by_key(|&(_, count)| count)?;
        debug!(
            "chirality test passed {} of {} correspondences",
            count,
            bearings.len()
        );
        (count * 2 > bearings.len()).then_some(pose)
    }
}
