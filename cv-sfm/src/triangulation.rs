use float_ord::FloatOrd;
use itertools::Itertools;
use nalgebra::{Matrix3x4, Matrix4, Point3, Unit, Vector3};

/// Multi-view triangulation which minimizes the squared sine of the angle between
/// each observed bearing and the bearing to the point, linearized.
///
/// Each observation is a `[R|t]` pose mapping world to camera coordinates and the
/// observed bearing in that camera frame. Points which end up behind any observing
/// camera are rejected.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct LinearEigenTriangulator {
    epsilon: f64,
    max_iterations: usize,
}

impl LinearEigenTriangulator {
    pub fn new() -> Self {
        Default::default()
    }

    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    pub fn triangulate(
        &self,
        observations: impl Iterator<Item = (Matrix3x4<f64>, Unit<Vector3<f64>>)> + Clone,
    ) -> Option<Point3<f64>> {
        if observations.clone().count() < 2 {
            return None;
        }

        let mut a = Matrix4::<f64>::zeros();
        for (pose, bearing) in observations.clone() {
            let bearing = bearing.into_inner();
            // Remove the component of the projection along the bearing.
            let term = pose - bearing * bearing.transpose() * pose;
            a += term.transpose() * term;
        }

        let se = a.try_symmetric_eigen(self.epsilon, self.max_iterations)?;
        let homogeneous = se
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| se.eigenvectors.column(ix).into_owned())?;
        if homogeneous.w.abs() < f64::EPSILON {
            return None;
        }
        let point = Point3::from_homogeneous(homogeneous)?;
        if !point.coords.iter().all(|n| n.is_finite()) {
            return None;
        }
        let in_front = observations.clone().all(|(pose, bearing)| {
            (pose * point.to_homogeneous()).dot(&bearing.into_inner()) > 0.0
        });
        in_front.then_some(point)
    }
}

impl Default for LinearEigenTriangulator {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

/// The largest angle in radians between any two rays from `centers` to `point`.
pub fn max_ray_angle(point: &Point3<f64>, centers: impl Iterator<Item = Point3<f64>>) -> f64 {
    let rays: Vec<Unit<Vector3<f64>>> = centers.map(|c| Unit::new_normalize(point - c)).collect();
    rays.iter()
        .tuple_combinations()
        .map(|(a, b)| a.into_inner().dot(&b.into_inner()).clamp(-1.0, 1.0).acos())
        .max_by_key(|&angle| FloatOrd(angle))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::CameraPose;
    use approx::assert_relative_eq;
    use nalgebra::{Point2, Rotation3};

    fn cameras() -> Vec<CameraPose> {
        (0..3)
            .map(|i| {
                let angle = (i as f64 - 1.0) * 0.2;
                let rotation = Rotation3::from_euler_angles(0.0, angle, 0.0).into_inner();
                let center = Point3::new(4.0 * angle.sin(), 0.1 * i as f64, -4.0 * angle.cos());
                CameraPose::new(600.0, Point2::new(320.0, 240.0))
                    .with_pose(rotation, -(rotation * center.coords))
            })
            .collect()
    }

    #[test]
    fn recovers_point_from_three_views() {
        let point = Point3::new(0.3, -0.2, 0.5);
        let cameras = cameras();
        let observations = cameras.iter().map(|c| {
            (
                c.projection_matrix(),
                c.bearing(&c.project(&point).unwrap()),
            )
        });
        let estimate = LinearEigenTriangulator::new()
            .triangulate(observations)
            .unwrap();
        assert_relative_eq!(estimate, point, epsilon = 1e-9);
    }

    #[test]
    fn single_observation_is_not_enough() {
        let c = cameras()[0];
        let bearing = c.bearing(&Point2::new(300.0, 200.0));
        assert!(LinearEigenTriangulator::new()
            .triangulate(std::iter::once((c.projection_matrix(), bearing)))
            .is_none());
    }

    #[test]
    fn ray_angle_between_opposite_cameras() {
        let angle = max_ray_angle(
            &Point3::origin(),
            [
                Point3::new(-1.0, 0.0, -1.0),
                Point3::new(1.0, 0.0, -1.0),
                Point3::new(0.0, 0.0, -1.0),
            ]
            .into_iter(),
        );
        assert_relative_eq!(angle, std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
    }
}
