use nalgebra::{Matrix3, Matrix3x4, Point2, Point3, Rotation3, Unit, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Iterations used to invert the radial distortion polynomial.
const UNDISTORT_ITERATIONS: usize = 20;

/// A pinhole camera with two radial distortion coefficients.
///
/// The pose maps world coordinates into the camera frame (`x` right, `y` down,
/// `z` forward). A focal length of zero marks a camera that was never solved.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Focal length in pixels.
    pub focal_length: f64,
    /// Radial distortion `k1, k2` applied to normalized image coordinates.
    pub distortion: [f64; 2],
    /// The principal point in pixels.
    pub principal_point: Point2<f64>,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self::invalid()
    }
}

impl CameraPose {
    /// A camera that has not been reconstructed.
    pub fn invalid() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            focal_length: 0.0,
            distortion: [0.0; 2],
            principal_point: Point2::origin(),
        }
    }

    /// An undistorted camera at the world origin.
    pub fn new(focal_length: f64, principal_point: Point2<f64>) -> Self {
        Self {
            focal_length,
            principal_point,
            ..Self::invalid()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.focal_length != 0.0
    }

    pub fn with_pose(self, rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
            ..self
        }
    }

    /// The optical center in world coordinates.
    pub fn center(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.transpose() * self.translation))
    }

    /// The `[R|t]` matrix acting on normalized image coordinates.
    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        let mut p = Matrix3x4::zeros();
        p.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        p.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        p
    }

    /// Transforms a world point into the camera frame.
    pub fn transform(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.rotation * point.coords + self.translation
    }

    /// The distortion factor for a squared normalized radius.
    pub fn distortion_factor(&self, r2: f64) -> f64 {
        let [k1, k2] = self.distortion;
        1.0 + k1 * r2 + k2 * r2 * r2
    }

    /// Projects a point in the camera frame to pixels. `None` if it is not in front.
    pub fn project_camera_point(&self, pc: &Vector3<f64>) -> Option<Point2<f64>> {
        if pc.z <= 0.0 {
            return None;
        }
        let n = Vector2::new(pc.x / pc.z, pc.y / pc.z);
        let d = self.distortion_factor(n.norm_squared());
        Some(self.principal_point + n * (self.focal_length * d))
    }

    /// Projects a world point to pixels. `None` if it is behind the camera.
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        self.project_camera_point(&self.transform(point))
    }

    /// Squared reprojection error in pixels, infinite behind the camera.
    pub fn squared_reprojection_error(&self, point: &Point3<f64>, observed: &Point2<f64>) -> f64 {
        self.project(point)
            .map(|p| (p - observed).norm_squared())
            .unwrap_or(f64::INFINITY)
    }

    /// Removes the intrinsics and the distortion of a pixel position.
    pub fn normalize(&self, pixel: &Point2<f64>) -> Vector2<f64> {
        let distorted = (pixel - self.principal_point) / self.focal_length;
        if self.distortion == [0.0; 2] {
            return distorted;
        }
        let mut n = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            n = distorted / self.distortion_factor(n.norm_squared());
        }
        n
    }

    /// The ray through a pixel in the camera frame.
    pub fn bearing(&self, pixel: &Point2<f64>) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.normalize(pixel).push(1.0))
    }

    /// The ray through a pixel in the world frame.
    pub fn world_bearing(&self, pixel: &Point2<f64>) -> Unit<Vector3<f64>> {
        Unit::new_unchecked(self.rotation.transpose() * self.bearing(pixel).into_inner())
    }

    /// Applies an incremental rotation (axis-angle, left multiplied) and translation.
    pub fn perturb(&mut self, rotation: &Vector3<f64>, translation: &Vector3<f64>) {
        self.rotation = Rotation3::new(*rotation).into_inner() * self.rotation;
        self.translation += translation;
    }

    /// The camera after the world is mapped by `x -> (x + shift) * scale`.
    pub fn transformed(&self, shift: &Vector3<f64>, scale: f64) -> Self {
        Self {
            translation: self.translation * scale - self.rotation * shift * scale,
            ..*self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraPose {
        let mut camera = CameraPose::new(700.0, Point2::new(320.0, 240.0)).with_pose(
            Rotation3::from_euler_angles(0.1, -0.2, 0.05).into_inner(),
            Vector3::new(0.3, -0.1, 2.0),
        );
        camera.distortion = [-0.05, 0.01];
        camera
    }

    #[test]
    fn projection_and_bearing_agree() {
        let camera = camera();
        let point = Point3::new(0.2, 0.4, 1.5);
        let pixel = camera.project(&point).unwrap();
        let ray = camera.world_bearing(&pixel);
        let to_point = (point - camera.center()).normalize();
        assert_relative_eq!(ray.into_inner(), to_point, epsilon = 1e-9);
        assert_relative_eq!(camera.squared_reprojection_error(&point, &pixel), 0.0);
    }

    #[test]
    fn points_behind_are_not_projected() {
        let camera = CameraPose::new(500.0, Point2::origin());
        assert!(camera.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(camera
            .squared_reprojection_error(&Point3::new(0.0, 0.0, -1.0), &Point2::origin())
            .is_infinite());
    }

    #[test]
    fn world_transform_keeps_projections() {
        let camera = camera();
        let point = Point3::new(-0.4, 0.1, 0.8);
        let shift = Vector3::new(1.0, 2.0, -3.0);
        let moved = camera.transformed(&shift, 0.25);
        let moved_point = Point3::from((point.coords + shift) * 0.25);
        assert_relative_eq!(
            camera.project(&point).unwrap(),
            moved.project(&moved_point).unwrap(),
            epsilon = 1e-9
        );
    }
}
