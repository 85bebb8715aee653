//! Sparse bundle adjustment with Levenberg-Marquardt.
//!
//! The normal equations are reduced to the camera parameters with the Schur
//! complement of the 3x3 point blocks. The damping follows Nielsen's update rule.

use crate::CameraPose;
use log::*;
use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3, Point2, Point3, SMatrix, Vector2, Vector3};
use rayon::prelude::*;

/// Rotation increment and translation increment.
const EXTRINSIC_PARAMETERS: usize = 6;
/// Extrinsics followed by focal length, `k1` and `k2`.
const ALL_PARAMETERS: usize = 9;
/// Smallest diagonal entry the damping is scaled by.
const MIN_DIAGONAL: f64 = 1e-9;

/// One pixel measurement of a point by a camera, both given by index.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Observation {
    pub camera: usize,
    pub point: usize,
    pub pixel: Point2<f64>,
}

/// The outcome of one optimization.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BundleReport {
    /// Root mean squared reprojection error in pixels before optimization.
    pub initial_rms: f64,
    pub final_rms: f64,
    pub iterations: usize,
    /// Observations which were behind their camera and took no part.
    pub skipped: usize,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BundleAdjuster {
    pub max_iterations: usize,
    /// Only optimize rotation and translation of the cameras.
    pub fixed_intrinsics: bool,
    /// Only optimize the cameras.
    pub fixed_points: bool,
    /// Initial damping relative to the diagonal of the normal equations.
    pub tau: f64,
    /// Stop once an accepted step lowers the cost by less than this fraction.
    pub cost_tolerance: f64,
    pub gradient_tolerance: f64,
}

impl Default for BundleAdjuster {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            fixed_intrinsics: false,
            fixed_points: false,
            tau: 1e-3,
            cost_tolerance: 1e-12,
            gradient_tolerance: 1e-12,
        }
    }
}

/// The residual of one observation and its derivatives.
struct Linearization {
    camera: usize,
    point: usize,
    residual: DVector<f64>,
    camera_jacobian: DMatrix<f64>,
    point_jacobian: DMatrix<f64>,
}

/// Projects a point and differentiates the pixel with respect to the camera
/// parameters and the point.
fn project_with_jacobians(
    camera: &CameraPose,
    point: &Point3<f64>,
) -> Option<(Point2<f64>, SMatrix<f64, 2, ALL_PARAMETERS>, Matrix2x3<f64>)> {
    let rotated = camera.rotation * point.coords;
    let pc = rotated + camera.translation;
    if pc.z <= 0.0 {
        return None;
    }
    let n = Vector2::new(pc.x / pc.z, pc.y / pc.z);
    let r2 = n.norm_squared();
    let d = camera.distortion_factor(r2);
    let f = camera.focal_length;
    let [k1, k2] = camera.distortion;
    let projected = camera.principal_point + n * (f * d);

    let z2 = pc.z * pc.z;
    let d_normalized = Matrix2x3::new(
        1.0 / pc.z,
        0.0,
        -pc.x / z2,
        0.0,
        1.0 / pc.z,
        -pc.y / z2,
    );
    let d_distorted = (Matrix2::identity() * d + n * n.transpose() * (2.0 * (k1 + 2.0 * k2 * r2))) * f;
    let d_camera_point = d_distorted * d_normalized;

    let mut jc = SMatrix::<f64, 2, ALL_PARAMETERS>::zeros();
    jc.fixed_view_mut::<2, 3>(0, 0)
        .copy_from(&(d_camera_point * -rotated.cross_matrix()));
    jc.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_camera_point);
    jc.set_column(6, &(n * d));
    jc.set_column(7, &(n * (f * r2)));
    jc.set_column(8, &(n * (f * r2 * r2)));
    Some((projected, jc, d_camera_point * camera.rotation))
}

/// Half the sum of squared reprojection errors. Infinite if any point is behind its camera.
fn cost(cameras: &[CameraPose], points: &[Point3<f64>], observations: &[Observation]) -> f64 {
    0.5 * observations
        .iter()
        .map(|o| cameras[o.camera].squared_reprojection_error(&points[o.point], &o.pixel))
        .sum::<f64>()
}

fn rms(cost: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        (2.0 * cost / count as f64).sqrt()
    }
}

fn damp(matrix: &mut DMatrix<f64>, mu: f64) {
    for i in 0..matrix.nrows() {
        matrix[(i, i)] += mu * matrix[(i, i)].max(MIN_DIAGONAL);
    }
}

/// The Gauss-Newton normal equations split into camera and point blocks.
struct NormalEquations {
    camera_dim: usize,
    cameras: DMatrix<f64>,
    camera_gradient: DVector<f64>,
    points: Vec<DMatrix<f64>>,
    point_gradient: Vec<DVector<f64>>,
    /// `(camera, point, J_cᵀ J_p)` per observation.
    coupling: Vec<(usize, usize, DMatrix<f64>)>,
    /// Indices into `coupling` per point.
    point_observations: Vec<Vec<usize>>,
}

impl NormalEquations {
    fn build(
        linearizations: &[Linearization],
        num_cameras: usize,
        num_points: usize,
        camera_dim: usize,
        free_points: bool,
    ) -> Self {
        let mut system = Self {
            camera_dim,
            cameras: DMatrix::zeros(num_cameras * camera_dim, num_cameras * camera_dim),
            camera_gradient: DVector::zeros(num_cameras * camera_dim),
            points: vec![],
            point_gradient: vec![],
            coupling: vec![],
            point_observations: vec![],
        };
        if free_points {
            system.points = vec![DMatrix::zeros(3, 3); num_points];
            system.point_gradient = vec![DVector::zeros(3); num_points];
            system.point_observations = vec![vec![]; num_points];
        }
        for l in linearizations {
            let offset = l.camera * camera_dim;
            let jct = l.camera_jacobian.transpose();
            let mut block = system
                .cameras
                .view_mut((offset, offset), (camera_dim, camera_dim));
            block += &jct * &l.camera_jacobian;
            let mut gradient = system.camera_gradient.rows_mut(offset, camera_dim);
            gradient -= &jct * &l.residual;
            if free_points {
                let jpt = l.point_jacobian.transpose();
                system.points[l.point] += &jpt * &l.point_jacobian;
                system.point_gradient[l.point] -= &jpt * &l.residual;
                system.point_observations[l.point].push(system.coupling.len());
                system
                    .coupling
                    .push((l.camera, l.point, &jct * &l.point_jacobian));
            }
        }
        system
    }

    fn max_gradient(&self) -> f64 {
        self.camera_gradient
            .iter()
            .chain(self.point_gradient.iter().flat_map(|g| g.iter()))
            .fold(0.0f64, |m, &g| m.max(g.abs()))
    }

    /// Solves the damped system. Points whose block cannot be inverted stay put.
    fn solve(&self, mu: f64) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
        let cd = self.camera_dim;
        let mut reduced = self.cameras.clone();
        damp(&mut reduced, mu);
        let mut rhs = self.camera_gradient.clone();

        let inverses: Vec<Option<DMatrix<f64>>> = self
            .points
            .iter()
            .map(|v| {
                let mut v = v.clone();
                damp(&mut v, mu);
                v.try_inverse()
            })
            .collect();
        for (j, observations) in self.point_observations.iter().enumerate() {
            let Some(v_inv) = &inverses[j] else { continue };
            for &a in observations {
                let (ca, _, wa) = &self.coupling[a];
                let wv = wa * v_inv;
                let mut rows = rhs.rows_mut(ca * cd, cd);
                rows -= &wv * &self.point_gradient[j];
                for &b in observations {
                    let (cb, _, wb) = &self.coupling[b];
                    let mut block = reduced.view_mut((ca * cd, cb * cd), (cd, cd));
                    block -= &wv * wb.transpose();
                }
            }
        }

        let camera_step = match reduced.clone().cholesky() {
            Some(cholesky) => cholesky.solve(&rhs),
            None => reduced.lu().solve(&rhs)?,
        };
        if !camera_step.iter().all(|n| n.is_finite()) {
            return None;
        }

        let point_step = self
            .point_observations
            .iter()
            .enumerate()
            .map(|(j, observations)| {
                let Some(v_inv) = &inverses[j] else {
                    return Vector3::zeros();
                };
                let mut g = self.point_gradient[j].clone();
                for &a in observations {
                    let (ca, _, wa) = &self.coupling[a];
                    g -= wa.transpose() * camera_step.rows(ca * cd, cd);
                }
                let step = v_inv * g;
                Vector3::new(step[0], step[1], step[2])
            })
            .collect();
        Some((camera_step, point_step))
    }

    /// The decrease of the linear model, `½ hᵀ (μ D h + g)`.
    fn predicted_reduction(&self, mu: f64, camera_step: &DVector<f64>, point_step: &[Vector3<f64>]) -> f64 {
        let mut reduction = 0.0;
        for (i, &h) in camera_step.iter().enumerate() {
            let d = self.cameras[(i, i)].max(MIN_DIAGONAL);
            reduction += h * (mu * d * h + self.camera_gradient[i]);
        }
        for ((v, g), h) in self.points.iter().zip(&self.point_gradient).zip(point_step) {
            for k in 0..3 {
                let d = v[(k, k)].max(MIN_DIAGONAL);
                reduction += h[k] * (mu * d * h[k] + g[k]);
            }
        }
        0.5 * reduction
    }
}

impl BundleAdjuster {
    pub fn new() -> Self {
        Default::default()
    }

    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    #[must_use]
    pub fn fixed_intrinsics(self, fixed_intrinsics: bool) -> Self {
        Self {
            fixed_intrinsics,
            ..self
        }
    }

    #[must_use]
    pub fn fixed_points(self, fixed_points: bool) -> Self {
        Self {
            fixed_points,
            ..self
        }
    }

    fn camera_dim(&self) -> usize {
        if self.fixed_intrinsics {
            EXTRINSIC_PARAMETERS
        } else {
            ALL_PARAMETERS
        }
    }

    fn linearize(
        &self,
        cameras: &[CameraPose],
        points: &[Point3<f64>],
        observations: &[Observation],
    ) -> Vec<Linearization> {
        let cd = self.camera_dim();
        observations
            .par_iter()
            .filter_map(|o| {
                let (projected, jc, jp) = project_with_jacobians(&cameras[o.camera], &points[o.point])?;
                let residual = projected - o.pixel;
                Some(Linearization {
                    camera: o.camera,
                    point: o.point,
                    residual: DVector::from_column_slice(residual.as_slice()),
                    camera_jacobian: DMatrix::from_fn(2, cd, |r, c| jc[(r, c)]),
                    point_jacobian: DMatrix::from_fn(2, 3, |r, c| jp[(r, c)]),
                })
            })
            .collect()
    }

    fn apply(
        &self,
        cameras: &mut [CameraPose],
        points: &mut [Point3<f64>],
        camera_step: &DVector<f64>,
        point_step: &[Vector3<f64>],
    ) {
        let cd = self.camera_dim();
        for (i, camera) in cameras.iter_mut().enumerate() {
            let h = camera_step.rows(i * cd, cd);
            camera.perturb(&Vector3::new(h[0], h[1], h[2]), &Vector3::new(h[3], h[4], h[5]));
            if cd == ALL_PARAMETERS {
                camera.focal_length += h[6];
                camera.distortion[0] += h[7];
                camera.distortion[1] += h[8];
            }
        }
        for (point, h) in points.iter_mut().zip(point_step) {
            point.coords += h;
        }
    }

    /// Minimizes the reprojection error of `observations` in place.
    ///
    /// Observations of points behind their camera at the start are left out.
    pub fn optimize(
        &self,
        cameras: &mut [CameraPose],
        points: &mut [Point3<f64>],
        observations: &[Observation],
    ) -> BundleReport {
        let active: Vec<Observation> = observations
            .iter()
            .filter(|o| cameras[o.camera].transform(&points[o.point]).z > 0.0)
            .copied()
            .collect();
        let skipped = observations.len() - active.len();
        let mut current = cost(cameras, points, &active);
        let initial_rms = rms(current, active.len());

        let mut mu = self.tau;
        let mut nu = 2.0;
        let mut iterations = 0;
        while iterations < self.max_iterations && current > 0.0 {
            iterations += 1;
            let linearizations = self.linearize(cameras, points, &active);
            let system = NormalEquations::build(
                &linearizations,
                cameras.len(),
                points.len(),
                self.camera_dim(),
                !self.fixed_points,
            );
            if system.max_gradient() < self.gradient_tolerance {
                break;
            }
            let Some((camera_step, point_step)) = system.solve(mu) else {
                mu *= nu;
                nu *= 2.0;
                if !mu.is_finite() {
                    break;
                }
                continue;
            };

            let mut new_cameras = cameras.to_vec();
            let mut new_points = points.to_vec();
            self.apply(&mut new_cameras, &mut new_points, &camera_step, &point_step);
            let new_cost = cost(&new_cameras, &new_points, &active);
            let predicted = system.predicted_reduction(mu, &camera_step, &point_step);
            let gain = (current - new_cost) / predicted;
            debug!(
                "bundle adjustment iteration {}: cost {:e} -> {:e}, mu {:e}, gain {}",
                iterations, current, new_cost, mu, gain
            );

            if new_cost < current && gain > 0.0 {
                cameras.copy_from_slice(&new_cameras);
                points.copy_from_slice(&new_points);
                let converged = current - new_cost <= self.cost_tolerance * current;
                current = new_cost;
                mu *= (1.0f64 / 3.0).max(1.0 - (2.0 * gain - 1.0).powi(3));
                nu = 2.0;
                if converged {
                    break;
                }
            } else {
                mu *= nu;
                nu *= 2.0;
                if !mu.is_finite() {
                    break;
                }
            }
        }

        BundleReport {
            initial_rms,
            final_rms: rms(current, active.len()),
            iterations,
            skipped,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn scene() -> (Vec<CameraPose>, Vec<Point3<f64>>, Vec<Observation>) {
        let cameras: Vec<CameraPose> = (0..4)
            .map(|i| {
                let angle = (i as f64 - 1.5) * 0.15;
                let rotation = Rotation3::from_euler_angles(0.02 * i as f64, angle, 0.0).into_inner();
                let center = Vector3::new(6.0 * angle.sin(), 0.1 * i as f64, -6.0 * angle.cos());
                let mut camera = CameraPose::new(800.0, Point2::new(400.0, 300.0))
                    .with_pose(rotation, -(rotation * center));
                camera.distortion = [-0.02, 0.005];
                camera
            })
            .collect();
        let points: Vec<Point3<f64>> = (0..60)
            .map(|i| {
                let i = i as f64;
                Point3::new((i * 0.61).sin(), (i * 0.29).cos(), (i * 0.83).sin() * 0.8)
            })
            .collect();
        let observations = cameras
            .iter()
            .enumerate()
            .flat_map(|(c, camera)| {
                points.iter().enumerate().map(move |(p, point)| Observation {
                    camera: c,
                    point: p,
                    pixel: camera.project(point).unwrap(),
                })
            })
            .collect();
        (cameras, points, observations)
    }

    #[test]
    fn single_camera_pose_is_recovered() {
        let (cameras, mut points, observations) = scene();
        let observations: Vec<Observation> = observations
            .into_iter()
            .filter(|o| o.camera == 2)
            .map(|o| Observation { camera: 0, ..o })
            .collect();
        let mut camera = [cameras[2]];
        camera[0].perturb(&Vector3::new(0.01, -0.02, 0.005), &Vector3::new(0.05, 0.02, -0.1));
        let report = BundleAdjuster::new()
            .fixed_points(true)
            .fixed_intrinsics(true)
            .optimize(&mut camera, &mut points, &observations);
        assert!(report.initial_rms > 1.0);
        assert!(report.final_rms < 1e-6);
        assert_relative_eq!(camera[0].rotation, cameras[2].rotation, epsilon = 1e-8);
        assert_relative_eq!(camera[0].translation, cameras[2].translation, epsilon = 1e-7);
    }

    #[test]
    fn full_adjustment_removes_perturbation() {
        let (mut cameras, mut points, observations) = scene();
        for (i, camera) in cameras.iter_mut().enumerate().skip(1) {
            let s = i as f64 * 0.003;
            camera.perturb(&Vector3::new(s, -s, s), &Vector3::new(-s, s, 2.0 * s));
            camera.focal_length += 5.0;
        }
        for (i, point) in points.iter_mut().enumerate() {
            point.coords += Vector3::new(0.01, -0.01, 0.02) * ((i % 5) as f64 - 2.0);
        }
        let report = BundleAdjuster::new()
            .max_iterations(100)
            .optimize(&mut cameras, &mut points, &observations);
        assert!(report.initial_rms > 1.0);
        assert!(report.final_rms < 1e-4, "{:?}", report);
        assert_eq!(report.skipped, 0);
    }

    #[test]
    fn fixed_intrinsics_are_kept() {
        let (mut cameras, mut points, observations) = scene();
        cameras[1].perturb(&Vector3::new(0.0, 0.01, 0.0), &Vector3::zeros());
        let before: Vec<(f64, [f64; 2])> = cameras.iter().map(|c| (c.focal_length, c.distortion)).collect();
        let report = BundleAdjuster::new()
            .fixed_intrinsics(true)
            .optimize(&mut cameras, &mut points, &observations);
        assert!(report.final_rms < report.initial_rms);
        let after: Vec<(f64, [f64; 2])> = cameras.iter().map(|c| (c.focal_length, c.distortion)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn jacobians_match_finite_differences() {
        let (cameras, points, _) = scene();
        let camera = cameras[1];
        let point = points[7];
        let (_, jc, jp) = project_with_jacobians(&camera, &point).unwrap();
        let h = 1e-6;
        for k in 0..ALL_PARAMETERS {
            let mut delta = [0.0; ALL_PARAMETERS];
            delta[k] = h;
            let mut shifted = camera;
            shifted.perturb(
                &Vector3::new(delta[0], delta[1], delta[2]),
                &Vector3::new(delta[3], delta[4], delta[5]),
            );
            shifted.focal_length += delta[6];
            shifted.distortion[0] += delta[7];
            shifted.distortion[1] += delta[8];
            let numeric = (shifted.project(&point).unwrap() - camera.project(&point).unwrap()) / h;
            assert_relative_eq!(numeric, jc.column(k).into_owned(), epsilon = 1e-3, max_relative = 1e-4);
        }
        for k in 0..3 {
            let mut shifted = point;
            shifted[k] += h;
            let numeric = (camera.project(&shifted).unwrap() - camera.project(&point).unwrap()) / h;
            assert_relative_eq!(numeric, jp.column(k).into_owned(), epsilon = 1e-3, max_relative = 1e-4);
        }
    }
}
