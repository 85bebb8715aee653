//! Absolute pose from three 2D-3D correspondences with Lambda Twist.
//!
//! "Lambda Twist: An Accurate Fast Robust Perspective Three Point (P3P) Solver"
//! Persson, M. and Nordberg, K. ECCV 2018.

use arrayvec::ArrayVec;
use nalgebra::{Matrix3, Point3, Rotation3, Unit, Vector2, Vector3};
use sample_consensus::{Estimator, Model};

/// A track observed by a view being posed.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PoseCorrespondence {
    /// Undistorted normalized image coordinates of the observation.
    pub normalized: Vector2<f64>,
    /// The triangulated track position.
    pub point: Point3<f64>,
}

impl PoseCorrespondence {
    pub fn bearing(&self) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.normalized.push(1.0))
    }
}

/// A world to camera transform `x_c = R x_w + t`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AbsolutePose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Model<PoseCorrespondence> for AbsolutePose {
    /// The reprojection error in normalized image units, infinite behind the camera.
    fn residual(&self, data: &PoseCorrespondence) -> f64 {
        let pc = self.rotation * data.point.coords + self.translation;
        if pc.z <= 0.0 {
            return f64::INFINITY;
        }
        (pc.xy() / pc.z - data.normalized).norm()
    }
}

/// The Lambda Twist P3P solver. Produces up to four poses per sample.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LambdaTwist {
    /// Gauss-Newton iterations used to refine the depths. Two are usually enough.
    pub gauss_newton_iterations: usize,
    pub rotation_convergence_iterations: usize,
    pub rotation_convergence_epsilon: f64,
}

impl Default for LambdaTwist {
    fn default() -> Self {
        Self {
            gauss_newton_iterations: 5,
            rotation_convergence_iterations: 100,
            rotation_convergence_epsilon: 1e-12,
        }
    }
}

/// The squared point distances and scaled bearing cosines of one sample.
#[derive(Copy, Clone, Debug)]
struct Triangle {
    a12: f64,
    a13: f64,
    a23: f64,
    b12: f64,
    b13: f64,
    b23: f64,
}

impl Triangle {
    fn residual(&self, l: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            l.x * l.x + l.y * l.y + self.b12 * l.x * l.y - self.a12,
            l.x * l.x + l.z * l.z + self.b13 * l.x * l.z - self.a13,
            l.y * l.y + l.z * l.z + self.b23 * l.y * l.z - self.a23,
        )
    }

    /// Refines the depths with Gauss-Newton, stopping once the residual grows.
    fn refine(&self, mut lambda: Vector3<f64>, iterations: usize) -> Vector3<f64> {
        let l1_norm = |v: &Vector3<f64>| v.iter().map(|n| n.abs()).sum::<f64>();
        let mut residual = self.residual(&lambda);
        for _ in 0..iterations {
            if l1_norm(&residual) < 1e-10 {
                break;
            }
            let (l1, l2, l3) = (lambda.x, lambda.y, lambda.z);
            #[rustfmt::skip]
            let jacobian = Matrix3::new(
                2.0 * l1 + self.b12 * l2, 2.0 * l2 + self.b12 * l1, 0.0,
                2.0 * l1 + self.b13 * l3, 0.0, 2.0 * l3 + self.b13 * l1,
                0.0, 2.0 * l2 + self.b23 * l3, 2.0 * l3 + self.b23 * l2,
            );
            let step = match jacobian.try_inverse() {
                Some(inverse) => inverse * residual,
                None => break,
            };
            let candidate = lambda - step;
            let candidate_residual = self.residual(&candidate);
            if l1_norm(&candidate_residual) > l1_norm(&residual) {
                break;
            }
            lambda = candidate;
            residual = candidate_residual;
        }
        lambda
    }
}

impl LambdaTwist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn solve(&self, samples: [PoseCorrespondence; 3]) -> ArrayVec<AbsolutePose, 4> {
        let mut poses = ArrayVec::new();
        let points = samples.map(|s| s.point.coords);
        let bearings = samples.map(|s| s.bearing().into_inner());

        let d12 = points[0] - points[1];
        let d13 = points[0] - points[2];
        let d23 = points[1] - points[2];
        let c12 = bearings[0].dot(&bearings[1]);
        let c23 = bearings[1].dot(&bearings[2]);
        let c31 = bearings[2].dot(&bearings[0]);
        let triangle = Triangle {
            a12: d12.norm_squared(),
            a13: d13.norm_squared(),
            a23: d23.norm_squared(),
            b12: -2.0 * c12,
            b13: -2.0 * c31,
            b23: -2.0 * c23,
        };
        let Triangle { a12, a13, a23, .. } = triangle;
        let blob = c12 * c23 * c31 - 1.0;
        let s12_sqr = 1.0 - c12 * c12;
        let s23_sqr = 1.0 - c23 * c23;
        let s31_sqr = 1.0 - c31 * c31;

        // Coefficients of the cubic whose root makes the conic pencil degenerate.
        let p3 = a13 * (a23 * s31_sqr - a13 * s23_sqr);
        let p2 = 2.0 * blob * a23 * a13
            + a13 * (2.0 * a12 + a13) * s23_sqr
            + a23 * (a23 - a12) * s31_sqr;
        let p1 = a23 * (a13 - a23) * s12_sqr
            - a12 * a12 * s23_sqr
            - 2.0 * a12 * (blob * a23 + a13 * s23_sqr);
        let p0 = a12 * (a12 * s23_sqr - a23 * s12_sqr);
        if p3.abs() < f64::EPSILON {
            return poses;
        }
        let g = cubic_root(p2 / p3, p1 / p3, p0 / p3);

        #[rustfmt::skip]
        let d0 = Matrix3::new(
            a23 * (1.0 - g), -(a23 * c12), a23 * c31 * g,
            -(a23 * c12), a23 - a12 + a13 * g, -c23 * (a13 * g - a12),
            a23 * c31 * g, -c23 * (a13 * g - a12), g * (a13 - a23) - a12,
        );
        let (eigenvectors, eigenvalues) = singular_eigen_decomposition(&d0);
        let ratio = (-eigenvalues[1] / eigenvalues[0]).max(0.0).sqrt();

        let mut lambdas: ArrayVec<Vector3<f64>, 4> = ArrayVec::new();
        for ratio in [ratio, -ratio] {
            let w2 = 1.0 / (ratio * eigenvectors.m12 - eigenvectors.m11);
            let w0 = w2 * (eigenvectors.m21 - ratio * eigenvectors.m22);
            let w1 = w2 * (eigenvectors.m31 - ratio * eigenvectors.m32);
            let a = 1.0 / ((a13 - a12) * w1 * w1 - a12 * triangle.b13 * w1 - a12);
            let b = a
                * (a13 * triangle.b12 * w1 - a12 * triangle.b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
            let c = a * ((a13 - a12) * w0 * w0 + a13 * triangle.b12 * w0 + a13);
            let Some((tau1, tau2)) = quadratic_roots(b, c) else {
                continue;
            };
            for tau in [tau1, tau2] {
                if tau <= 0.0 {
                    continue;
                }
                let d = a23 / (tau * (triangle.b23 + tau) + 1.0);
                if d <= 0.0 {
                    continue;
                }
                let l2 = d.sqrt();
                let l3 = tau * l2;
                let l1 = w0 * l2 + w1 * l3;
                if l1 >= 0.0 && !lambdas.is_full() {
                    lambdas.push(Vector3::new(l1, l2, l3));
                }
            }
        }

        let world_frame = Matrix3::from_columns(&[d12, d13, d12.cross(&d13)]);
        let Some(world_frame_inverse) = world_frame.try_inverse() else {
            return poses;
        };
        for lambda in lambdas {
            let lambda = triangle.refine(lambda, self.gauss_newton_iterations);
            let ry1 = lambda.x * bearings[0];
            let yd1 = ry1 - lambda.y * bearings[1];
            let yd2 = ry1 - lambda.z * bearings[2];
            let camera_frame = Matrix3::from_columns(&[yd1, yd2, yd1.cross(&yd2)]);
            let rotation = Rotation3::from_matrix_eps(
                &(camera_frame * world_frame_inverse),
                self.rotation_convergence_epsilon,
                self.rotation_convergence_iterations,
                Rotation3::identity(),
            )
            .into_inner();
            poses.push(AbsolutePose {
                rotation,
                translation: ry1 - rotation * points[0],
            });
        }
        poses
    }
}

impl Estimator<PoseCorrespondence> for LambdaTwist {
    type Model = AbsolutePose;
    type ModelIter = ArrayVec<AbsolutePose, 4>;
    const MIN_SAMPLES: usize = 3;

    fn estimate<I>(&self, mut data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PoseCorrespondence> + Clone,
    {
        match (data.next(), data.next(), data.next()) {
            (Some(a), Some(b), Some(c)) => self.solve([a, b, c]),
            _ => ArrayVec::new(),
        }
    }
}

/// The real roots of `r^2 + b r + c`, computed without cancellation.
fn quadratic_roots(b: f64, c: f64) -> Option<(f64, f64)> {
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        return None;
    }
    let y = discriminant.sqrt();
    Some(if b < 0.0 {
        (0.5 * (-b + y), 0.5 * (-b - y))
    } else {
        (2.0 * c / (-b + y), 2.0 * c / (-b - y))
    })
}

/// One root of `r^3 + b r^2 + c r + d` with a large derivative, found by Newton-Raphson
/// from a start point chosen around the stationary points of the cubic.
fn cubic_root(b: f64, c: f64, d: f64) -> f64 {
    let h = |r: f64| ((r + b) * r + c) * r + d;
    let dh = |r: f64| (3.0 * r + 2.0 * b) * r + c;
    let mut r = if b * b >= 3.0 * c {
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k1 = h(t1);
        if k1 > 0.0 {
            t1 - (-k1 / (3.0 * t1 + b)).sqrt()
        } else {
            let t2 = (-b + v) / 3.0;
            t2 + (-h(t2) / (3.0 * t2 + b)).sqrt()
        }
    } else {
        let r = -b / 3.0;
        if dh(r).abs() < 1e-4 {
            r + 1.0
        } else {
            r
        }
    };
    for iteration in 0..50 {
        let fx = h(r);
        if iteration >= 7 && fx.abs() <= 1e-13 {
            break;
        }
        r -= fx / dh(r);
    }
    r
}

/// Eigen decomposition of a symmetric 3x3 matrix with a zero eigenvalue.
///
/// Returns eigenvectors as columns and the two nonzero eigenvalues sorted by
/// descending magnitude, the null eigenvector last.
fn singular_eigen_decomposition(x: &Matrix3<f64>) -> (Matrix3<f64>, Vector2<f64>) {
    let null = Vector3::new(
        x[1] * x[5] - x[2] * x[4],
        x[2] * x[3] - x[5] * x[0],
        x[4] * x[0] - x[1] * x[3],
    )
    .normalize();

    let x12_sqr = x.m12 * x.m12;
    let b = -x.m11 - x.m22 - x.m33;
    let c = -x12_sqr - x.m13 * x.m13 - x.m23 * x.m23 + x.m11 * (x.m22 + x.m33) + x.m22 * x.m33;
    let (mut e1, mut e2) = quadratic_roots(b, c).unwrap_or((0.5 * b, 0.5 * b));
    if e1.abs() < e2.abs() {
        std::mem::swap(&mut e1, &mut e2);
    }

    let mx0011 = -x.m11 * x.m22;
    let prec_0 = x.m12 * x.m23 - x.m13 * x.m22;
    let prec_1 = x.m12 * x.m13 - x.m11 * x.m23;
    let eigenvector = |e: f64| {
        let tmp = 1.0 / (e * (x.m11 + x.m22) + mx0011 - e * e + x12_sqr);
        let a1 = -(e * x.m13 + prec_0) * tmp;
        let a2 = -(e * x.m23 + prec_1) * tmp;
        Vector3::new(a1, a2, 1.0).normalize()
    };
    (
        Matrix3::from_columns(&[eigenvector(e1), eigenvector(e2), null]),
        Vector2::new(e1, e2),
    )
}
