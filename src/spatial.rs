//! Spatial algebra for 6D motion and force vectors.
//!
//! Motion and force vectors are referenced at the origin of their expressing
//! frame, following the classical screw convention: transporting a quantity
//! between frames shifts the reference point and rotates the axes at once.
//! Functions here are pure math with no pipeline state dependencies.

use nalgebra::{Isometry3, Matrix3, UnitQuaternion, Vector3, Vector6};

/// SE(3) placement used throughout the kernel.
pub type Placement = Isometry3<f64>;

/// 6D spatial motion: linear part first, angular part second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Motion {
    /// Linear velocity of the point of the body coinciding with the origin.
    pub linear: Vector3<f64>,
    /// Angular velocity.
    pub angular: Vector3<f64>,
}

/// 6D spatial force (wrench): linear force first, angular torque second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Force {
    /// Linear force.
    pub linear: Vector3<f64>,
    /// Torque about the origin of the expressing frame.
    pub angular: Vector3<f64>,
}

impl Motion {
    /// The zero motion.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build from linear and angular parts.
    #[must_use]
    pub fn new(linear: Vector3<f64>, angular: Vector3<f64>) -> Self {
        Self { linear, angular }
    }

    /// Build from a 6-vector `[linear, angular]`.
    #[must_use]
    pub fn from_vector(v: &Vector6<f64>) -> Self {
        Self {
            linear: Vector3::new(v[0], v[1], v[2]),
            angular: Vector3::new(v[3], v[4], v[5]),
        }
    }

    /// Pack into a 6-vector `[linear, angular]`.
    #[must_use]
    pub fn to_vector(&self) -> Vector6<f64> {
        Vector6::new(
            self.linear.x,
            self.linear.y,
            self.linear.z,
            self.angular.x,
            self.angular.y,
            self.angular.z,
        )
    }

    /// Express this motion in the frame `m` maps to: rotate the axes and move
    /// the reference point to the target origin.
    #[must_use]
    pub fn transform(&self, m: &Placement) -> Self {
        let ang = m.rotation * self.angular;
        let lin = m.rotation * self.linear + m.translation.vector.cross(&ang);
        Self {
            linear: lin,
            angular: ang,
        }
    }

    /// Inverse of [`Motion::transform`].
    #[must_use]
    pub fn transform_inv(&self, m: &Placement) -> Self {
        let rot_inv = m.rotation.inverse();
        let ang = rot_inv * self.angular;
        let lin = rot_inv * (self.linear - m.translation.vector.cross(&self.angular));
        Self {
            linear: lin,
            angular: ang,
        }
    }

    /// Spatial cross product of two motions: `self × other`.
    #[must_use]
    pub fn cross_motion(&self, other: &Motion) -> Motion {
        Motion {
            linear: self.angular.cross(&other.linear) + self.linear.cross(&other.angular),
            angular: self.angular.cross(&other.angular),
        }
    }

    /// Dual spatial cross product with a force: `self ×* f`.
    #[must_use]
    pub fn cross_force(&self, f: &Force) -> Force {
        Force {
            linear: self.angular.cross(&f.linear),
            angular: self.angular.cross(&f.angular) + self.linear.cross(&f.linear),
        }
    }

    /// Power pairing with a force.
    #[must_use]
    pub fn dot(&self, f: &Force) -> f64 {
        self.linear.dot(&f.linear) + self.angular.dot(&f.angular)
    }

    /// Classical velocity of the material point located at `p` (same frame).
    #[must_use]
    pub fn velocity_at(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.linear + self.angular.cross(p)
    }
}

impl std::ops::Add for Motion {
    type Output = Motion;
    fn add(self, rhs: Motion) -> Motion {
        Motion {
            linear: self.linear + rhs.linear,
            angular: self.angular + rhs.angular,
        }
    }
}

impl std::ops::Sub for Motion {
    type Output = Motion;
    fn sub(self, rhs: Motion) -> Motion {
        Motion {
            linear: self.linear - rhs.linear,
            angular: self.angular - rhs.angular,
        }
    }
}

impl std::ops::Mul<f64> for Motion {
    type Output = Motion;
    fn mul(self, rhs: f64) -> Motion {
        Motion {
            linear: self.linear * rhs,
            angular: self.angular * rhs,
        }
    }
}

impl Force {
    /// The zero force.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build from linear and angular parts.
    #[must_use]
    pub fn new(linear: Vector3<f64>, angular: Vector3<f64>) -> Self {
        Self { linear, angular }
    }

    /// Build from a 6-vector `[force, torque]`.
    #[must_use]
    pub fn from_vector(v: &Vector6<f64>) -> Self {
        Self {
            linear: Vector3::new(v[0], v[1], v[2]),
            angular: Vector3::new(v[3], v[4], v[5]),
        }
    }

    /// Pack into a 6-vector `[force, torque]`.
    #[must_use]
    pub fn to_vector(&self) -> Vector6<f64> {
        Vector6::new(
            self.linear.x,
            self.linear.y,
            self.linear.z,
            self.angular.x,
            self.angular.y,
            self.angular.z,
        )
    }

    /// Express this force in the frame `m` maps to.
    #[must_use]
    pub fn transform(&self, m: &Placement) -> Self {
        let lin = m.rotation * self.linear;
        let ang = m.rotation * self.angular + m.translation.vector.cross(&lin);
        Self {
            linear: lin,
            angular: ang,
        }
    }

    /// Inverse of [`Force::transform`].
    #[must_use]
    pub fn transform_inv(&self, m: &Placement) -> Self {
        let rot_inv = m.rotation.inverse();
        let lin = rot_inv * self.linear;
        let ang = rot_inv * (self.angular - m.translation.vector.cross(&self.linear));
        Self {
            linear: lin,
            angular: ang,
        }
    }

    /// Set both parts to zero in place.
    pub fn set_zero(&mut self) {
        self.linear.fill(0.0);
        self.angular.fill(0.0);
    }
}

impl std::ops::Add for Force {
    type Output = Force;
    fn add(self, rhs: Force) -> Force {
        Force {
            linear: self.linear + rhs.linear,
            angular: self.angular + rhs.angular,
        }
    }
}

impl std::ops::AddAssign for Force {
    fn add_assign(&mut self, rhs: Force) {
        self.linear += rhs.linear;
        self.angular += rhs.angular;
    }
}

impl std::ops::Sub for Force {
    type Output = Force;
    fn sub(self, rhs: Force) -> Force {
        Force {
            linear: self.linear - rhs.linear,
            angular: self.angular - rhs.angular,
        }
    }
}

impl std::ops::Mul<f64> for Force {
    type Output = Force;
    fn mul(self, rhs: f64) -> Force {
        Force {
            linear: self.linear * rhs,
            angular: self.angular * rhs,
        }
    }
}

impl std::ops::Neg for Force {
    type Output = Force;
    fn neg(self) -> Force {
        Force {
            linear: -self.linear,
            angular: -self.angular,
        }
    }
}

/// Spatial inertia of a rigid body: mass, center-of-mass lever and rotational
/// inertia about the center of mass, all in the expressing frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialInertia {
    /// Body mass.
    pub mass: f64,
    /// Center of mass relative to the frame origin.
    pub lever: Vector3<f64>,
    /// Rotational inertia about the center of mass.
    pub inertia: Matrix3<f64>,
}

impl SpatialInertia {
    /// Zero inertia.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            mass: 0.0,
            lever: Vector3::zeros(),
            inertia: Matrix3::zeros(),
        }
    }

    /// Build from mass, center of mass and rotational inertia about the COM.
    #[must_use]
    pub fn new(mass: f64, lever: Vector3<f64>, inertia: Matrix3<f64>) -> Self {
        Self {
            mass,
            lever,
            inertia,
        }
    }

    /// Inertia of a solid sphere centered at `lever`.
    #[must_use]
    pub fn sphere(mass: f64, radius: f64, lever: Vector3<f64>) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self::new(mass, lever, Matrix3::from_diagonal_element(i))
    }

    /// Inertia of a solid box centered at `lever` with full extents
    /// `(sx, sy, sz)`.
    #[must_use]
    pub fn cuboid(mass: f64, sx: f64, sy: f64, sz: f64, lever: Vector3<f64>) -> Self {
        let c = mass / 12.0;
        let diag = Vector3::new(
            c * (sy * sy + sz * sz),
            c * (sx * sx + sz * sz),
            c * (sx * sx + sy * sy),
        );
        Self::new(mass, lever, Matrix3::from_diagonal(&diag))
    }

    /// Point mass at `lever`.
    #[must_use]
    pub fn point_mass(mass: f64, lever: Vector3<f64>) -> Self {
        Self::new(mass, lever, Matrix3::zeros())
    }

    /// Express the inertia in the frame `m` maps to.
    #[must_use]
    pub fn transform(&self, m: &Placement) -> Self {
        let rot = m.rotation.to_rotation_matrix();
        let rot_m = rot.matrix();
        Self {
            mass: self.mass,
            lever: m.rotation * self.lever + m.translation.vector,
            inertia: rot_m * self.inertia * rot_m.transpose(),
        }
    }

    /// Momentum of the body moving with motion `v` (same frame, origin
    /// referenced).
    #[must_use]
    pub fn mul_motion(&self, v: &Motion) -> Force {
        // Velocity of the COM, then momentum about the frame origin.
        let vcom = v.linear + v.angular.cross(&self.lever);
        let lin = vcom * self.mass;
        let ang = self.inertia * v.angular + self.lever.cross(&lin);
        Force {
            linear: lin,
            angular: ang,
        }
    }
}

impl std::ops::Add for SpatialInertia {
    type Output = SpatialInertia;
    fn add(self, rhs: SpatialInertia) -> SpatialInertia {
        let mass = self.mass + rhs.mass;
        if mass <= 0.0 {
            return SpatialInertia::zero();
        }
        let lever = (self.lever * self.mass + rhs.lever * rhs.mass) / mass;
        // Parallel-axis both rotational inertias onto the combined COM.
        let shift = |i: &Matrix3<f64>, m: f64, d: Vector3<f64>| -> Matrix3<f64> {
            let d2 = d.dot(&d);
            i + m * (Matrix3::identity() * d2 - d * d.transpose())
        };
        let inertia = shift(&self.inertia, self.mass, self.lever - lever)
            + shift(&rhs.inertia, rhs.mass, rhs.lever - lever);
        SpatialInertia {
            mass,
            lever,
            inertia,
        }
    }
}

impl std::ops::AddAssign for SpatialInertia {
    fn add_assign(&mut self, rhs: SpatialInertia) {
        *self = *self + rhs;
    }
}

/// Skew-symmetric matrix of a 3-vector.
#[must_use]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Logarithm map of SO(3): rotation vector of a unit quaternion, with the
/// rotation angle returned alongside.
#[must_use]
pub fn log3(quat: &UnitQuaternion<f64>) -> (Vector3<f64>, f64) {
    match quat.axis_angle() {
        Some((axis, angle)) => (axis.into_inner() * angle, angle),
        None => (Vector3::zeros(), 0.0),
    }
}

/// Exponential map of SO(3).
#[must_use]
pub fn exp3(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega)
}

/// Jacobian of the SO(3) logarithm at the rotation of angle-axis
/// `omega = angle * axis`.
#[must_use]
pub fn jlog3(angle: f64, omega: &Vector3<f64>) -> Matrix3<f64> {
    if angle < 1e-8 {
        let w = skew(omega);
        return Matrix3::identity() + 0.5 * w + w * w / 12.0;
    }
    let w = skew(omega);
    let theta2 = angle * angle;
    // 1/θ² − (1 + cos θ) / (2 θ sin θ)
    let coeff = 1.0 / theta2 - (1.0 + angle.cos()) / (2.0 * angle * angle.sin());
    Matrix3::identity() + 0.5 * w + coeff * (w * w)
}

/// Jacobian of the SO(3) exponential at `omega`.
#[must_use]
pub fn jexp3(omega: &Vector3<f64>) -> Matrix3<f64> {
    let angle = omega.norm();
    let w = skew(omega);
    if angle < 1e-8 {
        return Matrix3::identity() - 0.5 * w + w * w / 6.0;
    }
    let theta2 = angle * angle;
    let a = (1.0 - angle.cos()) / theta2;
    let b = (angle - angle.sin()) / (theta2 * angle);
    Matrix3::identity() - a * w + b * (w * w)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Translation3;

    #[test]
    fn test_motion_transform_roundtrip() {
        let m = Placement::from_parts(
            Translation3::new(1.0, -2.0, 0.5),
            UnitQuaternion::from_euler_angles(0.3, -0.2, 0.7),
        );
        let v = Motion::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(-0.5, 0.2, 0.9));
        let back = v.transform(&m).transform_inv(&m);
        assert_relative_eq!(back.linear, v.linear, epsilon = 1e-12);
        assert_relative_eq!(back.angular, v.angular, epsilon = 1e-12);
    }

    #[test]
    fn test_force_transform_preserves_power() {
        // Power is frame invariant: f · v must match after transforming both.
        let m = Placement::from_parts(
            Translation3::new(0.4, 1.1, -0.7),
            UnitQuaternion::from_euler_angles(-0.1, 0.5, 0.2),
        );
        let v = Motion::new(Vector3::new(0.3, -1.0, 2.0), Vector3::new(1.0, 0.0, -0.4));
        let f = Force::new(Vector3::new(-2.0, 0.5, 1.0), Vector3::new(0.1, 0.7, -0.3));
        let p0 = v.dot(&f);
        let p1 = v.transform(&m).dot(&f.transform(&m));
        assert_relative_eq!(p0, p1, epsilon = 1e-12);
    }

    #[test]
    fn test_inertia_momentum_pure_translation() {
        let inertia = SpatialInertia::sphere(2.0, 0.1, Vector3::zeros());
        let v = Motion::new(Vector3::new(1.0, 0.0, 0.0), Vector3::zeros());
        let h = inertia.mul_motion(&v);
        assert_relative_eq!(h.linear, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(h.angular, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_inertia_sum_matches_composite_momentum() {
        let a = SpatialInertia::sphere(1.0, 0.2, Vector3::new(1.0, 0.0, 0.0));
        let b = SpatialInertia::sphere(3.0, 0.1, Vector3::new(-1.0, 0.5, 0.0));
        let v = Motion::new(Vector3::new(0.2, -0.1, 0.6), Vector3::new(0.3, 0.9, -0.2));
        let h_sum = a.mul_motion(&v) + b.mul_motion(&v);
        let h_comp = (a + b).mul_motion(&v);
        assert_relative_eq!(h_sum.linear, h_comp.linear, epsilon = 1e-10);
        assert_relative_eq!(h_sum.angular, h_comp.angular, epsilon = 1e-10);
    }

    #[test]
    fn test_log3_exp3_roundtrip() {
        let omega = Vector3::new(0.3, -0.7, 0.2);
        let (log, angle) = log3(&exp3(&omega));
        assert_relative_eq!(log, omega, epsilon = 1e-10);
        assert_relative_eq!(angle, omega.norm(), epsilon = 1e-10);
    }

    #[test]
    fn test_jlog3_jexp3_inverse() {
        // Jlog3 and Jexp3 evaluated at the same rotation are inverse maps.
        let omega = Vector3::new(0.4, 0.1, -0.6);
        let angle = omega.norm();
        let prod = jlog3(angle, &omega) * jexp3(&omega);
        assert_relative_eq!(prod, Matrix3::identity(), epsilon = 1e-8);
    }
}
