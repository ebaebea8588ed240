//! Types, aliases and helper operations for doing math with `ultraviolet`.
pub use ultraviolet as uv;

/// A Pose has a rotation and a translation, no scaling.
pub type Pose = uv::DIsometry3;
pub type Vec3 = uv::DVec3;
pub type Rotor3 = uv::DRotor3;
pub type Bivec3 = uv::DBivec3;
pub type Mat3 = uv::DMat3;

/// A matrix with the given values on the diagonal and zeroes elsewhere.
#[inline]
pub fn diagonal(d: Vec3) -> Mat3 {
    Mat3::new(
        Vec3::new(d.x, 0.0, 0.0),
        Vec3::new(0.0, d.y, 0.0),
        Vec3::new(0.0, 0.0, d.z),
    )
}

/// The all-zero matrix, used as the inverse inertia of immovable bodies.
#[inline]
pub fn zero_mat() -> Mat3 {
    diagonal(Vec3::zero())
}

/// Inverse of `m`, or the zero matrix if `m` is singular.
#[inline]
pub fn inverse_or_zero(m: Mat3) -> Mat3 {
    if m.determinant().abs() > f64::EPSILON {
        m.inversed()
    } else {
        zero_mat()
    }
}

/// Velocity of a body.
///
// Equivalent to a 6-vector but with names for the translational and rotational part.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct Velocity {
    /// Linear velocity in metres per second.
    pub linear: Vec3,
    /// Angular velocity in radians per second, as a world-space axis scaled by the rate.
    pub angular: Vec3,
}

impl Default for Velocity {
    fn default() -> Self {
        Velocity {
            linear: Vec3::zero(),
            angular: Vec3::zero(),
        }
    }
}

impl Velocity {
    pub fn new(linear: Vec3, angular: Vec3) -> Self {
        Self { linear, angular }
    }

    /// Get the linear velocity of a point offset from the center of mass.
    pub fn point_velocity(&self, offset: Vec3) -> Vec3 {
        self.linear + self.angular.cross(offset)
    }

    /// Move a pose along this velocity for `dt` seconds.
    pub fn apply_to_pose(&self, dt: f64, mut pose: Pose) -> Pose {
        pose.translation += self.linear * dt;
        let ang_mag = self.angular.mag();
        if ang_mag > f64::EPSILON {
            let axis = self.angular / ang_mag;
            let delta = Rotor3::from_angle_plane(ang_mag * dt, Bivec3::from_normalized_axis(axis));
            pose.rotation = (delta * pose.rotation).normalized();
        }
        pose
    }

    /// Squared magnitude of the whole 6-vector.
    pub fn mag_sq(&self) -> f64 {
        self.linear.mag_sq() + self.angular.mag_sq()
    }
}

impl std::ops::Add for Velocity {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            linear: self.linear + other.linear,
            angular: self.angular + other.angular,
        }
    }
}
impl std::ops::AddAssign for Velocity {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}
impl std::ops::Sub for Velocity {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self {
            linear: self.linear - other.linear,
            angular: self.angular - other.angular,
        }
    }
}
impl std::ops::Mul<f64> for Velocity {
    type Output = Velocity;

    fn mul(self, rhs: f64) -> Self::Output {
        Velocity {
            linear: self.linear * rhs,
            angular: self.angular * rhs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn point_velocity_includes_rotation() {
        let vel = Velocity::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 2.0));
        let pv = vel.point_velocity(Vec3::new(1.0, 0.0, 0.0));
        assert_abs_diff_eq!(pv.x, 1.0);
        assert_abs_diff_eq!(pv.y, 2.0);
        assert_abs_diff_eq!(pv.z, 0.0);
    }

    #[test]
    fn apply_to_pose_translates() {
        let vel = Velocity::new(Vec3::new(0.0, -2.0, 0.5), Vec3::zero());
        let pose = vel.apply_to_pose(0.5, Pose::identity());
        assert_abs_diff_eq!(pose.translation.y, -1.0);
        assert_abs_diff_eq!(pose.translation.z, 0.25);
    }

    #[test]
    fn apply_to_pose_keeps_rotation_normalized() {
        let vel = Velocity::new(Vec3::zero(), Vec3::new(0.3, 1.0, -0.2));
        let mut pose = Pose::identity();
        for _ in 0..100 {
            pose = vel.apply_to_pose(1.0 / 60.0, pose);
        }
        let r = pose.rotation;
        let norm_sq = r.s * r.s + r.bv.xy * r.bv.xy + r.bv.xz * r.bv.xz + r.bv.yz * r.bv.yz;
        assert_abs_diff_eq!(norm_sq, 1.0, epsilon = 1e-9);
    }
}
