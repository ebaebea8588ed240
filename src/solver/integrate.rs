//! Body state carried across steps and the kernels that advance it.

use itertools::izip;

use super::{BodyKind, SolverBodyDesc};
use crate::{
    device::{map_each_mut, map_range},
    math::{self as m, Pose, Vec3, Velocity},
};

/// Per-body results that live from one step to the next.
///
/// Written by the static/kinematic init, the solver's write-backs and integration,
/// read by the download.
#[derive(Clone, Debug, Default)]
pub struct BodyState {
    pub poses: Vec<Pose>,
    /// Velocity reported to the host after the velocity iterations.
    pub velocities: Vec<Velocity>,
    /// Velocity at the end of the position iterations, used to move the poses.
    pub motion_velocities: Vec<Velocity>,
}

impl BodyState {
    /// Match the body count of a new step. Existing entries are kept.
    pub fn resize(&mut self, num_bodies: usize) {
        self.poses.resize(num_bodies, Pose::identity());
        self.velocities.resize(num_bodies, Velocity::default());
        self.motion_velocities.resize(num_bodies, Velocity::default());
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }
}

/// Apply gravity to the starting velocity of dynamic bodies.
pub fn pre_integrate(
    bodies: &[SolverBodyDesc],
    velocities: &mut [Velocity],
    gravity: Vec3,
    dt: f64,
) {
    let _span = crate::tracy_span!("pre-integrate", "pre_integrate");
    map_each_mut(velocities, |idx, vel| {
        let body = &bodies[idx];
        *vel = body.velocity;
        if body.kind == BodyKind::Dynamic && !body.disable_gravity {
            vel.linear += gravity * dt;
        }
    });
}

/// Record the poses and velocities of the static and kinematic bodies,
/// which the solver never touches.
pub fn init_static_kinematic(
    bodies: &[SolverBodyDesc],
    num_static_kinematic: u32,
    state: &mut BodyState,
) {
    let count = num_static_kinematic as usize;
    for (idx, body) in bodies[..count].iter().enumerate() {
        state.poses[idx] = body.pose;
        state.velocities[idx] = body.velocity;
        state.motion_velocities[idx] = body.velocity;
    }
}

/// Kinetic energy of a body divided by its mass.
pub fn mass_normalized_energy(body: &SolverBodyDesc, vel: Velocity) -> f64 {
    let inertia = m::inverse_or_zero(body.inv_inertia);
    0.5 * (vel.linear.mag_sq() + vel.angular.dot(inertia * vel.angular) * body.inv_mass)
}

/// Settings for damping slow bodies that are in contact.
#[derive(Clone, Copy, Debug)]
pub struct Stabilization {
    pub threshold: f64,
    pub damping: f64,
}

/// Move every dynamic body with its motion velocity.
///
/// With stabilization, bodies that were touched by a constraint and whose
/// mass-normalized kinetic energy is below the threshold are damped first.
pub fn integrate(
    bodies: &[SolverBodyDesc],
    num_static_kinematic: u32,
    had_interactions: &[bool],
    dt: f64,
    stabilization: Option<Stabilization>,
    state: &mut BodyState,
) {
    let _span = crate::tracy_span!("integrate", "integrate");
    let start = num_static_kinematic as usize;
    let BodyState {
        poses,
        velocities,
        motion_velocities,
    } = state;

    let moved: Vec<(Pose, Velocity, Velocity)> = {
        let motion = &motion_velocities[start..];
        let vels = &velocities[start..];
        map_range(bodies.len() - start, |i| {
            let idx = start + i;
            let mut motion_vel = motion[i];
            let mut vel = vels[i];
            if let Some(stab) = stabilization {
                if had_interactions[idx]
                    && mass_normalized_energy(&bodies[idx], vel) < stab.threshold
                {
                    motion_vel = motion_vel * stab.damping;
                    vel = vel * stab.damping;
                }
            }
            (motion_vel.apply_to_pose(dt, bodies[idx].pose), motion_vel, vel)
        })
    };
    for (pose, motion_vel, vel, (new_pose, new_motion_vel, new_vel)) in izip!(
        &mut poses[start..],
        &mut motion_velocities[start..],
        &mut velocities[start..],
        moved
    ) {
        *pose = new_pose;
        *motion_vel = new_motion_vel;
        *vel = new_vel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::test_scenes;
    use approx::assert_abs_diff_eq;

    #[test]
    fn gravity_only_for_dynamic_bodies() {
        let mut input = test_scenes::resting_box_input(Vec3::new(0.0, -10.0, 0.0));
        let mut velocities = vec![Velocity::default(); 2];
        pre_integrate(&input.bodies, &mut velocities, input.gravity, 0.1);
        assert_eq!(velocities[0], Velocity::default());
        assert_abs_diff_eq!(velocities[1].linear.y, -1.0);

        input.bodies[1].disable_gravity = true;
        pre_integrate(&input.bodies, &mut velocities, input.gravity, 0.1);
        assert_eq!(velocities[1], Velocity::default());
    }

    #[test]
    fn integrate_moves_with_motion_velocity() {
        let input = test_scenes::resting_box_input(Vec3::zero());
        let mut state = BodyState::default();
        state.resize(2);
        init_static_kinematic(&input.bodies, 1, &mut state);
        state.motion_velocities[1] = Velocity::new(Vec3::new(1.0, 0.0, 0.0), Vec3::zero());
        state.velocities[1] = Velocity::new(Vec3::new(3.0, 0.0, 0.0), Vec3::zero());

        integrate(&input.bodies, 1, &[false, true], 0.5, None, &mut state);
        assert_abs_diff_eq!(state.poses[1].translation.x, 0.5);
        assert_abs_diff_eq!(state.poses[1].translation.y, 0.5);
        assert_abs_diff_eq!(state.velocities[1].linear.x, 3.0);
        assert_abs_diff_eq!(state.poses[0].translation.y, 0.0);
    }

    #[test]
    fn stabilization_damps_slow_touching_bodies() {
        let input = test_scenes::resting_box_input(Vec3::zero());
        let stab = Some(Stabilization {
            threshold: 1e-2,
            damping: 0.5,
        });
        let slow = Velocity::new(Vec3::new(0.05, 0.0, 0.0), Vec3::zero());

        let mut state = BodyState::default();
        state.resize(2);
        state.velocities[1] = slow;
        state.motion_velocities[1] = slow;
        integrate(&input.bodies, 1, &[false, true], 1.0, stab, &mut state);
        assert_abs_diff_eq!(state.velocities[1].linear.x, 0.025);
        assert_abs_diff_eq!(state.poses[1].translation.x, 0.025);

        // a body nothing touched keeps its velocity
        state.velocities[1] = slow;
        state.motion_velocities[1] = slow;
        integrate(&input.bodies, 1, &[false, false], 1.0, stab, &mut state);
        assert_abs_diff_eq!(state.velocities[1].linear.x, 0.05);
    }

    #[test]
    fn energy_weights_spin_by_inertia() {
        let input = test_scenes::resting_box_input(Vec3::zero());
        let body = &input.bodies[1];
        // mass 1, inertia 1/6 about every axis
        let moving = Velocity::new(Vec3::new(0.3, 0.0, 0.0), Vec3::zero());
        assert_abs_diff_eq!(mass_normalized_energy(body, moving), 0.045, epsilon = 1e-12);
        let spinning = Velocity::new(Vec3::zero(), Vec3::new(0.0, 0.0, 0.5));
        assert_abs_diff_eq!(
            mass_normalized_energy(body, spinning),
            0.25 / 12.0,
            epsilon = 1e-12
        );
        // immovable bodies have no rotational energy
        assert_eq!(mass_normalized_energy(&input.bodies[0], spinning), 0.0);

        // both are above 0.05 as squared speeds but below it as energies
        let stab = Some(Stabilization {
            threshold: 0.05,
            damping: 0.5,
        });
        for vel in [moving, spinning] {
            let mut state = BodyState::default();
            state.resize(2);
            state.velocities[1] = vel;
            state.motion_velocities[1] = vel;
            integrate(&input.bodies, 1, &[false, true], 0.1, stab, &mut state);
            assert_abs_diff_eq!(state.velocities[1].linear.x, vel.linear.x * 0.5);
            assert_abs_diff_eq!(state.velocities[1].angular.z, vel.angular.z * 0.5);
        }
    }
}
