//! The seam between the partitioned solver and a reduced-coordinate articulation solver.
//!
//! Articulations share the solver's velocity space but are solved by impulse propagation
//! along their link trees instead of partition sweeps.
//! The partitioned solver talks to them only through [`ArticulationSolver`].

use super::{block::ConstraintBlock, residual::ErrorAccumulator};
use crate::math::{self as m, Mat3, Vec3, Velocity};

/// A link of an articulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkRef {
    pub articulation: u32,
    pub link: u32,
}

/// Where a link is and how its velocity responds to an impulse at its center of mass.
#[derive(Clone, Copy, Debug)]
pub struct LinkResponse {
    pub center_of_mass: Vec3,
    pub inv_mass: f64,
    pub inv_inertia: Mat3,
}

/// Parameters for the per-iteration propagation and internal solve.
pub struct InternalSolveParams<'a> {
    pub dt: f64,
    pub inv_dt: f64,
    pub bias_coefficient: f64,
    pub is_velocity_iteration: bool,
    pub do_friction: bool,
    pub residual_reporting: bool,
    /// Prepared constraints between links and static or kinematic bodies.
    pub static_blocks: &'a mut [ConstraintBlock],
    /// Prepared constraints between links of the same articulation.
    pub self_blocks: &'a mut [ConstraintBlock],
}

/// A solver for articulations that the partitioned solver drives every iteration.
///
/// Exactly one instance is shared by a pipeline.
/// Constraint lanes touching a link read [`link_velocity`][Self::link_velocity]
/// and hand their velocity change back through [`push_link_delta`][Self::push_link_delta];
/// the solver decides how deferred deltas are folded in.
pub trait ArticulationSolver: Send + Sync {
    fn num_articulations(&self) -> u32;

    fn link_velocity(&self, link: LinkRef) -> Velocity;

    fn link_response(&self, link: LinkRef) -> LinkResponse;

    /// Store a velocity change a constraint in `partition` made to a link.
    fn push_link_delta(&mut self, link: LinkRef, partition: u32, delta: Velocity);

    /// Fold deferred link deltas of the previous partitions into the link velocities.
    fn average_delta_v(&mut self, num_slabs: u32, partition: u32);

    /// Propagate the averaged impulses through the link trees and solve
    /// internal, static and self-collision constraints.
    fn propagate_rigid_body_impulses_and_solve_internal_constraints(
        &mut self,
        params: InternalSolveParams<'_>,
    );

    /// Publish link velocities for extended-body solvers to read.
    fn output_velocity(&mut self);

    /// Store the velocities at the end of the position iterations.
    fn save_velocities(&mut self);

    /// Internal residuals of each articulation since the last reset.
    fn errors(&self) -> Vec<ErrorAccumulator>;

    fn reset_errors(&mut self);
}

/// The articulation solver of a scene without articulations.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullArticulationSolver;

impl ArticulationSolver for NullArticulationSolver {
    fn num_articulations(&self) -> u32 {
        0
    }

    fn link_velocity(&self, _link: LinkRef) -> Velocity {
        Velocity::default()
    }

    fn link_response(&self, _link: LinkRef) -> LinkResponse {
        LinkResponse {
            center_of_mass: Vec3::zero(),
            inv_mass: 0.0,
            inv_inertia: m::zero_mat(),
        }
    }

    fn push_link_delta(&mut self, _link: LinkRef, _partition: u32, _delta: Velocity) {}

    fn average_delta_v(&mut self, _num_slabs: u32, _partition: u32) {}

    fn propagate_rigid_body_impulses_and_solve_internal_constraints(
        &mut self,
        _params: InternalSolveParams<'_>,
    ) {
    }

    fn output_velocity(&mut self) {}

    fn save_velocities(&mut self) {}

    fn errors(&self) -> Vec<ErrorAccumulator> {
        Vec::new()
    }

    fn reset_errors(&mut self) {}
}
