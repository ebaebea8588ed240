//! Pluggable solvers for bodies outside the rigid/articulation model
//! (particle systems, cloth, soft bodies).
//!
//! They run once per solver iteration, after the articulation pass,
//! and exchange momentum with rigid bodies through the shared velocity buffer.

use std::collections::BTreeMap;

use crate::math::{Pose, Vec3, Velocity};

/// Kinds of extended bodies, in the order they are solved each iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtendedBodyKind {
    ParticleSystem,
    Cloth,
    SoftBody,
}

/// Step data handed to [`ExtendedBodySolver::prepare_constraints`].
#[derive(Clone, Copy, Debug)]
pub struct ExtendedPrepareDesc<'a> {
    pub dt: f64,
    pub gravity: Vec3,
    pub bias_coefficient: f64,
    /// Poses of every solver body at the start of the step.
    pub body_poses: &'a [Pose],
    /// Inverse masses of every solver body, zero for static and kinematic ones.
    pub body_inv_masses: &'a [f64],
}

/// Per-iteration data handed to [`ExtendedBodySolver::solve`].
pub struct ExtendedSolveContext<'a> {
    /// Velocity of every solver body, after the partitioned solve of this iteration.
    /// Impulses on rigid bodies are applied by changing these.
    pub velocities: &'a mut [Velocity],
    /// Dynamic bodies of the island being solved.
    pub island_bodies: &'a [u32],
    pub dt: f64,
    pub iteration: u32,
    pub is_velocity_iteration: bool,
}

pub trait ExtendedBodySolver: Send {
    fn kind(&self) -> ExtendedBodyKind;

    /// Build this step's constraints against rigid bodies and articulations.
    fn prepare_constraints(
        &mut self,
        desc: &ExtendedPrepareDesc<'_>,
        inv_dt: f64,
        num_bodies: u32,
        num_articulations: u32,
    );

    fn solve(&mut self, ctx: &mut ExtendedSolveContext<'_>);

    /// Whether the solver takes part in velocity iterations.
    fn solves_velocity_iterations(&self) -> bool {
        true
    }

    /// Advance the solver's own particles or nodes after its solve.
    fn update_particles(&mut self, _dt: f64) {}

    /// Called after the last iteration of every island.
    fn finalize_velocities(&mut self, _dt: f64, _scale: f64, _is_tgs: bool) {}
}

/// Every extended-body solver attached to a pipeline, grouped by kind.
///
/// An empty registry is a valid configuration.
#[derive(Default)]
pub struct ExtendedSolverRegistry {
    solvers: BTreeMap<ExtendedBodyKind, Vec<Box<dyn ExtendedBodySolver>>>,
}

impl std::fmt::Debug for ExtendedSolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<_, _> = self.solvers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("ExtendedSolverRegistry")
            .field("solvers", &counts)
            .finish()
    }
}

impl ExtendedSolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, solver: Box<dyn ExtendedBodySolver>) {
        self.solvers.entry(solver.kind()).or_default().push(solver);
    }

    pub fn is_empty(&self) -> bool {
        self.solvers.values().all(|v| v.is_empty())
    }

    pub fn count(&self, kind: ExtendedBodyKind) -> usize {
        self.solvers.get(&kind).map(|v| v.len()).unwrap_or(0)
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ExtendedBodySolver>> {
        self.solvers.values_mut().flat_map(|v| v.iter_mut())
    }

    pub fn prepare_all(
        &mut self,
        desc: &ExtendedPrepareDesc<'_>,
        inv_dt: f64,
        num_bodies: u32,
        num_articulations: u32,
    ) {
        for solver in self.iter_mut() {
            solver.prepare_constraints(desc, inv_dt, num_bodies, num_articulations);
        }
    }

    /// Solve every registered solver in kind order, then let them advance their particles.
    pub fn solve_all(&mut self, ctx: &mut ExtendedSolveContext<'_>) {
        let is_velocity_iteration = ctx.is_velocity_iteration;
        let dt = ctx.dt;
        for solver in self.iter_mut() {
            if is_velocity_iteration && !solver.solves_velocity_iterations() {
                continue;
            }
            solver.solve(ctx);
        }
        for solver in self.iter_mut() {
            solver.update_particles(dt);
        }
    }

    /// Let soft bodies and cloth settle their velocities after the last iteration.
    pub fn finalize_all(&mut self, dt: f64) {
        for (kind, solvers) in self.solvers.iter_mut() {
            if *kind == ExtendedBodyKind::ParticleSystem {
                continue;
            }
            for solver in solvers {
                solver.finalize_velocities(dt, 1.0, false);
            }
        }
    }
}
