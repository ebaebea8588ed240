//! Host-side description of one solver step and the solver stages that consume it.
//!
//! The scene layer builds a [`StepInput`] every step:
//! bodies sorted so that static and kinematic ones come first,
//! contact and joint descriptors, and islands already split into partitions
//! of warp-sized [`ConstraintBatch`]es.

pub mod articulation;
pub mod block;
pub mod extended;
pub mod integrate;
pub mod partitioned;
pub mod prepare;
pub mod residual;
pub mod slab;
pub mod threshold;

use std::collections::HashSet;

use crate::{
    device::WARP_SIZE,
    math::{self as m, Mat3, Pose, Vec3, Velocity},
    PipelineError, StepFlags,
};
use articulation::LinkRef;

/// How a body responds to the solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum BodyKind {
    /// Never moves.
    Static,
    /// Moves with a prescribed velocity, unaffected by constraints.
    Kinematic,
    /// Moved by gravity and constraints.
    Dynamic,
}

/// Per-body input to the solver.
#[derive(Clone, Copy, Debug)]
pub struct SolverBodyDesc {
    pub kind: BodyKind,
    pub pose: Pose,
    pub velocity: Velocity,
    pub inv_mass: f64,
    /// World-space inverse inertia tensor.
    pub inv_inertia: Mat3,
    pub disable_gravity: bool,
}

impl SolverBodyDesc {
    /// A static body at the given pose.
    pub fn fixed(pose: Pose) -> Self {
        Self {
            kind: BodyKind::Static,
            pose,
            velocity: Velocity::default(),
            inv_mass: 0.0,
            inv_inertia: m::zero_mat(),
            disable_gravity: true,
        }
    }

    /// A kinematic body moving with `velocity`.
    pub fn kinematic(pose: Pose, velocity: Velocity) -> Self {
        Self {
            kind: BodyKind::Kinematic,
            velocity,
            ..Self::fixed(pose)
        }
    }

    /// A dynamic body with the given mass and principal moments of inertia.
    ///
    /// The inertia is taken to be aligned with the world axes.
    pub fn dynamic(pose: Pose, mass: f64, inertia: Vec3) -> Self {
        let inv = |x: f64| if x > 0.0 { 1.0 / x } else { 0.0 };
        Self {
            kind: BodyKind::Dynamic,
            pose,
            velocity: Velocity::default(),
            inv_mass: inv(mass),
            inv_inertia: m::diagonal(Vec3::new(inv(inertia.x), inv(inertia.y), inv(inertia.z))),
            disable_gravity: false,
        }
    }

    pub fn with_velocity(mut self, velocity: Velocity) -> Self {
        self.velocity = velocity;
        self
    }
}

/// One end of a constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConstraintBody {
    /// A solver body by index.
    Rigid(u32),
    /// A link of an articulation.
    Link(LinkRef),
}

impl ConstraintBody {
    pub fn rigid_index(&self) -> Option<u32> {
        match self {
            ConstraintBody::Rigid(idx) => Some(*idx),
            ConstraintBody::Link(_) => None,
        }
    }
}

/// A point of contact between two bodies.
#[derive(Clone, Copy, Debug)]
pub struct ContactPoint {
    /// World-space position.
    pub point: Vec3,
    /// Negative when the bodies overlap.
    pub separation: f64,
}

/// All the contact points between one pair of shapes.
#[derive(Clone, Debug)]
pub struct ContactDesc {
    pub bodies: [ConstraintBody; 2],
    /// Unit normal pointing from the second body towards the first.
    pub normal: Vec3,
    pub points: Vec<ContactPoint>,
    pub friction: f64,
    pub restitution: f64,
    /// Identifies the contact manager (the shape pair) across steps.
    pub manager: u32,
    /// Report when the total normal force between the bodies crosses this.
    pub force_threshold: Option<f64>,
}

/// One scalar row of a joint.
///
/// The relative velocity along the row is
/// `linear·(v0 - v1) + angular0·w0 - angular1·w1`.
#[derive(Clone, Copy, Debug)]
pub struct JointRow {
    pub linear: Vec3,
    pub angular0: Vec3,
    pub angular1: Vec3,
    pub geometric_error: f64,
    pub velocity_target: f64,
    pub min_impulse: f64,
    pub max_impulse: f64,
}

impl JointRow {
    /// An equality row along a linear axis.
    pub fn linear(axis: Vec3, r0: Vec3, r1: Vec3, geometric_error: f64) -> Self {
        Self {
            linear: axis,
            angular0: r0.cross(axis),
            angular1: r1.cross(axis),
            geometric_error,
            velocity_target: 0.0,
            min_impulse: f64::MIN,
            max_impulse: f64::MAX,
        }
    }
}

/// A joint made of up to [`MAX_JOINT_ROWS`] rows.
#[derive(Clone, Debug)]
pub struct JointDesc {
    pub bodies: [ConstraintBody; 2],
    pub rows: Vec<JointRow>,
    /// The joint breaks when the linear force exceeds this.
    pub break_force: f64,
    /// The joint breaks when the torque exceeds this.
    pub break_torque: f64,
}

pub const MAX_JOINT_ROWS: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Contact,
    Joint,
}

/// Up to [`WARP_SIZE`] constraints of one kind that share no dynamic body.
#[derive(Clone, Debug)]
pub struct ConstraintBatch {
    pub kind: BatchKind,
    /// Indices into [`StepInput::contacts`] or [`StepInput::joints`].
    pub constraints: Vec<u32>,
}

impl ConstraintBatch {
    pub fn contacts(constraints: Vec<u32>) -> Self {
        Self {
            kind: BatchKind::Contact,
            constraints,
        }
    }

    pub fn joints(constraints: Vec<u32>) -> Self {
        Self {
            kind: BatchKind::Joint,
            constraints,
        }
    }
}

/// Constraints of an island that touch no dynamic body more than once.
#[derive(Clone, Debug, Default)]
pub struct PartitionDesc {
    /// Batches between dynamic rigid bodies.
    pub rigid_batches: Vec<ConstraintBatch>,
    /// Batches with at least one articulation link.
    pub articulation_batches: Vec<ConstraintBatch>,
}

/// A group of bodies and constraints that can be solved without looking at anything else.
#[derive(Clone, Debug, Default)]
pub struct IslandDesc {
    /// Dynamic solver bodies in this island.
    pub bodies: Vec<u32>,
    pub partitions: Vec<PartitionDesc>,
    /// Contacts between a dynamic body and a static or kinematic one.
    pub static_contacts: Vec<u32>,
    /// Joints between a dynamic body and a static or kinematic one.
    pub static_joints: Vec<u32>,
    /// Contacts between an articulation link and a static or kinematic body.
    pub articulation_static_contacts: Vec<u32>,
    pub articulation_static_joints: Vec<u32>,
    /// Contacts between links of the same articulation.
    pub articulation_self_contacts: Vec<u32>,
    pub articulation_self_joints: Vec<u32>,
    pub position_iterations: u32,
    pub velocity_iterations: u32,
}

impl IslandDesc {
    pub fn has_articulation_constraints(&self) -> bool {
        self.partitions
            .iter()
            .any(|p| !p.articulation_batches.is_empty())
            || !self.articulation_static_contacts.is_empty()
            || !self.articulation_static_joints.is_empty()
            || !self.articulation_self_contacts.is_empty()
            || !self.articulation_self_joints.is_empty()
    }
}

/// Everything the solver needs for one step.
#[derive(Clone, Debug)]
pub struct StepInput {
    pub dt: f64,
    pub gravity: Vec3,
    pub flags: StepFlags,
    /// Static and kinematic bodies first, then dynamic ones.
    pub bodies: Vec<SolverBodyDesc>,
    /// Number of static and kinematic bodies at the start of `bodies`.
    pub num_static_kinematic: u32,
    pub contacts: Vec<ContactDesc>,
    pub joints: Vec<JointDesc>,
    pub islands: Vec<IslandDesc>,
    /// Contact managers destroyed since the last step.
    pub destroyed_managers: Vec<u32>,
}

impl StepInput {
    pub fn is_static(&self, body: u32) -> bool {
        body < self.num_static_kinematic
    }

    /// Check the structural assumptions the device kernels rely on:
    /// body ordering, index ranges and batch widths.
    ///
    /// Constraint values themselves are not checked.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidInput(msg));

        if self.dt.is_nan() || self.dt <= 0.0 {
            return invalid(format!("time step must be positive, got {}", self.dt));
        }
        let num_bodies = self.bodies.len() as u32;
        if self.num_static_kinematic > num_bodies {
            return invalid("more static bodies than bodies".to_string());
        }
        for (idx, body) in self.bodies.iter().enumerate() {
            let should_be_static = (idx as u32) < self.num_static_kinematic;
            if should_be_static != (body.kind != BodyKind::Dynamic) {
                return invalid(format!("body {} is out of static/dynamic order", idx));
            }
        }

        let check_body = |body: &ConstraintBody| match body {
            ConstraintBody::Rigid(idx) => *idx < num_bodies,
            ConstraintBody::Link(_) => true,
        };
        for (idx, contact) in self.contacts.iter().enumerate() {
            if !contact.bodies.iter().all(check_body) {
                return invalid(format!("contact {} references a missing body", idx));
            }
        }
        for (idx, joint) in self.joints.iter().enumerate() {
            if !joint.bodies.iter().all(check_body) {
                return invalid(format!("joint {} references a missing body", idx));
            }
            if joint.rows.len() > MAX_JOINT_ROWS {
                return invalid(format!("joint {} has too many rows", idx));
            }
        }

        let num_contacts = self.contacts.len() as u32;
        let num_joints = self.joints.len() as u32;
        let check_batch = |batch: &ConstraintBatch| {
            let limit = match batch.kind {
                BatchKind::Contact => num_contacts,
                BatchKind::Joint => num_joints,
            };
            !batch.constraints.is_empty()
                && batch.constraints.len() <= WARP_SIZE
                && batch.constraints.iter().all(|c| *c < limit)
        };
        for (island_idx, island) in self.islands.iter().enumerate() {
            let batches = island
                .partitions
                .iter()
                .flat_map(|p| p.rigid_batches.iter().chain(&p.articulation_batches));
            for batch in batches {
                if !check_batch(batch) {
                    return invalid(format!("island {} has a malformed batch", island_idx));
                }
            }
            let contact_lists = [
                &island.static_contacts,
                &island.articulation_static_contacts,
                &island.articulation_self_contacts,
            ];
            let joint_lists = [
                &island.static_joints,
                &island.articulation_static_joints,
                &island.articulation_self_joints,
            ];
            if contact_lists.iter().any(|l| l.iter().any(|c| *c >= num_contacts))
                || joint_lists.iter().any(|l| l.iter().any(|j| *j >= num_joints))
            {
                return invalid(format!("island {} references a missing constraint", island_idx));
            }
            if island.bodies.iter().any(|b| *b >= num_bodies) {
                return invalid(format!("island {} references a missing body", island_idx));
            }
        }
        Ok(())
    }

    /// Bodies referenced by a constraint that are moved by the solver.
    fn dynamic_bodies_of(&self, kind: BatchKind, constraint: u32) -> Vec<ConstraintBody> {
        let bodies = match kind {
            BatchKind::Contact => self.contacts[constraint as usize].bodies,
            BatchKind::Joint => self.joints[constraint as usize].bodies,
        };
        bodies
            .iter()
            .filter(|b| match b {
                ConstraintBody::Rigid(idx) => !self.is_static(*idx),
                ConstraintBody::Link(_) => true,
            })
            .copied()
            .collect()
    }

    /// Find the first partition where two constraints share a dynamic body or link.
    ///
    /// Returns `(island, partition)`, or `None` if every partition is conflict-free.
    pub fn find_partition_conflict(&self) -> Option<(usize, usize)> {
        for (island_idx, island) in self.islands.iter().enumerate() {
            for (part_idx, partition) in island.partitions.iter().enumerate() {
                let mut seen: HashSet<ConstraintBody> = HashSet::new();
                let batches = partition
                    .rigid_batches
                    .iter()
                    .chain(&partition.articulation_batches);
                for batch in batches {
                    for &c in &batch.constraints {
                        for body in self.dynamic_bodies_of(batch.kind, c) {
                            if !seen.insert(body) {
                                return Some((island_idx, part_idx));
                            }
                        }
                    }
                }
            }
        }
        None
    }
}
