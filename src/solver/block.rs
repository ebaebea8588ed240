//! Prepared constraint layouts consumed by the solve kernels.
//!
//! A [`ConstraintBlock`] is one batch after preparation:
//! a header plus one lane per constraint, each lane holding its prepared rows.
//! Rows store everything that stays constant during the solve
//! (lever arms, angular response, effective mass, targets),
//! so solving a row is a handful of dot products.

use super::{residual::ErrorAccumulator, BatchKind, ConstraintBody};
use crate::math::{Vec3, Velocity};

//
// Contacts
//

/// Non-penetration row of one contact point.
#[derive(Clone, Copy, Debug)]
pub struct ContactRow {
    pub ra_x_n: Vec3,
    pub rb_x_n: Vec3,
    /// Angular velocity change of each body per unit impulse.
    pub ang_delta_a: Vec3,
    pub ang_delta_b: Vec3,
    pub eff_mass: f64,
    /// Minimum normal velocity the row enforces.
    /// Starts out with the positional bias and is replaced by `target_unbiased` on conclude.
    pub target: f64,
    pub target_unbiased: f64,
    /// Accumulated normal impulse, never negative.
    pub applied: f64,
}

/// Friction row along one tangent direction of a contact patch.
#[derive(Clone, Copy, Debug)]
pub struct FrictionRow {
    pub tangent: Vec3,
    pub ra_x_t: Vec3,
    pub rb_x_t: Vec3,
    pub ang_delta_a: Vec3,
    pub ang_delta_b: Vec3,
    pub eff_mass: f64,
    pub applied: f64,
}

/// A contact manager's points, prepared for solving.
#[derive(Clone, Debug)]
pub struct PreparedContact {
    pub bodies: [ConstraintBody; 2],
    pub inv_mass: [f64; 2],
    pub normal: Vec3,
    pub rows: Vec<ContactRow>,
    /// Either empty or one row per tangent direction.
    pub friction: Vec<FrictionRow>,
    pub friction_coef: f64,
    /// Index of the contact descriptor this came from.
    pub contact: u32,
    /// Where this contact's per-point forces go in the contact force buffer.
    pub force_offset: u32,
}

impl PreparedContact {
    pub fn solve(
        &mut self,
        vels: &mut [Velocity; 2],
        do_friction: bool,
        residual: &mut ErrorAccumulator,
    ) {
        let [va, vb] = vels;
        let normal = self.normal;
        let [im_a, im_b] = self.inv_mass;

        let mut total_normal = 0.0;
        for row in &mut self.rows {
            let vn = normal.dot(va.linear - vb.linear) + row.ra_x_n.dot(va.angular)
                - row.rb_x_n.dot(vb.angular);
            let delta = (row.target - vn) * row.eff_mass;
            let new_applied = (row.applied + delta).max(0.0);
            let delta = new_applied - row.applied;
            row.applied = new_applied;

            va.linear += normal * (delta * im_a);
            va.angular += row.ang_delta_a * delta;
            vb.linear -= normal * (delta * im_b);
            vb.angular -= row.ang_delta_b * delta;

            residual.accumulate(delta);
            total_normal += new_applied;
        }

        if !do_friction {
            return;
        }
        let limit = self.friction_coef * total_normal;
        for row in &mut self.friction {
            let vt = row.tangent.dot(va.linear - vb.linear) + row.ra_x_t.dot(va.angular)
                - row.rb_x_t.dot(vb.angular);
            let delta = -vt * row.eff_mass;
            let new_applied = (row.applied + delta).max(-limit).min(limit);
            let delta = new_applied - row.applied;
            row.applied = new_applied;

            va.linear += row.tangent * (delta * im_a);
            va.angular += row.ang_delta_a * delta;
            vb.linear -= row.tangent * (delta * im_b);
            vb.angular -= row.ang_delta_b * delta;

            residual.accumulate(delta);
        }
    }

    pub fn conclude(&mut self) {
        for row in &mut self.rows {
            row.target = row.target_unbiased;
        }
    }

    pub fn total_normal_impulse(&self) -> f64 {
        self.rows.iter().map(|r| r.applied).sum()
    }
}

//
// Joints
//

/// One prepared scalar joint row.
#[derive(Clone, Copy, Debug)]
pub struct PreparedJointRow {
    pub linear: Vec3,
    pub angular0: Vec3,
    pub angular1: Vec3,
    pub ang_delta0: Vec3,
    pub ang_delta1: Vec3,
    pub eff_mass: f64,
    pub target: f64,
    pub target_unbiased: f64,
    pub min_impulse: f64,
    pub max_impulse: f64,
    pub applied: f64,
}

/// A joint's rows, prepared for solving.
#[derive(Clone, Debug)]
pub struct PreparedJoint {
    pub bodies: [ConstraintBody; 2],
    pub inv_mass: [f64; 2],
    pub rows: Vec<PreparedJointRow>,
    /// Index of the joint descriptor this came from, also its write-back slot.
    pub joint: u32,
    pub break_force: f64,
    pub break_torque: f64,
}

impl PreparedJoint {
    pub fn solve(&mut self, vels: &mut [Velocity; 2], residual: &mut ErrorAccumulator) {
        let [v0, v1] = vels;
        let [im0, im1] = self.inv_mass;
        for row in &mut self.rows {
            let v = row.linear.dot(v0.linear - v1.linear) + row.angular0.dot(v0.angular)
                - row.angular1.dot(v1.angular);
            let delta = (row.target - v) * row.eff_mass;
            let new_applied = (row.applied + delta)
                .max(row.min_impulse)
                .min(row.max_impulse);
            let delta = new_applied - row.applied;
            row.applied = new_applied;

            v0.linear += row.linear * (delta * im0);
            v0.angular += row.ang_delta0 * delta;
            v1.linear -= row.linear * (delta * im1);
            v1.angular -= row.ang_delta1 * delta;

            residual.accumulate(delta);
        }
    }

    pub fn conclude(&mut self) {
        for row in &mut self.rows {
            row.target = row.target_unbiased;
        }
    }

    /// Total linear and angular impulse the joint applied to its first body.
    pub fn applied_impulse(&self) -> (Vec3, Vec3) {
        self.rows.iter().fold(
            (Vec3::zero(), Vec3::zero()),
            |(lin, ang), row| (lin + row.linear * row.applied, ang + row.angular0 * row.applied),
        )
    }
}

//
// Blocks
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub kind: BatchKind,
    /// Partition index within the island, or 0 for blocks outside of partitions.
    pub partition: u32,
    pub num_lanes: u32,
}

#[derive(Clone, Debug)]
pub enum Lanes {
    Contacts(Vec<PreparedContact>),
    Joints(Vec<PreparedJoint>),
}

/// A prepared batch.
#[derive(Clone, Debug)]
pub struct ConstraintBlock {
    pub header: BlockHeader,
    pub lanes: Lanes,
}

impl ConstraintBlock {
    pub fn contacts(partition: u32, lanes: Vec<PreparedContact>) -> Self {
        Self {
            header: BlockHeader {
                kind: BatchKind::Contact,
                partition,
                num_lanes: lanes.len() as u32,
            },
            lanes: Lanes::Contacts(lanes),
        }
    }

    pub fn joints(partition: u32, lanes: Vec<PreparedJoint>) -> Self {
        Self {
            header: BlockHeader {
                kind: BatchKind::Joint,
                partition,
                num_lanes: lanes.len() as u32,
            },
            lanes: Lanes::Joints(lanes),
        }
    }

    /// Both bodies of every lane.
    pub fn lane_bodies(&self) -> Vec<[ConstraintBody; 2]> {
        match &self.lanes {
            Lanes::Contacts(lanes) => lanes.iter().map(|l| l.bodies).collect(),
            Lanes::Joints(lanes) => lanes.iter().map(|l| l.bodies).collect(),
        }
    }

    /// Solve every lane with velocities fetched and stored through `fetch` and `store`.
    ///
    /// Lanes of one block never share a body, so every lane sees the velocities
    /// as they were before the block.
    pub fn solve(
        &mut self,
        do_friction: bool,
        residual: &mut ErrorAccumulator,
        fetch: impl Fn(ConstraintBody) -> Velocity,
        mut store: impl FnMut(ConstraintBody, Velocity, Velocity),
    ) {
        match &mut self.lanes {
            Lanes::Contacts(lanes) => {
                for lane in lanes {
                    let before = [fetch(lane.bodies[0]), fetch(lane.bodies[1])];
                    let mut vels = before;
                    lane.solve(&mut vels, do_friction, residual);
                    store(lane.bodies[0], before[0], vels[0]);
                    store(lane.bodies[1], before[1], vels[1]);
                }
            }
            Lanes::Joints(lanes) => {
                for lane in lanes {
                    let before = [fetch(lane.bodies[0]), fetch(lane.bodies[1])];
                    let mut vels = before;
                    lane.solve(&mut vels, residual);
                    store(lane.bodies[0], before[0], vels[0]);
                    store(lane.bodies[1], before[1], vels[1]);
                }
            }
        }
    }

    pub fn conclude(&mut self) {
        match &mut self.lanes {
            Lanes::Contacts(lanes) => lanes.iter_mut().for_each(PreparedContact::conclude),
            Lanes::Joints(lanes) => lanes.iter_mut().for_each(PreparedJoint::conclude),
        }
    }
}

/// The static constraints of one dynamic body that are solved together in one static slab.
///
/// Joints are solved before contacts, each in order, starting from the body's
/// averaged velocity. The result goes to `output` for the static propagation pass.
#[derive(Clone, Debug)]
pub struct StaticSlabBlock {
    pub body: u32,
    pub slab: u32,
    pub joints: Vec<PreparedJoint>,
    pub contacts: Vec<PreparedContact>,
    pub output: Velocity,
}

impl StaticSlabBlock {
    /// Solve the block starting from `start`.
    ///
    /// `fixed_velocity` gives the velocity of the static or kinematic other end.
    pub fn solve(
        &mut self,
        start: Velocity,
        do_friction: bool,
        residual: &mut ErrorAccumulator,
        fixed_velocity: impl Fn(ConstraintBody) -> Velocity,
    ) {
        let body = ConstraintBody::Rigid(self.body);
        let mut current = start;
        let lane_vels = |bodies: &[ConstraintBody; 2], current: Velocity| {
            let pick = |b: ConstraintBody| if b == body { current } else { fixed_velocity(b) };
            [pick(bodies[0]), pick(bodies[1])]
        };
        let dynamic_side = |bodies: &[ConstraintBody; 2]| if bodies[0] == body { 0 } else { 1 };

        for joint in &mut self.joints {
            let mut vels = lane_vels(&joint.bodies, current);
            joint.solve(&mut vels, residual);
            current = vels[dynamic_side(&joint.bodies)];
        }
        for contact in &mut self.contacts {
            let mut vels = lane_vels(&contact.bodies, current);
            contact.solve(&mut vels, do_friction, residual);
            current = vels[dynamic_side(&contact.bodies)];
        }
        self.output = current;
    }

    pub fn conclude(&mut self) {
        self.joints.iter_mut().for_each(PreparedJoint::conclude);
        self.contacts.iter_mut().for_each(PreparedContact::conclude);
    }
}
