//! Constraint preparation: turning descriptors into solver blocks.
//!
//! Every constraint kind is prepared by its own kernel,
//! and a kind with no batches this step is never launched.

use std::collections::HashMap;

use super::{
    articulation::ArticulationSolver,
    block::{
        ConstraintBlock, ContactRow, FrictionRow, PreparedContact, PreparedJoint,
        PreparedJointRow, StaticSlabBlock,
    },
    BatchKind, ConstraintBatch, ConstraintBody, ContactDesc, IslandDesc, JointDesc,
    SolverBodyDesc,
};
use crate::{
    device::{map_range, WARP_SIZE},
    math::{Mat3, Vec3, Velocity},
    PipelineConfig,
};

/// The normal may turn this little before a friction anchor's tangent basis is rebuilt.
const ANCHOR_NORMAL_TOLERANCE: f64 = 0.999;

//
// Friction anchors
//

/// Per-contact-manager friction state that persists across steps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrictionAnchor {
    pub normal: Vec3,
    pub tangents: [Vec3; 2],
    /// Number of friction patches last step. Zero means there is no basis to reuse.
    pub patch_count: u32,
}

impl FrictionAnchor {
    /// Keep the previous tangent basis if the normal hasn't turned, otherwise build a new one.
    pub fn update(previous: Option<&FrictionAnchor>, normal: Vec3) -> Self {
        let reusable = |prev: &&FrictionAnchor| {
            prev.patch_count > 0 && prev.normal.dot(normal) > ANCHOR_NORMAL_TOLERANCE
        };
        match previous.filter(reusable) {
            Some(prev) => FrictionAnchor {
                normal,
                tangents: prev.tangents,
                patch_count: 1,
            },
            None => FrictionAnchor {
                normal,
                tangents: tangent_basis(normal),
                patch_count: 1,
            },
        }
    }
}

/// Two unit vectors orthogonal to `normal` and to each other.
pub fn tangent_basis(normal: Vec3) -> [Vec3; 2] {
    // cross with the world axis least aligned with the normal
    let helper = if normal.x.abs() < 0.57 {
        Vec3::unit_x()
    } else {
        Vec3::unit_y()
    };
    let t0 = normal.cross(helper).normalized();
    let t1 = normal.cross(t0);
    [t0, t1]
}

/// Friction anchors of every contact manager, keyed by manager id.
#[derive(Clone, Debug, Default)]
pub struct FrictionAnchors {
    anchors: HashMap<u32, FrictionAnchor>,
}

impl FrictionAnchors {
    pub fn get(&self, manager: u32) -> Option<&FrictionAnchor> {
        self.anchors.get(&manager)
    }

    pub fn insert(&mut self, manager: u32, anchor: FrictionAnchor) {
        self.anchors.insert(manager, anchor);
    }

    /// Drop the anchors of destroyed managers.
    /// A manager without an anchor starts from a fresh basis, as with a zero patch count.
    pub fn reset_patch_counts(&mut self, managers: &[u32]) {
        for manager in managers {
            self.anchors.remove(manager);
        }
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

//
// Preparation inputs
//

/// Read-only step data the preparation kernels work from.
pub struct PrepareContext<'a> {
    pub bodies: &'a [SolverBodyDesc],
    /// Body velocities after pre-integration.
    pub velocities: &'a [Velocity],
    pub contacts: &'a [ContactDesc],
    pub joints: &'a [JointDesc],
    /// Offset of each contact's first point in the contact force buffer.
    pub point_offsets: &'a [u32],
    pub articulation: &'a dyn ArticulationSolver,
    pub config: &'a PipelineConfig,
    pub dt: f64,
}

/// Mass properties of one constraint end as seen by the solver.
#[derive(Clone, Copy, Debug)]
struct BodyResponse {
    center: Vec3,
    inv_mass: f64,
    inv_inertia: Mat3,
    velocity: Velocity,
}

impl<'a> PrepareContext<'a> {
    fn inv_dt(&self) -> f64 {
        1.0 / self.dt
    }

    fn response(&self, body: ConstraintBody) -> BodyResponse {
        match body {
            ConstraintBody::Rigid(idx) => {
                let desc = &self.bodies[idx as usize];
                BodyResponse {
                    center: desc.pose.translation,
                    inv_mass: desc.inv_mass,
                    inv_inertia: desc.inv_inertia,
                    velocity: self.velocities[idx as usize],
                }
            }
            ConstraintBody::Link(link) => {
                let resp = self.articulation.link_response(link);
                BodyResponse {
                    center: resp.center_of_mass,
                    inv_mass: resp.inv_mass,
                    inv_inertia: resp.inv_inertia,
                    velocity: self.articulation.link_velocity(link),
                }
            }
        }
    }

    /// Prepare a contact, returning it with its updated friction anchor.
    pub fn prepare_contact(
        &self,
        contact_idx: u32,
        previous_anchor: Option<&FrictionAnchor>,
    ) -> (PreparedContact, FrictionAnchor) {
        let desc = &self.contacts[contact_idx as usize];
        let [a, b] = [self.response(desc.bodies[0]), self.response(desc.bodies[1])];
        let normal = desc.normal;
        let inv_dt = self.inv_dt();
        let config = self.config;

        let rows = desc
            .points
            .iter()
            .map(|point| {
                let ra = point.point - a.center;
                let rb = point.point - b.center;
                let ra_x_n = ra.cross(normal);
                let rb_x_n = rb.cross(normal);
                let ang_delta_a = a.inv_inertia * ra_x_n;
                let ang_delta_b = b.inv_inertia * rb_x_n;
                let eff_mass = inv_or_zero(
                    a.inv_mass + b.inv_mass + ra_x_n.dot(ang_delta_a) + rb_x_n.dot(ang_delta_b),
                );

                let initial_vn = normal.dot(a.velocity.linear - b.velocity.linear)
                    + ra_x_n.dot(a.velocity.angular)
                    - rb_x_n.dot(b.velocity.angular);
                let sep = point.separation;
                let (target, target_unbiased) =
                    if desc.restitution > 0.0 && -initial_vn > config.bounce_threshold {
                        let bounce = -desc.restitution * initial_vn;
                        (bounce, bounce)
                    } else {
                        let biased = if sep < 0.0 {
                            (-sep * config.bias_coefficient * inv_dt)
                                .min(config.max_depenetration_velocity)
                        } else {
                            -sep * inv_dt
                        };
                        (biased, (-sep * inv_dt).min(0.0))
                    };

                ContactRow {
                    ra_x_n,
                    rb_x_n,
                    ang_delta_a,
                    ang_delta_b,
                    eff_mass,
                    target,
                    target_unbiased,
                    applied: 0.0,
                }
            })
            .collect();

        let anchor = FrictionAnchor::update(previous_anchor, normal);
        let friction = if desc.friction > 0.0 && !desc.points.is_empty() {
            let centroid = desc
                .points
                .iter()
                .fold(Vec3::zero(), |acc, p| acc + p.point)
                / desc.points.len() as f64;
            let ra = centroid - a.center;
            let rb = centroid - b.center;
            anchor
                .tangents
                .iter()
                .map(|&tangent| {
                    let ra_x_t = ra.cross(tangent);
                    let rb_x_t = rb.cross(tangent);
                    let ang_delta_a = a.inv_inertia * ra_x_t;
                    let ang_delta_b = b.inv_inertia * rb_x_t;
                    FrictionRow {
                        tangent,
                        ra_x_t,
                        rb_x_t,
                        ang_delta_a,
                        ang_delta_b,
                        eff_mass: inv_or_zero(
                            a.inv_mass
                                + b.inv_mass
                                + ra_x_t.dot(ang_delta_a)
                                + rb_x_t.dot(ang_delta_b),
                        ),
                        applied: 0.0,
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let prepared = PreparedContact {
            bodies: desc.bodies,
            inv_mass: [a.inv_mass, b.inv_mass],
            normal,
            rows,
            friction,
            friction_coef: desc.friction,
            contact: contact_idx,
            force_offset: self.point_offsets[contact_idx as usize],
        };
        (prepared, anchor)
    }

    pub fn prepare_joint(&self, joint_idx: u32) -> PreparedJoint {
        let desc = &self.joints[joint_idx as usize];
        let [r0, r1] = [self.response(desc.bodies[0]), self.response(desc.bodies[1])];
        let inv_dt = self.inv_dt();
        let rows = desc
            .rows
            .iter()
            .map(|row| {
                let ang_delta0 = r0.inv_inertia * row.angular0;
                let ang_delta1 = r1.inv_inertia * row.angular1;
                let lin_sq = row.linear.mag_sq();
                PreparedJointRow {
                    linear: row.linear,
                    angular0: row.angular0,
                    angular1: row.angular1,
                    ang_delta0,
                    ang_delta1,
                    eff_mass: inv_or_zero(
                        (r0.inv_mass + r1.inv_mass) * lin_sq
                            + row.angular0.dot(ang_delta0)
                            + row.angular1.dot(ang_delta1),
                    ),
                    target: row.velocity_target
                        - row.geometric_error * self.config.bias_coefficient * inv_dt,
                    target_unbiased: row.velocity_target,
                    min_impulse: row.min_impulse,
                    max_impulse: row.max_impulse,
                    applied: 0.0,
                }
            })
            .collect();
        PreparedJoint {
            bodies: desc.bodies,
            inv_mass: [r0.inv_mass, r1.inv_mass],
            rows,
            joint: joint_idx,
            break_force: desc.break_force,
            break_torque: desc.break_torque,
        }
    }

    /// Prepare every batch of `kind`, in batch order.
    ///
    /// Contacts are prepared in parallel; their friction anchors are written back afterwards.
    pub fn prepare_batches(
        &self,
        batches: &[ConstraintBatch],
        kind: BatchKind,
        partition: u32,
        anchors: &mut FrictionAnchors,
    ) -> Vec<ConstraintBlock> {
        let batches: Vec<&ConstraintBatch> = batches.iter().filter(|b| b.kind == kind).collect();
        match kind {
            BatchKind::Contact => {
                let anchors_ref = &*anchors;
                let prepared = map_range(batches.len(), |i| {
                    batches[i]
                        .constraints
                        .iter()
                        .map(|&c| {
                            let manager = self.contacts[c as usize].manager;
                            let (contact, anchor) =
                                self.prepare_contact(c, anchors_ref.get(manager));
                            (contact, (manager, anchor))
                        })
                        .unzip::<_, _, Vec<_>, Vec<_>>()
                });
                prepared
                    .into_iter()
                    .map(|(lanes, new_anchors)| {
                        for (manager, anchor) in new_anchors {
                            anchors.insert(manager, anchor);
                        }
                        ConstraintBlock::contacts(partition, lanes)
                    })
                    .collect()
            }
            BatchKind::Joint => map_range(batches.len(), |i| {
                let lanes = batches[i]
                    .constraints
                    .iter()
                    .map(|&j| self.prepare_joint(j))
                    .collect();
                ConstraintBlock::joints(partition, lanes)
            }),
        }
    }

    /// Split loose constraint lists into warp-sized blocks outside of any partition.
    pub fn prepare_loose(
        &self,
        contacts: &[u32],
        joints: &[u32],
        anchors: &mut FrictionAnchors,
    ) -> Vec<ConstraintBlock> {
        let batches: Vec<ConstraintBatch> = contacts
            .chunks(WARP_SIZE)
            .map(|c| ConstraintBatch::contacts(c.to_vec()))
            .chain(
                joints
                    .chunks(WARP_SIZE)
                    .map(|j| ConstraintBatch::joints(j.to_vec())),
            )
            .collect();
        let mut blocks = self.prepare_batches(&batches, BatchKind::Contact, 0, anchors);
        blocks.extend(self.prepare_batches(&batches, BatchKind::Joint, 0, anchors));
        blocks
    }

    /// Group an island's static constraints by dynamic body
    /// and cut each body's list into static slabs of at most `static_slab_size`.
    ///
    /// Joints come before contacts, both in the island's order.
    pub fn prepare_static_slabs(
        &self,
        island: &IslandDesc,
        num_static_kinematic: u32,
        anchors: &mut FrictionAnchors,
    ) -> Vec<StaticSlabBlock> {
        enum Item {
            Joint(u32),
            Contact(u32),
        }
        let dynamic_end = |bodies: &[ConstraintBody; 2]| {
            bodies
                .iter()
                .filter_map(|b| b.rigid_index())
                .find(|idx| *idx >= num_static_kinematic)
        };

        let mut per_body: Vec<(u32, Vec<Item>)> = Vec::new();
        let mut body_slot: HashMap<u32, usize> = HashMap::new();
        let mut push = |body: u32, item: Item| {
            let slot = *body_slot.entry(body).or_insert_with(|| {
                per_body.push((body, Vec::new()));
                per_body.len() - 1
            });
            per_body[slot].1.push(item);
        };
        for &j in &island.static_joints {
            if let Some(body) = dynamic_end(&self.joints[j as usize].bodies) {
                push(body, Item::Joint(j));
            }
        }
        for &c in &island.static_contacts {
            if let Some(body) = dynamic_end(&self.contacts[c as usize].bodies) {
                push(body, Item::Contact(c));
            }
        }

        let slab_size = self.config.static_slab_size.max(1) as usize;
        let mut blocks = Vec::new();
        for (body, items) in per_body {
            for (slab, chunk) in items.chunks(slab_size).enumerate() {
                let mut block = StaticSlabBlock {
                    body,
                    slab: slab as u32,
                    joints: Vec::new(),
                    contacts: Vec::new(),
                    output: Velocity::default(),
                };
                for item in chunk {
                    match *item {
                        Item::Joint(j) => block.joints.push(self.prepare_joint(j)),
                        Item::Contact(c) => {
                            let manager = self.contacts[c as usize].manager;
                            let (contact, anchor) = self.prepare_contact(c, anchors.get(manager));
                            anchors.insert(manager, anchor);
                            block.contacts.push(contact);
                        }
                    }
                }
                blocks.push(block);
            }
        }
        blocks
    }
}

fn inv_or_zero(x: f64) -> f64 {
    if x > f64::EPSILON {
        1.0 / x
    } else {
        0.0
    }
}

//
// Prepared islands
//

/// The prepared blocks of one partition.
#[derive(Clone, Debug, Default)]
pub struct PreparedPartition {
    pub rigid: Vec<ConstraintBlock>,
    pub articulation: Vec<ConstraintBlock>,
}

/// Everything the solve kernels need for one island.
#[derive(Clone, Debug, Default)]
pub struct PreparedIsland {
    pub partitions: Vec<PreparedPartition>,
    pub static_slabs: Vec<StaticSlabBlock>,
    pub articulation_static: Vec<ConstraintBlock>,
    pub articulation_self: Vec<ConstraintBlock>,
}

impl PreparedIsland {
    pub fn with_partitions(count: usize) -> Self {
        Self {
            partitions: vec![PreparedPartition::default(); count],
            ..Default::default()
        }
    }

    /// Every block of the island, for passes that treat them all alike.
    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut ConstraintBlock> {
        self.partitions
            .iter_mut()
            .flat_map(|p| p.rigid.iter_mut().chain(p.articulation.iter_mut()))
            .chain(self.articulation_static.iter_mut())
            .chain(self.articulation_self.iter_mut())
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ConstraintBlock> {
        self.partitions
            .iter()
            .flat_map(|p| p.rigid.iter().chain(p.articulation.iter()))
            .chain(self.articulation_static.iter())
            .chain(self.articulation_self.iter())
    }
}

/// How many batches of each kind a step has, used to size the preparation launches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCounts {
    pub rigid_contact_batches: usize,
    pub rigid_joint_batches: usize,
    pub articulation_contact_batches: usize,
    pub articulation_joint_batches: usize,
    pub articulation_static_contacts: usize,
    pub articulation_static_joints: usize,
    pub articulation_self_contacts: usize,
    pub articulation_self_joints: usize,
    pub static_constraints: usize,
}

impl BlockCounts {
    pub fn of(islands: &[IslandDesc]) -> Self {
        let mut counts = BlockCounts::default();
        for island in islands {
            for partition in &island.partitions {
                for batch in &partition.rigid_batches {
                    match batch.kind {
                        BatchKind::Contact => counts.rigid_contact_batches += 1,
                        BatchKind::Joint => counts.rigid_joint_batches += 1,
                    }
                }
                for batch in &partition.articulation_batches {
                    match batch.kind {
                        BatchKind::Contact => counts.articulation_contact_batches += 1,
                        BatchKind::Joint => counts.articulation_joint_batches += 1,
                    }
                }
            }
            counts.articulation_static_contacts += island.articulation_static_contacts.len();
            counts.articulation_static_joints += island.articulation_static_joints.len();
            counts.articulation_self_contacts += island.articulation_self_contacts.len();
            counts.articulation_self_joints += island.articulation_self_joints.len();
            counts.static_constraints += island.static_contacts.len() + island.static_joints.len();
        }
        counts
    }

    pub fn total_batches(&self) -> usize {
        let loose = |n: usize| (n + WARP_SIZE - 1) / WARP_SIZE;
        self.rigid_contact_batches
            + self.rigid_joint_batches
            + self.articulation_contact_batches
            + self.articulation_joint_batches
            + loose(self.articulation_static_contacts)
            + loose(self.articulation_static_joints)
            + loose(self.articulation_self_contacts)
            + loose(self.articulation_self_joints)
            + loose(self.static_constraints)
    }

    pub fn articulation_loose(&self) -> usize {
        self.articulation_static_contacts
            + self.articulation_static_joints
            + self.articulation_self_contacts
            + self.articulation_self_joints
    }
}
