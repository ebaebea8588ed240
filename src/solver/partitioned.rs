//! The partitioned iterative solve.
//!
//! Every island is solved by a fixed program of [`SolveOp`]s built by [`IslandPlan::ops`].
//! The pipeline issues each op as one kernel on the compute queue,
//! so ops of an island execute strictly in program order.
//!
//! Per position iteration the program is:
//! partitions in index order (articulation delta averaging, reference counts on the first one,
//! rigid blocks, articulation blocks), slab averaging, articulation propagation,
//! extended-body solvers, static slabs and static propagation.
//! Velocity iterations repeat that with friction on and no positional bias,
//! and the last one leaves the static averaging to the final write-back.
//! Extended-body solvers are finalized at the end of every island.

use super::{
    articulation::{ArticulationSolver, InternalSolveParams},
    block::{ConstraintBlock, Lanes, PreparedContact, PreparedJoint, StaticSlabBlock},
    extended::{ExtendedSolveContext, ExtendedSolverRegistry},
    integrate::BodyState,
    prepare::PreparedIsland,
    residual::{ErrorAccumulator, IslandResidual},
    slab::{average_slabs, SlabMask, SlabVelocities},
    threshold::ThresholdElement,
    ConstraintBody, ContactDesc, IslandDesc, SolverBodyDesc,
};
use crate::{
    config::FRICTION_TRAILING_ITERATIONS,
    device::{
        arena::{DeviceArena, DeviceVec},
        block_dim, map_each_mut, map_range, KernelLaunch, WARP_SIZE,
    },
    math::{Vec3, Velocity},
    DeviceError, PipelineConfig, StepFlags,
};

//
// Write-back records
//

/// What a joint did during the step.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstraintWriteback {
    /// Linear impulse applied to the first body.
    pub linear_impulse: Vec3,
    /// Angular impulse applied to the first body.
    pub angular_impulse: Vec3,
    /// Largest remaining velocity error over the joint's rows.
    pub residual: f64,
    /// The force or torque went above the joint's break limits.
    pub broken: bool,
}

impl Default for ConstraintWriteback {
    fn default() -> Self {
        Self {
            linear_impulse: Vec3::zero(),
            angular_impulse: Vec3::zero(),
            residual: 0.0,
            broken: false,
        }
    }
}

pub fn writeback_joint(
    joint: &PreparedJoint,
    vels: [Velocity; 2],
    inv_dt: f64,
) -> ConstraintWriteback {
    let (linear_impulse, angular_impulse) = joint.applied_impulse();
    let [v0, v1] = vels;
    let residual = joint
        .rows
        .iter()
        .map(|row| {
            let v = row.linear.dot(v0.linear - v1.linear) + row.angular0.dot(v0.angular)
                - row.angular1.dot(v1.angular);
            let err = row.target - v;
            // a row pushing against its limit has nothing left to fix
            if (err > 0.0 && row.applied >= row.max_impulse)
                || (err < 0.0 && row.applied <= row.min_impulse)
            {
                0.0
            } else {
                err.abs()
            }
        })
        .fold(0.0, f64::max);
    ConstraintWriteback {
        linear_impulse,
        angular_impulse,
        residual,
        broken: linear_impulse.mag() * inv_dt > joint.break_force
            || angular_impulse.mag() * inv_dt > joint.break_torque,
    }
}

/// Per-point normal forces of a contact, and the threshold stream element if it has a threshold.
pub fn writeback_contact(
    contact: &PreparedContact,
    desc: &ContactDesc,
    num_bodies: u32,
    inv_dt: f64,
    thresholds: bool,
) -> (Vec<f64>, Option<ThresholdElement>) {
    let forces = contact.rows.iter().map(|r| r.applied * inv_dt).collect();
    let element = match desc.force_threshold {
        Some(threshold) if thresholds => {
            let node = |body: ConstraintBody| match body {
                ConstraintBody::Rigid(idx) => idx,
                ConstraintBody::Link(link) => num_bodies + link.articulation,
            };
            Some(ThresholdElement::new(
                node(contact.bodies[0]),
                node(contact.bodies[1]),
                desc.manager,
                contact.total_normal_impulse() * inv_dt,
                threshold,
            ))
        }
        _ => None,
    };
    (forces, element)
}

//
// Buffers
//

/// Solver state of one step, allocated from the step's arena.
#[derive(Debug)]
pub struct SolverBuffers {
    /// Canonical velocity of every body.
    pub velocities: DeviceVec<Velocity>,
    pub slabs: SlabVelocities,
    pub mask: SlabMask,
    pub islands: Vec<PreparedIsland>,
    pub joint_writeback: DeviceVec<ConstraintWriteback>,
    pub contact_forces: DeviceVec<f64>,
    pub threshold_stream: Vec<ThresholdElement>,
    iteration_residual: ErrorAccumulator,
    island_residual: IslandResidual,
    /// Residuals of finished islands, as copied to the host.
    pub island_residuals: Vec<IslandResidual>,
}

/// Sizes for [`SolverBuffers::allocate`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferSizes {
    pub num_bodies: usize,
    pub num_slabs: usize,
    pub num_joints: usize,
    pub num_contact_points: usize,
}

impl SolverBuffers {
    pub fn allocate(arena: &mut DeviceArena, sizes: BufferSizes) -> Result<Self, DeviceError> {
        let num_slabs = sizes.num_slabs.max(1);
        let velocities = arena.alloc_zeroed("body velocities", sizes.num_bodies)?;
        let slabs = SlabVelocities::new(
            arena.alloc_zeroed("slab velocities", sizes.num_bodies * num_slabs)?,
            num_slabs,
        );
        let mask = SlabMask::new(
            arena.alloc_zeroed(
                "slab reference counts",
                sizes.num_bodies * SlabMask::words_per_entry(num_slabs),
            )?,
            sizes.num_bodies,
        );
        Ok(Self {
            velocities,
            slabs,
            mask,
            islands: Vec::new(),
            joint_writeback: arena.alloc_zeroed("joint writeback", sizes.num_joints)?,
            contact_forces: arena.alloc_zeroed("contact forces", sizes.num_contact_points)?,
            threshold_stream: Vec::new(),
            iteration_residual: ErrorAccumulator::default(),
            island_residual: IslandResidual::default(),
            island_residuals: Vec::new(),
        })
    }
}

/// Step data and collaborators the solve ops work with.
pub struct SolveEnv<'a> {
    pub bodies: &'a [SolverBodyDesc],
    pub num_static_kinematic: u32,
    pub contacts: &'a [ContactDesc],
    pub dt: f64,
    pub config: &'a PipelineConfig,
    pub flags: StepFlags,
    pub articulation: &'a mut dyn ArticulationSolver,
    pub extended: &'a mut ExtendedSolverRegistry,
    pub body_state: &'a mut BodyState,
}

//
// Island plans
//

/// One step of an island's solve program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveOp {
    BeginIsland,
    BeginIteration,
    AverageDeltaV { partition: u32 },
    ComputeReferenceCounts,
    SolvePartition { partition: u32, friction: bool },
    SolveArticulationPartition { partition: u32, friction: bool },
    AverageSlabs,
    PropagateArticulations { velocity_iteration: bool, friction: bool },
    OutputArticulationVelocity,
    SolveExtended { iteration: u32, velocity_iteration: bool },
    SolveStatic { friction: bool },
    PropagateStatic,
    EndIteration { velocity_iteration: bool },
    Conclude,
    WriteBackMotion,
    SaveArticulationVelocities,
    FinalWriteBack { average_static: bool },
    FinalizeExtended,
    WriteBackBlocks,
    CopyResiduals,
}

/// The shape of one island's solve, taken from its description before preparation.
#[derive(Clone, Debug)]
pub struct IslandPlan {
    pub island: u32,
    pub bodies: Vec<u32>,
    pub partitions_per_slab: u32,
    pub position_iterations: u32,
    pub velocity_iterations: u32,
    pub rigid_batches: Vec<usize>,
    pub articulation_batches: Vec<usize>,
    pub static_constraints: usize,
    pub loose_articulation_constraints: usize,
    /// The island has constraints touching articulation links.
    pub has_articulation_constraints: bool,
    /// The scene has articulations, which are driven every iteration
    /// whether or not anything touches them.
    pub has_articulations: bool,
    pub has_extended: bool,
    pub flags: StepFlags,
}

impl IslandPlan {
    pub fn new(
        island_idx: u32,
        island: &IslandDesc,
        config: &PipelineConfig,
        flags: StepFlags,
        num_articulations: u32,
        has_extended: bool,
    ) -> Self {
        Self {
            island: island_idx,
            bodies: island.bodies.clone(),
            partitions_per_slab: config.partitions_per_slab.max(1),
            position_iterations: island.position_iterations,
            velocity_iterations: island.velocity_iterations,
            rigid_batches: island.partitions.iter().map(|p| p.rigid_batches.len()).collect(),
            articulation_batches: island
                .partitions
                .iter()
                .map(|p| p.articulation_batches.len())
                .collect(),
            static_constraints: island.static_contacts.len() + island.static_joints.len(),
            loose_articulation_constraints: island.articulation_static_contacts.len()
                + island.articulation_static_joints.len()
                + island.articulation_self_contacts.len()
                + island.articulation_self_joints.len(),
            has_articulation_constraints: island.has_articulation_constraints(),
            has_articulations: num_articulations > 0,
            has_extended,
            flags,
        }
    }

    pub fn num_partitions(&self) -> u32 {
        self.rigid_batches.len() as u32
    }

    pub fn slab_of(&self, partition: u32) -> usize {
        (partition / self.partitions_per_slab) as usize
    }

    /// Number of slabs the island's partitions fall into.
    pub fn num_slabs(&self) -> usize {
        let parts = self.num_partitions();
        ((parts + self.partitions_per_slab - 1) / self.partitions_per_slab).max(1) as usize
    }

    fn total_batches(&self) -> usize {
        self.rigid_batches.iter().sum::<usize>()
            + self.articulation_batches.iter().sum::<usize>()
            + (self.loose_articulation_constraints + WARP_SIZE - 1) / WARP_SIZE
    }

    fn friction_in_position_iteration(&self, iteration: u32) -> bool {
        self.flags.friction_every_iteration
            || iteration + FRICTION_TRAILING_ITERATIONS >= self.position_iterations
    }

    /// The island's full solve program.
    pub fn ops(&self) -> Vec<SolveOp> {
        let mut ops = vec![SolveOp::BeginIsland];
        for it in 0..self.position_iterations {
            let friction = self.friction_in_position_iteration(it);
            self.push_iteration(&mut ops, it, false, friction, false);
        }
        ops.push(SolveOp::Conclude);
        ops.push(SolveOp::WriteBackMotion);
        if self.has_articulations {
            ops.push(SolveOp::SaveArticulationVelocities);
        }
        for it in 0..self.velocity_iterations {
            let last = it + 1 == self.velocity_iterations;
            self.push_iteration(&mut ops, it, true, true, last);
        }
        ops.push(SolveOp::FinalWriteBack {
            average_static: self.velocity_iterations > 0,
        });
        if self.has_extended {
            ops.push(SolveOp::FinalizeExtended);
        }
        ops.push(SolveOp::WriteBackBlocks);
        if self.flags.residual_reporting {
            ops.push(SolveOp::CopyResiduals);
        }
        ops
    }

    fn push_iteration(
        &self,
        ops: &mut Vec<SolveOp>,
        iteration: u32,
        velocity_iteration: bool,
        friction: bool,
        last: bool,
    ) {
        if self.flags.residual_reporting {
            ops.push(SolveOp::BeginIteration);
        }
        for c in 0..self.num_partitions() {
            let has_arti_batches = self.articulation_batches[c as usize] > 0;
            if (c == 0 && self.has_articulation_constraints) || has_arti_batches {
                ops.push(SolveOp::AverageDeltaV { partition: c });
            }
            if c == 0 {
                ops.push(SolveOp::ComputeReferenceCounts);
            }
            ops.push(SolveOp::SolvePartition {
                partition: c,
                friction,
            });
            if has_arti_batches {
                ops.push(SolveOp::SolveArticulationPartition {
                    partition: c,
                    friction,
                });
            }
        }
        ops.push(SolveOp::AverageSlabs);
        if self.has_articulations {
            ops.push(SolveOp::PropagateArticulations {
                velocity_iteration,
                friction,
            });
        }
        if self.has_extended {
            ops.push(SolveOp::OutputArticulationVelocity);
            ops.push(SolveOp::SolveExtended {
                iteration,
                velocity_iteration,
            });
        }
        ops.push(SolveOp::SolveStatic { friction });
        if !(velocity_iteration && last) {
            ops.push(SolveOp::PropagateStatic);
        }
        if self.flags.residual_reporting {
            ops.push(SolveOp::EndIteration { velocity_iteration });
        }
    }

    /// The kernel an op is issued as, or `None` for ops that are memory transfers.
    pub fn launch(&self, op: &SolveOp) -> Option<KernelLaunch> {
        let bodies = self.bodies.len();
        let launch = match *op {
            SolveOp::BeginIsland => {
                KernelLaunch::for_threads("begin_island", bodies, block_dim::BODIES)
            }
            SolveOp::BeginIteration => KernelLaunch::new("clear_residuals", 1),
            SolveOp::AverageDeltaV { .. } => KernelLaunch::new("articulation_average_delta_v", 1),
            SolveOp::ComputeReferenceCounts => {
                KernelLaunch::for_batches("compute_reference_counts", self.total_batches())
            }
            SolveOp::SolvePartition { partition, .. } => KernelLaunch::for_batches(
                "solve_rigid_blocks",
                self.rigid_batches[partition as usize],
            ),
            SolveOp::SolveArticulationPartition { partition, .. } => KernelLaunch::for_batches(
                "solve_articulation_blocks",
                self.articulation_batches[partition as usize],
            ),
            SolveOp::AverageSlabs => {
                KernelLaunch::for_threads("average_slabs", bodies, block_dim::BODIES)
            }
            SolveOp::PropagateArticulations { .. } => {
                KernelLaunch::new("propagate_articulation_impulses", 1)
            }
            SolveOp::OutputArticulationVelocity => {
                KernelLaunch::new("articulation_output_velocity", 1)
            }
            SolveOp::SolveExtended { .. } => KernelLaunch::new("solve_extended_bodies", 1),
            SolveOp::SolveStatic { .. } => KernelLaunch::for_threads(
                "solve_static_slabs",
                self.static_constraints,
                block_dim::SOLVE,
            ),
            SolveOp::PropagateStatic => {
                KernelLaunch::for_threads("propagate_static", bodies, block_dim::BODIES)
            }
            SolveOp::EndIteration { .. } => KernelLaunch::new("record_residuals", 1),
            SolveOp::Conclude => KernelLaunch::for_threads(
                "conclude_blocks",
                self.total_batches() * WARP_SIZE + self.static_constraints,
                block_dim::SOLVE,
            ),
            SolveOp::WriteBackMotion => {
                KernelLaunch::for_threads("write_back_motion", bodies, block_dim::BODIES)
            }
            SolveOp::SaveArticulationVelocities => {
                KernelLaunch::new("articulation_save_velocities", 1)
            }
            SolveOp::FinalWriteBack { .. } => {
                KernelLaunch::for_threads("write_back_bodies", bodies, block_dim::BODIES)
            }
            SolveOp::FinalizeExtended => KernelLaunch::new("finalize_extended_bodies", 1),
            SolveOp::WriteBackBlocks => KernelLaunch::for_threads(
                "write_back_blocks",
                self.total_batches() * WARP_SIZE + self.static_constraints,
                block_dim::WRITEBACK,
            ),
            SolveOp::CopyResiduals => return None,
        };
        Some(launch)
    }
}

//
// Executing ops
//

/// Run one op of `plan` against the step's buffers.
pub fn run_op(op: SolveOp, plan: &IslandPlan, bufs: &mut SolverBuffers, env: &mut SolveEnv<'_>) {
    let island = plan.island as usize;
    let inv_dt = 1.0 / env.dt;
    match op {
        SolveOp::BeginIsland => {
            bufs.iteration_residual.reset();
            bufs.island_residual = IslandResidual {
                island: plan.island,
                ..Default::default()
            };
            if plan.has_articulations {
                env.articulation.reset_errors();
            }
            for &body in &plan.bodies {
                bufs.slabs.broadcast(body, bufs.velocities[body as usize]);
            }
            bufs.mask.clear_entries(&plan.bodies);
        }
        SolveOp::BeginIteration => bufs.iteration_residual.reset(),
        SolveOp::AverageDeltaV { partition } => {
            env.articulation
                .average_delta_v(bufs.slabs.num_slabs() as u32, partition);
        }
        SolveOp::ComputeReferenceCounts => compute_reference_counts(plan, bufs, env),
        SolveOp::SolvePartition {
            partition,
            friction,
        } => solve_partition(plan, partition, false, friction, bufs, env),
        SolveOp::SolveArticulationPartition {
            partition,
            friction,
        } => solve_partition(plan, partition, true, friction, bufs, env),
        SolveOp::AverageSlabs => {
            average_slabs(&bufs.slabs, &bufs.mask, &mut bufs.velocities, &plan.bodies);
        }
        SolveOp::PropagateArticulations {
            velocity_iteration,
            friction,
        } => {
            let prepared = &mut bufs.islands[island];
            env.articulation
                .propagate_rigid_body_impulses_and_solve_internal_constraints(
                    InternalSolveParams {
                        dt: env.dt,
                        inv_dt,
                        bias_coefficient: env.config.bias_coefficient,
                        is_velocity_iteration: velocity_iteration,
                        do_friction: friction,
                        residual_reporting: plan.flags.residual_reporting,
                        static_blocks: &mut prepared.articulation_static,
                        self_blocks: &mut prepared.articulation_self,
                    },
                );
        }
        SolveOp::OutputArticulationVelocity => env.articulation.output_velocity(),
        SolveOp::SolveExtended {
            iteration,
            velocity_iteration,
        } => {
            env.extended.solve_all(&mut ExtendedSolveContext {
                velocities: &mut bufs.velocities,
                island_bodies: &plan.bodies,
                dt: env.dt,
                iteration,
                is_velocity_iteration: velocity_iteration,
            });
        }
        SolveOp::SolveStatic { friction } => solve_static(plan, friction, bufs, env),
        SolveOp::PropagateStatic => {
            average_static(&bufs.islands[island].static_slabs, &mut bufs.velocities);
            for &body in &plan.bodies {
                bufs.slabs.broadcast(body, bufs.velocities[body as usize]);
            }
        }
        SolveOp::EndIteration { velocity_iteration } => {
            if velocity_iteration {
                bufs.island_residual.velocity = bufs.iteration_residual;
            } else {
                bufs.island_residual
                    .position_iterations
                    .push(bufs.iteration_residual);
            }
        }
        SolveOp::Conclude => {
            let prepared = &mut bufs.islands[island];
            prepared.blocks_mut().for_each(ConstraintBlock::conclude);
            prepared
                .static_slabs
                .iter_mut()
                .for_each(StaticSlabBlock::conclude);
        }
        SolveOp::WriteBackMotion => {
            for &body in &plan.bodies {
                env.body_state.motion_velocities[body as usize] = bufs.velocities[body as usize];
            }
        }
        SolveOp::SaveArticulationVelocities => env.articulation.save_velocities(),
        SolveOp::FinalWriteBack { average_static: avg } => {
            if avg {
                average_static(&bufs.islands[island].static_slabs, &mut bufs.velocities);
            }
            for &body in &plan.bodies {
                env.body_state.velocities[body as usize] = bufs.velocities[body as usize];
            }
        }
        SolveOp::FinalizeExtended => env.extended.finalize_all(env.dt),
        SolveOp::WriteBackBlocks => write_back_blocks(plan, bufs, env),
        SolveOp::CopyResiduals => {
            let mut residual = bufs.island_residual.clone();
            if plan.has_articulations {
                residual.articulations = env.articulation.errors();
            }
            bufs.island_residuals.push(residual);
        }
    }
}

/// Run an island's whole program right away, for tests and host-side tools.
pub fn solve_island_now(plan: &IslandPlan, bufs: &mut SolverBuffers, env: &mut SolveEnv<'_>) {
    for op in plan.ops() {
        run_op(op, plan, bufs, env);
    }
}

/// Mark the slab of every partition each dynamic body appears in.
fn compute_reference_counts(plan: &IslandPlan, bufs: &mut SolverBuffers, env: &SolveEnv<'_>) {
    let prepared = &bufs.islands[plan.island as usize];
    let num_static = env.num_static_kinematic;
    let marks: Vec<Vec<(u32, usize)>> = map_range(prepared.partitions.len(), |c| {
        let slab = plan.slab_of(c as u32);
        let partition = &prepared.partitions[c];
        partition
            .rigid
            .iter()
            .chain(&partition.articulation)
            .flat_map(|block| block.lane_bodies())
            .flatten()
            .filter_map(|body| body.rigid_index())
            .filter(|idx| *idx >= num_static)
            .map(|idx| (idx, slab))
            .collect()
    });
    bufs.mask.clear_entries(&plan.bodies);
    for (body, slab) in marks.into_iter().flatten() {
        bufs.mask.entry_mut(body as usize).set(slab);
    }
}

type LaneWrite = (ConstraintBody, Velocity, Velocity);

/// Solve one partition's blocks in parallel against the partition's slab,
/// then scatter the results in block order.
fn solve_partition(
    plan: &IslandPlan,
    partition: u32,
    articulation_blocks: bool,
    friction: bool,
    bufs: &mut SolverBuffers,
    env: &mut SolveEnv<'_>,
) {
    let _span = crate::tracy_span!("solve partition", "solve_partition");
    let slab = plan.slab_of(partition);
    let num_static = env.num_static_kinematic;
    let SolverBuffers {
        velocities,
        slabs,
        islands,
        iteration_residual,
        ..
    } = bufs;
    let prepared = &mut islands[plan.island as usize].partitions[partition as usize];
    let blocks = if articulation_blocks {
        &mut prepared.articulation
    } else {
        &mut prepared.rigid
    };

    let results: Vec<(ErrorAccumulator, Vec<LaneWrite>)> = {
        let slabs = &*slabs;
        let canonical = &**velocities;
        let articulation: &dyn ArticulationSolver = &*env.articulation;
        let fetch = |body: ConstraintBody| match body {
            ConstraintBody::Rigid(idx) if idx < num_static => canonical[idx as usize],
            ConstraintBody::Rigid(idx) => slabs.get(idx, slab),
            ConstraintBody::Link(link) => articulation.link_velocity(link),
        };
        map_each_mut(blocks, |_, block| {
            let mut residual = ErrorAccumulator::default();
            let mut writes = Vec::with_capacity(block.header.num_lanes as usize * 2);
            block.solve(friction, &mut residual, &fetch, |body, before, after| {
                writes.push((body, before, after))
            });
            (residual, writes)
        })
    };

    for (residual, writes) in results {
        iteration_residual.combine(&residual);
        for (body, before, after) in writes {
            match body {
                ConstraintBody::Rigid(idx) if idx < num_static => {}
                ConstraintBody::Rigid(idx) => slabs.set(idx, slab, after),
                ConstraintBody::Link(link) => {
                    env.articulation
                        .push_link_delta(link, partition, after - before)
                }
            }
        }
    }
}

/// Solve every static slab from its body's canonical velocity.
fn solve_static(
    plan: &IslandPlan,
    friction: bool,
    bufs: &mut SolverBuffers,
    env: &mut SolveEnv<'_>,
) {
    let _span = crate::tracy_span!("solve static slabs", "solve_static");
    let SolverBuffers {
        velocities,
        islands,
        iteration_residual,
        ..
    } = bufs;
    let canonical = &**velocities;
    let articulation: &dyn ArticulationSolver = &*env.articulation;
    let residuals = map_each_mut(
        &mut islands[plan.island as usize].static_slabs,
        |_, block| {
            let mut residual = ErrorAccumulator::default();
            let start = canonical[block.body as usize];
            block.solve(start, friction, &mut residual, |body| match body {
                ConstraintBody::Rigid(idx) => canonical[idx as usize],
                ConstraintBody::Link(link) => articulation.link_velocity(link),
            });
            residual
        },
    );
    for residual in &residuals {
        iteration_residual.combine(residual);
    }
}

/// Average the outputs of each body's static slabs into its canonical velocity.
///
/// Slabs of one body are adjacent.
fn average_static(blocks: &[StaticSlabBlock], velocities: &mut [Velocity]) {
    let mut start = 0;
    while start < blocks.len() {
        let body = blocks[start].body;
        let end = start
            + blocks[start..]
                .iter()
                .take_while(|b| b.body == body)
                .count();
        let v0 = velocities[body as usize];
        let mut sum = Velocity::default();
        for block in &blocks[start..end] {
            sum += block.output - v0;
        }
        velocities[body as usize] = v0 + sum * (1.0 / (end - start) as f64);
        start = end;
    }
}

/// Joint write-back records, per-point contact forces and the threshold stream.
fn write_back_blocks(plan: &IslandPlan, bufs: &mut SolverBuffers, env: &mut SolveEnv<'_>) {
    let _span = crate::tracy_span!("write back blocks", "write_back_blocks");
    let inv_dt = 1.0 / env.dt;
    let num_bodies = env.bodies.len() as u32;
    let thresholds = plan.flags.has_force_thresholds;
    let canonical = &*bufs.velocities;
    let articulation: &dyn ArticulationSolver = &*env.articulation;
    let contacts = env.contacts;
    let velocity_of = |body: ConstraintBody| match body {
        ConstraintBody::Rigid(idx) => canonical[idx as usize],
        ConstraintBody::Link(link) => articulation.link_velocity(link),
    };

    let prepared = &bufs.islands[plan.island as usize];
    let mut joints: Vec<&PreparedJoint> = Vec::new();
    let mut prepared_contacts: Vec<&PreparedContact> = Vec::new();
    for block in prepared.blocks() {
        match &block.lanes {
            Lanes::Contacts(lanes) => prepared_contacts.extend(lanes),
            Lanes::Joints(lanes) => joints.extend(lanes),
        }
    }
    for block in &prepared.static_slabs {
        joints.extend(&block.joints);
        prepared_contacts.extend(&block.contacts);
    }

    let joint_records = map_range(joints.len(), |i| {
        let joint = joints[i];
        let vels = [velocity_of(joint.bodies[0]), velocity_of(joint.bodies[1])];
        (joint.joint, writeback_joint(joint, vels, inv_dt))
    });
    let contact_records = map_range(prepared_contacts.len(), |i| {
        let contact = prepared_contacts[i];
        let desc = &contacts[contact.contact as usize];
        (
            contact.force_offset,
            writeback_contact(contact, desc, num_bodies, inv_dt, thresholds),
        )
    });

    for (joint, record) in joint_records {
        bufs.joint_writeback[joint as usize] = record;
    }
    for (offset, (forces, element)) in contact_records {
        let offset = offset as usize;
        bufs.contact_forces[offset..offset + forces.len()].copy_from_slice(&forces);
        bufs.threshold_stream.extend(element);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        solver::{
            articulation::{
                recording::{Call, RecordingArticulations},
                LinkRef, NullArticulationSolver,
            },
            extended::recording::RecordingSolver,
            prepare::{FrictionAnchors, PrepareContext},
            test_scenes, BatchKind, ConstraintBatch, ContactPoint, JointDesc, JointRow,
            PartitionDesc, StepInput,
        },
        DeviceContext, ExtendedBodyKind,
    };
    use approx::assert_abs_diff_eq;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// A step that has gone through pre-integration and preparation, ready to solve.
    struct Prepared {
        input: StepInput,
        config: PipelineConfig,
        bufs: SolverBuffers,
        plans: Vec<IslandPlan>,
        state: BodyState,
    }

    fn prepare(
        input: StepInput,
        config: PipelineConfig,
        articulation: &dyn ArticulationSolver,
        has_extended: bool,
    ) -> Prepared {
        let mut arena = DeviceArena::new(DeviceContext::new(false), 1 << 24);
        let plans: Vec<IslandPlan> = input
            .islands
            .iter()
            .enumerate()
            .map(|(i, island)| {
                IslandPlan::new(
                    i as u32,
                    island,
                    &config,
                    input.flags,
                    articulation.num_articulations(),
                    has_extended,
                )
            })
            .collect();
        let num_points: usize = input.contacts.iter().map(|c| c.points.len()).sum();
        let mut bufs = SolverBuffers::allocate(
            &mut arena,
            BufferSizes {
                num_bodies: input.bodies.len(),
                num_slabs: plans.iter().map(|p| p.num_slabs()).max().unwrap_or(1),
                num_joints: input.joints.len(),
                num_contact_points: num_points,
            },
        )
        .unwrap();
        crate::solver::integrate::pre_integrate(
            &input.bodies,
            &mut bufs.velocities,
            input.gravity,
            input.dt,
        );
        let offsets: Vec<u32> = input
            .contacts
            .iter()
            .scan(0, |acc, c| {
                let start = *acc;
                *acc += c.points.len() as u32;
                Some(start)
            })
            .collect();
        let ctx = PrepareContext {
            bodies: &input.bodies,
            velocities: &bufs.velocities,
            contacts: &input.contacts,
            joints: &input.joints,
            point_offsets: &offsets,
            articulation,
            config: &config,
            dt: input.dt,
        };
        let mut anchors = FrictionAnchors::default();
        let islands: Vec<PreparedIsland> = input
            .islands
            .iter()
            .map(|island| {
                let mut prepared = PreparedIsland::with_partitions(island.partitions.len());
                for (c, partition) in island.partitions.iter().enumerate() {
                    let p = &mut prepared.partitions[c];
                    for kind in [BatchKind::Contact, BatchKind::Joint] {
                        p.rigid.extend(ctx.prepare_batches(
                            &partition.rigid_batches,
                            kind,
                            c as u32,
                            &mut anchors,
                        ));
                        p.articulation.extend(ctx.prepare_batches(
                            &partition.articulation_batches,
                            kind,
                            c as u32,
                            &mut anchors,
                        ));
                    }
                }
                prepared.articulation_static = ctx.prepare_loose(
                    &island.articulation_static_contacts,
                    &island.articulation_static_joints,
                    &mut anchors,
                );
                prepared.articulation_self = ctx.prepare_loose(
                    &island.articulation_self_contacts,
                    &island.articulation_self_joints,
                    &mut anchors,
                );
                prepared.static_slabs =
                    ctx.prepare_static_slabs(island, input.num_static_kinematic, &mut anchors);
                prepared
            })
            .collect();
        bufs.islands = islands;
        let mut state = BodyState::default();
        state.resize(input.bodies.len());
        Prepared {
            input,
            config,
            bufs,
            plans,
            state,
        }
    }

    fn solve_all(p: &mut Prepared, articulation: &mut dyn ArticulationSolver) {
        let mut extended = ExtendedSolverRegistry::new();
        solve_all_with(p, articulation, &mut extended);
    }

    fn solve_all_with(
        p: &mut Prepared,
        articulation: &mut dyn ArticulationSolver,
        extended: &mut ExtendedSolverRegistry,
    ) {
        let mut env = SolveEnv {
            bodies: &p.input.bodies,
            num_static_kinematic: p.input.num_static_kinematic,
            contacts: &p.input.contacts,
            dt: p.input.dt,
            config: &p.config,
            flags: p.input.flags,
            articulation,
            extended,
            body_state: &mut p.state,
        };
        for plan in &p.plans {
            solve_island_now(plan, &mut p.bufs, &mut env);
        }
    }

    fn sphere_row_step(len: u32, approach: f64) -> StepInput {
        let (bodies, contacts, island) = test_scenes::sphere_row_input(len, 0, approach);
        StepInput {
            dt: 1.0 / 60.0,
            gravity: Vec3::zero(),
            flags: StepFlags::default(),
            bodies,
            num_static_kinematic: 0,
            contacts,
            joints: vec![],
            islands: vec![island],
            destroyed_managers: vec![],
        }
    }

    /// Straightforward sequential solve of the same prepared blocks,
    /// either Gauss-Seidel over all partitions or Jacobi between partitions.
    fn reference_solve(p: &Prepared, jacobi: bool) -> Vec<Velocity> {
        let mut vels: Vec<Velocity> = p.bufs.velocities.to_vec();
        let mut island = p.bufs.islands[0].clone();
        let desc = &p.input.islands[0];
        let sweep = |vels: &mut Vec<Velocity>, island: &mut PreparedIsland| {
            let start = vels.clone();
            let mut deltas = vec![Velocity::default(); vels.len()];
            let mut counts = vec![0u32; vels.len()];
            for partition in &mut island.partitions {
                let mut touched = Vec::new();
                for block in &mut partition.rigid {
                    let mut residual = ErrorAccumulator::default();
                    let read = if jacobi { start.clone() } else { vels.clone() };
                    block.solve(
                        false,
                        &mut residual,
                        |b| read[b.rigid_index().unwrap() as usize],
                        |b, before, after| {
                            let idx = b.rigid_index().unwrap() as usize;
                            if jacobi {
                                deltas[idx] += after - before;
                                touched.push(idx);
                            } else {
                                vels[idx] = after;
                            }
                        },
                    );
                }
                touched.sort_unstable();
                touched.dedup();
                for idx in touched {
                    counts[idx] += 1;
                }
            }
            if jacobi {
                for idx in 0..vels.len() {
                    if counts[idx] > 0 {
                        vels[idx] = start[idx] + deltas[idx] * (1.0 / counts[idx] as f64);
                    }
                }
            }
        };
        for _ in 0..desc.position_iterations {
            sweep(&mut vels, &mut island);
        }
        island.blocks_mut().for_each(ConstraintBlock::conclude);
        for _ in 0..desc.velocity_iterations {
            sweep(&mut vels, &mut island);
        }
        vels
    }

    #[test]
    fn one_slab_matches_gauss_seidel() {
        let mut p = prepare(
            sphere_row_step(9, 2.0),
            PipelineConfig::default(),
            &NullArticulationSolver,
            false,
        );
        let expected = reference_solve(&p, false);
        solve_all(&mut p, &mut NullArticulationSolver);
        for (got, want) in p.state.velocities.iter().zip(&expected) {
            assert_abs_diff_eq!(got.linear.x, want.linear.x, epsilon = 1e-9);
            assert_abs_diff_eq!(got.angular.z, want.angular.z, epsilon = 1e-9);
        }
        // momentum along the row is conserved by the contacts
        let momentum = |vels: &[Velocity]| -> f64 {
            vels.iter()
                .zip(&p.input.bodies)
                .map(|(v, b)| v.linear.x / b.inv_mass)
                .sum()
        };
        assert_abs_diff_eq!(momentum(&p.state.velocities), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn slab_per_partition_matches_jacobi() {
        let mut p = prepare(
            sphere_row_step(9, 2.0),
            PipelineConfig::default().with_partitions_per_slab(1),
            &NullArticulationSolver,
            false,
        );
        assert_eq!(p.plans[0].num_slabs(), 2);
        let expected = reference_solve(&p, true);
        solve_all(&mut p, &mut NullArticulationSolver);
        for (got, want) in p.state.velocities.iter().zip(&expected) {
            assert_abs_diff_eq!(got.linear.x, want.linear.x, epsilon = 1e-9);
        }
    }

    #[test]
    fn resting_box_absorbs_gravity() {
        let mut input = test_scenes::resting_box_input(Vec3::new(0.0, -9.81, 0.0));
        input.flags.residual_reporting = true;
        let mut p = prepare(input, PipelineConfig::default(), &NullArticulationSolver, false);
        solve_all(&mut p, &mut NullArticulationSolver);

        assert!(p.state.velocities[1].linear.y.abs() < 1e-4);
        // the ground was never touched by the solver
        assert_eq!(p.bufs.velocities[0], Velocity::default());
        assert_eq!(p.state.velocities[0], Velocity::default());

        let residual = &p.bufs.island_residuals[0];
        assert_eq!(residual.position_iterations.len(), 4);
        for pair in residual.position_iterations.windows(2) {
            assert!(pair[1].rms() <= pair[0].rms() + 1e-12);
        }
        assert!(residual.velocity.count > 0);

        // the contact carries the box's weight
        let total_force: f64 = p.bufs.contact_forces.iter().sum();
        assert_abs_diff_eq!(total_force, 9.81, epsilon = 1e-2);
    }

    #[test]
    fn kinematic_bodies_are_not_moved() {
        let mut input = test_scenes::resting_box_input(Vec3::new(0.0, -9.81, 0.0));
        let conveyor = Velocity::new(Vec3::new(1.0, 0.0, 0.0), Vec3::zero());
        input.bodies[0] = crate::SolverBodyDesc::kinematic(input.bodies[0].pose, conveyor);
        let mut p = prepare(input, PipelineConfig::default(), &NullArticulationSolver, false);
        solve_all(&mut p, &mut NullArticulationSolver);
        assert_eq!(p.bufs.velocities[0], conveyor);
        // friction drags the box along
        assert!(p.state.velocities[1].linear.x > 0.0);
    }

    #[test]
    fn friction_cadence() {
        let mut island = test_scenes::resting_box_input(Vec3::zero()).islands[0].clone();
        island.position_iterations = 5;
        island.velocity_iterations = 2;
        let config = PipelineConfig::default();
        let frictions = |flags: StepFlags| -> Vec<(bool, bool)> {
            IslandPlan::new(0, &island, &config, flags, 0, false)
                .ops()
                .into_iter()
                .scan(false, |in_velocity, op| {
                    if op == SolveOp::Conclude {
                        *in_velocity = true;
                    }
                    Some(match op {
                        SolveOp::SolvePartition { friction, .. } => Some((*in_velocity, friction)),
                        _ => None,
                    })
                })
                .flatten()
                .collect()
        };
        itertools::assert_equal(
            frictions(StepFlags::default()),
            [
                (false, false),
                (false, false),
                (false, true),
                (false, true),
                (false, true),
                (true, true),
                (true, true),
            ],
        );
        assert!(frictions(StepFlags {
            friction_every_iteration: true,
            ..Default::default()
        })
        .iter()
        .all(|(_, f)| *f));
    }

    #[test]
    fn last_velocity_iteration_defers_static_averaging() {
        let island = test_scenes::resting_box_input(Vec3::zero()).islands[0].clone();
        let config = PipelineConfig::default();
        let plan = IslandPlan::new(0, &island, &config, StepFlags::default(), 0, false);
        let ops = plan.ops();
        let propagates = ops.iter().filter(|op| **op == SolveOp::PropagateStatic).count();
        // four position iterations, the only velocity iteration skips it
        assert_eq!(propagates, 4);
        assert_eq!(
            ops.iter().rev().nth(1),
            Some(&SolveOp::FinalWriteBack {
                average_static: true
            })
        );
        // no partitions with work means nothing to launch for them
        let launch = plan.launch(&SolveOp::SolvePartition {
            partition: 0,
            friction: false,
        });
        assert_eq!(launch.map(|l| l.blocks), Some(0));
        assert_eq!(plan.launch(&SolveOp::CopyResiduals), None);
    }

    /// Two dynamic bodies in contact, the second moving into an articulation link.
    fn articulated_step() -> StepInput {
        let body = |x: f64| {
            crate::SolverBodyDesc::dynamic(
                crate::Pose::new(Vec3::new(x, 0.0, 0.0), crate::Rotor3::identity()),
                1.0,
                Vec3::new(0.4, 0.4, 0.4),
            )
        };
        let link = LinkRef {
            articulation: 0,
            link: 0,
        };
        let contact = |bodies: [ConstraintBody; 2], x: f64, manager: u32| ContactDesc {
            bodies,
            normal: Vec3::unit_x(),
            points: vec![ContactPoint {
                point: Vec3::new(x, 0.0, 0.0),
                separation: 0.0,
            }],
            friction: 0.0,
            restitution: 0.0,
            manager,
            force_threshold: None,
        };
        StepInput {
            dt: 1.0 / 60.0,
            gravity: Vec3::zero(),
            flags: StepFlags::default(),
            bodies: vec![
                body(0.0),
                body(1.0).with_velocity(Velocity::new(Vec3::new(1.0, 0.0, 0.0), Vec3::zero())),
            ],
            num_static_kinematic: 0,
            contacts: vec![
                contact([ConstraintBody::Rigid(1), ConstraintBody::Rigid(0)], 0.5, 0),
                contact([ConstraintBody::Link(link), ConstraintBody::Rigid(1)], 1.5, 1),
            ],
            joints: vec![],
            islands: vec![IslandDesc {
                bodies: vec![0, 1],
                partitions: vec![
                    PartitionDesc {
                        rigid_batches: vec![ConstraintBatch::contacts(vec![0])],
                        articulation_batches: vec![],
                    },
                    PartitionDesc {
                        rigid_batches: vec![],
                        articulation_batches: vec![ConstraintBatch::contacts(vec![1])],
                    },
                ],
                position_iterations: 1,
                velocity_iterations: 1,
                ..Default::default()
            }],
            destroyed_managers: vec![],
        }
    }

    #[test]
    fn articulation_call_order() {
        let mut arti = RecordingArticulations::new(1, 1.0);
        let mut p = prepare(articulated_step(), PipelineConfig::default(), &arti, false);
        solve_all(&mut p, &mut arti);

        let propagate = |velocity_iteration| Call::Propagate {
            velocity_iteration,
            static_blocks: 0,
            self_blocks: 0,
        };
        itertools::assert_equal(
            arti.calls.iter().cloned(),
            [
                Call::AverageDeltaV { partition: 0 },
                Call::AverageDeltaV { partition: 1 },
                propagate(false),
                Call::SaveVelocities,
                Call::AverageDeltaV { partition: 0 },
                Call::AverageDeltaV { partition: 1 },
                propagate(true),
            ],
        );
        // the link was pushed away from body 1
        let link = LinkRef {
            articulation: 0,
            link: 0,
        };
        assert!(arti.velocities[&link].linear.x > 0.0);
    }

    #[test]
    fn extended_solvers_run_every_iteration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut extended = ExtendedSolverRegistry::new();
        extended.register(Box::new(RecordingSolver {
            kind: ExtendedBodyKind::Cloth,
            log: log.clone(),
            push: Vec3::zero(),
        }));
        let mut arti = RecordingArticulations::new(1, 1.0);
        let mut p = prepare(articulated_step(), PipelineConfig::default(), &arti, true);
        solve_all_with(&mut p, &mut arti, &mut extended);

        use crate::solver::extended::recording::Call as ExtCall;
        // cloth sits out the velocity iteration but still updates, then finalizes
        itertools::assert_equal(
            log.lock().iter().cloned(),
            [
                ExtCall::Solve {
                    kind: ExtendedBodyKind::Cloth,
                    iteration: 0,
                    velocity: false,
                },
                ExtCall::Update {
                    kind: ExtendedBodyKind::Cloth,
                },
                ExtCall::Update {
                    kind: ExtendedBodyKind::Cloth,
                },
                ExtCall::Finalize {
                    kind: ExtendedBodyKind::Cloth,
                },
            ],
        );
        assert_eq!(
            arti.calls
                .iter()
                .filter(|c| **c == Call::OutputVelocity)
                .count(),
            2
        );
    }

    #[test]
    fn joint_breaks_above_limit() {
        let mut input = test_scenes::resting_box_input(Vec3::new(0.0, -9.81, 0.0));
        input.contacts.clear();
        input.islands[0].static_contacts.clear();
        // hold the box up with a vertical joint row to the ground
        input.joints = vec![JointDesc {
            bodies: [ConstraintBody::Rigid(1), ConstraintBody::Rigid(0)],
            rows: vec![JointRow::linear(
                Vec3::unit_y(),
                Vec3::zero(),
                Vec3::new(0.0, 0.5, 0.0),
                0.0,
            )],
            break_force: 5.0,
            break_torque: f64::MAX,
        }];
        input.islands[0].static_joints = vec![0];
        let config = PipelineConfig::default();
        let mut p = prepare(input.clone(), config, &NullArticulationSolver, false);
        solve_all(&mut p, &mut NullArticulationSolver);
        let record = p.bufs.joint_writeback[0];
        assert!(record.broken);
        assert_abs_diff_eq!(record.linear_impulse.y * 60.0, 9.81, epsilon = 1e-6);
        assert!(p.state.velocities[1].linear.y.abs() < 1e-9);

        input.joints[0].break_force = 20.0;
        let mut p = prepare(input, config, &NullArticulationSolver, false);
        solve_all(&mut p, &mut NullArticulationSolver);
        assert!(!p.bufs.joint_writeback[0].broken);
    }

    #[test]
    fn articulations_are_driven_without_contacts() {
        let mut input = test_scenes::resting_box_input(Vec3::new(0.0, -9.81, 0.0));
        input.flags.residual_reporting = true;
        let mut arti = RecordingArticulations::new(1, 1.0);
        let mut p = prepare(input, PipelineConfig::default(), &arti, false);
        solve_all(&mut p, &mut arti);

        let propagate = |velocity_iteration| Call::Propagate {
            velocity_iteration,
            static_blocks: 0,
            self_blocks: 0,
        };
        // nothing touches the links, so no delta averaging
        itertools::assert_equal(
            arti.calls.iter().cloned(),
            [
                propagate(false),
                propagate(false),
                propagate(false),
                propagate(false),
                Call::SaveVelocities,
                propagate(true),
            ],
        );
        assert_eq!(p.bufs.island_residuals[0].articulations.len(), 1);

        // a scene without articulations never calls into the solver
        let ops = IslandPlan::new(
            0,
            &p.input.islands[0],
            &p.config,
            p.input.flags,
            0,
            false,
        )
        .ops();
        assert!(!ops.iter().any(|op| matches!(
            op,
            SolveOp::PropagateArticulations { .. } | SolveOp::SaveArticulationVelocities
        )));
    }

    #[test]
    fn loose_articulation_blocks_reach_propagation() {
        let mut input = test_scenes::resting_box_input(Vec3::zero());
        let link = |link| LinkRef {
            articulation: 0,
            link,
        };
        // 33 links resting on the ground, one joint inside the articulation
        input.contacts.extend((0..33).map(|i| ContactDesc {
            bodies: [ConstraintBody::Link(link(i)), ConstraintBody::Rigid(0)],
            normal: Vec3::unit_y(),
            points: vec![ContactPoint {
                point: Vec3::new(i as f64, 0.0, 0.0),
                separation: 0.0,
            }],
            friction: 0.0,
            restitution: 0.0,
            manager: 10 + i,
            force_threshold: None,
        }));
        input.joints = vec![JointDesc {
            bodies: [ConstraintBody::Link(link(0)), ConstraintBody::Link(link(1))],
            rows: vec![JointRow::linear(Vec3::unit_x(), Vec3::zero(), Vec3::zero(), 0.0)],
            break_force: f64::MAX,
            break_torque: f64::MAX,
        }];
        input.islands[0].articulation_static_contacts = (1..34).collect();
        input.islands[0].articulation_self_joints = vec![0];

        let mut arti = RecordingArticulations::new(1, 1.0);
        let mut p = prepare(input, PipelineConfig::default(), &arti, false);
        let prepared = &p.bufs.islands[0];
        itertools::assert_equal(
            prepared.articulation_static.iter().map(|b| b.header.num_lanes),
            [32, 1],
        );
        itertools::assert_equal(
            prepared.articulation_self.iter().map(|b| b.header.kind),
            [BatchKind::Joint],
        );

        solve_all(&mut p, &mut arti);
        let propagates: Vec<&Call> = arti
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Propagate { .. }))
            .collect();
        assert_eq!(propagates.len(), 5);
        assert!(propagates.iter().all(|c| matches!(
            c,
            Call::Propagate {
                static_blocks: 2,
                self_blocks: 1,
                ..
            }
        )));
        // loose constraints count as articulation constraints for the averaging
        assert_eq!(
            arti.calls
                .iter()
                .filter(|c| **c == Call::AverageDeltaV { partition: 0 })
                .count(),
            5
        );
    }
}
