//! The host-facing solver pipeline.
//!
//! One [`SolverPipeline::step`] issues a whole step onto two queues:
//! the compute queue runs upload, preparation, the island solves, integration
//! and the threshold pass, while the download queue waits for the compute queue's
//! `solve_done` event and copies the results to host memory.
//! The next step's upload waits for the body state download of the previous one,
//! so compute of step N+1 overlaps with the rest of the download of step N.
//!
//! Results are collected with [`SolverPipeline::sync_dma_back`],
//! which spins on a pinned completion flag before falling back to a blocking wait.

use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

use crate::{
    device::{
        arena::DeviceArena,
        block_dim,
        queue::{Event, PinnedFlag, Queue},
        DeviceContext, KernelLaunch,
    },
    math::{Pose, Velocity},
    solver::{
        articulation::ArticulationSolver,
        extended::{ExtendedPrepareDesc, ExtendedSolverRegistry},
        integrate::{self, BodyState, Stabilization},
        partitioned::{
            run_op, BufferSizes, ConstraintWriteback, IslandPlan, SolveEnv, SolverBuffers,
        },
        prepare::{BlockCounts, FrictionAnchors, PrepareContext, PreparedIsland},
        residual::IslandResidual,
        threshold::{
            process_threshold_stream, ThresholdChange, ThresholdHistory, ThresholdOutput,
        },
        BatchKind, ConstraintBody, StepInput,
    },
    DeviceError, PipelineConfig, PipelineError,
};

/// Steps that may be issued before [`SolverPipeline::sync_dma_back`] has to be called.
pub const MAX_STEPS_IN_FLIGHT: usize = 2;

/// Everything a step produces, as downloaded to the host.
#[derive(Clone, Debug, Default)]
pub struct StepOutput {
    /// Number of the step, starting at 1.
    pub step: u64,
    pub poses: Vec<Pose>,
    pub velocities: Vec<Velocity>,
    /// One record per joint of the step input.
    pub joint_writeback: Vec<ConstraintWriteback>,
    /// Normal force of every contact point, in the order of the step's contacts.
    pub contact_forces: Vec<f64>,
    /// Body pairs whose force threshold state changed since the previous step.
    pub changed_thresholds: Vec<ThresholdChange>,
    /// Number of body pairs currently above their threshold.
    pub num_exceeded: usize,
    /// Only filled with [`StepFlags::residual_reporting`][crate::StepFlags::residual_reporting].
    pub island_residuals: Vec<IslandResidual>,
}

/// State carried across steps, shared between the host and the queue workers.
struct Shared {
    arena: Mutex<DeviceArena>,
    articulation: Mutex<Box<dyn ArticulationSolver>>,
    extended: Mutex<ExtendedSolverRegistry>,
    body_state: Mutex<BodyState>,
    anchors: Mutex<FrictionAnchors>,
    thresholds: Mutex<ThresholdHistory>,
}

/// Device buffers and host data of one step.
struct StepFrame {
    input: Arc<StepInput>,
    /// `None` if allocation failed; kernels of the step then do nothing.
    buffers: Option<SolverBuffers>,
    point_offsets: Vec<u32>,
    had_interactions: Vec<bool>,
    threshold: ThresholdOutput,
}

type FrameRef = Arc<Mutex<StepFrame>>;

struct PendingStep {
    step: u64,
    result: Arc<Mutex<StepOutput>>,
}

pub struct SolverPipeline {
    ctx: DeviceContext,
    config: PipelineConfig,
    shared: Arc<Shared>,
    compute: Queue,
    download: Queue,
    solve_done: Event,
    body_state_released: Event,
    completion: PinnedFlag,
    step_count: u64,
    pending: VecDeque<PendingStep>,
}

impl std::fmt::Debug for SolverPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverPipeline")
            .field("config", &self.config)
            .field("step_count", &self.step_count)
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

impl SolverPipeline {
    /// Create a pipeline with its own device context.
    pub fn new(
        config: PipelineConfig,
        articulation: Box<dyn ArticulationSolver>,
        extended: ExtendedSolverRegistry,
    ) -> Self {
        Self::with_context(
            DeviceContext::new(config.sync_checks),
            config,
            articulation,
            extended,
        )
    }

    /// Create a pipeline on an existing device context.
    ///
    /// Sync checks are a property of the context;
    /// `config.sync_checks` only applies to contexts created by [`new`][Self::new].
    pub fn with_context(
        ctx: DeviceContext,
        config: PipelineConfig,
        articulation: Box<dyn ArticulationSolver>,
        extended: ExtendedSolverRegistry,
    ) -> Self {
        let shared = Arc::new(Shared {
            arena: Mutex::new(DeviceArena::new(ctx.clone(), config.device_memory_bytes)),
            articulation: Mutex::new(articulation),
            extended: Mutex::new(extended),
            body_state: Mutex::new(BodyState::default()),
            anchors: Mutex::new(FrictionAnchors::default()),
            thresholds: Mutex::new(ThresholdHistory::default()),
        });
        Self {
            compute: Queue::new("compute", ctx.clone()),
            download: Queue::new("download", ctx.clone()),
            ctx,
            config,
            shared,
            solve_done: Event::new(),
            body_state_released: Event::new(),
            completion: PinnedFlag::new(),
            step_count: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn steps_in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Largest amount of device memory any step has used so far.
    pub fn device_memory_high_water(&self) -> usize {
        self.shared.arena.lock().high_water_bytes()
    }

    /// Block until both queues have executed everything issued to them.
    pub fn wait_idle(&self) {
        self.compute.synchronize();
        self.download.synchronize();
    }

    //
    // Issuing work
    //

    fn kernel<F>(
        &self,
        launch: KernelLaunch,
        frame: &FrameRef,
        kernel: F,
    ) -> Result<(), DeviceError>
    where
        F: FnOnce(&mut StepFrame, &Shared) + Send + 'static,
    {
        let frame = frame.clone();
        let shared = self.shared.clone();
        self.compute.launch(launch, move || {
            kernel(&mut frame.lock(), &shared);
            Ok(())
        })
    }

    fn copy<F>(
        &self,
        name: &'static str,
        frame: &FrameRef,
        transfer: F,
    ) -> Result<(), DeviceError>
    where
        F: FnOnce(&mut StepFrame, &Shared) + Send + 'static,
    {
        let frame = frame.clone();
        let shared = self.shared.clone();
        self.compute.copy(name, move || {
            transfer(&mut frame.lock(), &shared);
            Ok(())
        })
    }

    /// Issue a step.
    ///
    /// Returns the step number, which [`sync_dma_back`][Self::sync_dma_back]
    /// reports back with the step's results.
    pub fn step(&mut self, input: StepInput) -> Result<u64, PipelineError> {
        let _span = crate::tracy_span!("issue step", "step");
        if self.pending.len() >= MAX_STEPS_IN_FLIGHT {
            return Err(PipelineError::TooManyStepsInFlight);
        }
        input.validate()?;
        if cfg!(debug_assertions) {
            if let Some((island, partition)) = input.find_partition_conflict() {
                return Err(PipelineError::InvalidInput(format!(
                    "partition {} of island {} touches a dynamic body twice",
                    partition, island
                )));
            }
        }

        self.step_count += 1;
        let step = self.step_count;
        let input = Arc::new(input);
        let counts = BlockCounts::of(&input.islands);
        let has_extended = !self.shared.extended.lock().is_empty();
        let num_articulations = self.shared.articulation.lock().num_articulations();
        let plans: Vec<Arc<IslandPlan>> = input
            .islands
            .iter()
            .enumerate()
            .map(|(idx, island)| {
                Arc::new(IslandPlan::new(
                    idx as u32,
                    island,
                    &self.config,
                    input.flags,
                    num_articulations,
                    has_extended,
                ))
            })
            .collect();
        log::debug!(
            "step {}: {} bodies, {} islands, {} batches",
            step,
            input.bodies.len(),
            plans.len(),
            counts.total_batches()
        );

        let frame: FrameRef = Arc::new(Mutex::new(StepFrame {
            input: input.clone(),
            buffers: None,
            point_offsets: Vec::new(),
            had_interactions: Vec::new(),
            threshold: ThresholdOutput::default(),
        }));

        self.compute.wait(&self.body_state_released)?;
        self.issue_upload(&frame, &plans)?;
        self.issue_prepare(&frame, &input, counts, has_extended, num_articulations)?;
        for plan in &plans {
            self.issue_island(&frame, plan)?;
        }
        self.issue_integrate(&frame, &input)?;
        if input.flags.has_force_thresholds {
            let num_threshold_contacts = input
                .contacts
                .iter()
                .filter(|c| c.force_threshold.is_some())
                .count();
            let max_node = input.bodies.len() as u32 + num_articulations;
            self.kernel(
                KernelLaunch::for_threads(
                    "process_force_thresholds",
                    num_threshold_contacts.max(1),
                    block_dim::THRESHOLD,
                ),
                &frame,
                move |frame, shared| {
                    if let Some(bufs) = &frame.buffers {
                        let mut history = shared.thresholds.lock();
                        let output = process_threshold_stream(
                            &bufs.threshold_stream,
                            history.previous(),
                            max_node,
                        );
                        history.advance(output.exceeded.clone());
                        frame.threshold = output;
                    }
                },
            )?;
        }
        self.compute.record(&self.solve_done)?;

        let result = Arc::new(Mutex::new(StepOutput {
            step,
            ..Default::default()
        }));
        self.issue_download(&frame, &result, step)?;
        self.pending.push_back(PendingStep { step, result });
        Ok(step)
    }

    fn issue_upload(
        &self,
        frame: &FrameRef,
        plans: &[Arc<IslandPlan>],
    ) -> Result<(), DeviceError> {
        let num_slabs = plans.iter().map(|p| p.num_slabs()).max().unwrap_or(1);
        self.copy("upload", frame, move |frame, shared| {
            let input = frame.input.clone();
            shared.body_state.lock().resize(input.bodies.len());

            let mut offset = 0;
            frame.point_offsets = input
                .contacts
                .iter()
                .map(|c| {
                    let start = offset;
                    offset += c.points.len() as u32;
                    start
                })
                .collect();
            frame.had_interactions = vec![false; input.bodies.len()];
            let constraint_bodies = input
                .contacts
                .iter()
                .map(|c| c.bodies)
                .chain(input.joints.iter().map(|j| j.bodies));
            for body in constraint_bodies.flatten() {
                if let ConstraintBody::Rigid(idx) = body {
                    frame.had_interactions[idx as usize] = true;
                }
            }

            let mut arena = shared.arena.lock();
            arena.retire();
            // a failed allocation is already on the diagnostic channel
            frame.buffers = SolverBuffers::allocate(
                &mut arena,
                BufferSizes {
                    num_bodies: input.bodies.len(),
                    num_slabs,
                    num_joints: input.joints.len(),
                    num_contact_points: offset as usize,
                },
            )
            .ok();
            if let Some(bufs) = &mut frame.buffers {
                bufs.islands = input
                    .islands
                    .iter()
                    .map(|island| PreparedIsland::with_partitions(island.partitions.len()))
                    .collect();
            }
        })
    }

    fn issue_prepare(
        &self,
        frame: &FrameRef,
        input: &StepInput,
        counts: BlockCounts,
        has_extended: bool,
        num_articulations: u32,
    ) -> Result<(), DeviceError> {
        let num_bodies = input.bodies.len();
        let num_static = input.num_static_kinematic as usize;
        let config = self.config;

        self.kernel(
            KernelLaunch::for_threads(
                "reset_patch_counts",
                input.destroyed_managers.len(),
                block_dim::BODIES,
            ),
            frame,
            |frame, shared| {
                shared
                    .anchors
                    .lock()
                    .reset_patch_counts(&frame.input.destroyed_managers);
            },
        )?;
        self.kernel(
            KernelLaunch::for_threads("pre_integrate", num_bodies, block_dim::BODIES),
            frame,
            |frame, _| {
                let StepFrame { input, buffers, .. } = frame;
                if let Some(bufs) = buffers {
                    integrate::pre_integrate(
                        &input.bodies,
                        &mut bufs.velocities,
                        input.gravity,
                        input.dt,
                    );
                }
            },
        )?;
        self.kernel(
            KernelLaunch::for_threads("init_static_kinematic", num_static, block_dim::BODIES),
            frame,
            |frame, shared| {
                let input = &frame.input;
                integrate::init_static_kinematic(
                    &input.bodies,
                    input.num_static_kinematic,
                    &mut shared.body_state.lock(),
                );
            },
        )?;
        if has_extended {
            self.kernel(
                KernelLaunch::new("prepare_extended_bodies", 1),
                frame,
                move |frame, shared| {
                    let input = &frame.input;
                    let poses: Vec<Pose> = input.bodies.iter().map(|b| b.pose).collect();
                    let inv_masses: Vec<f64> = input.bodies.iter().map(|b| b.inv_mass).collect();
                    let desc = ExtendedPrepareDesc {
                        dt: input.dt,
                        gravity: input.gravity,
                        bias_coefficient: config.bias_coefficient,
                        body_poses: &poses,
                        body_inv_masses: &inv_masses,
                    };
                    shared.extended.lock().prepare_all(
                        &desc,
                        1.0 / input.dt,
                        input.bodies.len() as u32,
                        num_articulations,
                    );
                },
            )?;
        }

        let partitioned = [
            ("prepare_contact_blocks", counts.rigid_contact_batches, false, BatchKind::Contact),
            ("prepare_joint_blocks", counts.rigid_joint_batches, false, BatchKind::Joint),
            (
                "prepare_articulation_contact_blocks",
                counts.articulation_contact_batches,
                true,
                BatchKind::Contact,
            ),
            (
                "prepare_articulation_joint_blocks",
                counts.articulation_joint_batches,
                true,
                BatchKind::Joint,
            ),
        ];
        for (name, batches, articulation_batches, kind) in partitioned {
            self.kernel(
                KernelLaunch::for_batches(name, batches),
                frame,
                move |frame, shared| {
                    with_prepare_context(frame, shared, &config, |ctx, input, islands, anchors| {
                        for (island, prepared) in input.islands.iter().zip(islands) {
                            for (c, partition) in island.partitions.iter().enumerate() {
                                let (batches, out) = if articulation_batches {
                                    (
                                        &partition.articulation_batches,
                                        &mut prepared.partitions[c].articulation,
                                    )
                                } else {
                                    (&partition.rigid_batches, &mut prepared.partitions[c].rigid)
                                };
                                out.extend(ctx.prepare_batches(batches, kind, c as u32, anchors));
                            }
                        }
                    })
                },
            )?;
        }

        self.kernel(
            KernelLaunch::for_threads(
                "prepare_articulation_loose",
                counts.articulation_loose(),
                block_dim::PREPARE,
            ),
            frame,
            move |frame, shared| {
                with_prepare_context(frame, shared, &config, |ctx, input, islands, anchors| {
                    for (island, prepared) in input.islands.iter().zip(islands) {
                        prepared.articulation_static = ctx.prepare_loose(
                            &island.articulation_static_contacts,
                            &island.articulation_static_joints,
                            anchors,
                        );
                        prepared.articulation_self = ctx.prepare_loose(
                            &island.articulation_self_contacts,
                            &island.articulation_self_joints,
                            anchors,
                        );
                    }
                })
            },
        )?;
        self.kernel(
            KernelLaunch::for_threads(
                "prepare_static_slabs",
                counts.static_constraints,
                block_dim::PREPARE,
            ),
            frame,
            move |frame, shared| {
                with_prepare_context(frame, shared, &config, |ctx, input, islands, anchors| {
                    for (island, prepared) in input.islands.iter().zip(islands) {
                        prepared.static_slabs =
                            ctx.prepare_static_slabs(island, input.num_static_kinematic, anchors);
                    }
                })
            },
        )
    }

    /// Issue every op of an island's solve program in order.
    fn issue_island(&self, frame: &FrameRef, plan: &Arc<IslandPlan>) -> Result<(), DeviceError> {
        let config = self.config;
        for op in plan.ops() {
            let plan_ref = plan.clone();
            let run = move |frame: &mut StepFrame, shared: &Shared| {
                let StepFrame { input, buffers, .. } = frame;
                let bufs = match buffers {
                    Some(bufs) => bufs,
                    None => return,
                };
                let mut articulation = shared.articulation.lock();
                let mut extended = shared.extended.lock();
                let mut body_state = shared.body_state.lock();
                let mut env = SolveEnv {
                    bodies: &input.bodies,
                    num_static_kinematic: input.num_static_kinematic,
                    contacts: &input.contacts,
                    dt: input.dt,
                    config: &config,
                    flags: input.flags,
                    articulation: &mut **articulation,
                    extended: &mut extended,
                    body_state: &mut body_state,
                };
                run_op(op, &plan_ref, bufs, &mut env);
            };
            match plan.launch(&op) {
                Some(launch) => self.kernel(launch, frame, run)?,
                None => self.copy("copy_residuals", frame, run)?,
            }
        }
        Ok(())
    }

    fn issue_integrate(&self, frame: &FrameRef, input: &StepInput) -> Result<(), DeviceError> {
        let config = self.config;
        let num_dynamic = input.bodies.len() - input.num_static_kinematic as usize;
        self.kernel(
            KernelLaunch::for_threads("integrate", num_dynamic, block_dim::BODIES),
            frame,
            move |frame, shared| {
                if frame.buffers.is_none() {
                    return;
                }
                let input = &frame.input;
                let stabilization = input.flags.enable_stabilization.then(|| Stabilization {
                    threshold: config.stabilization_threshold,
                    damping: config.stabilization_damping,
                });
                integrate::integrate(
                    &input.bodies,
                    input.num_static_kinematic,
                    &frame.had_interactions,
                    input.dt,
                    stabilization,
                    &mut shared.body_state.lock(),
                );
            },
        )
    }

    fn issue_download(
        &self,
        frame: &FrameRef,
        result: &Arc<Mutex<StepOutput>>,
        step: u64,
    ) -> Result<(), DeviceError> {
        self.download.wait(&self.solve_done)?;
        {
            let shared = self.shared.clone();
            let result = result.clone();
            self.download.copy("download_bodies", move || {
                let state = shared.body_state.lock();
                let mut out = result.lock();
                out.poses = state.poses.clone();
                out.velocities = state.velocities.clone();
                Ok(())
            })?;
        }
        self.download.record(&self.body_state_released)?;
        {
            let frame = frame.clone();
            let result = result.clone();
            self.download.copy("download_results", move || {
                let frame = frame.lock();
                let mut out = result.lock();
                if let Some(bufs) = &frame.buffers {
                    debug_assert!(bufs.threshold_stream.len() >= frame.threshold.exceeded.len());
                    out.joint_writeback = bufs.joint_writeback.to_vec();
                    out.contact_forces = bufs.contact_forces.to_vec();
                    out.island_residuals = bufs.island_residuals.clone();
                }
                out.changed_thresholds = frame.threshold.changes.clone();
                out.num_exceeded = frame.threshold.exceeded.len();
                Ok(())
            })?;
        }
        self.download.write_flag(&self.completion, step)
    }

    //
    // Collecting results
    //

    /// Wait for the oldest step in flight and return its results.
    ///
    /// In abort mode the step's threshold outputs are zeroed
    /// and the exceeded-pair history is dropped.
    pub fn sync_dma_back(&mut self) -> Result<StepOutput, PipelineError> {
        let _span = crate::tracy_span!("sync dma back", "sync_dma_back");
        let pending = self
            .pending
            .pop_front()
            .ok_or(PipelineError::NoStepInFlight)?;
        if !self
            .completion
            .spin_wait(pending.step, self.config.spin_wait_timeout)
        {
            log::warn!(
                "step {} not done after spinning {:?}, falling back to a blocking wait",
                pending.step,
                self.config.spin_wait_timeout
            );
            self.download.synchronize();
        }

        let mut output = std::mem::take(&mut *pending.result.lock());
        if self.ctx.is_in_abort_mode() {
            log::warn!(
                "device in abort mode, dropping force threshold output of step {}",
                pending.step
            );
            output.changed_thresholds.clear();
            output.num_exceeded = 0;
            self.shared.thresholds.lock().clear();
        }
        Ok(output)
    }
}

/// Run `f` with a preparation context over the frame's buffers.
fn with_prepare_context<F>(
    frame: &mut StepFrame,
    shared: &Shared,
    config: &PipelineConfig,
    f: F,
) where
    F: FnOnce(&PrepareContext<'_>, &StepInput, &mut [PreparedIsland], &mut FrictionAnchors),
{
    let StepFrame {
        input,
        buffers,
        point_offsets,
        ..
    } = frame;
    let SolverBuffers {
        velocities,
        islands,
        ..
    } = match buffers {
        Some(bufs) => bufs,
        None => return,
    };
    let articulation = shared.articulation.lock();
    let mut anchors = shared.anchors.lock();
    let ctx = PrepareContext {
        bodies: &input.bodies,
        velocities,
        contacts: &input.contacts,
        joints: &input.joints,
        point_offsets,
        articulation: &**articulation,
        config,
        dt: input.dt,
    };
    f(&ctx, input, islands, &mut anchors);
}
