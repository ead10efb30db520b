use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        mpsc::{self, Receiver, Sender},
    },
    thread,
};

use log::{debug, info, warn};

use crate::{
    checkpoint::{self, CALLBACKS_KEY, Checkpoint, CheckpointIo, DiskStateIo, PersistErr},
    collective::{Mesh, MeshHandle, ReduceOp},
    config::{RuntimeEnv, SpawnConfig},
    controller::{RankInfo, RunController, WorkerContext},
    device::Device,
    error::{AccelErr, Result},
    module::{Module, SharedModule, StateDict, share},
    plugin::TrainingTypePlugin,
    state::RunState,
    tensor::Tensor,
};

const RESCUE_WEIGHTS_FILE: &str = "rescue_weights.ckpt";

/// The fixed-order values the global-zero worker pushes after its run
/// stage. The parent drains exactly these three, in this order, once.
#[derive(Debug)]
enum TransferSlot {
    BestModelPath(Option<PathBuf>),
    LastModelPath(Option<PathBuf>),
    Results(Option<serde_json::Value>),
}

impl TransferSlot {
    fn kind(&self) -> &'static str {
        match self {
            TransferSlot::BestModelPath(_) => "best model path",
            TransferSlot::LastModelPath(_) => "last model path",
            TransferSlot::Results(_) => "run results",
        }
    }
}

/// Spawn-based strategy for the mesh accelerator family.
///
/// Dispatching a run spawns one worker per mesh core. Workers coordinate
/// through a fresh collective mesh, hand their results back over a
/// single-consumer channel created before the spawn, and rejoin before
/// control returns to the parent. `post_dispatch` then restores the
/// parent's model and tracker from what global zero produced.
pub struct MeshSpawnPlugin {
    cfg: SpawnConfig,
    env: RuntimeEnv,
    state_io: Arc<dyn CheckpointIo>,
    model: Option<SharedModule>,
    results: Option<serde_json::Value>,
    channel: Option<(Sender<TransferSlot>, Receiver<TransferSlot>)>,
    dispatched: bool,
    configure_sharded_hook: bool,
}

impl MeshSpawnPlugin {
    /// Creates a spawn strategy for the given topology, reading seed and
    /// platform identity from the process environment.
    pub fn new(cfg: SpawnConfig) -> Self {
        Self {
            cfg,
            env: RuntimeEnv::from_env(),
            state_io: Arc::new(DiskStateIo),
            model: None,
            results: None,
            channel: None,
            dispatched: false,
            configure_sharded_hook: true,
        }
    }

    /// Replaces the environment snapshot.
    pub fn with_runtime_env(mut self, env: RuntimeEnv) -> Self {
        self.env = env;
        self
    }

    /// Replaces the state-dict persistence backend.
    pub fn with_state_io(mut self, state_io: Arc<dyn CheckpointIo>) -> Self {
        self.state_io = state_io;
        self
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.cfg
    }

    /// Persists a state dict through the mesh-native save primitive.
    ///
    /// A missed save rendezvous is tolerated: the write lands before the
    /// rendezvous step, so valid data is on disk either way. Every other
    /// failure propagates.
    pub fn save(&self, state: &StateDict, path: &Path) -> std::result::Result<(), PersistErr> {
        save_state(self.state_io.as_ref(), state, path)
    }

    fn spawn_workers(&mut self, controller: &dyn RunController) -> Result<()> {
        let shared = self.model.clone().ok_or(AccelErr::MissingModel)?;
        let slot_tx = self.channel.get_or_insert_with(mpsc::channel).0.clone();

        let cfg = self.cfg.clone();
        let env = self.env.clone();
        let state_io = Arc::clone(&self.state_io);
        let world = cfg.world_size();
        let mesh = Mesh::new(world);

        self.dispatched = true;
        info!(world_size = world; "spawning mesh workers");

        let first_failure = thread::scope(|s| {
            let mut workers = Vec::with_capacity(world);
            for process_idx in 0..world {
                let module = shared.lock().boxed_clone();
                let comm = mesh.handle(process_idx);
                let slot_tx = slot_tx.clone();
                let state_io = Arc::clone(&state_io);
                let cfg = &cfg;
                let env = &env;
                workers.push(s.spawn(move || {
                    worker_main(
                        process_idx,
                        cfg,
                        env,
                        controller,
                        module,
                        comm,
                        slot_tx,
                        state_io.as_ref(),
                    )
                }));
            }

            let mut first_failure = None;
            for (process_idx, worker) in workers.into_iter().enumerate() {
                let failure = match worker.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(AccelErr::WorkerFailed {
                        global_rank: process_idx,
                    }),
                };
                if let Some(e) = failure {
                    warn!(global_rank = process_idx; "worker finished with error: {e}");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
            first_failure
        });

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl TrainingTypePlugin for MeshSpawnPlugin {
    fn on_gpu(&self) -> bool {
        false
    }

    fn root_device(&self) -> Device {
        Device::Mesh(0)
    }

    fn model_to_device(&self) -> Result<()> {
        let model = self.model.as_ref().ok_or(AccelErr::MissingModel)?;
        model.lock().to_device(Device::Mesh(0));
        Ok(())
    }

    // Once workers rejoin, the parent is the single authoritative
    // process. Collective calls outside the worker mesh validate their
    // arguments and behave as a world of one; in-run collectives go
    // through the `WorkerContext` handle each worker receives.
    fn is_global_zero(&self) -> bool {
        true
    }

    fn reduce(&self, tensor: Tensor, op: &str) -> Result<Tensor> {
        ReduceOp::parse(op)?;
        Ok(tensor)
    }

    fn barrier(&self, _name: &str) {}

    fn broadcast_bytes(&self, payload: Vec<u8>, _src: usize) -> Result<Vec<u8>> {
        Ok(payload)
    }

    fn all_gather(&self, tensor: &Tensor, _sync_grads: bool) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn connect(&mut self, model: SharedModule) {
        self.model = Some(model);
    }

    fn model(&self) -> Option<&SharedModule> {
        self.model.as_ref()
    }

    fn set_model(&mut self, model: SharedModule) {
        self.model = Some(model);
    }

    fn results(&self) -> Option<&serde_json::Value> {
        self.results.as_ref()
    }

    fn cache_results(&mut self, results: Option<serde_json::Value>) {
        self.results = results;
    }

    fn call_configure_sharded_model_hook(&self) -> bool {
        self.configure_sharded_hook
    }

    fn set_call_configure_sharded_model_hook(&mut self, mode: bool) {
        self.configure_sharded_hook = mode;
    }

    fn setup(&mut self, _controller: &dyn RunController) -> Result<()> {
        // The transfer channel must exist before any worker starts.
        self.channel = Some(mpsc::channel());
        Ok(())
    }

    // Workers wrap their model before building optimizers; constructing
    // them any earlier would bind pre-wrap parameter references.
    fn setup_optimizers_in_pre_dispatch(&self) -> bool {
        true
    }

    fn start_training(&mut self, controller: &dyn RunController) -> Result<()> {
        self.spawn_workers(controller)
    }

    fn start_evaluating(&mut self, controller: &dyn RunController) -> Result<()> {
        self.spawn_workers(controller)
    }

    fn start_predicting(&mut self, controller: &dyn RunController) -> Result<()> {
        self.spawn_workers(controller)
    }

    fn post_dispatch(&mut self, controller: &dyn RunController) -> Result<()> {
        if !self.dispatched {
            return Ok(());
        }
        self.dispatched = false;
        let Some((_slot_tx, slot_rx)) = self.channel.take() else {
            return Ok(());
        };

        let best = match recv_slot(&slot_rx, "best model path")? {
            TransferSlot::BestModelPath(path) => path,
            other => return Err(unexpected_slot("best model path", &other)),
        };
        let last = match recv_slot(&slot_rx, "last model path")? {
            TransferSlot::LastModelPath(path) => path,
            other => return Err(unexpected_slot("last model path", &other)),
        };
        let results = match recv_slot(&slot_rx, "run results")? {
            TransferSlot::Results(results) => results,
            other => return Err(unexpected_slot("run results", &other)),
        };

        if let Some(tracker) = controller.checkpoint_tracker() {
            tracker.set_best_model_path(best);
        }

        let fitting = controller.run_state() == RunState::Fitting;
        if fitting {
            if let Some(last) = &last {
                let state = self.state_io.load(last)?;
                let model = self.model.as_ref().ok_or(AccelErr::MissingModel)?;
                model.lock().load_state_dict(&state)?;
            }
        }

        self.results = results;

        // Weight recovery for platforms that kill the worker group on
        // completion: reload the rescue file, then delete it.
        if self.env.hosted_platform && fitting {
            let rescue = rescue_weights_path(&controller.default_root_dir());
            let state = self.state_io.load(&rescue)?;
            let model = self.model.as_ref().ok_or(AccelErr::MissingModel)?;
            model.lock().load_state_dict(&state)?;
            self.state_io.remove(&rescue)?;
        }

        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: Checkpoint, filepath: &Path) -> Result<()> {
        if !self.is_global_zero() {
            return Ok(());
        }

        let mut checkpoint = checkpoint;
        // Callback state is process-local runtime state, rebuilt on restore.
        checkpoint.remove(CALLBACKS_KEY);
        match checkpoint::atomic_save(&checkpoint, filepath) {
            Err(PersistErr::RendezvousMissed) => Ok(()),
            other => other.map_err(Into::into),
        }
    }
}

/// One worker's whole lifecycle: rank derivation, placement, deferred
/// optimizer construction, precision connect, the pre-run barrier, the
/// run stage, result transfer and the end barrier — in that order.
///
/// Everything the worker touches arrives through its arguments; nothing
/// is captured from ambient process state.
fn worker_main(
    process_idx: usize,
    cfg: &SpawnConfig,
    env: &RuntimeEnv,
    controller: &dyn RunController,
    mut module: Box<dyn Module>,
    comm: MeshHandle,
    slot_tx: Sender<TransferSlot>,
    state_io: &dyn CheckpointIo,
) -> Result<()> {
    let rank = RankInfo::from_topology(process_idx, cfg);
    let cx = WorkerContext::for_worker(rank, env.global_seed, comm.clone());
    if !cx.progress_enabled() {
        debug!(global_rank = rank.global_rank; "progress reporting disabled off global zero");
    }

    module.to_device(Device::Mesh(rank.local_rank));

    // Optimizers are built against the placed (and possibly wrapped)
    // model so their parameter references never point at pre-wrap state.
    let setup = controller.init_optimizers(module.as_ref());
    let mut precision = controller.make_precision();
    let (model, _optimizers, _lr_schedulers) =
        precision.connect(share(module), setup.optimizers, setup.lr_schedulers);

    comm.barrier("pre-run-stage");

    let (results, stage_failure) = {
        let mut guard = model.lock();
        match controller.run_stage(&mut **guard, &cx) {
            Ok(results) => (results, None),
            Err(e) => {
                warn!(global_rank = rank.global_rank; "run stage failed: {e}");
                (None, Some(e))
            }
        }
    };

    if env.hosted_platform && rank.is_global_zero() {
        // The hosted runtime reclaims the worker group right after the
        // stage ends; the weights must be on disk before that happens.
        warn!("writing rescue weights, do not interrupt");
        let path = rescue_weights_path(&controller.default_root_dir());
        if let Err(e) = save_state(state_io, &model.lock().state_dict(), &path) {
            warn!(global_rank = rank.global_rank; "rescue weight save failed: {e}");
        }
    }

    let best_model_path = controller
        .checkpoint_tracker()
        .and_then(|tracker| tracker.best_model_path());

    let mut last_model_path = None;
    if controller.run_state() == RunState::Fitting {
        if let Some(best) = &best_model_path {
            let path = last_weights_path(best);
            match save_state(state_io, &model.lock().state_dict(), &path) {
                Ok(()) => last_model_path = Some(path),
                Err(e) => warn!(global_rank = rank.global_rank; "last weight save failed: {e}"),
            }
        }
    }

    let mut transfer_failure = None;
    if rank.is_global_zero() {
        let slots = [
            TransferSlot::BestModelPath(best_model_path),
            TransferSlot::LastModelPath(last_model_path),
            TransferSlot::Results(results),
        ];
        for slot in slots {
            if slot_tx.send(slot).is_err() {
                transfer_failure = Some(AccelErr::ChannelClosed {
                    expected: "slot consumer",
                });
                break;
            }
        }
    }

    comm.barrier("end-process");

    // Failures surface only after the protocol completed, so one broken
    // worker cannot leave the rest stuck in a collective.
    if let Some(e) = stage_failure {
        return Err(e);
    }
    if let Some(e) = transfer_failure {
        return Err(e);
    }
    Ok(())
}

fn save_state(
    io: &dyn CheckpointIo,
    state: &StateDict,
    path: &Path,
) -> std::result::Result<(), PersistErr> {
    match io.save(state, path) {
        Err(PersistErr::RendezvousMissed) => Ok(()),
        other => other,
    }
}

fn recv_slot(rx: &Receiver<TransferSlot>, expected: &'static str) -> Result<TransferSlot> {
    rx.recv().map_err(|_| AccelErr::ChannelClosed { expected })
}

fn unexpected_slot(expected: &'static str, got: &TransferSlot) -> AccelErr {
    AccelErr::UnexpectedSlot {
        expected,
        got: got.kind(),
    }
}

fn rescue_weights_path(root: &Path) -> PathBuf {
    root.join(RESCUE_WEIGHTS_FILE)
}

fn last_weights_path(best: &Path) -> PathBuf {
    match best.to_str().and_then(|s| s.strip_suffix(".ckpt")) {
        Some(stem) => PathBuf::from(format!("{stem}.tmp_end.ckpt")),
        None => {
            let mut raw = best.as_os_str().to_owned();
            raw.push(".tmp_end.ckpt");
            PathBuf::from(raw)
        }
    }
}
