use std::path::PathBuf;

use rand::{SeedableRng, rngs::StdRng};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    checkpoint::CheckpointTracker,
    collective::{MeshHandle, ReduceOp},
    config::SpawnConfig,
    error::{AccelErr, Result},
    module::Module,
    optim::OptimizerSetup,
    precision::{FullPrecisionPlugin, PrecisionPlugin},
    state::RunState,
    tensor::Tensor,
};

/// A process's identity within the run topology. Recomputed every time a
/// worker starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankInfo {
    /// Index among the workers of this node.
    pub local_rank: usize,
    /// Unique index across all processes of the run.
    pub global_rank: usize,
    /// Total number of cooperating processes.
    pub world_size: usize,
}

impl RankInfo {
    /// The identity of a run without worker processes.
    pub fn single_process() -> Self {
        Self {
            local_rank: 0,
            global_rank: 0,
            world_size: 1,
        }
    }

    /// Derives a worker's identity from its process index and the
    /// spawn topology.
    pub fn from_topology(process_idx: usize, cfg: &SpawnConfig) -> Self {
        Self {
            local_rank: process_idx % cfg.num_processes(),
            global_rank: process_idx,
            world_size: cfg.world_size(),
        }
    }

    /// Whether this process is rank zero across all nodes: the sole
    /// checkpoint writer and source of authoritative results.
    pub fn is_global_zero(&self) -> bool {
        self.global_rank == 0
    }
}

/// Per-worker execution context threaded into `run_stage`.
///
/// Carries everything a run needs to know about where it executes: the
/// rank identity, whether progress reporting is enabled (rank zero only),
/// the shared seed, and the collective handle for in-run coordination.
/// Collaborators read this context instead of ambient process state.
#[derive(Clone)]
pub struct WorkerContext {
    rank: RankInfo,
    progress_enabled: bool,
    seed: Option<u64>,
    comm: Option<MeshHandle>,
}

impl WorkerContext {
    /// Context of an in-process run with no worker topology.
    pub fn single_process() -> Self {
        Self {
            rank: RankInfo::single_process(),
            progress_enabled: true,
            seed: None,
            comm: None,
        }
    }

    /// Context of a spawned worker. Progress reporting is enabled on
    /// global rank zero only, so N ranks never duplicate console output.
    pub fn for_worker(rank: RankInfo, seed: Option<u64>, comm: MeshHandle) -> Self {
        Self {
            progress_enabled: rank.is_global_zero(),
            rank,
            seed,
            comm: Some(comm),
        }
    }

    pub fn rank(&self) -> RankInfo {
        self.rank
    }

    pub fn progress_enabled(&self) -> bool {
        self.progress_enabled
    }

    /// Returns the shared seed, when the environment designates one.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Builds this worker's RNG. Seeded workers across the run produce
    /// identical streams, which data-parallel reproducibility requires.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    /// Blocks until every worker reaches the named rendezvous point.
    /// No-op without a worker topology.
    pub fn barrier(&self, name: &str) {
        if let Some(comm) = &self.comm {
            comm.barrier(name);
        }
    }

    /// Reduces `tensor` across all workers.
    ///
    /// # Args
    /// * `tensor` - The per-worker contribution; same shape on every rank.
    /// * `op` - `sum`, `mean` or `avg`, case-insensitive.
    ///
    /// # Errors
    /// Returns `AccelErr::InvalidReduceOp` for any other op name, before
    /// any collective call is made.
    pub fn reduce(&self, tensor: Tensor, op: &str) -> Result<Tensor> {
        let op = ReduceOp::parse(op)?;
        let Some(comm) = &self.comm else {
            return Ok(tensor);
        };

        let device = tensor.device();
        let mut summed = comm.sum_reduce(tensor.data());
        if op == ReduceOp::Mean {
            let world = comm.world_size() as f32;
            for value in &mut summed {
                *value /= world;
            }
        }
        Ok(Tensor::new(summed, device))
    }

    /// Aggregates a boolean decision across all workers: true only when
    /// every rank agreed (unanimity, not majority).
    pub fn reduce_decision(&self, decision: bool) -> bool {
        let Some(comm) = &self.comm else {
            return decision;
        };

        let summed = comm.sum_reduce(&[if decision { 1.0 } else { 0.0 }]);
        summed[0] as usize == comm.world_size()
    }

    /// Gathers `tensor` from every worker, stacked in rank order.
    pub fn all_gather(&self, tensor: &Tensor, _sync_grads: bool) -> Tensor {
        let Some(comm) = &self.comm else {
            return tensor.clone();
        };

        let rows = comm.all_gather(tensor.data());
        Tensor::new(rows.concat(), tensor.device())
    }

    /// Broadcasts a serializable value from `src` to every worker.
    ///
    /// The value is serialized to bytes and carried through the mesh's
    /// tensor collective, since the device family has no native
    /// arbitrary-object broadcast.
    pub fn broadcast<T>(&self, value: &T, src: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = serde_json::to_vec(value).map_err(AccelErr::Serialization)?;
        let Some(comm) = &self.comm else {
            return serde_json::from_slice(&payload).map_err(AccelErr::Serialization);
        };

        let bytes = comm.broadcast_bytes(&payload, src);
        serde_json::from_slice(&bytes).map_err(AccelErr::Serialization)
    }
}

/// The epoch/batch iteration loop that calls into this layer.
///
/// Strategies dispatch into it exactly once per run via `run_stage`; in
/// spawn execution that call happens once per worker with that worker's
/// model copy and context.
pub trait RunController: Send + Sync {
    /// Returns the current run state.
    fn run_state(&self) -> RunState;

    /// Runs the active stage (fit/validate/test/predict loop) to
    /// completion.
    ///
    /// # Args
    /// * `module` - The model copy owned by the calling process.
    /// * `cx` - The worker execution context.
    ///
    /// # Returns
    /// The stage's results, opaque to the execution layer.
    ///
    /// # Errors
    /// Propagates loop-level failures; spawn strategies surface them
    /// after the transfer protocol completes.
    fn run_stage(
        &self,
        module: &mut dyn Module,
        cx: &WorkerContext,
    ) -> Result<Option<serde_json::Value>>;

    /// Builds optimizers, schedulers and step frequencies for `module`.
    fn init_optimizers(&self, module: &dyn Module) -> OptimizerSetup;

    /// The attached checkpoint-tracking collaborator, if any.
    fn checkpoint_tracker(&self) -> Option<&dyn CheckpointTracker> {
        None
    }

    /// Root directory for run artifacts (rescue checkpoints land here).
    fn default_root_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }

    /// Creates the precision plugin each worker connects after placing
    /// its model.
    fn make_precision(&self) -> Box<dyn PrecisionPlugin> {
        Box::new(FullPrecisionPlugin)
    }
}
