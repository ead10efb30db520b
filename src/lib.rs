mod accelerator;
mod batch;
mod checkpoint;
mod collective;
mod config;
mod controller;
mod device;
mod error;
mod module;
mod optim;
pub mod plugin;
mod precision;
mod state;
mod tensor;

pub use accelerator::Accelerator;
pub use batch::Batch;
pub use checkpoint::{
    CALLBACKS_KEY, Checkpoint, CheckpointIo, CheckpointTracker, CheckpointValue, DiskStateIo,
    HYPER_PARAMETERS_KEY, PersistErr, atomic_save, load_checkpoint,
};
pub use collective::{Mesh, MeshHandle, ReduceOp};
pub use config::{GLOBAL_SEED_VAR, HOSTED_PLATFORM_VAR, RuntimeEnv, SpawnConfig};
pub use controller::{RankInfo, RunController, WorkerContext};
pub use device::Device;
pub use error::{AccelErr, Result};
pub use module::{Module, ModuleErr, SharedModule, StateDict, StepArgs, StepOutput, share};
pub use optim::{LrScheduler, Optimizer, OptimizerSetup, StepClosure};
pub use plugin::{Scope, Stage, TrainingTypePlugin, single::SingleDevicePlugin, spawn::MeshSpawnPlugin};
pub use precision::{FullPrecisionPlugin, Precision, PrecisionPlugin};
pub use state::RunState;
pub use tensor::Tensor;
