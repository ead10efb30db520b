use std::{collections::BTreeMap, error::Error, fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{batch::Batch, device::Device, tensor::Tensor};

/// Named parameter buffers, the unit of weight persistence and transfer.
pub type StateDict = BTreeMap<String, Vec<f32>>;

/// The numerical model boundary.
///
/// Implementations encapsulate all forward/backward tensor math. The
/// execution layer treats this trait as a black box: it places the model
/// on devices, drives its step methods, and moves its weights across
/// process boundaries as state dicts.
pub trait Module: Send {
    /// Executes one training step on the given batch.
    ///
    /// # Args
    /// * `args` - The batch and its loop-level indices.
    ///
    /// # Returns
    /// The step output, typically carrying a loss tensor.
    ///
    /// # Errors
    /// Returns `ModuleErr` on shape or domain violations.
    fn training_step(&mut self, args: &StepArgs) -> Result<StepOutput, ModuleErr>;

    /// Executes one validation step on the given batch.
    fn validation_step(&mut self, args: &StepArgs) -> Result<StepOutput, ModuleErr>;

    /// Executes one test step on the given batch.
    fn test_step(&mut self, args: &StepArgs) -> Result<StepOutput, ModuleErr>;

    /// Executes one prediction step on the given batch.
    fn predict_step(&mut self, args: &StepArgs) -> Result<StepOutput, ModuleErr>;

    /// Backpropagates the given loss through the model.
    fn backward(&mut self, loss: &Tensor) -> Result<(), ModuleErr>;

    /// Snapshots the model weights.
    fn state_dict(&self) -> StateDict;

    /// Restores the model weights from a snapshot.
    ///
    /// # Errors
    /// Returns `ModuleErr::ShapeMismatch` when `state` does not match the
    /// model's parameter layout.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModuleErr>;

    /// Moves the model parameters to `device`.
    fn to_device(&mut self, device: Device);

    /// Returns the device the model currently lives on.
    fn device(&self) -> Device;

    /// Clones the model behind the trait object boundary.
    ///
    /// Spawn strategies use this to hand every worker its own copy; the
    /// copies are discarded at teardown in favor of the authoritative
    /// checkpointed weights.
    fn boxed_clone(&self) -> Box<dyn Module>;
}

/// A model handle shared between the caller and the strategy.
///
/// There is exactly one logical model per run; the strategy may replace
/// the handle with a wrapped model during setup.
pub type SharedModule = Arc<Mutex<Box<dyn Module>>>;

/// Wraps a module into a shareable handle.
pub fn share(module: Box<dyn Module>) -> SharedModule {
    Arc::new(Mutex::new(module))
}

/// Positional arguments of a step call.
#[derive(Debug, Clone, PartialEq)]
pub struct StepArgs {
    /// The batch; moved to the strategy root device before dispatch.
    pub batch: Batch,
    pub batch_idx: usize,
    /// Present when training with multiple optimizers.
    pub optimizer_idx: Option<usize>,
    /// Present when evaluating with multiple dataloaders.
    pub dataloader_idx: Option<usize>,
}

impl StepArgs {
    pub fn new(batch: Batch, batch_idx: usize) -> Self {
        Self {
            batch,
            batch_idx,
            optimizer_idx: None,
            dataloader_idx: None,
        }
    }
}

/// Output of a single step call. Opaque to the execution layer beyond
/// the optional loss it threads into backward.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutput {
    pub loss: Option<Tensor>,
    pub log: BTreeMap<String, f32>,
}

impl StepOutput {
    pub fn from_loss(loss: Tensor) -> Self {
        Self {
            loss: Some(loss),
            log: BTreeMap::new(),
        }
    }
}

/// Errors produced by model implementations.
#[derive(Debug)]
pub enum ModuleErr {
    /// An input is invalid for semantic or domain reasons.
    InvalidInput(&'static str),

    /// A shape invariant was violated (e.g. mismatched lengths).
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
}

impl fmt::Display for ModuleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleErr::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ModuleErr::ShapeMismatch {
                what,
                got,
                expected,
            } => {
                write!(f, "shape mismatch for {what}: got {got}, expected {expected}")
            }
        }
    }
}

impl Error for ModuleErr {}
