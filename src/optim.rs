use crate::{
    module::{ModuleErr, StateDict},
    tensor::Tensor,
};

/// Loss-recomputation closure handed to `Optimizer::step`.
///
/// Some optimizer families re-evaluate the loss during the step; the
/// strategy supplies this closure so they can.
pub type StepClosure<'a> = dyn FnMut() -> Result<Option<Tensor>, ModuleErr> + 'a;

/// The concrete-optimizer boundary. Algorithms live outside this layer.
pub trait Optimizer: Send {
    /// Applies one parameter update.
    ///
    /// # Args
    /// * `closure` - Recomputes the loss for optimizers that need it.
    ///
    /// # Errors
    /// Propagates model failures raised inside the closure.
    fn step(&mut self, closure: &mut StepClosure<'_>) -> Result<(), ModuleErr>;

    /// Clears accumulated gradients.
    fn zero_grad(&mut self);

    /// Snapshots optimizer state for checkpointing.
    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }
}

/// The learning-rate schedule boundary.
pub trait LrScheduler: Send {
    /// Advances the schedule by one step.
    fn step(&mut self);
}

/// Optimizers, schedulers and per-optimizer step frequencies, built as
/// three parallel lists by the run controller.
#[derive(Default)]
pub struct OptimizerSetup {
    pub optimizers: Vec<Box<dyn Optimizer>>,
    pub lr_schedulers: Vec<Box<dyn LrScheduler>>,
    pub frequencies: Vec<usize>,
}
