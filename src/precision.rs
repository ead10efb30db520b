use crate::{
    error::Result,
    module::SharedModule,
    optim::{LrScheduler, Optimizer},
    plugin::{Scope, Stage},
    tensor::Tensor,
};

/// Numeric precision a precision plugin applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Half,
    Full,
    Double,
}

impl Precision {
    pub fn bits(self) -> u8 {
        match self {
            Precision::Half => 16,
            Precision::Full => 32,
            Precision::Double => 64,
        }
    }
}

/// Applies numeric-precision policy around forward/backward calls.
///
/// A peer of the training-type plugin: the accelerator composes exactly
/// one of each and never inspects the concrete type beyond capability
/// queries.
pub trait PrecisionPlugin: Send {
    /// Returns the precision this plugin applies.
    fn precision(&self) -> Precision;

    /// Whether this plugin performs loss scaling.
    fn supports_scaling(&self) -> bool {
        false
    }

    /// Attaches the plugin to the model and optimizers.
    ///
    /// # Returns
    /// The (possibly wrapped) model and optimizer/scheduler lists the
    /// accelerator stores back as its own references.
    fn connect(
        &mut self,
        model: SharedModule,
        optimizers: Vec<Box<dyn Optimizer>>,
        lr_schedulers: Vec<Box<dyn LrScheduler>>,
    ) -> (
        SharedModule,
        Vec<Box<dyn Optimizer>>,
        Vec<Box<dyn LrScheduler>>,
    );

    /// Runs the backward pass under this plugin's numeric policy.
    ///
    /// # Returns
    /// The (possibly scaled) loss; opaque to the caller.
    fn backward(
        &mut self,
        model: &SharedModule,
        loss: Tensor,
        optimizer: &mut dyn Optimizer,
        opt_idx: usize,
        should_accumulate: bool,
    ) -> Result<Tensor>;

    /// Decides whether the strategy's optimizer step should execute.
    fn pre_optimizer_step(
        &mut self,
        _model: &SharedModule,
        _optimizer: &mut dyn Optimizer,
        _opt_idx: usize,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Runs after the optimizer step, whether or not it executed.
    fn post_optimizer_step(&mut self, _optimizer: &mut dyn Optimizer, _opt_idx: usize) {}

    /// Clips gradients under this plugin's scaling regime.
    fn clip_gradients(&self, _optimizer: &mut dyn Optimizer, _clip_val: f64) {}

    /// Scope held around each step call.
    fn step_scope(&self, _stage: Stage) -> Scope<'_> {
        Scope::noop()
    }

    fn pre_dispatch(&mut self) {}

    fn post_dispatch(&mut self) {}
}

/// The 32-bit pass-through baseline: no scaling, no wrapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullPrecisionPlugin;

impl PrecisionPlugin for FullPrecisionPlugin {
    fn precision(&self) -> Precision {
        Precision::Full
    }

    fn connect(
        &mut self,
        model: SharedModule,
        optimizers: Vec<Box<dyn Optimizer>>,
        lr_schedulers: Vec<Box<dyn LrScheduler>>,
    ) -> (
        SharedModule,
        Vec<Box<dyn Optimizer>>,
        Vec<Box<dyn LrScheduler>>,
    ) {
        (model, optimizers, lr_schedulers)
    }

    fn backward(
        &mut self,
        model: &SharedModule,
        loss: Tensor,
        _optimizer: &mut dyn Optimizer,
        _opt_idx: usize,
        _should_accumulate: bool,
    ) -> Result<Tensor> {
        model.lock().backward(&loss)?;
        Ok(loss)
    }
}
