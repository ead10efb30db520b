pub mod single;
pub mod spawn;

use std::path::Path;

use log::warn;

use crate::{
    checkpoint::{self, Checkpoint, HYPER_PARAMETERS_KEY, PersistErr},
    controller::{RunController, WorkerContext},
    device::Device,
    error::{AccelErr, Result},
    module::{SharedModule, StepArgs, StepOutput},
    optim::{Optimizer, OptimizerSetup, StepClosure},
    tensor::Tensor,
};

/// A scoped region released exactly once, on drop, including while
/// unwinding.
pub struct Scope<'a> {
    on_exit: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Scope<'a> {
    /// A scope with no exit action.
    pub fn noop() -> Self {
        Self { on_exit: None }
    }

    /// A scope running `f` when it ends.
    pub fn on_exit(f: impl FnOnce() + 'a) -> Self {
        Self {
            on_exit: Some(Box::new(f)),
        }
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if let Some(f) = self.on_exit.take() {
            f();
        }
    }
}

/// The four step kinds a strategy dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Train,
    Validate,
    Test,
    Predict,
}

/// The parallelism-strategy contract.
///
/// A strategy owns the process topology, the collective primitives, the
/// model reference and checkpoint persistence. The provided method
/// bodies implement the single-process baseline; distributed strategies
/// override the ones whose semantics span processes.
pub trait TrainingTypePlugin: Send {
    /// Whether this strategy executes on a CUDA device.
    fn on_gpu(&self) -> bool;

    /// The device batches are moved to before each step.
    fn root_device(&self) -> Device;

    /// Moves the connected model to the strategy's device.
    ///
    /// # Errors
    /// Returns `AccelErr::MissingModel` before `connect`.
    fn model_to_device(&self) -> Result<()>;

    /// Whether this process is rank zero across all nodes. Gates
    /// checkpoint writes and identifies the broadcast source.
    fn is_global_zero(&self) -> bool;

    /// Reduces `tensor` across the strategy's processes.
    ///
    /// # Args
    /// * `op` - `sum`, `mean` or `avg`, case-insensitive.
    ///
    /// # Errors
    /// Returns `AccelErr::InvalidReduceOp` for any other op name.
    fn reduce(&self, tensor: Tensor, op: &str) -> Result<Tensor>;

    /// Blocks until all of the strategy's processes arrive.
    fn barrier(&self, name: &str);

    /// Transmits a serialized payload from `src` to every process.
    fn broadcast_bytes(&self, payload: Vec<u8>, src: usize) -> Result<Vec<u8>>;

    /// Gathers `tensor` from every process, stacked in rank order.
    fn all_gather(&self, tensor: &Tensor, sync_grads: bool) -> Result<Tensor>;

    /// Takes the shared model reference from the caller.
    fn connect(&mut self, model: SharedModule);

    /// The connected (possibly wrapped) model.
    fn model(&self) -> Option<&SharedModule>;

    /// Replaces the model reference, e.g. after precision wrapping.
    fn set_model(&mut self, model: SharedModule);

    /// Results of the last run, cached after completion.
    fn results(&self) -> Option<&serde_json::Value>;

    /// Stores the run results. Called once, after run completion and
    /// before teardown.
    fn cache_results(&mut self, results: Option<serde_json::Value>);

    /// Whether the model-sharding setup hook should fire.
    fn call_configure_sharded_model_hook(&self) -> bool;

    fn set_call_configure_sharded_model_hook(&mut self, mode: bool);

    /// Sets up processes or distributed connections before model setup.
    fn setup_environment(&mut self) {}

    /// Finishes strategy setup once the model is connected.
    fn setup(&mut self, _controller: &dyn RunController) -> Result<()> {
        Ok(())
    }

    fn pre_dispatch(&mut self) {}

    /// Runs after dispatch returns control to the parent process.
    fn post_dispatch(&mut self, _controller: &dyn RunController) -> Result<()> {
        Ok(())
    }

    /// Dispatches the training run. The baseline runs the controller's
    /// stage in-process and caches its results.
    fn start_training(&mut self, controller: &dyn RunController) -> Result<()> {
        let model = self.model().cloned().ok_or(AccelErr::MissingModel)?;
        let cx = WorkerContext::single_process();
        let results = {
            let mut module = model.lock();
            controller.run_stage(&mut **module, &cx)?
        };
        self.cache_results(results);
        Ok(())
    }

    /// Dispatches an evaluation run. See `start_training`.
    fn start_evaluating(&mut self, controller: &dyn RunController) -> Result<()> {
        self.start_training(controller)
    }

    /// Dispatches a prediction run. See `start_training`.
    fn start_predicting(&mut self, controller: &dyn RunController) -> Result<()> {
        self.start_training(controller)
    }

    /// Executes one training step on the connected model.
    fn training_step(&self, args: &StepArgs) -> Result<StepOutput> {
        let model = self.model().ok_or(AccelErr::MissingModel)?;
        let out = model.lock().training_step(args)?;
        Ok(out)
    }

    /// Runs after the training step, outside its scopes.
    fn post_training_step(&self) {}

    /// Executes one validation step on the connected model.
    fn validation_step(&self, args: &StepArgs) -> Result<StepOutput> {
        let model = self.model().ok_or(AccelErr::MissingModel)?;
        let out = model.lock().validation_step(args)?;
        Ok(out)
    }

    /// Executes one test step on the connected model.
    fn test_step(&self, args: &StepArgs) -> Result<StepOutput> {
        let model = self.model().ok_or(AccelErr::MissingModel)?;
        let out = model.lock().test_step(args)?;
        Ok(out)
    }

    /// Executes one prediction step on the connected model.
    fn predict_step(&self, args: &StepArgs) -> Result<StepOutput> {
        let model = self.model().ok_or(AccelErr::MissingModel)?;
        let out = model.lock().predict_step(args)?;
        Ok(out)
    }

    fn training_step_end(&self, output: StepOutput) -> StepOutput {
        output
    }

    fn validation_step_end(&self, output: StepOutput) -> StepOutput {
        output
    }

    fn test_step_end(&self, output: StepOutput) -> StepOutput {
        output
    }

    /// Runs before the precision plugin executes backward. Lets a
    /// strategy intercept or reorder gradient synchronization.
    fn pre_backward(&self, _loss: &Tensor, _should_accumulate: bool, _opt_idx: usize) {}

    /// Runs after the precision plugin executes backward.
    fn post_backward(&self, _loss: &Tensor, _should_accumulate: bool, _opt_idx: usize) {}

    /// Applies one optimizer step.
    fn optimizer_step(
        &self,
        optimizer: &mut dyn Optimizer,
        _opt_idx: usize,
        closure: &mut StepClosure<'_>,
    ) -> Result<()> {
        optimizer.step(closure).map_err(Into::into)
    }

    fn post_optimizer_step(&self, _optimizer: &mut dyn Optimizer, _opt_idx: usize) {}

    /// Whether optimizer construction must wait until pre-dispatch.
    /// Strategies operating on a wrapped model return true so optimizer
    /// parameter references never point at pre-wrap parameters.
    fn setup_optimizers_in_pre_dispatch(&self) -> bool {
        false
    }

    fn rpc_enabled(&self) -> bool {
        false
    }

    /// Aggregates a boolean decision across processes. Distributed
    /// strategies override this so decisions like early stopping stay
    /// consistent cluster-wide; the baseline is the identity.
    fn reduce_boolean_decision(&self, decision: bool) -> Result<bool> {
        Ok(decision)
    }

    /// Builds the optimizer setup from the connected model.
    fn init_optimizers(&self, controller: &dyn RunController) -> Result<OptimizerSetup> {
        let model = self.model().ok_or(AccelErr::MissingModel)?;
        let setup = controller.init_optimizers(&**model.lock());
        Ok(setup)
    }

    /// Transforms the checkpoint mapping before it is written.
    fn on_save(&self, checkpoint: Checkpoint) -> Checkpoint {
        checkpoint
    }

    /// Persists a checkpoint mapping. Only global zero writes.
    ///
    /// When the save fails because the reserved `hyper_parameters` entry
    /// cannot be serialized, that entry is dropped with a warning and the
    /// save retried once; any other failure propagates.
    fn save_checkpoint(&self, checkpoint: Checkpoint, filepath: &Path) -> Result<()> {
        if !self.is_global_zero() {
            return Ok(());
        }

        let mut checkpoint = self.on_save(checkpoint);
        match checkpoint::atomic_save(&checkpoint, filepath) {
            Ok(()) => Ok(()),
            Err(PersistErr::Unserializable { key }) if key == HYPER_PARAMETERS_KEY => {
                checkpoint.remove(HYPER_PARAMETERS_KEY);
                warn!(key = HYPER_PARAMETERS_KEY; "dropped unserializable checkpoint entry, retrying save");
                checkpoint::atomic_save(&checkpoint, filepath).map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Scope held around each step call together with the precision
    /// plugin's scope.
    fn step_scope(&self, _stage: Stage) -> Scope<'_> {
        Scope::noop()
    }

    /// Scope under which sharded strategies allocate model parameters
    /// shard-aware. The baseline allocates normally.
    fn model_sharded_scope(&self) -> Scope<'_> {
        Scope::noop()
    }
}
