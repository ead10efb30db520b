use std::path::Path;

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    batch::Batch,
    checkpoint::Checkpoint,
    controller::RunController,
    device::Device,
    error::{AccelErr, Result},
    module::{SharedModule, StateDict, StepArgs, StepOutput},
    optim::{LrScheduler, Optimizer, StepClosure},
    plugin::{Scope, Stage, TrainingTypePlugin},
    precision::{Precision, PrecisionPlugin},
    tensor::Tensor,
};

/// The single entry point the training loop calls.
///
/// An accelerator deals with one hardware family. It composes exactly
/// one precision plugin and one training-type plugin, wires their setup
/// order, and delegates every step, backward and optimizer call to them.
/// It keeps no state of its own beyond the optimizer lists derived
/// during setup; the training-type plugin is the single source of truth
/// for everything else.
pub struct Accelerator {
    precision: Box<dyn PrecisionPlugin>,
    training_type: Box<dyn TrainingTypePlugin>,
    optimizers: Vec<Box<dyn Optimizer>>,
    lr_schedulers: Vec<Box<dyn LrScheduler>>,
    optimizer_frequencies: Vec<usize>,
}

impl Accelerator {
    /// Composes an accelerator from its two plugins.
    ///
    /// # Args
    /// * `precision` - Handles precision-specific parts of the routine.
    /// * `training_type` - Handles the parallelism strategy.
    pub fn new(
        precision: Box<dyn PrecisionPlugin>,
        training_type: Box<dyn TrainingTypePlugin>,
    ) -> Self {
        Self {
            precision,
            training_type,
            optimizers: Vec::new(),
            lr_schedulers: Vec::new(),
            optimizer_frequencies: Vec::new(),
        }
    }

    /// Transfers shared ownership of the model to the strategy.
    pub fn connect(&mut self, model: SharedModule) {
        self.training_type.connect(model);
    }

    /// Sets up processes or distributed connections ahead of setup.
    pub fn setup_environment(&mut self) {
        self.training_type.setup_environment();
    }

    /// Runs plugin setup, optimizer construction and the precision
    /// connect, in that order.
    ///
    /// Optimizer construction is skipped here when the strategy defers
    /// it to pre-dispatch (strategies operating on a wrapped model).
    pub fn setup(&mut self, controller: &dyn RunController, model: SharedModule) -> Result<()> {
        self.training_type.connect(model);
        self.training_type.setup(controller)?;
        if !self.training_type.setup_optimizers_in_pre_dispatch() {
            self.setup_optimizers(controller)?;
        }
        self.setup_precision_plugin();
        Ok(())
    }

    /// Builds optimizers, schedulers and step frequencies from the model.
    ///
    /// No-op unless the run state is fitting or tuning. Re-entrant calls
    /// replace the stored lists wholesale, so repeated setup never
    /// duplicates optimizer state.
    pub fn setup_optimizers(&mut self, controller: &dyn RunController) -> Result<()> {
        if !controller.run_state().builds_optimizers() {
            return Ok(());
        }

        let setup = self.training_type.init_optimizers(controller)?;
        self.optimizers = setup.optimizers;
        self.lr_schedulers = setup.lr_schedulers;
        self.optimizer_frequencies = setup.frequencies;
        Ok(())
    }

    fn setup_precision_plugin(&mut self) {
        let Some(model) = self.training_type.model().cloned() else {
            return;
        };

        let optimizers = std::mem::take(&mut self.optimizers);
        let lr_schedulers = std::mem::take(&mut self.lr_schedulers);
        let (model, optimizers, lr_schedulers) =
            self.precision.connect(model, optimizers, lr_schedulers);

        self.training_type.set_model(model);
        self.optimizers = optimizers;
        self.lr_schedulers = lr_schedulers;
    }

    /// Dispatches the training run through the strategy.
    pub fn start_training(&mut self, controller: &dyn RunController) -> Result<()> {
        self.training_type.start_training(controller)
    }

    /// Dispatches an evaluation run through the strategy.
    pub fn start_evaluating(&mut self, controller: &dyn RunController) -> Result<()> {
        self.training_type.start_evaluating(controller)
    }

    /// Dispatches a prediction run through the strategy.
    pub fn start_predicting(&mut self, controller: &dyn RunController) -> Result<()> {
        self.training_type.start_predicting(controller)
    }

    /// Runs both plugins' pre-dispatch hooks and any deferred optimizer
    /// construction.
    pub fn pre_dispatch(&mut self, controller: &dyn RunController) -> Result<()> {
        self.training_type.pre_dispatch();
        if self.training_type.setup_optimizers_in_pre_dispatch() {
            self.setup_optimizers(controller)?;
        }
        self.precision.pre_dispatch();
        Ok(())
    }

    /// Runs both plugins' post-dispatch hooks, completing result and
    /// weight transfer for spawned strategies.
    pub fn post_dispatch(&mut self, controller: &dyn RunController) -> Result<()> {
        self.training_type.post_dispatch(controller)?;
        self.precision.post_dispatch();
        Ok(())
    }

    /// Executes one training step.
    ///
    /// The batch is moved to the strategy root device first, and the
    /// step runs inside both plugins' scopes; the scopes release even
    /// when the step fails.
    pub fn training_step(&self, args: StepArgs) -> Result<StepOutput> {
        let args = self.args_to_device(args);
        let _precision = self.precision.step_scope(Stage::Train);
        let _strategy = self.training_type.step_scope(Stage::Train);
        self.training_type.training_step(&args)
    }

    /// Runs the strategy's after-step hook, outside the step scopes.
    pub fn post_training_step(&self) {
        self.training_type.post_training_step();
    }

    /// Executes one validation step. See `training_step`.
    pub fn validation_step(&self, args: StepArgs) -> Result<StepOutput> {
        let args = self.args_to_device(args);
        let _precision = self.precision.step_scope(Stage::Validate);
        let _strategy = self.training_type.step_scope(Stage::Validate);
        self.training_type.validation_step(&args)
    }

    /// Executes one test step. See `training_step`.
    pub fn test_step(&self, args: StepArgs) -> Result<StepOutput> {
        let args = self.args_to_device(args);
        let _precision = self.precision.step_scope(Stage::Test);
        let _strategy = self.training_type.step_scope(Stage::Test);
        self.training_type.test_step(&args)
    }

    /// Executes one prediction step. See `training_step`.
    pub fn predict_step(&self, args: StepArgs) -> Result<StepOutput> {
        let args = self.args_to_device(args);
        let _precision = self.precision.step_scope(Stage::Predict);
        let _strategy = self.training_type.step_scope(Stage::Predict);
        self.training_type.predict_step(&args)
    }

    pub fn training_step_end(&self, output: StepOutput) -> StepOutput {
        self.training_type.training_step_end(output)
    }

    pub fn validation_step_end(&self, output: StepOutput) -> StepOutput {
        self.training_type.validation_step_end(output)
    }

    pub fn test_step_end(&self, output: StepOutput) -> StepOutput {
        self.training_type.test_step_end(output)
    }

    fn args_to_device(&self, mut args: StepArgs) -> StepArgs {
        args.batch = args.batch.to_device(self.root_device());
        args
    }

    /// Moves a batch to the strategy root device, preserving its shape.
    pub fn to_device(&self, batch: Batch) -> Batch {
        batch.to_device(self.root_device())
    }

    /// Runs the backward pass: strategy pre-hook, precision backward,
    /// strategy post-hook.
    ///
    /// The pre/post hooks let a strategy intercept or reorder standard
    /// backward machinery, e.g. for its own gradient synchronization.
    ///
    /// # Returns
    /// Whatever the precision plugin's backward returns; opaque here.
    pub fn backward(
        &mut self,
        loss: Tensor,
        opt_idx: usize,
        should_accumulate: bool,
    ) -> Result<Tensor> {
        let count = self.optimizers.len();
        self.training_type
            .pre_backward(&loss, should_accumulate, opt_idx);

        let model = self.training_type.model().cloned().ok_or(AccelErr::MissingModel)?;
        let optimizer = self
            .optimizers
            .get_mut(opt_idx)
            .ok_or(AccelErr::InvalidOptimizer {
                index: opt_idx,
                count,
            })?;
        let output =
            self.precision
                .backward(&model, loss, optimizer.as_mut(), opt_idx, should_accumulate)?;

        self.training_type
            .post_backward(&output, should_accumulate, opt_idx);
        Ok(output)
    }

    /// Performs one optimizer step.
    ///
    /// The precision plugin decides whether the underlying step actually
    /// executes; both plugins' post hooks run either way.
    pub fn optimizer_step(&mut self, opt_idx: usize, closure: &mut StepClosure<'_>) -> Result<()> {
        let count = self.optimizers.len();
        let model = self.training_type.model().cloned().ok_or(AccelErr::MissingModel)?;
        let optimizer = self
            .optimizers
            .get_mut(opt_idx)
            .ok_or(AccelErr::InvalidOptimizer {
                index: opt_idx,
                count,
            })?;

        let run_step = self
            .precision
            .pre_optimizer_step(&model, optimizer.as_mut(), opt_idx)?;
        if run_step {
            self.training_type
                .optimizer_step(optimizer.as_mut(), opt_idx, closure)?;
        }
        self.precision.post_optimizer_step(optimizer.as_mut(), opt_idx);
        self.training_type
            .post_optimizer_step(optimizer.as_mut(), opt_idx);
        Ok(())
    }

    /// Clears the gradients of the optimizer at `opt_idx`.
    pub fn optimizer_zero_grad(&mut self, opt_idx: usize) -> Result<()> {
        let count = self.optimizers.len();
        let optimizer = self
            .optimizers
            .get_mut(opt_idx)
            .ok_or(AccelErr::InvalidOptimizer {
                index: opt_idx,
                count,
            })?;
        optimizer.zero_grad();
        Ok(())
    }

    /// Clips gradients under the precision plugin's scaling regime.
    pub fn clip_gradients(&mut self, opt_idx: usize, clip_val: f64) -> Result<()> {
        let count = self.optimizers.len();
        let optimizer = self
            .optimizers
            .get_mut(opt_idx)
            .ok_or(AccelErr::InvalidOptimizer {
                index: opt_idx,
                count,
            })?;
        self.precision.clip_gradients(optimizer.as_mut(), clip_val);
        Ok(())
    }

    /// Snapshots the state of the optimizer at `opt_idx`.
    pub fn optimizer_state(&self, opt_idx: usize) -> Result<StateDict> {
        let optimizer = self
            .optimizers
            .get(opt_idx)
            .ok_or(AccelErr::InvalidOptimizer {
                index: opt_idx,
                count: self.optimizers.len(),
            })?;
        Ok(optimizer.state_dict())
    }

    pub fn optimizers(&self) -> &[Box<dyn Optimizer>] {
        &self.optimizers
    }

    pub fn lr_schedulers(&self) -> &[Box<dyn LrScheduler>] {
        &self.lr_schedulers
    }

    pub fn optimizer_frequencies(&self) -> &[usize] {
        &self.optimizer_frequencies
    }

    /// The connected (possibly wrapped) model.
    pub fn model(&self) -> Option<SharedModule> {
        self.training_type.model().cloned()
    }

    pub fn root_device(&self) -> Device {
        self.training_type.root_device()
    }

    pub fn precision(&self) -> Precision {
        self.precision.precision()
    }

    pub fn rpc_enabled(&self) -> bool {
        self.training_type.rpc_enabled()
    }

    /// Results of the last run, cached by the strategy.
    pub fn results(&self) -> Option<&serde_json::Value> {
        self.training_type.results()
    }

    /// Blocks until all of the strategy's processes arrive.
    pub fn barrier(&self, name: &str) {
        self.training_type.barrier(name);
    }

    /// Broadcasts a serializable value from `src` to every process.
    pub fn broadcast<T>(&self, value: &T, src: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = serde_json::to_vec(value)?;
        let bytes = self.training_type.broadcast_bytes(payload, src)?;
        serde_json::from_slice(&bytes).map_err(Into::into)
    }

    /// Gathers a tensor from every process, stacked in rank order.
    pub fn all_gather(&self, tensor: &Tensor, sync_grads: bool) -> Result<Tensor> {
        self.training_type.all_gather(tensor, sync_grads)
    }

    /// Reduces a tensor across the strategy's processes.
    pub fn reduce(&self, tensor: Tensor, op: &str) -> Result<Tensor> {
        self.training_type.reduce(tensor, op)
    }

    /// Applies the strategy's checkpoint transform.
    pub fn on_save(&self, checkpoint: Checkpoint) -> Checkpoint {
        self.training_type.on_save(checkpoint)
    }

    /// Persists a checkpoint mapping through the strategy.
    pub fn save_checkpoint(&self, checkpoint: Checkpoint, filepath: &Path) -> Result<()> {
        self.training_type.save_checkpoint(checkpoint, filepath)
    }

    /// Scope under which large models are constructed shard-aware.
    /// Control returns to the caller exactly once, on exit.
    pub fn model_sharded_scope(&self) -> Scope<'_> {
        self.training_type.model_sharded_scope()
    }

    pub fn call_configure_sharded_model_hook(&self) -> bool {
        self.training_type.call_configure_sharded_model_hook()
    }

    pub fn set_call_configure_sharded_model_hook(&mut self, mode: bool) {
        self.training_type.set_call_configure_sharded_model_hook(mode);
    }

    pub fn setup_optimizers_in_pre_dispatch(&self) -> bool {
        self.training_type.setup_optimizers_in_pre_dispatch()
    }
}
