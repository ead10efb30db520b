#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use training_backends::{
    AccelErr, Batch, CheckpointTracker, Device, Module, ModuleErr, OptimizerSetup, Optimizer,
    LrScheduler, Result, RunController, RunState, StateDict, StepArgs, StepClosure, StepOutput,
    Tensor, WorkerContext,
};

/// Shared call log for observing what a module saw.
pub type CallLog = Arc<Mutex<Vec<(String, Option<Device>)>>>;

/// Sums every tensor element in a batch, recursively.
pub fn batch_sum(batch: &Batch) -> f32 {
    match batch {
        Batch::Tensor(t) => t.data().iter().sum(),
        Batch::Seq(items) => items.iter().map(batch_sum).sum(),
        Batch::Map(fields) => fields.values().map(batch_sum).sum(),
    }
}

/// A deterministic model stub: one named weight buffer, a device tag and
/// a shared call log. Clones own their weights but share the log.
#[derive(Clone)]
pub struct StubModule {
    weights: Vec<f32>,
    device: Device,
    log: CallLog,
}

impl StubModule {
    pub fn new(weights: Vec<f32>) -> Self {
        Self::with_log(weights, CallLog::default())
    }

    pub fn with_log(weights: Vec<f32>, log: CallLog) -> Self {
        Self {
            weights,
            device: Device::Cpu,
            log,
        }
    }

    fn step(&mut self, name: &str, args: &StepArgs) -> std::result::Result<StepOutput, ModuleErr> {
        self.log
            .lock()
            .push((name.to_string(), args.batch.device()));
        let loss = batch_sum(&args.batch) + self.weights.first().copied().unwrap_or(0.0);
        Ok(StepOutput::from_loss(Tensor::new(vec![loss], self.device)))
    }
}

impl Module for StubModule {
    fn training_step(&mut self, args: &StepArgs) -> std::result::Result<StepOutput, ModuleErr> {
        self.step("training_step", args)
    }

    fn validation_step(&mut self, args: &StepArgs) -> std::result::Result<StepOutput, ModuleErr> {
        self.step("validation_step", args)
    }

    fn test_step(&mut self, args: &StepArgs) -> std::result::Result<StepOutput, ModuleErr> {
        self.step("test_step", args)
    }

    fn predict_step(&mut self, args: &StepArgs) -> std::result::Result<StepOutput, ModuleErr> {
        self.step("predict_step", args)
    }

    fn backward(&mut self, _loss: &Tensor) -> std::result::Result<(), ModuleErr> {
        self.log.lock().push(("backward".to_string(), None));
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("w".to_string(), self.weights.clone());
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> std::result::Result<(), ModuleErr> {
        let Some(weights) = state.get("w") else {
            return Err(ModuleErr::InvalidInput("missing parameter entry"));
        };
        if weights.len() != self.weights.len() {
            return Err(ModuleErr::ShapeMismatch {
                what: "params",
                got: weights.len(),
                expected: self.weights.len(),
            });
        }
        self.weights = weights.clone();
        Ok(())
    }

    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn device(&self) -> Device {
        self.device
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

/// Counts applied steps through a shared counter; the closure runs first.
pub struct CountingOptimizer(pub Arc<AtomicUsize>);

impl Optimizer for CountingOptimizer {
    fn step(&mut self, closure: &mut StepClosure<'_>) -> std::result::Result<(), ModuleErr> {
        closure()?;
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn zero_grad(&mut self) {}
}

pub struct NoopScheduler;

impl LrScheduler for NoopScheduler {
    fn step(&mut self) {}
}

/// A checkpoint tracker holding nothing but the best-model-path field.
#[derive(Default)]
pub struct PathTracker(Mutex<Option<PathBuf>>);

impl PathTracker {
    pub fn with_best(path: PathBuf) -> Self {
        Self(Mutex::new(Some(path)))
    }
}

impl CheckpointTracker for PathTracker {
    fn best_model_path(&self) -> Option<PathBuf> {
        self.0.lock().clone()
    }

    fn set_best_model_path(&self, path: Option<PathBuf>) {
        *self.0.lock() = path;
    }
}

/// What one worker reported from inside its run stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSighting {
    pub global_rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub progress_enabled: bool,
    pub seed: Option<u64>,
}

/// A scripted run controller: fixed state, fixed results, optional
/// weight mutation and failure injection, plus observation hooks.
pub struct TestController {
    pub state: RunState,
    pub result: Option<serde_json::Value>,
    pub tracker: Option<Arc<PathTracker>>,
    pub root: PathBuf,
    pub train_to: Option<StateDict>,
    pub fail_stage: bool,
    pub sightings: Mutex<Vec<WorkerSighting>>,
    pub optimizer_steps: Arc<AtomicUsize>,
    pub init_calls: AtomicUsize,
}

impl TestController {
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            result: None,
            tracker: None,
            root: std::env::temp_dir(),
            train_to: None,
            fail_stage: false,
            sightings: Mutex::new(Vec::new()),
            optimizer_steps: Arc::new(AtomicUsize::new(0)),
            init_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<PathTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = root;
        self
    }

    /// Makes every run stage overwrite the model weights with `state`.
    pub fn training_to(mut self, state: StateDict) -> Self {
        self.train_to = Some(state);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_stage = true;
        self
    }
}

impl RunController for TestController {
    fn run_state(&self) -> RunState {
        self.state
    }

    fn run_stage(
        &self,
        module: &mut dyn Module,
        cx: &WorkerContext,
    ) -> Result<Option<serde_json::Value>> {
        let rank = cx.rank();
        self.sightings.lock().push(WorkerSighting {
            global_rank: rank.global_rank,
            local_rank: rank.local_rank,
            world_size: rank.world_size,
            progress_enabled: cx.progress_enabled(),
            seed: cx.seed(),
        });

        if let Some(state) = &self.train_to {
            module.load_state_dict(state)?;
        }
        if self.fail_stage {
            return Err(AccelErr::Module(ModuleErr::InvalidInput(
                "stage failure injected",
            )));
        }
        Ok(self.result.clone())
    }

    fn init_optimizers(&self, _module: &dyn Module) -> OptimizerSetup {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        OptimizerSetup {
            optimizers: vec![Box::new(CountingOptimizer(self.optimizer_steps.clone()))],
            lr_schedulers: vec![Box::new(NoopScheduler)],
            frequencies: vec![1],
        }
    }

    fn checkpoint_tracker(&self) -> Option<&dyn CheckpointTracker> {
        self.tracker.as_deref().map(|t| t as &dyn CheckpointTracker)
    }

    fn default_root_dir(&self) -> PathBuf {
        self.root.clone()
    }
}

/// Enables RUST_LOG-driven output for a test binary.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A per-test scratch directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "training-backends-{tag}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
