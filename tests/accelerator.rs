mod common;

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use common::{CallLog, StubModule, TestController};
use training_backends::{
    Accelerator, AccelErr, Batch, Device, FullPrecisionPlugin, Optimizer, Precision,
    PrecisionPlugin, Result, RunState, Scope, SharedModule, SingleDevicePlugin, StepArgs, Tensor,
    share,
};

fn single_device_accel(device: Device) -> Accelerator {
    Accelerator::new(
        Box::new(FullPrecisionPlugin),
        Box::new(SingleDevicePlugin::new(device)),
    )
}

#[test]
fn setup_skips_optimizers_outside_fitting() -> Result<()> {
    let controller = TestController::new(RunState::Testing);
    let mut accel = single_device_accel(Device::Cpu);

    accel.setup(&controller, share(Box::new(StubModule::new(vec![0.0]))))?;

    assert!(accel.optimizers().is_empty());
    assert!(accel.lr_schedulers().is_empty());
    assert!(accel.optimizer_frequencies().is_empty());
    Ok(())
}

#[test]
fn repeated_optimizer_setup_replaces_instead_of_appending() -> Result<()> {
    let controller = TestController::new(RunState::Fitting);
    let mut accel = single_device_accel(Device::Cpu);

    accel.setup(&controller, share(Box::new(StubModule::new(vec![0.0]))))?;
    assert_eq!(accel.optimizers().len(), 1);
    assert_eq!(accel.lr_schedulers().len(), 1);
    assert_eq!(accel.optimizer_frequencies(), &[1]);

    accel.setup_optimizers(&controller)?;
    assert_eq!(accel.optimizers().len(), 1);
    assert_eq!(accel.optimizer_frequencies(), &[1]);
    Ok(())
}

#[test]
fn steps_move_batches_to_the_root_device() -> Result<()> {
    let controller = TestController::new(RunState::Fitting);
    let log = CallLog::default();
    let module = StubModule::with_log(vec![1.0], log.clone());
    let mut accel = single_device_accel(Device::Cuda(0));

    accel.setup(&controller, share(Box::new(module)))?;

    let batch = Batch::Tensor(Tensor::new(vec![2.0, 3.0], Device::Cpu));
    let out = accel.training_step(StepArgs::new(batch, 0))?;
    assert_eq!(out.loss.and_then(|l| l.item()), Some(6.0));

    let mut fields = BTreeMap::new();
    fields.insert("x".to_string(), Batch::Tensor(Tensor::scalar(4.0)));
    fields.insert(
        "y".to_string(),
        Batch::Seq(vec![Batch::Tensor(Tensor::scalar(5.0))]),
    );
    accel.validation_step(StepArgs::new(Batch::Map(fields), 1))?;

    let seen = log.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], ("training_step".to_string(), Some(Device::Cuda(0))));
    assert_eq!(
        seen[1],
        ("validation_step".to_string(), Some(Device::Cuda(0)))
    );
    Ok(())
}

#[test]
fn to_device_preserves_batch_shape() {
    let accel = single_device_accel(Device::Mesh(2));

    let mut fields = BTreeMap::new();
    fields.insert("a".to_string(), Batch::Tensor(Tensor::scalar(1.0)));
    fields.insert(
        "b".to_string(),
        Batch::Seq(vec![
            Batch::Tensor(Tensor::scalar(2.0)),
            Batch::Tensor(Tensor::scalar(3.0)),
        ]),
    );

    let moved = accel.to_device(Batch::Map(fields));
    let Batch::Map(fields) = moved else {
        panic!("mapping batch changed shape");
    };
    assert_eq!(
        fields.keys().cloned().collect::<Vec<_>>(),
        vec!["a".to_string(), "b".to_string()]
    );
    assert!(fields.values().all(|b| b.device() == Some(Device::Mesh(2))));

    let single = accel.to_device(Batch::Tensor(Tensor::scalar(9.0)));
    assert!(matches!(single, Batch::Tensor(_)));
    assert_eq!(single.device(), Some(Device::Mesh(2)));
}

#[test]
fn backward_delegates_through_the_model() -> Result<()> {
    let controller = TestController::new(RunState::Fitting);
    let log = CallLog::default();
    let module = StubModule::with_log(vec![0.0], log.clone());
    let mut accel = single_device_accel(Device::Cpu);

    accel.setup(&controller, share(Box::new(module)))?;

    let out = accel.backward(Tensor::scalar(1.5), 0, false)?;
    assert_eq!(out.item(), Some(1.5));
    assert!(log.lock().iter().any(|(name, _)| name == "backward"));
    Ok(())
}

#[test]
fn backward_rejects_unknown_optimizer_index() -> Result<()> {
    let controller = TestController::new(RunState::Testing);
    let mut accel = single_device_accel(Device::Cpu);
    accel.setup(&controller, share(Box::new(StubModule::new(vec![0.0]))))?;

    let err = accel.backward(Tensor::scalar(1.0), 0, false).unwrap_err();
    assert!(matches!(
        err,
        AccelErr::InvalidOptimizer { index: 0, count: 0 }
    ));
    Ok(())
}

/// Precision plugin that vetoes or admits the optimizer step and records
/// its hook ordering.
struct GatedPrecision {
    admit: bool,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl PrecisionPlugin for GatedPrecision {
    fn precision(&self) -> Precision {
        Precision::Full
    }

    fn connect(
        &mut self,
        model: SharedModule,
        optimizers: Vec<Box<dyn Optimizer>>,
        lr_schedulers: Vec<Box<dyn training_backends::LrScheduler>>,
    ) -> (
        SharedModule,
        Vec<Box<dyn Optimizer>>,
        Vec<Box<dyn training_backends::LrScheduler>>,
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

    fn pre_optimizer_step(
        &mut self,
        _model: &SharedModule,
        _optimizer: &mut dyn Optimizer,
        _opt_idx: usize,
    ) -> Result<bool> {
        self.events.lock().push("pre_optimizer_step");
        Ok(self.admit)
    }

    fn post_optimizer_step(&mut self, _optimizer: &mut dyn Optimizer, _opt_idx: usize) {
        self.events.lock().push("post_optimizer_step");
    }
}

#[test]
fn vetoed_optimizer_step_still_runs_post_hooks() -> Result<()> {
    let controller = TestController::new(RunState::Fitting);
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut accel = Accelerator::new(
        Box::new(GatedPrecision {
            admit: false,
            events: events.clone(),
        }),
        Box::new(SingleDevicePlugin::new(Device::Cpu)),
    );

    accel.setup(&controller, share(Box::new(StubModule::new(vec![0.0]))))?;

    accel.optimizer_step(0, &mut || Ok(None))?;
    assert_eq!(controller.optimizer_steps.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(
        events.lock().as_slice(),
        ["pre_optimizer_step", "post_optimizer_step"]
    );
    Ok(())
}

#[test]
fn admitted_optimizer_step_executes_once() -> Result<()> {
    let controller = TestController::new(RunState::Fitting);
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut accel = Accelerator::new(
        Box::new(GatedPrecision {
            admit: true,
            events: events.clone(),
        }),
        Box::new(SingleDevicePlugin::new(Device::Cpu)),
    );

    accel.setup(&controller, share(Box::new(StubModule::new(vec![0.0]))))?;

    accel.optimizer_step(0, &mut || Ok(None))?;
    assert_eq!(controller.optimizer_steps.load(std::sync::atomic::Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn single_device_reduce_validates_op_names() -> Result<()> {
    let controller = TestController::new(RunState::Testing);
    let mut accel = single_device_accel(Device::Cpu);
    accel.setup(&controller, share(Box::new(StubModule::new(vec![0.0]))))?;

    let reduced = accel.reduce(Tensor::scalar(3.0), "SUM")?;
    assert_eq!(reduced.item(), Some(3.0));

    let err = accel.reduce(Tensor::scalar(3.0), "max").unwrap_err();
    assert!(matches!(err, AccelErr::InvalidReduceOp(op) if op == "max"));
    Ok(())
}

#[test]
fn broadcast_round_trips_on_a_single_process() -> Result<()> {
    let controller = TestController::new(RunState::Testing);
    let mut accel = single_device_accel(Device::Cpu);
    accel.setup(&controller, share(Box::new(StubModule::new(vec![0.0]))))?;

    let mut payload = BTreeMap::new();
    payload.insert("epoch".to_string(), 7_u64);
    let received: BTreeMap<String, u64> = accel.broadcast(&payload, 0)?;
    assert_eq!(received, payload);
    Ok(())
}

#[test]
fn in_process_run_caches_results() -> Result<()> {
    let controller =
        TestController::new(RunState::Fitting).with_result(serde_json::json!({ "loss": 0.25 }));
    let mut accel = single_device_accel(Device::Cpu);
    accel.setup(&controller, share(Box::new(StubModule::new(vec![0.0]))))?;

    accel.start_training(&controller)?;

    assert_eq!(
        accel.results(),
        Some(&serde_json::json!({ "loss": 0.25 }))
    );
    let sightings = controller.sightings.lock();
    assert_eq!(sightings.len(), 1);
    assert_eq!(sightings[0].world_size, 1);
    assert!(sightings[0].progress_enabled);
    Ok(())
}

#[test]
fn scopes_release_exactly_once() {
    let accel = single_device_accel(Device::Cpu);

    {
        let _scope = accel.model_sharded_scope();
    }

    let released = Arc::new(Mutex::new(0_usize));
    {
        let counter = released.clone();
        let _scope = Scope::on_exit(move || *counter.lock() += 1);
    }
    assert_eq!(*released.lock(), 1);
}
