use crate::{
    collective::ReduceOp,
    device::Device,
    error::{AccelErr, Result},
    module::SharedModule,
    plugin::TrainingTypePlugin,
    tensor::Tensor,
};

/// The in-process baseline strategy: one device, one process.
///
/// All collectives are world-1 identities and this process is always
/// global zero.
pub struct SingleDevicePlugin {
    device: Device,
    model: Option<SharedModule>,
    results: Option<serde_json::Value>,
    configure_sharded_hook: bool,
}

impl SingleDevicePlugin {
    /// Creates a strategy placing all work on `device`.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            model: None,
            results: None,
            configure_sharded_hook: true,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl TrainingTypePlugin for SingleDevicePlugin {
    fn on_gpu(&self) -> bool {
        self.device.is_cuda()
    }

    fn root_device(&self) -> Device {
        self.device
    }

    fn model_to_device(&self) -> Result<()> {
        let model = self.model.as_ref().ok_or(AccelErr::MissingModel)?;
        model.lock().to_device(self.device);
        Ok(())
    }

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
}
