use crate::device::Device;

/// A flat numeric buffer tagged with its placement.
///
/// This layer never performs tensor math; it moves buffers between
/// devices and through collectives. The element layout is a plain
/// `f32` slice, matching what the collectives transport.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tensor {
    data: Vec<f32>,
    device: Device,
}

impl Tensor {
    /// Creates a tensor from raw data on the given device.
    pub fn new(data: Vec<f32>, device: Device) -> Self {
        Self { data, device }
    }

    /// Creates a host-resident scalar tensor.
    pub fn scalar(value: f32) -> Self {
        Self::new(vec![value], Device::Cpu)
    }

    /// Returns the underlying data slice.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the device this tensor lives on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the element count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Moves the tensor to `device`, consuming it.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Reads a single-element tensor back as a scalar.
    ///
    /// # Returns
    /// The value when the tensor holds exactly one element, `None` otherwise.
    pub fn item(&self) -> Option<f32> {
        if self.data.len() == 1 {
            Some(self.data[0])
        } else {
            None
        }
    }
}
