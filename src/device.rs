use std::fmt;

/// Compute device families this layer can place work on.
///
/// `Mesh` cores belong to the accelerator family that requires
/// process-per-core spawn execution; they are only reachable through
/// the spawn strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Cuda(usize),
    Mesh(usize),
}

impl Device {
    /// Returns whether this device is a CUDA ordinal.
    pub fn is_cuda(self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Returns whether this device is a mesh-accelerator core.
    pub fn is_mesh(self) -> bool {
        matches!(self, Device::Mesh(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Device::Mesh(core) => write!(f, "mesh:{core}"),
        }
    }
}
