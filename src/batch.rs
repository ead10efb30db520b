use std::collections::BTreeMap;

use crate::{device::Device, tensor::Tensor};

/// A batch as delivered by a dataloader: a single tensor, a mapping of
/// named fields, or an arbitrarily nested sequence of the above.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Tensor(Tensor),
    Seq(Vec<Batch>),
    Map(BTreeMap<String, Batch>),
}

impl Batch {
    /// Moves every tensor in the batch to `device`.
    ///
    /// The transfer is recursive and type-preserving: sequences stay
    /// sequences, mappings keep their keys, nesting is untouched.
    pub fn to_device(self, device: Device) -> Self {
        match self {
            Batch::Tensor(t) => Batch::Tensor(t.to_device(device)),
            Batch::Seq(items) => {
                Batch::Seq(items.into_iter().map(|b| b.to_device(device)).collect())
            }
            Batch::Map(fields) => Batch::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, v.to_device(device)))
                    .collect(),
            ),
        }
    }

    /// Returns the device of the first tensor in the batch, if any.
    pub fn device(&self) -> Option<Device> {
        match self {
            Batch::Tensor(t) => Some(t.device()),
            Batch::Seq(items) => items.iter().find_map(Batch::device),
            Batch::Map(fields) => fields.values().find_map(Batch::device),
        }
    }
}

impl From<Tensor> for Batch {
    fn from(tensor: Tensor) -> Self {
        Batch::Tensor(tensor)
    }
}
