use std::{error::Error, fmt, io};

use crate::{checkpoint::PersistErr, module::ModuleErr};

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, AccelErr>;

/// Failures surfaced by the execution layer.
#[derive(Debug)]
pub enum AccelErr {
    /// The numerical model reported a failure.
    Module(ModuleErr),
    /// A checkpoint could not be persisted or restored.
    Persist(PersistErr),
    /// A value could not be serialized for transport.
    Serialization(serde_json::Error),
    /// A reduction was requested with an unsupported op name.
    InvalidReduceOp(String),
    /// An optimizer index outside the configured set was referenced.
    InvalidOptimizer { index: usize, count: usize },
    /// An operation requiring a connected model ran before `connect`.
    MissingModel,
    /// A worker process died without reporting a structured error.
    WorkerFailed { global_rank: usize },
    /// The result channel delivered a slot out of protocol order.
    UnexpectedSlot {
        expected: &'static str,
        got: &'static str,
    },
    /// The result channel closed before the protocol completed.
    ChannelClosed { expected: &'static str },
    Io(io::Error),
}

impl fmt::Display for AccelErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccelErr::Module(e) => write!(f, "module error: {e}"),
            AccelErr::Persist(e) => write!(f, "persistence error: {e}"),
            AccelErr::Serialization(e) => write!(f, "serialization error: {e}"),
            AccelErr::InvalidReduceOp(op) => {
                write!(f, "unsupported reduce op {op:?}: expected sum, mean or avg")
            }
            AccelErr::InvalidOptimizer { index, count } => {
                write!(f, "optimizer index {index} out of range: {count} configured")
            }
            AccelErr::MissingModel => write!(f, "no model connected to the strategy"),
            AccelErr::WorkerFailed { global_rank } => {
                write!(f, "worker with global rank {global_rank} failed")
            }
            AccelErr::UnexpectedSlot { expected, got } => {
                write!(f, "result channel protocol: expected {expected}, got {got}")
            }
            AccelErr::ChannelClosed { expected } => {
                write!(f, "result channel closed while expecting {expected}")
            }
            AccelErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for AccelErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AccelErr::Module(e) => Some(e),
            AccelErr::Persist(e) => Some(e),
            AccelErr::Serialization(e) => Some(e),
            AccelErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ModuleErr> for AccelErr {
    fn from(value: ModuleErr) -> Self {
        Self::Module(value)
    }
}

impl From<PersistErr> for AccelErr {
    fn from(value: PersistErr) -> Self {
        Self::Persist(value)
    }
}

impl From<serde_json::Error> for AccelErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

impl From<io::Error> for AccelErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
