use std::{
    collections::BTreeMap,
    error::Error,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use crate::module::StateDict;

/// Reserved checkpoint key holding caller hyperparameters. The one key
/// `save_checkpoint` may drop to recover from a failed save.
pub const HYPER_PARAMETERS_KEY: &str = "hyper_parameters";

/// Reserved checkpoint key holding runtime callback state. Spawn
/// strategies do not persist it.
pub const CALLBACKS_KEY: &str = "callbacks";

/// A checkpoint mapping. Opaque to this layer beyond the reserved keys.
pub type Checkpoint = BTreeMap<String, CheckpointValue>;

/// Values a checkpoint mapping can carry.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointValue {
    Number(f64),
    Text(String),
    Flag(bool),
    Weights(StateDict),
    Values(Vec<CheckpointValue>),
    Table(BTreeMap<String, CheckpointValue>),
    /// A process-local resource id. It has no meaning outside the writing
    /// process, so the persistence boundary refuses to write it.
    Handle(u64),
}

impl CheckpointValue {
    fn has_handle(&self) -> bool {
        match self {
            CheckpointValue::Handle(_) => true,
            CheckpointValue::Values(items) => items.iter().any(Self::has_handle),
            CheckpointValue::Table(table) => table.values().any(Self::has_handle),
            _ => false,
        }
    }
}

/// Failures at the persistence boundary.
#[derive(Debug)]
pub enum PersistErr {
    /// The mapping holds a value that cannot leave the process, under the
    /// named top-level key.
    Unserializable { key: String },
    /// The device-native save missed its post-write rendezvous. The data
    /// is on disk; callers may treat this as benign.
    RendezvousMissed,
    /// The on-disk bytes do not form a valid artifact.
    Malformed(String),
    Io(io::Error),
}

impl fmt::Display for PersistErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistErr::Unserializable { key } => {
                write!(f, "checkpoint entry {key:?} is not serializable")
            }
            PersistErr::RendezvousMissed => write!(f, "save rendezvous not met"),
            PersistErr::Malformed(msg) => write!(f, "malformed checkpoint: {msg}"),
            PersistErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for PersistErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PersistErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PersistErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

// Unique staging names keep concurrent writers of one target path (e.g.
// several workers dumping identical weights) from clobbering each
// other's staging file before the rename.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

fn staging_path(path: &Path) -> PathBuf {
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut staged = path.as_os_str().to_owned();
    staged.push(format!(".part{seq}"));
    PathBuf::from(staged)
}

/// Persists a checkpoint mapping, replacing any existing file.
///
/// The write lands in a staging file first and is renamed into place, so
/// a crash mid-write never leaves a torn checkpoint behind.
///
/// # Errors
/// Returns `PersistErr::Unserializable` naming the first top-level key
/// whose value cannot leave the process, or `PersistErr::Io` on write
/// failures.
pub fn atomic_save(checkpoint: &Checkpoint, path: &Path) -> Result<(), PersistErr> {
    for (key, value) in checkpoint {
        if value.has_handle() {
            return Err(PersistErr::Unserializable { key: key.clone() });
        }
    }

    let bytes =
        serde_json::to_vec(checkpoint).map_err(|e| PersistErr::Malformed(e.to_string()))?;
    let staged = staging_path(path);
    fs::write(&staged, &bytes)?;
    fs::rename(&staged, path)?;
    Ok(())
}

/// Reads back a checkpoint mapping written by `atomic_save`.
///
/// # Errors
/// Returns `PersistErr::Io` when the file is unreadable and
/// `PersistErr::Malformed` when its contents do not parse.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint, PersistErr> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| PersistErr::Malformed(e.to_string()))
}

/// State-dict persistence boundary used by spawn strategies for weight
/// rescue and transfer files.
pub trait CheckpointIo: Send + Sync {
    /// Writes a state dict, replacing any existing file.
    fn save(&self, state: &StateDict, path: &Path) -> Result<(), PersistErr>;

    /// Reads a state dict back.
    fn load(&self, path: &Path) -> Result<StateDict, PersistErr>;

    /// Deletes a previously written state dict.
    fn remove(&self, path: &Path) -> Result<(), PersistErr>;
}

type LenType = u64;
const LEN_SIZE: usize = size_of::<LenType>();

/// Disk-backed `CheckpointIo` writing length-framed binary state dicts.
#[derive(Debug, Clone, Default)]
pub struct DiskStateIo;

impl DiskStateIo {
    fn read_len(bytes: &[u8], offset: &mut usize) -> Result<usize, PersistErr> {
        let end = offset
            .checked_add(LEN_SIZE)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| PersistErr::Malformed("truncated length header".into()))?;

        // Frame headers are fixed-width big-endian, payloads are raw casts.
        let raw: [u8; LEN_SIZE] = bytes[*offset..end].try_into().unwrap();
        *offset = end;
        Ok(LenType::from_be_bytes(raw) as usize)
    }

    fn read_bytes<'a>(
        bytes: &'a [u8],
        offset: &mut usize,
        len: usize,
    ) -> Result<&'a [u8], PersistErr> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| PersistErr::Malformed("truncated frame".into()))?;
        let slice = &bytes[*offset..end];
        *offset = end;
        Ok(slice)
    }
}

impl CheckpointIo for DiskStateIo {
    fn save(&self, state: &StateDict, path: &Path) -> Result<(), PersistErr> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(state.len() as LenType).to_be_bytes());
        for (name, values) in state {
            buf.extend_from_slice(&(name.len() as LenType).to_be_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(values.len() as LenType).to_be_bytes());
            buf.extend_from_slice(bytemuck::cast_slice(values));
        }

        let staged = staging_path(path);
        fs::write(&staged, &buf)?;
        fs::rename(&staged, path)?;
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<StateDict, PersistErr> {
        let bytes = fs::read(path)?;
        let mut offset = 0;

        let entries = Self::read_len(&bytes, &mut offset)?;
        let mut state = StateDict::new();
        for _ in 0..entries {
            let name_len = Self::read_len(&bytes, &mut offset)?;
            let name = str::from_utf8(Self::read_bytes(&bytes, &mut offset, name_len)?)
                .map_err(|e| PersistErr::Malformed(e.to_string()))?
                .to_string();

            let count = Self::read_len(&bytes, &mut offset)?;
            let raw = Self::read_bytes(&bytes, &mut offset, count * size_of::<f32>())?;
            state.insert(name, bytemuck::pod_collect_to_vec(raw));
        }

        Ok(state)
    }

    fn remove(&self, path: &Path) -> Result<(), PersistErr> {
        fs::remove_file(path).map_err(Into::into)
    }
}

/// The checkpoint-tracking collaborator. This layer only ever touches the
/// best-model-path field.
pub trait CheckpointTracker: Send + Sync {
    fn best_model_path(&self) -> Option<PathBuf>;

    fn set_best_model_path(&self, path: Option<PathBuf>);
}
