use std::{
    collections::HashMap,
    error::Error,
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use coordinator::{CoordinatorErr, UpdateCoordinator, optimization::Optimizer};
use log::{info, warn};
use ml_core::ParameterSet;
use ndarray::{ArrayD, IxDyn};
use safetensors::{Dtype, SafeTensorError, SafeTensors, tensor::TensorView};
use serde::{Deserialize, Serialize};

/// The name of the file naming the latest snapshot.
pub const POINTER_FILE: &str = "checkpoint";

const STEP_KEY: &str = "step";
const PARAMS_PREFIX: &str = "params/";

/// Checkpoint failures.
#[derive(Debug)]
pub enum CheckpointErr {
    Io { path: PathBuf, source: io::Error },
    Format(SafeTensorError),
    Pointer(serde_json::Error),
    /// The directory has no valid snapshot to restore from.
    NoCheckpoint { dir: PathBuf },
    /// A snapshot lacks a tensor the model declares.
    Missing { name: String },
    /// A snapshot tensor doesn't match the model.
    Mismatch { name: String, detail: String },
    Coordinator(CoordinatorErr),
}

impl fmt::Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "io error on '{}': {source}", path.display()),
            Self::Format(e) => write!(f, "malformed tensor file: {e}"),
            Self::Pointer(e) => write!(f, "malformed checkpoint pointer: {e}"),
            Self::NoCheckpoint { dir } => {
                write!(f, "no checkpoint to restore in '{}'", dir.display())
            }
            Self::Missing { name } => write!(f, "checkpoint has no tensor {name}"),
            Self::Mismatch { name, detail } => write!(f, "checkpoint tensor {name}: {detail}"),
            Self::Coordinator(e) => write!(f, "{e}"),
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Format(e) => Some(e),
            Self::Pointer(e) => Some(e),
            Self::Coordinator(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SafeTensorError> for CheckpointErr {
    fn from(value: SafeTensorError) -> Self {
        Self::Format(value)
    }
}

impl From<serde_json::Error> for CheckpointErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Pointer(value)
    }
}

impl From<CoordinatorErr> for CheckpointErr {
    fn from(value: CoordinatorErr) -> Self {
        Self::Coordinator(value)
    }
}

type Result<T> = std::result::Result<T, CheckpointErr>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CheckpointErr + '_ {
    move |source| CheckpointErr::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The contents of the pointer file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPointer {
    /// The file name of the latest snapshot.
    pub latest: String,
    pub step: u64,
    /// Every retained snapshot, oldest first.
    pub history: Vec<String>,
}

/// What seeding from a pretrained file did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub seeded: Vec<String>,
    pub skipped: Vec<String>,
}

/// Saves and restores the complete training state under one directory.
///
/// Every snapshot is a safetensors file holding the variables, the statistics, the moving
/// average shadow and the optimizer state, with the step in its metadata. A small JSON pointer
/// names the latest one. Both are written under a temporary name and renamed into place.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep: usize,
}

impl CheckpointManager {
    /// Creates a new `CheckpointManager`.
    ///
    /// # Arguments
    /// * `dir` - The checkpoint directory of the run.
    /// * `keep` - How many snapshots to retain.
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Readies the directory for a run: kept as is when resuming, wiped and re-created otherwise.
    pub fn prepare(&self, restore: bool) -> Result<()> {
        if !restore && self.dir.exists() {
            info!(dir:% = self.dir.display(); "clearing checkpoint directory");
            fs::remove_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        }

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))
    }

    /// Reads the pointer file.
    ///
    /// # Returns
    /// The pointer, or `None` if no snapshot was ever saved in the directory.
    pub fn latest(&self) -> Result<Option<CheckpointPointer>> {
        let path = self.dir.join(POINTER_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Writes a snapshot of the coordinator's state at its current step.
    ///
    /// # Returns
    /// The path of the new snapshot.
    pub fn save<O: Optimizer>(&self, coordinator: &UpdateCoordinator<O>) -> Result<PathBuf> {
        let step = coordinator.step();
        let name = format!("model.ckpt-{step}.safetensors");
        let path = self.dir.join(&name);

        let bytes = encode_state(coordinator)?;
        write_atomic(&path, &bytes)?;

        let mut history = match self.latest()? {
            Some(pointer) => pointer.history,
            None => Vec::new(),
        };
        history.retain(|old| *old != name);
        history.push(name.clone());

        let evicted: Vec<_> = history
            .drain(..history.len().saturating_sub(self.keep))
            .collect();

        let pointer = CheckpointPointer {
            latest: name,
            step,
            history,
        };
        let pointer_bytes = serde_json::to_vec_pretty(&pointer)?;
        write_atomic(&self.dir.join(POINTER_FILE), &pointer_bytes)?;

        for old in evicted {
            let old = self.dir.join(old);
            if let Err(e) = fs::remove_file(&old) {
                warn!(path:% = old.display(); "couldn't delete old checkpoint: {e}");
            }
        }

        info!(step = step, path:% = path.display(); "saved checkpoint");
        Ok(path)
    }

    /// Loads the latest snapshot into the coordinator, every tensor must be present.
    ///
    /// # Returns
    /// The restored step.
    pub fn restore_latest<O: Optimizer>(&self, coordinator: &mut UpdateCoordinator<O>) -> Result<u64> {
        let pointer = self.latest()?.ok_or_else(|| CheckpointErr::NoCheckpoint {
            dir: self.dir.clone(),
        })?;

        let path = self.dir.join(&pointer.latest);
        let data = fs::read(&path).map_err(io_err(&path))?;
        let step = read_step(&data)?;
        let tensors = SafeTensors::deserialize(&data)?;

        let state = coordinator.state_mut();
        let mut params = state.params.clone();
        let mut shadow = Vec::with_capacity(params.len());

        for id in params.variable_ids() {
            let name = params.variable(id).name().to_string();
            let shape = params.variable(id).shape().to_vec();

            let key = format!("{PARAMS_PREFIX}{name}");
            let value = load_tensor(&tensors, &key, Some(&shape[..]))?;
            params.assign_variable(id, value).map_err(|e| mismatch(&name, e))?;
            let key = format!("shadow/{name}");
            shadow.push(load_tensor(&tensors, &key, Some(&shape[..]))?);

            for (slot, values) in state.optimizers[id.index()].slots() {
                let key = format!("optimizer/{name}/{slot}");
                load_tensor(&tensors, &key, Some(&[values.len()][..]))?;
            }
        }

        let stat_ids: Vec<_> = params
            .statistics()
            .iter()
            .map(|s| (s.name().to_string(), s.value().shape().to_vec()))
            .collect();
        for (name, shape) in stat_ids {
            let value = load_tensor(&tensors, &format!("stats/{name}"), Some(&shape[..]))?;
            let id = params.statistic_id(&name).ok_or_else(|| CheckpointErr::Missing {
                name: name.clone(),
            })?;
            params.assign_statistic(id, value).map_err(|e| mismatch(&name, e))?;
        }

        // Everything was found and has the right shape, commit.
        for (id, value) in params.variable_ids().zip(shadow) {
            state.shadow.assign(id, value)?;

            let name = params.variable(id).name().to_string();
            let optimizer = &mut state.optimizers[id.index()];
            let slots: Vec<_> = optimizer.slots().iter().map(|(slot, _)| *slot).collect();
            for slot in slots {
                let key = format!("optimizer/{name}/{slot}");
                let values = load_tensor(&tensors, &key, None)?;
                optimizer.load_slot(slot, values.as_slice().unwrap_or(&[]))?;
            }
        }

        *state.params = params;
        *state.step = step;

        info!(step = step, path:% = path.display(); "restored checkpoint");
        Ok(step)
    }

    /// Copies the matching trainable variables of a pretrained file into the coordinator.
    ///
    /// Names are matched with or without the `params/` prefix. Tensors with no variable of the
    /// same name and shape are skipped, variables with no tensor keep their value. The shadow of
    /// every seeded variable is reset to the seeded value.
    pub fn seed_from_pretrained<O: Optimizer>(
        path: &Path,
        coordinator: &mut UpdateCoordinator<O>,
    ) -> Result<SeedReport> {
        let data = fs::read(path).map_err(io_err(path))?;
        let tensors = SafeTensors::deserialize(&data)?;
        let state = coordinator.state_mut();
        let mut report = SeedReport::default();

        let mut names = tensors.names();
        names.sort();

        for stored in names {
            let name = stored.strip_prefix(PARAMS_PREFIX).unwrap_or(stored);
            let Some(id) = state.params.variable_id(name) else {
                report.skipped.push(stored.clone());
                continue;
            };

            let shape = state.params.variable(id).shape().to_vec();
            let seeded = load_tensor(&tensors, stored, Some(&shape[..])).and_then(|value| {
                state
                    .params
                    .assign_variable(id, value.clone())
                    .map_err(|e| mismatch(name, e))?;
                Ok(value)
            });

            let value = match seeded {
                Ok(value) => value,
                Err(e) => {
                    warn!(tensor = stored.as_str(); "skipping pretrained tensor: {e}");
                    report.skipped.push(stored.clone());
                    continue;
                }
            };

            state.shadow.assign(id, value)?;
            report.seeded.push(name.to_string());
        }

        info!(
            seeded = report.seeded.len(),
            skipped = report.skipped.len(),
            path:% = path.display();
            "seeded from pretrained model"
        );
        Ok(report)
    }
}

fn mismatch(name: &str, e: ml_core::MlErr) -> CheckpointErr {
    CheckpointErr::Mismatch {
        name: name.to_string(),
        detail: e.to_string(),
    }
}

fn encode(values: impl Iterator<Item = f32>) -> Vec<u8> {
    values.flat_map(f32::to_le_bytes).collect()
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Serializes every tensor of the coordinator's state.
fn encode_state<O: Optimizer>(coordinator: &UpdateCoordinator<O>) -> Result<Vec<u8>> {
    let params: &ParameterSet = coordinator.params();
    let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();

    for (id, var) in params.variable_ids().zip(params.variables()) {
        let name = var.name();
        entries.push((
            format!("{PARAMS_PREFIX}{name}"),
            var.shape().to_vec(),
            encode(var.value().iter().copied()),
        ));
        entries.push((
            format!("shadow/{name}"),
            var.shape().to_vec(),
            encode(coordinator.shadow().get(id).iter().copied()),
        ));

        for (slot, values) in coordinator.optimizers()[id.index()].slots() {
            entries.push((
                format!("optimizer/{name}/{slot}"),
                vec![values.len()],
                encode(values.iter().copied()),
            ));
        }
    }

    for stat in params.statistics() {
        entries.push((
            format!("stats/{}", stat.name()),
            stat.value().shape().to_vec(),
            encode(stat.value().iter().copied()),
        ));
    }

    let views = entries
        .iter()
        .map(|(name, shape, bytes)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes)?;
            Ok((name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;

    let metadata = HashMap::from([(STEP_KEY.to_string(), coordinator.step().to_string())]);
    Ok(safetensors::tensor::serialize(views, &Some(metadata))?)
}

fn read_step(data: &[u8]) -> Result<u64> {
    let (_, metadata) = SafeTensors::read_metadata(data)?;
    metadata
        .metadata()
        .as_ref()
        .and_then(|meta| meta.get(STEP_KEY))
        .and_then(|step| step.parse().ok())
        .ok_or_else(|| CheckpointErr::Missing {
            name: format!("metadata.{STEP_KEY}"),
        })
}

/// Reads an f32 tensor, checking its shape when one is given.
fn load_tensor(
    tensors: &SafeTensors<'_>,
    name: &str,
    shape: Option<&[usize]>,
) -> Result<ArrayD<f32>> {
    let view = tensors.tensor(name).map_err(|_| CheckpointErr::Missing {
        name: name.to_string(),
    })?;

    if view.dtype() != Dtype::F32 {
        return Err(CheckpointErr::Mismatch {
            name: name.to_string(),
            detail: format!("dtype {:?}, expected F32", view.dtype()),
        });
    }

    if let Some(shape) = shape {
        if view.shape() != shape {
            return Err(CheckpointErr::Mismatch {
                name: name.to_string(),
                detail: format!("shape {:?}, expected {shape:?}", view.shape()),
            });
        }
    }

    ArrayD::from_shape_vec(IxDyn(view.shape()), decode(view.data())).map_err(|e| {
        CheckpointErr::Mismatch {
            name: name.to_string(),
            detail: e.to_string(),
        }
    })
}

/// Writes `bytes` to a sibling temporary file and renames it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let written = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(io_err(&tmp))
        .and_then(|()| fs::rename(&tmp, path).map_err(io_err(path)));

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
        return written;
    }

    sync_dir(path)
}

/// Flushes the directory entry of a renamed file.
#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    File::open(dir)
        .and_then(|dir| dir.sync_all())
        .map_err(io_err(dir))
}

#[cfg(not(unix))]
fn sync_dir(_: &Path) -> Result<()> {
    Ok(())
}
