//! Weight initialization policies applied once per fit, right after the module is built.

use crate::error::Result;
use crate::snapshot::ParameterSnapshot;
use candle::Device;
use candle_nn::VarMap;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Decides the starting parameter values of a freshly built module.
pub trait WeightInit: fmt::Debug + Send + Sync {
    /// Mutate the module parameters in place. Must not change any shape.
    fn initialize(&self, params: &VarMap) -> Result<()>;
}

/// Keep the module's own random initialization.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomInit;

impl WeightInit for RandomInit {
    fn initialize(&self, _params: &VarMap) -> Result<()> {
        Ok(())
    }
}

/// Overwrite every parameter from a snapshot (warm start).
///
/// The snapshot is loaded once and shared by every fit that uses this policy.
#[derive(Clone, Debug)]
pub struct SnapshotInit {
    snapshot: Arc<ParameterSnapshot>,
}

impl SnapshotInit {
    pub fn new(snapshot: ParameterSnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }

    pub fn from_file(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        Ok(Self::new(ParameterSnapshot::load(path, device)?))
    }

    pub fn snapshot(&self) -> &ParameterSnapshot {
        &self.snapshot
    }
}

impl WeightInit for SnapshotInit {
    fn initialize(&self, params: &VarMap) -> Result<()> {
        self.snapshot.apply_to(params)?;
        tracing::debug!(tensors = self.snapshot.len(), "warm-started module from snapshot");
        Ok(())
    }
}

/// Serialisable choice of initialization policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InitConfig {
    #[default]
    Random,
    FromSnapshot { path: PathBuf },
}

impl InitConfig {
    /// Resolve into a policy, loading the snapshot if there is one.
    pub fn build(&self, device: &Device) -> Result<Arc<dyn WeightInit>> {
        match self {
            Self::Random => Ok(Arc::new(RandomInit)),
            Self::FromSnapshot { path } => Ok(Arc::new(SnapshotInit::from_file(path, device)?)),
        }
    }
}
