//! Parameter snapshots: named tensors that can be persisted and applied to a module.
//!
//! The on-disk format is safetensors, so a save/load round trip reproduces
//! every value bit for bit.

use crate::error::{FinetuneError, Result};
use crate::module::named_vars;
use candle::{Device, Tensor};
use candle_nn::VarMap;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// A copy of a module's parameters keyed by identifier.
#[derive(Clone, Debug)]
pub struct ParameterSnapshot {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterSnapshot {
    pub fn new(tensors: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        Self {
            tensors: tensors.into_iter().collect(),
        }
    }

    /// Deep-copy the current values of every variable in `varmap`.
    pub fn from_varmap(varmap: &VarMap) -> Result<Self> {
        let tensors = named_vars(varmap)?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { tensors })
    }

    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle::safetensors::load(path, device)?;
        tracing::debug!(path = %path.display(), tensors = tensors.len(), "loaded parameter snapshot");
        Ok(Self::new(tensors))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tensors: HashMap<&str, Tensor> = self
            .tensors
            .iter()
            .map(|(name, t)| (name.as_str(), t.clone()))
            .collect();
        candle::safetensors::save(&tensors, path)?;
        tracing::debug!(path = %path.display(), tensors = tensors.len(), "saved parameter snapshot");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// The shape signature: identifier to dimensions.
    pub fn shapes(&self) -> BTreeMap<String, Vec<usize>> {
        self.tensors
            .iter()
            .map(|(name, t)| (name.clone(), t.dims().to_vec()))
            .collect()
    }

    /// Check that every variable of `varmap` has a same-shaped tensor here.
    pub fn check_compatible(&self, varmap: &VarMap) -> Result<()> {
        for (name, var) in named_vars(varmap)? {
            let Some(tensor) = self.tensors.get(&name) else {
                return Err(FinetuneError::MissingParameter { name });
            };
            if tensor.dims() != var.dims() {
                return Err(FinetuneError::ShapeMismatch {
                    name,
                    expected: var.dims().to_vec(),
                    got: tensor.dims().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Overwrite every variable of `varmap` with the snapshot value.
    ///
    /// All-or-nothing: compatibility and dtype/device conversion happen before
    /// the first variable is written, so a failure leaves `varmap` untouched.
    /// Snapshot entries without a matching variable are ignored.
    pub fn apply_to(&self, varmap: &VarMap) -> Result<()> {
        self.check_compatible(varmap)?;
        let vars = named_vars(varmap)?;
        let mut staged = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            let src = &self.tensors[&name];
            let src = src.to_dtype(var.dtype())?.to_device(var.device())?;
            staged.push((var, src));
        }
        let applied = staged.len();
        for (var, src) in staged {
            var.set(&src)?;
        }
        let ignored = self.tensors.len() - applied;
        if ignored > 0 {
            tracing::debug!(ignored, "snapshot entries without a module parameter were ignored");
        }
        Ok(())
    }
}
