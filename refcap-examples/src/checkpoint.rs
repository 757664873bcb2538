//! Safetensors checkpoints of caption model parameters.
//!
//! The training statistics and the model configuration travel in the safetensors metadata so
//! that a checkpoint is enough to rebuild the model it was saved from.
use candle::{Device, Result, Tensor};
use candle_nn::VarMap;
use refcap_transformers::models::caption;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckpointMetadata {
    pub epoch: usize,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub cider: Option<f64>,
    pub model: Option<caption::Config>,
}

impl CheckpointMetadata {
    fn to_map(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        map.insert("epoch".to_string(), self.epoch.to_string());
        let stats = [
            ("train_loss", self.train_loss),
            ("val_loss", self.val_loss),
            ("cider", self.cider),
        ];
        for (key, value) in stats {
            if let Some(value) = value {
                map.insert(key.to_string(), value.to_string());
            }
        }
        if let Some(model) = self.model.as_ref() {
            let model = serde_json::to_string(model).map_err(candle::Error::wrap)?;
            map.insert("config".to_string(), model);
        }
        Ok(map)
    }

    fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let float = |key: &str| -> Result<Option<f64>> {
            match map.get(key) {
                None => Ok(None),
                Some(v) => v.parse().map(Some).map_err(candle::Error::wrap),
            }
        };
        let epoch = match map.get("epoch") {
            None => 0,
            Some(v) => v.parse().map_err(candle::Error::wrap)?,
        };
        let model = match map.get("config") {
            None => None,
            Some(v) => Some(serde_json::from_str(v).map_err(candle::Error::wrap)?),
        };
        Ok(Self {
            epoch,
            train_loss: float("train_loss")?,
            val_loss: float("val_loss")?,
            cider: float("cider")?,
            model,
        })
    }
}

fn lock(varmap: &VarMap) -> Result<std::sync::MutexGuard<'_, HashMap<String, candle::Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|e| candle::Error::Msg(format!("var map lock poisoned: {e}")))
}

pub fn save<P: AsRef<Path>>(varmap: &VarMap, metadata: &CheckpointMetadata, path: P) -> Result<()> {
    let path = path.as_ref();
    let tensor_data = lock(varmap)?;
    let data = tensor_data.iter().map(|(k, v)| (k, v.as_tensor()));
    safetensors::tensor::serialize_to_file(data, Some(metadata.to_map()?), path)?;
    tracing::info!(?path, epoch = metadata.epoch, "saved checkpoint");
    Ok(())
}

pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<CheckpointMetadata> {
    let buffer = std::fs::read(path.as_ref())?;
    let (_, metadata) = safetensors::SafeTensors::read_metadata(&buffer)?;
    match metadata.metadata() {
        None => Ok(CheckpointMetadata::default()),
        Some(map) => CheckpointMetadata::from_map(map),
    }
}

fn set(name: &str, var: &candle::Var, value: &Tensor) -> Result<()> {
    let value = value.to_dtype(var.dtype())?.to_device(var.device())?;
    if let Err(err) = var.set(&value) {
        candle::bail!("error setting {name}: {err}")
    }
    Ok(())
}

/// Loads every parameter of `varmap` from `path`. Fails on missing or unexpected entries, or on
/// shape mismatches.
pub fn load_strict<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<()> {
    let path = path.as_ref();
    let tensors = candle::safetensors::load(path, &Device::Cpu)?;
    let tensor_data = lock(varmap)?;
    let mut unexpected: Vec<&String> = tensors
        .keys()
        .filter(|k| !tensor_data.contains_key(*k))
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        candle::bail!("unexpected parameters in {path:?}: {unexpected:?}")
    }
    for (name, var) in tensor_data.iter() {
        match tensors.get(name) {
            None => candle::bail!("cannot find {name} in {path:?}"),
            Some(value) => set(name, var, value)?,
        }
    }
    tracing::info!(?path, parameters = tensor_data.len(), "loaded checkpoint");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Parameters of the model without a value of the right shape in the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint entries the model has no parameter for.
    pub unexpected: Vec<String>,
}

/// Loads the parameters whose name and shape match, leaving the others untouched. Used to warm
/// start a model variant from a checkpoint of another one.
pub fn load_partial<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<LoadReport> {
    let path = path.as_ref();
    let tensors = candle::safetensors::load(path, &Device::Cpu)?;
    let tensor_data = lock(varmap)?;
    let mut report = LoadReport::default();
    for (name, var) in tensor_data.iter() {
        match tensors.get(name) {
            Some(value) if value.shape() == var.shape() => {
                set(name, var, value)?;
                report.loaded.push(name.clone())
            }
            _ => report.missing.push(name.clone()),
        }
    }
    report.unexpected = tensors
        .keys()
        .filter(|k| !tensor_data.contains_key(*k))
        .cloned()
        .collect();
    report.loaded.sort();
    report.missing.sort();
    report.unexpected.sort();
    tracing::info!(
        ?path,
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "partially loaded checkpoint"
    );
    Ok(report)
}
