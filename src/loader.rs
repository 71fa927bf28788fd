//! Checkpoint resolution: a local directory or a Hub model id, yielding the
//! config / tokenizer / safetensors paths the rest of the crate consumes.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use candle::{bail, DType, Result};
use hf_hub::api::sync::Api;

const WEIGHTS_INDEX: &str = "model.safetensors.index.json";
const WEIGHTS_SINGLE: &str = "model.safetensors";

#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

pub fn resolve_model(model_path: &str) -> Result<ModelPaths> {
    let dir = Path::new(model_path);
    if dir.is_dir() {
        resolve_local(dir)
    } else {
        resolve_hub(model_path)
    }
}

fn resolve_local(dir: &Path) -> Result<ModelPaths> {
    let config = dir.join("config.json");
    let tokenizer = dir.join("tokenizer.json");
    for required in [&config, &tokenizer] {
        if !required.is_file() {
            bail!("checkpoint file {} is missing", required.display());
        }
    }
    let index = dir.join(WEIGHTS_INDEX);
    let single = dir.join(WEIGHTS_SINGLE);
    let weights = if index.is_file() {
        shard_names(&index)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    } else if single.is_file() {
        vec![single]
    } else {
        bail!("no safetensors weights found in {}", dir.display());
    };
    Ok(ModelPaths {
        config,
        tokenizer,
        weights,
    })
}

fn resolve_hub(model_id: &str) -> Result<ModelPaths> {
    let hub_err = |e: hf_hub::api::sync::ApiError| candle::Error::Msg(e.to_string());
    let api = Api::new().map_err(hub_err)?;
    let repo = api.model(model_id.to_string());
    let config = repo.get("config.json").map_err(hub_err)?;
    let tokenizer = repo.get("tokenizer.json").map_err(hub_err)?;
    let weights = match repo.get(WEIGHTS_INDEX) {
        Ok(index) => shard_names(&index)?
            .iter()
            .map(|name| repo.get(name).map_err(hub_err))
            .collect::<Result<Vec<_>>>()?,
        // not sharded, expect a single weights file
        Err(_) => vec![repo.get(WEIGHTS_SINGLE).map_err(hub_err)?],
    };
    Ok(ModelPaths {
        config,
        tokenizer,
        weights,
    })
}

fn shard_names(index: &Path) -> Result<Vec<String>> {
    let json: serde_json::Value = serde_json::from_reader(File::open(index)?)
        .map_err(|e| candle::Error::Msg(e.to_string()))?;
    shard_names_from_index(&json)
        .ok_or_else(|| candle::Error::Msg(format!("no weight map in {}", index.display())))
}

fn shard_names_from_index(index: &serde_json::Value) -> Option<Vec<String>> {
    let weight_map = index.get("weight_map")?.as_object()?;
    let names: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    Some(names.into_iter().map(str::to_string).collect())
}

/// Final path component of the checkpoint location, folding `checkpoint-*`
/// leaf directories into their parent name.
pub fn model_name_from_path(model_path: &str) -> String {
    let components: Vec<&str> = model_path
        .trim_end_matches('/')
        .split('/')
        .filter(|part| !part.is_empty())
        .collect();
    match components.as_slice() {
        [] => model_path.to_string(),
        [.., parent, leaf] if leaf.starts_with("checkpoint-") => format!("{parent}_{leaf}"),
        [.., leaf] => (*leaf).to_string(),
    }
}

pub fn weight_dtype(torch_dtype: &str) -> Result<DType> {
    match torch_dtype {
        "float16" => Ok(DType::F16),
        "bfloat16" => Ok(DType::BF16),
        dtype => bail!("unsupported weight dtype `{dtype}`"),
    }
}
