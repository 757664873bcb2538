use refcap_transformers::models::caption;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub model: caption::Config,
    pub lr: f64,
    /// Learning rate of the backbone parameters, `0` keeps the backbone frozen.
    pub lr_backbone: f64,
    pub weight_decay: f64,
    pub epochs: usize,
    pub start_epoch: usize,
    pub batch_size: usize,
    pub clip_max_norm: f64,
    pub seed: u64,
    pub max_image_size: u32,
    pub max_caption_length: usize,
    pub annotations: PathBuf,
    pub image_root: PathBuf,
    /// Local `tokenizer.json`, fetched from the hub when missing.
    pub tokenizer: Option<PathBuf>,
    pub checkpoint_path: PathBuf,
    pub prefix: String,
    pub transformer_type: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: caption::Config::default(),
            lr: 1e-4,
            lr_backbone: 1e-5,
            weight_decay: 1e-4,
            epochs: 30,
            start_epoch: 0,
            batch_size: 32,
            clip_max_norm: 0.1,
            seed: 42,
            max_image_size: 299,
            max_caption_length: 128,
            annotations: PathBuf::from("data/refcoco.jsonl"),
            image_root: PathBuf::from("data/images"),
            tokenizer: None,
            checkpoint_path: PathBuf::from("checkpoints"),
            prefix: "refcoco".to_string(),
            transformer_type: "concat".to_string(),
        }
    }
}

impl TrainingConfig {
    pub fn from_file<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(p.as_ref())?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Rejects settings that would only fail once the first batch reaches the model.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.model.variant()?;
        if self.max_caption_length > self.model.max_position_embeddings {
            anyhow::bail!(
                "max_caption_length {} exceeds the {} position embeddings of the model",
                self.max_caption_length,
                self.model.max_position_embeddings
            )
        }
        if self.max_caption_length < 2 {
            anyhow::bail!("max_caption_length must leave room for the start and end tokens")
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive")
        }
        Ok(())
    }

    /// `{transformer_type}_{prefix}{_loc}{_glob}_checkpoint_{epoch}.safetensors`
    pub fn checkpoint_name(&self, epoch: usize) -> String {
        let loc = if self.model.use_location_features {
            "_loc"
        } else {
            ""
        };
        let glob = if self.model.use_global_features {
            "_glob"
        } else {
            ""
        };
        format!(
            "{}_{}{loc}{glob}_checkpoint_{epoch}.safetensors",
            self.transformer_type, self.prefix
        )
    }

    pub fn checkpoint_file(&self, epoch: usize) -> PathBuf {
        self.checkpoint_path.join(self.checkpoint_name(epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_names() {
        let mut cfg = TrainingConfig::default();
        assert_eq!(cfg.checkpoint_name(3), "concat_refcoco_checkpoint_3.safetensors");
        cfg.model.use_location_features = true;
        cfg.model.use_global_features = true;
        cfg.prefix = "refcocog".to_string();
        assert_eq!(
            cfg.checkpoint_name(12),
            "concat_refcocog_loc_glob_checkpoint_12.safetensors"
        );
    }

    #[test]
    fn validation() {
        let mut cfg = TrainingConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.max_caption_length = cfg.model.max_position_embeddings + 1;
        assert!(cfg.validate().is_err());
        cfg.max_caption_length = 64;
        cfg.model.use_global_features = true;
        assert!(cfg.validate().is_err());
        cfg.model.use_location_features = true;
        assert!(cfg.validate().is_ok());
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() -> anyhow::Result<()> {
        let cfg: TrainingConfig =
            serde_json::from_str(r#"{"lr": 0.001, "model": {"use_location_features": true}}"#)?;
        assert_eq!(cfg.lr, 1e-3);
        assert_eq!(cfg.lr_backbone, 1e-5);
        assert!(cfg.model.use_location_features);
        assert_eq!(cfg.model.hidden_dim, 256);
        Ok(())
    }
}
