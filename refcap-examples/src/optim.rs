//! AdamW with a separate parameter group for the backbone and gradient norm clipping.
use crate::config::TrainingConfig;
use candle::backprop::GradStore;
use candle::{DType, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

pub const BACKBONE_PREFIX: &str = "backbone.";

/// Splits the variables of `varmap` into (backbone, rest), each sorted by name.
pub fn partition_vars(varmap: &VarMap) -> Result<(Vec<Var>, Vec<Var>)> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle::Error::Msg(format!("var map lock poisoned: {e}")))?;
    let mut named: Vec<(&String, &Var)> = data.iter().collect();
    named.sort_by(|(l, _), (r, _)| l.cmp(r));
    let mut backbone = vec![];
    let mut rest = vec![];
    for (name, var) in named {
        if name.starts_with(BACKBONE_PREFIX) {
            backbone.push(var.clone())
        } else {
            rest.push(var.clone())
        }
    }
    Ok((backbone, rest))
}

/// Rescales the gradients of `vars` in place so that their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            total += grad
                .to_dtype(DType::F64)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if max_norm > 0. && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var) {
                let grad = (grad * scale)?;
                grads.insert(var, grad);
            }
        }
    }
    Ok(norm)
}

pub struct CaptionOptimizer {
    model: AdamW,
    backbone: Option<AdamW>,
    vars: Vec<Var>,
    max_norm: f64,
}

impl CaptionOptimizer {
    pub fn new(varmap: &VarMap, cfg: &TrainingConfig) -> Result<Self> {
        let (backbone_vars, model_vars) = partition_vars(varmap)?;
        let params = |lr| ParamsAdamW {
            lr,
            weight_decay: cfg.weight_decay,
            ..Default::default()
        };
        let mut vars = model_vars.clone();
        let backbone = if cfg.lr_backbone > 0. {
            vars.extend(backbone_vars.iter().cloned());
            Some(AdamW::new(backbone_vars, params(cfg.lr_backbone))?)
        } else {
            None
        };
        let model = AdamW::new(model_vars, params(cfg.lr))?;
        tracing::info!(
            trainable = vars.len(),
            frozen_backbone = backbone.is_none(),
            "optimizer ready"
        );
        Ok(Self {
            model,
            backbone,
            vars,
            max_norm: cfg.clip_max_norm,
        })
    }

    pub fn trainable_vars(&self) -> &[Var] {
        &self.vars
    }

    /// Backpropagates `loss`, clips the gradients and updates both parameter groups. Returns the
    /// gradient norm before clipping.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f64> {
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&mut grads, &self.vars, self.max_norm)?;
        self.model.step(&grads)?;
        if let Some(backbone) = self.backbone.as_mut() {
            backbone.step(&grads)?;
        }
        Ok(norm)
    }
}
