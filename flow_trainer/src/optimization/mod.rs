mod adam;
mod muon;
mod optimizer;
mod sgd;

pub use adam::Adam;
pub use muon::{Muon, orthogonalize};
pub use optimizer::{Optimizer, OptimizerState};
pub use sgd::Sgd;

use rectified_flow::ParamLayout;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{Result, TrainErr, config::parse_kwargs};

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SgdKwargs {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AdamKwargs {
    lr: f32,
    betas: (f32, f32),
    eps: f32,
    weight_decay: f32,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MuonKwargs {
    lr: f32,
    momentum: f32,
    nesterov: bool,
    weight_decay: f32,
    adamw_lr: f32,
    adamw_betas: (f32, f32),
    adamw_eps: f32,
}

impl Default for SgdKwargs {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.,
            weight_decay: 0.,
        }
    }
}

impl AdamKwargs {
    fn with_decay(weight_decay: f32) -> Self {
        Self {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay,
        }
    }
}

impl Default for AdamKwargs {
    fn default() -> Self {
        Self::with_decay(0.)
    }
}

impl Default for MuonKwargs {
    fn default() -> Self {
        Self {
            lr: 0.02,
            momentum: 0.95,
            nesterov: true,
            weight_decay: 0.,
            adamw_lr: 3e-4,
            adamw_betas: (0.9, 0.95),
            adamw_eps: 1e-8,
        }
    }
}

/// Builds an optimizer by name.
///
/// # Arguments
/// * `name` - One of `sgd`, `sgd_momentum`, `adam`, `adamw` or `muon`.
/// * `kwargs` - The optimizer's hyperparameters, missing ones take their defaults.
/// * `layout` - The layout of the parameters it will update.
///
/// # Returns
/// The optimizer, or an error if the name or any argument is unknown.
pub fn build_optimizer(
    name: &str,
    kwargs: &Map<String, Value>,
    layout: &ParamLayout,
) -> Result<Box<dyn Optimizer>> {
    const KIND: &str = "optimizer";
    let len = layout.len();

    let optimizer: Box<dyn Optimizer> = match name {
        "sgd" | "sgd_momentum" => {
            let mut defaults = Map::new();
            if name == "sgd_momentum" {
                defaults.insert("momentum".into(), Value::from(0.9f64));
            }
            defaults.extend(kwargs.clone());

            let SgdKwargs {
                lr,
                momentum,
                weight_decay,
            } = parse_kwargs(KIND, &defaults)?;
            Box::new(Sgd::new(len, lr, momentum, weight_decay))
        }
        "adam" | "adamw" => {
            let mut defaults = Map::new();
            if name == "adamw" {
                defaults.insert("weight_decay".into(), Value::from(0.01f64));
            }
            defaults.extend(kwargs.clone());

            let AdamKwargs {
                lr,
                betas,
                eps,
                weight_decay,
            } = parse_kwargs(KIND, &defaults)?;
            Box::new(Adam::new(len, lr, betas, eps, weight_decay, name == "adamw"))
        }
        "muon" => {
            let MuonKwargs {
                lr,
                momentum,
                nesterov,
                weight_decay,
                adamw_lr,
                adamw_betas,
                adamw_eps,
            } = parse_kwargs(KIND, kwargs)?;

            let adamw = Adam::new(len, adamw_lr, adamw_betas, adamw_eps, weight_decay, true);
            Box::new(Muon::new(layout, lr, momentum, nesterov, weight_decay, adamw))
        }
        _ => {
            return Err(TrainErr::Unknown {
                kind: KIND,
                name: name.to_string(),
            });
        }
    };

    Ok(optimizer)
}

#[cfg(test)]
mod tests {
    use rectified_flow::arch::Init;
    use serde_json::json;

    use super::*;

    fn layout() -> ParamLayout {
        let mut layout = ParamLayout::new();
        layout.root().alloc("w", &[2, 2], Init::Zeros);
        layout
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn every_name_builds() {
        for name in ["sgd", "sgd_momentum", "adam", "adamw", "muon"] {
            let opt = build_optimizer(name, &Map::new(), &layout()).unwrap();
            assert_eq!(opt.normalizes_updates(), name == "muon");
        }
    }

    #[test]
    fn kwargs_override_defaults() {
        let opt = build_optimizer("adamw", &kwargs(json!({"lr": 0.5})), &layout()).unwrap();
        assert_eq!(opt.lr(), 0.5);
    }

    #[test]
    fn unknown_names_and_arguments_fail() {
        assert!(matches!(
            build_optimizer("lion", &Map::new(), &layout()),
            Err(TrainErr::Unknown { .. })
        ));
        assert!(matches!(
            build_optimizer("sgd", &kwargs(json!({"beta": 1.0})), &layout()),
            Err(TrainErr::InvalidKwargs { .. })
        ));
    }
}
