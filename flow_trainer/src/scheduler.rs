use std::f32::consts::PI;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{Result, TrainErr, config::parse_kwargs};

/// Drives an optimizer's learning rate as a function of the update count.
pub trait LrScheduler: Send {
    /// Advances the schedule by one optimizer update.
    fn step(&mut self);

    /// The learning rate at the current position.
    fn lr(&self) -> f32;

    fn state_dict(&self) -> Value;

    /// Restores the position, leaving the schedule untouched on error.
    fn load_state_dict(&mut self, state: &Value) -> Result<()>;

    fn boxed_clone(&self) -> Box<dyn LrScheduler>;
}

/// The shape of a learning rate schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Curve {
    Constant,
    LinearWarmup {
        warmup_steps: u64,
    },
    Cosine {
        warmup_steps: u64,
        total_steps: u64,
        min_lr: f32,
    },
}

impl Curve {
    fn lr(&self, base_lr: f32, step: u64) -> f32 {
        let warmup = |w: u64| ((step + 1) as f32 / w as f32).min(1.);

        match *self {
            Curve::Constant => base_lr,
            Curve::LinearWarmup { warmup_steps } if step < warmup_steps => base_lr * warmup(warmup_steps),
            Curve::LinearWarmup { .. } => base_lr,
            Curve::Cosine { warmup_steps, .. } if step < warmup_steps => base_lr * warmup(warmup_steps),
            Curve::Cosine {
                warmup_steps,
                total_steps,
                min_lr,
            } => {
                let span = total_steps.saturating_sub(warmup_steps).max(1);
                let progress = ((step - warmup_steps) as f32 / span as f32).min(1.);
                min_lr + (base_lr - min_lr) * 0.5 * (1. + (PI * progress).cos())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
struct SchedulerState {
    step: u64,
    base_lr: f32,
}

/// A scheduler following a fixed `Curve` from a base learning rate.
#[derive(Debug, Clone)]
pub struct CurveScheduler {
    curve: Curve,
    base_lr: f32,
    step: u64,
}

impl CurveScheduler {
    pub fn new(curve: Curve, base_lr: f32) -> Self {
        Self {
            curve,
            base_lr,
            step: 0,
        }
    }
}

impl LrScheduler for CurveScheduler {
    fn step(&mut self) {
        self.step += 1;
    }

    fn lr(&self) -> f32 {
        self.curve.lr(self.base_lr, self.step)
    }

    fn state_dict(&self) -> Value {
        serde_json::json!({ "step": self.step, "base_lr": self.base_lr })
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<()> {
        let SchedulerState { step, base_lr } = serde_json::from_value(state.clone())?;
        self.step = step;
        self.base_lr = base_lr;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn LrScheduler> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WarmupKwargs {
    warmup_steps: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CosineKwargs {
    #[serde(default)]
    warmup_steps: u64,
    total_steps: u64,
    #[serde(default)]
    min_lr: f32,
}

/// Builds a scheduler by name.
///
/// # Arguments
/// * `name` - One of `constant`, `linear_warmup` or `cosine`.
/// * `kwargs` - The schedule's arguments.
/// * `base_lr` - The optimizer's initial learning rate.
pub fn build_scheduler(
    name: &str,
    kwargs: &Map<String, Value>,
    base_lr: f32,
) -> Result<Box<dyn LrScheduler>> {
    const KIND: &str = "scheduler";

    let curve = match name {
        "constant" => {
            if !kwargs.is_empty() {
                return Err(TrainErr::InvalidKwargs {
                    kind: KIND,
                    msg: "constant takes no arguments".into(),
                });
            }

            Curve::Constant
        }
        "linear_warmup" => {
            let WarmupKwargs { warmup_steps } = parse_kwargs(KIND, kwargs)?;
            Curve::LinearWarmup { warmup_steps }
        }
        "cosine" => {
            let CosineKwargs {
                warmup_steps,
                total_steps,
                min_lr,
            } = parse_kwargs(KIND, kwargs)?;

            Curve::Cosine {
                warmup_steps,
                total_steps,
                min_lr,
            }
        }
        _ => {
            return Err(TrainErr::Unknown {
                kind: KIND,
                name: name.to_string(),
            });
        }
    };

    Ok(Box::new(CurveScheduler::new(curve, base_lr)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn warmup_ramps_linearly() {
        let mut sched = build_scheduler("linear_warmup", &map(json!({"warmup_steps": 4})), 1.0).unwrap();
        let mut lrs = vec![sched.lr()];
        for _ in 0..5 {
            sched.step();
            lrs.push(sched.lr());
        }

        assert_eq!(lrs, [0.25, 0.5, 0.75, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn cosine_decays_to_the_floor() {
        let kwargs = map(json!({"warmup_steps": 0, "total_steps": 10, "min_lr": 0.1}));
        let mut sched = build_scheduler("cosine", &kwargs, 1.0).unwrap();
        assert_eq!(sched.lr(), 1.0);

        for _ in 0..5 {
            sched.step();
        }
        assert!((sched.lr() - 0.55).abs() < 1e-6);

        for _ in 0..20 {
            sched.step();
        }
        assert!((sched.lr() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn state_restores_the_position() {
        let kwargs = map(json!({"total_steps": 100}));
        let mut sched = build_scheduler("cosine", &kwargs, 0.5).unwrap();
        for _ in 0..37 {
            sched.step();
        }

        let mut other = build_scheduler("cosine", &kwargs, 0.5).unwrap();
        other.load_state_dict(&sched.state_dict()).unwrap();
        assert_eq!(other.lr(), sched.lr());

        assert!(other.load_state_dict(&json!({"step": "x"})).is_err());
        assert_eq!(other.lr(), sched.lr());
    }

    #[test]
    fn unknown_schedules_fail() {
        assert!(matches!(
            build_scheduler("step", &Map::new(), 1.0),
            Err(TrainErr::Unknown { .. })
        ));
        assert!(build_scheduler("cosine", &Map::new(), 1.0).is_err());
    }
}
