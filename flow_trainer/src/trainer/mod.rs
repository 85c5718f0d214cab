mod handle;
mod phase;

pub use handle::ModelHandle;
pub use phase::Phase;

use std::{path::Path, path::PathBuf, sync::Arc};

use log::{debug, info, warn};
use ndarray::ArrayD;
use rand::{SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use rectified_flow::FlowModel;

use crate::{
    Result, TrainErr,
    autoencoder::{self, Autoencoder},
    checkpoint::{self, Checkpoint, CheckpointErr},
    collective::Collective,
    config::{ClipPolicy, RunConfig},
    data::DataSource,
    ema::Ema,
    metrics::{self, LogHelper, MetricRecord, MetricsSink, Timer},
    optimization::{Optimizer, OptimizerState, build_optimizer},
    sampler::{self, EmaDenoiser, Sampler},
    scaler::{GradScaler, ScalerState},
    scheduler::{LrScheduler, build_scheduler},
};

/// What only exists once the trainer has been prepared.
struct Prepared {
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LrScheduler>>,
    ema: Ema,
    sink: Option<Box<dyn MetricsSink>>,
    clip: bool,
}

/// Owns the whole training lifecycle of one worker.
pub struct Trainer {
    config: RunConfig,
    phase: Phase,
    collective: Arc<dyn Collective>,
    model: ModelHandle,
    autoencoder: Arc<dyn Autoencoder>,
    sampler: Box<dyn Sampler>,
    params: Vec<f32>,
    grad: Vec<f32>,
    scaler: GradScaler,
    prepared: Option<Prepared>,
    log_helper: LogHelper,
    timer: Timer,
    rng: StdRng,
    accumulation: usize,
    micro_steps: usize,
    steps: u64,
    last_latents: Option<ArrayD<f32>>,
}

impl Trainer {
    /// Creates a new `Trainer` with freshly initialized parameters.
    ///
    /// # Arguments
    /// * `config` - The run's config, validated here.
    /// * `collective` - The worker group this trainer belongs to.
    pub fn new(config: RunConfig, collective: Arc<dyn Collective>) -> Result<Self> {
        let autoencoder = autoencoder::build_autoencoder(&config.train)?;
        Self::with_autoencoder(config, collective, autoencoder)
    }

    /// Creates a new `Trainer` around an already built autoencoder.
    pub fn with_autoencoder(
        config: RunConfig,
        collective: Arc<dyn Collective>,
        autoencoder: Arc<dyn Autoencoder>,
    ) -> Result<Self> {
        config.validate()?;
        let train = &config.train;

        let model = FlowModel::new(&config.model)?;
        let params = model.init_params(&mut StdRng::seed_from_u64(train.seed))?;
        let grad = vec![0.; params.len()];

        let rng = window_rng(train.seed, collective.rank(), 0);

        Ok(Self {
            sampler: sampler::build_sampler(&train.sampler_id, train.sample_steps)?,
            scaler: GradScaler::new(train.scaler.clone()),
            accumulation: train.accumulation_steps(),
            model: ModelHandle::new(model, Arc::clone(&collective)),
            phase: Phase::Uninitialized,
            prepared: None,
            log_helper: LogHelper::new(),
            timer: Timer::start(),
            micro_steps: 0,
            steps: 0,
            last_latents: None,
            collective,
            autoencoder,
            params,
            grad,
            rng,
            config,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The amount of completed update windows.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// The averaged parameters, `None` before `prepare`.
    pub fn ema_params(&self) -> Option<&[f32]> {
        self.prepared.as_ref().map(|p| p.ema.shadow())
    }

    pub fn optimizer_state(&self) -> Option<OptimizerState> {
        self.prepared.as_ref().map(|p| p.optimizer.state_dict())
    }

    pub fn scaler_state(&self) -> ScalerState {
        self.scaler.state()
    }

    /// The learning rate of the next update, `None` before `prepare`.
    pub fn lr(&self) -> Option<f32> {
        self.prepared.as_ref().map(|p| p.optimizer.lr())
    }

    fn expect_phase(&self, op: &'static str, allowed: &[Phase]) -> Result<()> {
        if !allowed.contains(&self.phase) {
            return Err(TrainErr::InvalidPhase { op, phase: self.phase });
        }

        Ok(())
    }

    /// Builds the optimizer, the scheduler and the EMA, synchronizes the
    /// parameters across the group and restores the resume checkpoint.
    pub fn prepare(&mut self) -> Result<()> {
        self.expect_phase("prepare", &[Phase::Uninitialized])?;
        let train = &self.config.train;

        self.collective.broadcast(&mut self.params, 0)?;

        let layout = self.model.unwrapped_model().core().layout();
        let mut optimizer = build_optimizer(&train.opt, &train.opt_kwargs, layout)?;
        let scheduler = match &train.scheduler {
            Some(name) => {
                let scheduler = build_scheduler(name, &train.scheduler_kwargs, optimizer.lr())?;
                optimizer.set_lr(scheduler.lr());
                Some(scheduler)
            }
            None => None,
        };

        let clip = match train.clip_policy {
            ClipPolicy::Auto => !optimizer.normalizes_updates(),
            ClipPolicy::Always => true,
            ClipPolicy::Never => false,
        };
        info!(clip = clip, max_norm = train.max_grad_norm; "clip policy {:?}", train.clip_policy);

        let sink = if self.collective.is_leader() {
            Some(metrics::build_sink(&self.config.logging)?)
        } else {
            None
        };

        self.prepared = Some(Prepared {
            ema: Ema::new(train.ema.clone(), &self.params),
            optimizer,
            scheduler,
            sink,
            clip,
        });

        info!(
            rank = self.collective.rank(),
            params = self.params.len(),
            accumulation = self.accumulation,
            replicated = self.model.is_replicated();
            "trainer prepared"
        );
        self.phase = Phase::Ready;

        if let Some(path) = self.config.train.resume_ckpt.clone() {
            self.load_checkpoint(&path)?;
        }

        Ok(())
    }

    /// Runs every epoch of `source`, or until `max_steps` updates.
    ///
    /// # Returns
    /// The amount of completed updates.
    pub fn train(&mut self, source: &mut dyn DataSource) -> Result<u64> {
        self.expect_phase("train", &[Phase::Ready])?;
        self.phase = Phase::Running;
        self.timer = Timer::start();

        let epochs = self.config.train.epochs;
        'epochs: for epoch in 0..epochs {
            source.reset();

            while let Some(batch) = source.next_batch() {
                if self.reached_max_steps() {
                    break 'epochs;
                }

                self.micro_step(batch?)?;
            }

            info!(epoch = epoch, steps = self.steps; "epoch finished");
        }

        if self.micro_steps > 0 {
            debug!(micro_steps = self.micro_steps; "dropping an incomplete accumulation window");
            self.grad.fill(0.);
            self.micro_steps = 0;
        }

        if let Some(sink) = self.prepared.as_mut().and_then(|p| p.sink.as_mut()) {
            sink.flush()?;
        }

        self.phase = Phase::Terminated;
        info!(steps = self.steps; "training finished");
        Ok(self.steps)
    }

    fn reached_max_steps(&self) -> bool {
        self.config.train.max_steps.is_some_and(|max| self.steps >= max)
    }

    /// Accumulates the gradient of one raw batch, completing an update
    /// window every `accumulation` calls.
    ///
    /// # Returns
    /// The window's metrics when this call completed one.
    pub fn micro_step(&mut self, mut batch: ArrayD<f32>) -> Result<Option<MetricRecord>> {
        self.expect_phase("micro_step", &[Phase::Ready, Phase::Running])?;
        let train = &self.config.train;

        if self.micro_steps == 0 {
            self.rng = window_rng(train.seed, self.collective.rank(), self.steps);
        }

        train.precision.round_array(&mut batch);
        let mut latents = self.autoencoder.encode(batch.view())?;
        let vae_scale = train.vae_scale;
        latents.par_mapv_inplace(|v| v / vae_scale);
        train.precision.round_array(&mut latents);

        let loss = self.model.forward(&self.params, latents.view(), &mut self.rng)?;
        let seed = self.scaler.scale() / self.accumulation as f32;
        self.model.backward(&self.params, &mut self.grad, seed)?;

        self.log_helper.log("diffusion_loss", loss as f64);
        self.last_latents = Some(latents);
        self.micro_steps += 1;

        if self.micro_steps < self.accumulation {
            return Ok(None);
        }

        self.micro_steps = 0;
        self.finish_window().map(Some)
    }

    fn finish_window(&mut self) -> Result<MetricRecord> {
        let Self {
            config,
            collective,
            model,
            autoencoder,
            sampler,
            params,
            grad,
            scaler,
            prepared,
            log_helper,
            timer,
            rng,
            steps,
            last_latents,
            ..
        } = &mut *self;

        let train = &config.train;
        let prepared = prepared.as_mut().ok_or(TrainErr::InvalidPhase {
            op: "finish_window",
            phase: Phase::Uninitialized,
        })?;

        let found_inf = scaler.unscale(grad);
        let grad_norm = (prepared.clip && !found_inf).then(|| clip_grad_norm(grad, train.max_grad_norm));

        if found_inf {
            warn!(step = *steps, scale = scaler.scale(); "non finite gradients, skipping the update");
        } else {
            prepared.optimizer.step(grad, params)?;
        }

        grad.fill(0.);
        scaler.update(found_inf);

        if let Some(scheduler) = prepared.scheduler.as_mut() {
            scheduler.step();
            prepared.optimizer.set_lr(scheduler.lr());
        }

        if !found_inf {
            prepared.ema.update(params)?;
        }

        let means = log_helper.pop(&**collective)?;
        let mut record = MetricRecord::new(*steps);
        for (name, mean) in means {
            record.scalar(&name, mean);
        }

        record.scalar("time", timer.lap().as_secs_f64());
        record.scalar("lr", prepared.optimizer.lr() as f64);
        if scaler.is_enabled() {
            record.scalar("loss_scale", scaler.scale() as f64);
        }
        record.scalar("skipped_step", if found_inf { 1. } else { 0. });
        if let Some(norm) = grad_norm {
            record.scalar("grad_norm", norm as f64);
        }

        if collective.is_leader() && *steps % train.sample_interval == 0 {
            if let Some(template) = last_latents.as_ref() {
                let decode = |z: ndarray::ArrayViewD<f32>| autoencoder.decode(z);
                let samples = EmaDenoiser::new(model.unwrapped_model().core(), prepared.ema.shadow())
                    .and_then(|mut denoiser| {
                        sampler.sample(&mut denoiser, template.view(), &decode, train.vae_scale, rng)
                    });

                match samples {
                    Ok(samples) => {
                        let shape = samples.shape().to_vec();
                        record.media("samples", shape, samples.iter().copied().collect());
                    }
                    Err(e) => warn!(step = *steps; "sampling failed: {e}"),
                }
            }
        }

        if let Some(sink) = prepared.sink.as_mut() {
            sink.emit(&record)?;
        }

        *steps += 1;
        if *steps % train.save_interval == 0 {
            let previous = std::mem::replace(&mut self.phase, Phase::Checkpointing);
            let saved = match self.collective.is_leader() {
                true => self.save_checkpoint().map(drop),
                false => Ok(()),
            };

            self.phase = previous;
            saved?;
            self.collective.barrier()?;
        }

        self.collective.barrier()?;
        Ok(record)
    }

    /// Writes the current state to `checkpoint_dir/step_<steps>.safetensors`.
    pub fn save_checkpoint(&mut self) -> Result<PathBuf> {
        self.expect_phase("save_checkpoint", &[Phase::Ready, Phase::Running, Phase::Checkpointing])?;
        let prepared = self.prepared.as_ref().ok_or(TrainErr::InvalidPhase {
            op: "save_checkpoint",
            phase: self.phase,
        })?;

        let previous = std::mem::replace(&mut self.phase, Phase::Checkpointing);
        let snapshot = Checkpoint {
            steps: self.steps,
            model: self.params.clone(),
            ema: prepared.ema.shadow().to_vec(),
            ema_state: prepared.ema.state(),
            opt: prepared.optimizer.state_dict(),
            scaler: self.scaler.state(),
            scheduler: prepared.scheduler.as_ref().map(|s| s.state_dict()),
        };

        let layout = self.model.unwrapped_model().core().layout();
        let saved = checkpoint::save(&self.config.train.checkpoint_dir, &snapshot, layout);
        self.phase = previous;

        let path = saved?;
        info!(steps = self.steps; "checkpoint saved to {}", path.display());
        Ok(path)
    }

    /// Restores a checkpoint. Every part is validated before any of it is
    /// applied, on error the trainer is left untouched.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        self.expect_phase("load_checkpoint", &[Phase::Ready])?;
        let prepared = self.prepared.as_mut().ok_or(TrainErr::InvalidPhase {
            op: "load_checkpoint",
            phase: self.phase,
        })?;

        let layout = self.model.unwrapped_model().core().layout();
        let snapshot = checkpoint::read(path, layout)?;

        let mut optimizer = prepared.optimizer.boxed_clone();
        optimizer.load_state_dict(&snapshot.opt)?;

        let scheduler = match (&prepared.scheduler, &snapshot.scheduler) {
            (Some(scheduler), Some(state)) => {
                let mut scheduler = scheduler.boxed_clone();
                scheduler.load_state_dict(state)?;
                Some(scheduler)
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(CheckpointErr::MissingMetadata("scheduler").into());
            }
            (None, Some(_)) => {
                return Err(CheckpointErr::Incompatible(
                    "the checkpoint has a scheduler state but no scheduler is configured".into(),
                )
                .into());
            }
        };

        let mut ema = prepared.ema.clone();
        ema.load(&snapshot.ema, snapshot.ema_state)?;

        if !(snapshot.scaler.scale.is_finite() && snapshot.scaler.scale > 0.) {
            return Err(CheckpointErr::Incompatible(format!(
                "invalid loss scale {}",
                snapshot.scaler.scale
            ))
            .into());
        }

        prepared.optimizer = optimizer;
        prepared.scheduler = scheduler;
        prepared.ema = ema;
        self.scaler.load_state(snapshot.scaler);
        self.params = snapshot.model;
        self.grad.fill(0.);
        self.micro_steps = 0;
        self.log_helper = LogHelper::new();
        self.steps = snapshot.steps;

        info!(steps = self.steps; "resumed from {}", path.display());
        Ok(())
    }
}

/// The noise source of the window starting after `steps` updates.
///
/// Draws depend only on the seed, the rank and the step, so a resumed run
/// repeats them.
fn window_rng(seed: u64, rank: usize, steps: u64) -> StdRng {
    let rank = (rank as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let steps = steps.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    StdRng::seed_from_u64(seed ^ rank ^ steps)
}

const NORM_CHUNK: usize = 4096;

/// Scales `grad` so its global L2 norm is at most `max_norm`.
///
/// # Returns
/// The norm before clipping.
pub fn clip_grad_norm(grad: &mut [f32], max_norm: f32) -> f32 {
    // Fixed chunks keep the sum independent of rayon's splitting.
    let partials: Vec<f64> = grad
        .par_chunks(NORM_CHUNK)
        .map(|chunk| chunk.iter().map(|g| (*g as f64).powi(2)).sum())
        .collect();
    let norm = partials.iter().sum::<f64>().sqrt() as f32;
    let coef = max_norm / (norm + 1e-6);

    if coef < 1. {
        grad.par_iter_mut().for_each(|g| *g *= coef);
    }

    norm
}
