use std::f64::consts::FRAC_PI_2;

use burn::config::Config;
use burn::lr_scheduler::LrScheduler;
use burn::prelude::Backend;
use burn::LearningRate;
use clap::Args;

use crate::ParamName;

/// Log-linear decay from `lr_init` to `lr_final` over `max_steps`, optionally eased in
/// over the first `lr_delay_steps`.
#[derive(Config, Debug)]
pub struct ExponentialLrConfig {
    pub lr_init: f64,
    pub lr_final: f64,
    #[config(default = 0)]
    pub lr_delay_steps: u32,
    #[config(default = 1.0)]
    pub lr_delay_mult: f64,
    #[config(default = 1000000)]
    pub max_steps: u32,
}

impl ExponentialLrConfig {
    pub fn init(&self) -> ExponentialLr {
        ExponentialLr {
            config: self.clone(),
            current_step: 0,
        }
    }

    /// Learning rate at `step`. Negative steps, or a schedule that is zero at both ends,
    /// disable the parameter.
    pub fn rate(&self, step: i64) -> f64 {
        if step < 0 || (self.lr_init == 0.0 && self.lr_final == 0.0) {
            return 0.0;
        }

        let delay_rate = if self.lr_delay_steps > 0 {
            let t = (step as f64 / self.lr_delay_steps as f64).clamp(0.0, 1.0);
            self.lr_delay_mult + (1.0 - self.lr_delay_mult) * (FRAC_PI_2 * t).sin()
        } else {
            1.0
        };

        let t = (step as f64 / self.max_steps.max(1) as f64).clamp(0.0, 1.0);
        let log_lr = self.lr_init.ln() * (1.0 - t) + self.lr_final.ln() * t;
        delay_rate * log_lr.exp()
    }
}

/// Stateful form of [`ExponentialLrConfig`], stepping once per call like burn's schedulers.
#[derive(Clone, Debug)]
pub struct ExponentialLr {
    config: ExponentialLrConfig,
    current_step: usize,
}

impl LrScheduler for ExponentialLr {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        let lr = self.config.rate(self.current_step as i64);
        self.current_step += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.current_step
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.current_step = record;
        self
    }
}

#[derive(Config, Args)]
pub struct LearningRates {
    /// Start learning rate of the point positions.
    #[config(default = 1e-4)]
    #[arg(long, help_heading = "Learning rates", default_value = "1e-4")]
    pub lr_means3d: f64,

    /// Final learning rate of the point positions.
    #[config(default = 1e-6)]
    #[arg(long, help_heading = "Learning rates", default_value = "1e-6")]
    pub lr_means3d_final: f64,

    /// Number of steps over which the position learning rate is eased in.
    #[config(default = 0)]
    #[arg(long, help_heading = "Learning rates", default_value = "0")]
    pub lr_means3d_delay_steps: u32,

    /// Fraction of the position learning rate used at the start of the ease in.
    #[config(default = 1.0)]
    #[arg(long, help_heading = "Learning rates", default_value = "1.0")]
    pub lr_means3d_delay_mult: f64,

    /// Learning rate of the colors.
    #[config(default = 2.5e-3)]
    #[arg(long, help_heading = "Learning rates", default_value = "2.5e-3")]
    pub lr_rgb_colors: f64,

    /// Learning rate of the rotations.
    #[config(default = 1e-3)]
    #[arg(long, help_heading = "Learning rates", default_value = "1e-3")]
    pub lr_unnorm_rotations: f64,

    /// Learning rate of the opacity logits.
    #[config(default = 5e-2)]
    #[arg(long, help_heading = "Learning rates", default_value = "5e-2")]
    pub lr_logit_opacities: f64,

    /// Learning rate of the log scales.
    #[config(default = 1e-3)]
    #[arg(long, help_heading = "Learning rates", default_value = "1e-3")]
    pub lr_log_scales: f64,

    /// Learning rate of the camera rotations. Zero keeps the poses fixed.
    #[config(default = 0.0)]
    #[arg(long, help_heading = "Learning rates", default_value = "0.0")]
    pub lr_cam_unnorm_rots: f64,

    /// Learning rate of the camera translations. Zero keeps the poses fixed.
    #[config(default = 0.0)]
    #[arg(long, help_heading = "Learning rates", default_value = "0.0")]
    pub lr_cam_trans: f64,
}

impl LearningRates {
    pub fn for_param(&self, name: ParamName) -> f64 {
        match name {
            ParamName::Means3D => self.lr_means3d,
            ParamName::RgbColors => self.lr_rgb_colors,
            ParamName::UnnormRotations => self.lr_unnorm_rotations,
            ParamName::LogitOpacities => self.lr_logit_opacities,
            ParamName::LogScales => self.lr_log_scales,
            ParamName::CamUnnormRots => self.lr_cam_unnorm_rots,
            ParamName::CamTrans => self.lr_cam_trans,
        }
    }

    /// Schedule driving the position learning rate over `max_steps`.
    pub fn means3d_schedule(&self, max_steps: u32) -> ExponentialLrConfig {
        ExponentialLrConfig::new(self.lr_means3d, self.lr_means3d_final)
            .with_lr_delay_steps(self.lr_means3d_delay_steps)
            .with_lr_delay_mult(self.lr_means3d_delay_mult)
            .with_max_steps(max_steps)
    }
}
