use burn::lr_scheduler::LrScheduler;
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Bool, Tensor};
use gsmap_scene::lr::ExponentialLr;
use gsmap_scene::{GaussianStore, ParamName, StoreError};
use tracing::trace_span;

use crate::config::TrainConfig;
use crate::densify::{densify_gaussians, DensifyStats};
use crate::prune::{prune_gaussians, DepthFrame, PruneStats};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

/// What the renderer hands back for one iteration, after the backward pass.
#[derive(Clone, Debug)]
pub struct FrameOutputs<B: Backend> {
    /// Gradient of the loss with respect to the projected point positions, `[N, 2+]`.
    pub means2d_grad: Tensor<B, 2>,
    /// Points that contributed to the frame.
    pub seen: Tensor<B, 1, Bool>,
    /// Projected radius of every point.
    pub radii: Option<Tensor<B, 1>>,
    /// Camera-space positions, first two columns normalized to `[0, 1]` screen space.
    pub camera_means3d: Tensor<B, 2>,
    /// Enables depth-consistency pruning for this iteration.
    pub depth: Option<DepthFrame<B>>,
}

impl<B: Backend> FrameOutputs<B> {
    /// Every per point input must have one row per point.
    pub fn check_rows(&self, num_points: usize) -> Result<(), StoreError> {
        let rows = [
            Some(self.means2d_grad.dims()[0]),
            Some(self.seen.dims()[0]),
            self.radii.as_ref().map(|radii| radii.dims()[0]),
            Some(self.camera_means3d.dims()[0]),
        ];
        let mismatch = rows.into_iter().flatten().find(|&n| n != num_points);
        match mismatch {
            Some(actual) => Err(StoreError::StatsRows {
                expected: num_points,
                actual,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StepReport {
    pub iter: u32,
    pub lr_means3d: f64,
    pub groups_stepped: usize,
    pub densify: Option<DensifyStats>,
    pub prune: Option<PruneStats>,
    pub num_points: usize,
}

/// Drives one mapping iteration: statistics, densification, pruning and the optimizer
/// step, in that order.
pub struct MapTrainer {
    config: TrainConfig,
    sched_means: ExponentialLr,
}

impl MapTrainer {
    pub fn new(config: &TrainConfig) -> Self {
        let sched_means = config.lr.means3d_schedule(config.total_steps).init();
        Self {
            config: config.clone(),
            sched_means,
        }
    }

    /// Run everything that follows the backward pass of iteration `iter`.
    ///
    /// Groups that were rebuilt by densify or prune have no entry in `grads` anymore and
    /// skip this optimizer step. A frame with the wrong number of rows is rejected before
    /// anything is changed.
    pub fn step<B: AutodiffBackend>(
        &mut self,
        iter: u32,
        store: &mut GaussianStore<B>,
        grads: &mut B::Gradients,
        frame: FrameOutputs<Inner<B>>,
    ) -> Result<StepReport, StoreError> {
        let _span = trace_span!("Map step", iter).entered();

        frame.check_rows(store.num_points())?;

        // Callers may start or resume at any iteration.
        let iter_step = iter as usize;
        if self.sched_means.to_record::<Inner<B>>() != iter_step {
            self.sched_means = self.sched_means.clone().load_record::<Inner<B>>(iter_step);
        }
        let lr_means3d = self.sched_means.step();
        store.set_lr(ParamName::Means3D, lr_means3d)?;

        trace_span!("Housekeeping").in_scope(|| {
            let stats = store.stats_mut();
            stats.set_camera_means(frame.camera_means3d)?;
            if iter <= self.config.densify.stop_after {
                stats.accumulate(frame.means2d_grad, frame.seen)?;
                if let Some(radii) = frame.radii {
                    stats.observe_radii(radii)?;
                }
            }
            Ok::<_, StoreError>(())
        })?;

        let densify = densify_gaussians(store, iter, &self.config.densify)?;
        let prune = prune_gaussians(store, iter, &self.config.prune, frame.depth.as_ref())?;

        let groups_stepped = store.step(grads);

        Ok(StepReport {
            iter,
            lr_means3d,
            groups_stepped,
            densify,
            prune,
            num_points: store.num_points(),
        })
    }
}
