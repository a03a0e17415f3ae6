use burn::prelude::Backend;
use burn::tensor::{Bool, Int, Tensor};
use tracing::trace_span;

use crate::{masks, StoreError};

/// Per point running statistics used by densification and pruning. Every tensor
/// has one row per point; the store keeps them aligned with the parameters.
#[derive(Clone, Debug)]
pub struct DensityStats<B: Backend> {
    /// Sum of the screen-space gradient norms over the iterations a point was seen.
    pub means2d_gradient_accum: Tensor<B, 1>,
    /// Number of iterations a point was seen.
    pub denom: Tensor<B, 1>,
    pub max_2d_radius: Tensor<B, 1>,
    /// Visibility of the most recent iteration.
    pub seen: Tensor<B, 1, Bool>,
    /// Last projected camera-space positions. `None` until the next projection after
    /// a structural change.
    pub camera_means3d: Option<Tensor<B, 2>>,
    /// Gradient of the projected positions from the most recent accumulate.
    pub means2d_grad: Option<Tensor<B, 2>>,
    pub scene_radius: f32,
}

impl<B: Backend> DensityStats<B> {
    pub fn new(num_points: usize, scene_radius: f32, device: &B::Device) -> Self {
        Self {
            means2d_gradient_accum: Tensor::zeros([num_points], device),
            denom: Tensor::zeros([num_points], device),
            max_2d_radius: Tensor::zeros([num_points], device),
            seen: masks::falses(num_points, device),
            camera_means3d: None,
            means2d_grad: None,
            scene_radius,
        }
    }

    pub fn num_points(&self) -> usize {
        self.denom.dims()[0]
    }

    fn check_rows(&self, actual: usize) -> Result<(), StoreError> {
        let expected = self.num_points();
        if actual == expected {
            Ok(())
        } else {
            Err(StoreError::StatsRows { expected, actual })
        }
    }

    /// Add the screen-space gradient norm of every seen point to its running total
    /// and count the observation.
    pub fn accumulate(
        &mut self,
        means2d_grad: Tensor<B, 2>,
        seen: Tensor<B, 1, Bool>,
    ) -> Result<(), StoreError> {
        let [rows, cols] = means2d_grad.dims();
        self.check_rows(rows)?;
        self.check_rows(seen.dims()[0])?;
        let _span = trace_span!("Accumulate stats").entered();

        if rows == 0 {
            self.seen = seen;
            self.means2d_grad = Some(means2d_grad);
            return Ok(());
        }

        let xy = means2d_grad.clone().slice([0..rows, 0..cols.min(2)]);
        let norm = xy.powf_scalar(2.0).sum_dim(1).sqrt().squeeze(1);

        self.means2d_gradient_accum = self
            .means2d_gradient_accum
            .clone()
            .mask_where(seen.clone(), self.means2d_gradient_accum.clone() + norm);
        self.denom = self
            .denom
            .clone()
            .mask_where(seen.clone(), self.denom.clone() + 1.0);
        self.seen = seen;
        self.means2d_grad = Some(means2d_grad);
        Ok(())
    }

    /// Track the largest projected radius of the points seen this iteration.
    pub fn observe_radii(&mut self, radii: Tensor<B, 1>) -> Result<(), StoreError> {
        self.check_rows(radii.dims()[0])?;
        if self.num_points() == 0 {
            return Ok(());
        }
        let grown = self.max_2d_radius.clone().max_pair(radii);
        self.max_2d_radius = self
            .max_2d_radius
            .clone()
            .mask_where(self.seen.clone(), grown);
        Ok(())
    }

    pub fn set_camera_means(&mut self, camera_means3d: Tensor<B, 2>) -> Result<(), StoreError> {
        self.check_rows(camera_means3d.dims()[0])?;
        self.camera_means3d = Some(camera_means3d);
        Ok(())
    }

    /// Mean screen-space gradient per point. Points never seen have 0/0, which is
    /// treated as no densification pressure.
    pub fn average_grad(&self) -> Tensor<B, 1> {
        let avg = self.means2d_gradient_accum.clone() / self.denom.clone();
        avg.clone().mask_fill(avg.is_nan(), 0.0)
    }

    /// Zero every accumulator at the current point count.
    pub fn reset(&mut self) {
        *self = Self::new(self.num_points(), self.scene_radius, &self.denom.device());
    }

    pub(crate) fn keep_rows(&mut self, indices: Tensor<B, 1, Int>) {
        let _span = trace_span!("Compact stats").entered();
        self.means2d_gradient_accum = self
            .means2d_gradient_accum
            .clone()
            .select(0, indices.clone());
        self.denom = self.denom.clone().select(0, indices.clone());
        self.max_2d_radius = self.max_2d_radius.clone().select(0, indices.clone());
        self.seen = self.seen.clone().int().select(0, indices.clone()).bool();
        self.camera_means3d = self
            .camera_means3d
            .take()
            .map(|means| means.select(0, indices.clone()));
        self.means2d_grad = self.means2d_grad.take().map(|grad| grad.select(0, indices));
    }

    /// Extend every accumulator with `count` zero rows. Projections and gradients do not
    /// exist yet for new points, so they are dropped.
    pub(crate) fn extend(&mut self, count: usize) {
        let device = self.denom.device();
        let zeros = || Tensor::<B, 1>::zeros([count], &device);

        self.means2d_gradient_accum =
            Tensor::cat(vec![self.means2d_gradient_accum.clone(), zeros()], 0);
        self.denom = Tensor::cat(vec![self.denom.clone(), zeros()], 0);
        self.max_2d_radius = Tensor::cat(vec![self.max_2d_radius.clone(), zeros()], 0);
        self.seen = Tensor::cat(vec![self.seen.clone(), masks::falses(count, &device)], 0);
        self.camera_means3d = None;
        self.means2d_grad = None;
    }
}
