use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Bool, ElementConversion, Tensor};
use gsmap_scene::{inverse_sigmoid, masks, GaussianStore, ParamName, StoreError};
use tracing::trace_span;

use crate::config::PruneConfig;
use crate::screen_map::ScreenIndexMap;

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

/// Opacity every point is reset to.
const RESET_OPACITY: f32 = 0.01;
/// Silhouette above which a pixel is considered well covered.
const SILHOUETTE_THRESHOLD: f32 = 0.99;
/// Margin below the worst depth error that still counts as inconsistent.
const DEPTH_ERROR_MARGIN: f32 = 0.01;
/// Points bigger than this fraction of the scene radius are removed.
const BIG_POINT_FRACTION: f32 = 0.1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub num_transparent: usize,
    pub num_big: usize,
    pub num_depth: usize,
    /// Points removed by any rule. Rules overlap, so this can be less than the sum.
    pub num_removed: usize,
    pub opacities_reset: bool,
}

/// Rendered and observed depth of one frame, all `[H, W]`.
#[derive(Clone, Debug)]
pub struct DepthFrame<B: Backend> {
    pub rendered: Tensor<B, 2>,
    pub silhouette: Tensor<B, 2>,
    pub observed: Tensor<B, 2>,
}

impl<B: Backend> DepthFrame<B> {
    pub fn new(
        rendered: Tensor<B, 2>,
        silhouette: Tensor<B, 2>,
        observed: Tensor<B, 2>,
    ) -> Result<Self, StoreError> {
        let size = rendered.dims();
        for other in [silhouette.dims(), observed.dims()] {
            if other != size {
                return Err(StoreError::FrameSize(size, other));
            }
        }
        Ok(Self {
            rendered,
            silhouette,
            observed,
        })
    }

    /// `[height, width]`
    pub fn dims(&self) -> [usize; 2] {
        self.rendered.dims()
    }

    /// Row-major mask of the well covered pixels whose depth error is within a small
    /// margin of the worst error in the frame.
    pub fn inconsistent_pixels(&self) -> Tensor<B, 1, Bool> {
        let [height, width] = self.dims();
        let num_pixels = height * width;
        if num_pixels == 0 {
            return masks::falses(0, &self.rendered.device());
        }

        let error = (self.rendered.clone() - self.observed.clone())
            .abs()
            .reshape([num_pixels]);
        let max_error = error.clone().max().into_scalar().elem::<f32>();

        let covered = self
            .silhouette
            .clone()
            .reshape([num_pixels])
            .greater_elem(SILHOUETTE_THRESHOLD);
        let worst = error.greater_elem(max_error - DEPTH_ERROR_MARGIN);
        masks::all(covered, worst)
    }
}

pub(crate) fn transparent_mask<B: AutodiffBackend>(
    store: &GaussianStore<B>,
    threshold: f32,
) -> Result<Tensor<Inner<B>, 1, Bool>, StoreError> {
    Ok(store.opacities()?.lower_elem(threshold))
}

pub(crate) fn big_mask<B: AutodiffBackend>(
    store: &GaussianStore<B>,
) -> Result<Tensor<Inner<B>, 1, Bool>, StoreError> {
    let limit = BIG_POINT_FRACTION * store.scene_radius();
    Ok(store.max_scales()?.greater_elem(limit))
}

/// Points owning a pixel whose rendered depth disagrees with the observation.
pub fn depth_mask<B: Backend>(
    camera_means3d: Tensor<B, 2>,
    frame: &DepthFrame<B>,
) -> Tensor<B, 1, Bool> {
    let _span = trace_span!("Depth consistency").entered();
    let [height, width] = frame.dims();
    let num_points = camera_means3d.dims()[0];
    let map = ScreenIndexMap::build(camera_means3d, width, height);
    map.owners_of(frame.inconsistent_pixels(), num_points)
}

/// Overwrite every opacity with a small constant. The old momentum of the opacities is
/// dropped, everything else is untouched.
pub fn reset_opacities<B: AutodiffBackend>(store: &mut GaussianStore<B>) -> Result<(), StoreError> {
    let _span = trace_span!("Reset opacities").entered();
    if store.num_points() == 0 {
        return Ok(());
    }
    let reset = store
        .inner(ParamName::LogitOpacities)?
        .full_like(inverse_sigmoid(RESET_OPACITY));
    store.overwrite(ParamName::LogitOpacities, reset)?;
    log::debug!("Reset opacity of {} points", store.num_points());
    Ok(())
}

pub(crate) fn reset_due(iter: u32, enabled: bool, every: u32) -> bool {
    enabled && every > 0 && iter > 0 && iter % every == 0
}

/// Remove transparent, oversized and depth-inconsistent points, then reset opacities on
/// their own cadence. Returns `None` when nothing was scheduled this iteration.
///
/// The depth rule needs `depth` and the camera-space positions of the current points;
/// without either it is skipped.
pub fn prune_gaussians<B: AutodiffBackend>(
    store: &mut GaussianStore<B>,
    iter: u32,
    config: &PruneConfig,
    depth: Option<&DepthFrame<Inner<B>>>,
) -> Result<Option<PruneStats>, StoreError> {
    if iter > config.stop_after {
        return Ok(None);
    }

    let mut stats = PruneStats::default();
    let mut active = false;

    let scheduled = iter >= config.start_after && iter % config.prune_every.max(1) == 0;
    if scheduled && store.num_points() == 0 {
        log::debug!("Iteration {iter}: no points to prune");
        active = true;
    } else if scheduled {
        let _span = trace_span!("Prune", iter).entered();
        active = true;

        let threshold = if iter == config.stop_after {
            config.final_removal_opacity_threshold
        } else {
            config.removal_opacity_threshold
        };
        let mut remove = transparent_mask(store, threshold)?;
        stats.num_transparent = masks::count(remove.clone());

        if iter >= config.remove_big_after {
            let big = big_mask(store)?;
            stats.num_big = masks::count(big.clone());
            remove = masks::any(remove, big);
        }

        match (depth, store.stats().camera_means3d.clone()) {
            (Some(frame), Some(camera_means3d)) => {
                let inconsistent = depth_mask(camera_means3d, frame);
                stats.num_depth = masks::count(inconsistent.clone());
                remove = masks::any(remove, inconsistent);
            }
            (Some(_), None) => {
                log::debug!(
                    "No camera-space positions for the current points, skipping depth pruning"
                );
            }
            (None, _) => {}
        }

        stats.num_removed = store.shrink(remove)?;
        log::info!(
            "Iteration {iter}: pruned {} points ({} transparent, {} big, {} depth), {} left",
            stats.num_removed,
            stats.num_transparent,
            stats.num_big,
            stats.num_depth,
            store.num_points()
        );
    }

    if reset_due(iter, config.reset_opacities, config.reset_opacities_every) {
        reset_opacities(store)?;
        stats.opacities_reset = true;
        active = true;
    }

    Ok(active.then_some(stats))
}
