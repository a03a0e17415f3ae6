use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Bool, Distribution, Tensor};
use gsmap_scene::{masks, quat, GaussianStore, ParamName, StoreError};
use tracing::trace_span;

use crate::config::DensifyConfig;
use crate::prune::{reset_due, reset_opacities, transparent_mask};

/// Points up to this fraction of the scene radius are cloned, larger ones are split.
const CLONE_SIZE_FRACTION: f32 = 0.01;
/// Children of a split are `1 / (SPLIT_SCALE_DIV * n)` the size of their parent.
const SPLIT_SCALE_DIV: f32 = 0.8;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DensifyStats {
    pub num_cloned: usize,
    /// Parents that were replaced by children.
    pub num_split: usize,
    /// Transparent points removed after growing.
    pub num_pruned: usize,
    pub opacities_reset: bool,
}

/// Duplicate small points under high screen-space gradient pressure as they are.
fn clone_points<B: AutodiffBackend>(
    store: &mut GaussianStore<B>,
    high_grad: Tensor<B::InnerBackend, 1, Bool>,
) -> Result<usize, StoreError> {
    let _span = trace_span!("Clone").entered();
    let small = store
        .max_scales()?
        .lower_equal_elem(CLONE_SIZE_FRACTION * store.scene_radius());
    let clone_mask = masks::all(high_grad, small);
    if masks::count(clone_mask.clone()) == 0 {
        return Ok(0);
    }

    let rows = store.select_points(masks::indices(clone_mask));
    store.grow(rows)
}

/// Replace big points under high gradient pressure by `n` smaller children sampled
/// around them.
fn split_points<B: AutodiffBackend>(
    store: &mut GaussianStore<B>,
    high_grad: Tensor<B::InnerBackend, 1, Bool>,
    n: usize,
) -> Result<usize, StoreError> {
    let _span = trace_span!("Split").entered();
    let large = store
        .max_scales()?
        .greater_elem(CLONE_SIZE_FRACTION * store.scene_radius());
    let split_mask = masks::all(high_grad, large);
    let split_count = masks::count(split_mask.clone());
    if split_count == 0 || n == 0 {
        return Ok(0);
    }

    let device = store.device().clone();
    let mut children = store
        .select_points(masks::indices(split_mask.clone()))
        .tile(n);
    let num_children = children.num_rows();

    let log_scales = children
        .get(ParamName::LogScales)
        .ok_or(StoreError::MissingGroup(ParamName::LogScales))?
        .clone();
    let rotations = children
        .get(ParamName::UnnormRotations)
        .ok_or(StoreError::MissingGroup(ParamName::UnnormRotations))?
        .clone();

    let normal = Distribution::Normal(0.0, 1.0);
    let samples = Tensor::random([num_children, 3], normal, &device) * log_scales.exp();
    let offsets = quat::rotate_vectors(rotations, samples);

    children.map(ParamName::Means3D, |means| means + offsets);
    children.map(ParamName::LogScales, |scales| {
        scales - (SPLIT_SCALE_DIV * n as f32).ln()
    });
    store.grow(children)?;

    // Only the parents go, their children stay.
    let remove = Tensor::cat(vec![split_mask, masks::falses(num_children, &device)], 0);
    store.shrink(remove)?;
    Ok(split_count)
}

/// Clone and split points based on their average screen-space gradient, then drop
/// transparent points and reset opacities on their own cadence. Returns `None` when
/// nothing was scheduled this iteration.
///
/// Statistics are zeroed after a densify pass, so the caller keeps accumulating into
/// fresh buffers.
pub fn densify_gaussians<B: AutodiffBackend>(
    store: &mut GaussianStore<B>,
    iter: u32,
    config: &DensifyConfig,
) -> Result<Option<DensifyStats>, StoreError> {
    if iter > config.stop_after {
        return Ok(None);
    }

    let mut stats = DensifyStats::default();
    let mut active = false;

    let scheduled = iter >= config.start_after && iter % config.densify_every.max(1) == 0;
    if scheduled && store.num_points() == 0 {
        log::debug!("Iteration {iter}: no points to densify");
        active = true;
    } else if scheduled {
        let _span = trace_span!("Densify", iter).entered();
        active = true;

        let high_grad = store
            .stats()
            .average_grad()
            .greater_equal_elem(config.grad_thresh);

        stats.num_cloned = clone_points(store, high_grad.clone())?;

        // Clones have no statistics of their own, so they never qualify for a split.
        let device = store.device().clone();
        let high_grad = Tensor::cat(
            vec![high_grad, masks::falses(stats.num_cloned, &device)],
            0,
        );
        stats.num_split = split_points(store, high_grad, config.num_to_split_into)?;

        store.reset_stats();

        let threshold = if iter == config.stop_after {
            config.final_removal_opacity_threshold
        } else {
            config.removal_opacity_threshold
        };
        let transparent = transparent_mask(store, threshold)?;
        stats.num_pruned = store.shrink(transparent)?;

        log::info!(
            "Iteration {iter}: cloned {}, split {}, pruned {} points, {} total",
            stats.num_cloned,
            stats.num_split,
            stats.num_pruned,
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
