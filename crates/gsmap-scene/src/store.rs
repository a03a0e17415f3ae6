use burn::prelude::Backend;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Bool, Int, Tensor};
use hashbrown::HashMap;
use tracing::trace_span;

use crate::adam::AdamConfig;
use crate::lr::LearningRates;
use crate::sync::ParamGroup;
use crate::{masks, DensityStats, ParamName, StoreError};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

/// Called after every structural change so the backend can hand back buffers
/// that are no longer referenced.
pub type ReleaseMemoryFn<B> = fn(&<B as Backend>::Device);

fn sync_device<B: Backend>(device: &B::Device) {
    B::sync(device);
}

/// Initial values of every parameter group.
#[derive(Clone, Debug)]
pub struct SceneParams<B: Backend> {
    pub means3d: Tensor<B, 2>,
    pub rgb_colors: Tensor<B, 2>,
    pub unnorm_rotations: Tensor<B, 2>,
    pub logit_opacities: Tensor<B, 2>,
    pub log_scales: Tensor<B, 2>,
    pub cam_unnorm_rots: Tensor<B, 2>,
    pub cam_trans: Tensor<B, 2>,
}

impl<B: Backend> SceneParams<B> {
    fn into_entries(self) -> [(ParamName, Tensor<B, 2>); 7] {
        [
            (ParamName::Means3D, self.means3d),
            (ParamName::RgbColors, self.rgb_colors),
            (ParamName::UnnormRotations, self.unnorm_rotations),
            (ParamName::LogitOpacities, self.logit_opacities),
            (ParamName::LogScales, self.log_scales),
            (ParamName::CamUnnormRots, self.cam_unnorm_rots),
            (ParamName::CamTrans, self.cam_trans),
        ]
    }
}

/// Rows for every point-indexed group, e.g. the points to append in a densify step.
#[derive(Clone, Debug)]
pub struct PointRows<B: Backend> {
    rows: HashMap<ParamName, Tensor<B, 2>>,
}

impl<B: Backend> Default for PointRows<B> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

impl<B: Backend> PointRows<B> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: ParamName, rows: Tensor<B, 2>) -> Self {
        self.rows.insert(name, rows);
        self
    }

    pub fn get(&self, name: ParamName) -> Option<&Tensor<B, 2>> {
        self.rows.get(&name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn num_rows(&self) -> usize {
        self.rows
            .get(&ParamName::Means3D)
            .map_or(0, |means| means.dims()[0])
    }

    /// Replace the rows of `name` with `f` applied to them.
    pub fn map(&mut self, name: ParamName, f: impl FnOnce(Tensor<B, 2>) -> Tensor<B, 2>) {
        if let Some(rows) = self.rows.remove(&name) {
            self.rows.insert(name, f(rows));
        }
    }

    /// Repeat the whole block `times` times: rows `[a, b]` become `[a, b, a, b, ...]`.
    #[must_use]
    pub fn tile(self, times: usize) -> Self {
        if times == 0 {
            return Self::new();
        }
        let rows = self
            .rows
            .into_iter()
            .map(|(name, rows)| (name, Tensor::cat(vec![rows; times], 0)))
            .collect();
        Self { rows }
    }
}

/// Named parameter tensors of the scene, their optimizer state and the per point
/// statistics. All changes to the number of points go through [`GaussianStore::grow`]
/// and [`GaussianStore::shrink`].
pub struct GaussianStore<B: AutodiffBackend> {
    groups: HashMap<ParamName, ParamGroup<B>>,
    stats: DensityStats<Inner<B>>,
    adam: AdamConfig,
    device: B::Device,
    release_memory: ReleaseMemoryFn<B>,
}

impl<B: AutodiffBackend> GaussianStore<B> {
    pub fn new(
        params: SceneParams<Inner<B>>,
        lrs: &LearningRates,
        adam: AdamConfig,
        scene_radius: f32,
    ) -> Result<Self, StoreError> {
        let device = params.means3d.device();
        let num_points = params.means3d.dims()[0];

        let mut groups = HashMap::new();
        for (name, value) in params.into_entries() {
            let rows = value.dims()[0];
            if name.is_point_indexed() && rows != num_points {
                return Err(StoreError::RowCount {
                    name,
                    expected: num_points,
                    actual: rows,
                });
            }
            groups.insert(name, ParamGroup::new(name, value, lrs.for_param(name))?);
        }

        log::debug!("Created store with {num_points} points");

        Ok(Self {
            groups,
            stats: DensityStats::new(num_points, scene_radius, &device),
            adam,
            device,
            release_memory: sync_device::<B>,
        })
    }

    /// Use `release` instead of a device sync after structural changes.
    #[must_use]
    pub fn with_memory_release(mut self, release: ReleaseMemoryFn<B>) -> Self {
        self.release_memory = release;
        self
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn num_points(&self) -> usize {
        self.groups
            .get(&ParamName::Means3D)
            .map_or(0, ParamGroup::num_rows)
    }

    pub fn num_frames(&self) -> usize {
        self.groups
            .get(&ParamName::CamTrans)
            .map_or(0, ParamGroup::num_rows)
    }

    pub fn group(&self, name: ParamName) -> Result<&ParamGroup<B>, StoreError> {
        self.groups.get(&name).ok_or(StoreError::MissingGroup(name))
    }

    fn group_mut(&mut self, name: ParamName) -> Result<&mut ParamGroup<B>, StoreError> {
        self.groups
            .get_mut(&name)
            .ok_or(StoreError::MissingGroup(name))
    }

    /// The live tensor of `name`, tracked by autodiff.
    pub fn val(&self, name: ParamName) -> Result<Tensor<B, 2>, StoreError> {
        Ok(self.group(name)?.val())
    }

    pub fn inner(&self, name: ParamName) -> Result<Tensor<Inner<B>, 2>, StoreError> {
        Ok(self.group(name)?.inner())
    }

    pub fn opacities(&self) -> Result<Tensor<Inner<B>, 1>, StoreError> {
        Ok(sigmoid(self.inner(ParamName::LogitOpacities)?).squeeze(1))
    }

    pub fn scales(&self) -> Result<Tensor<Inner<B>, 2>, StoreError> {
        Ok(self.inner(ParamName::LogScales)?.exp())
    }

    /// Largest world-space axis scale of every point.
    pub fn max_scales(&self) -> Result<Tensor<Inner<B>, 1>, StoreError> {
        Ok(self.scales()?.max_dim(1).squeeze(1))
    }

    pub fn stats(&self) -> &DensityStats<Inner<B>> {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut DensityStats<Inner<B>> {
        &mut self.stats
    }

    pub fn scene_radius(&self) -> f32 {
        self.stats.scene_radius
    }

    /// Reallocate zeroed statistics for the current point count.
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn set_lr(&mut self, name: ParamName, lr: f64) -> Result<(), StoreError> {
        self.group_mut(name)?.set_lr(lr);
        Ok(())
    }

    /// Copy the rows at `indices` out of every point-indexed group.
    pub fn select_points(&self, indices: Tensor<Inner<B>, 1, Int>) -> PointRows<Inner<B>> {
        ParamName::POINTS
            .into_iter()
            .filter_map(|name| self.groups.get(&name))
            .fold(PointRows::new(), |rows, group| {
                rows.with(group.name(), group.inner().select(0, indices.clone()))
            })
    }

    /// Append `rows` to every point-indexed group. New points start with zero momentum
    /// and zeroed statistics. Returns the number of points added.
    pub fn grow(&mut self, rows: PointRows<Inner<B>>) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.num_rows();
        for name in ParamName::POINTS {
            self.group(name)?;
            let new_rows = rows.get(name).ok_or(StoreError::MissingGroup(name))?;
            let [actual, width] = new_rows.dims();
            if width != name.width() {
                return Err(StoreError::Width {
                    name,
                    expected: name.width(),
                    actual: width,
                });
            }
            if actual != count {
                return Err(StoreError::RowCount {
                    name,
                    expected: count,
                    actual,
                });
            }
        }

        if count == 0 {
            return Ok(0);
        }

        let _span = trace_span!("Grow", count).entered();
        for name in ParamName::POINTS {
            if let Some(new_rows) = rows.get(name) {
                self.group_mut(name)?.append(new_rows.clone())?;
            }
        }
        self.stats.extend(count);
        self.release();
        Ok(count)
    }

    /// Remove the points where `remove` is set from every point-indexed group, their
    /// optimizer state, and the statistics. Returns the number of points removed.
    pub fn shrink(&mut self, remove: Tensor<Inner<B>, 1, Bool>) -> Result<usize, StoreError> {
        let num_points = self.num_points();
        let actual = remove.dims()[0];
        if actual != num_points {
            return Err(StoreError::MaskLength {
                name: ParamName::Means3D,
                expected: num_points,
                actual,
            });
        }
        for name in ParamName::POINTS {
            self.group(name)?;
        }

        let removed = masks::count(remove.clone());
        if removed == 0 {
            return Ok(0);
        }
        if removed == num_points {
            log::warn!("Removing all {num_points} points");
        }

        let _span = trace_span!("Shrink", removed).entered();
        let keep = masks::indices(remove.bool_not());
        for name in ParamName::POINTS {
            self.group_mut(name)?.keep_rows(keep.clone());
        }
        self.stats.keep_rows(keep);
        self.release();
        Ok(removed)
    }

    /// Overwrite all values of `name`, discarding its momentum.
    pub fn overwrite(
        &mut self,
        name: ParamName,
        value: Tensor<Inner<B>, 2>,
    ) -> Result<(), StoreError> {
        let expected = self.group(name)?.num_rows();
        let actual = value.dims()[0];
        if actual != expected {
            return Err(StoreError::RowCount {
                name,
                expected,
                actual,
            });
        }

        self.group_mut(name)?.replace(value)?;
        self.release();
        Ok(())
    }

    /// One optimizer step over every group that has a gradient. Returns how many
    /// groups were updated.
    pub fn step(&mut self, grads: &mut B::Gradients) -> usize {
        let _span = trace_span!("Optimizer step").entered();
        let adam = &self.adam;
        self.groups
            .values_mut()
            .map(|group| group.optimizer_step(grads, adam))
            .filter(|&stepped| stepped)
            .count()
    }

    /// Verify that parameters, moments and statistics agree on the point count.
    pub fn check_consistency(&self) -> Result<(), StoreError> {
        let num_points = self.num_points();
        for group in self.groups.values() {
            let rows = group.num_rows();
            if group.is_point_indexed() && rows != num_points {
                return Err(StoreError::RowCount {
                    name: group.name(),
                    expected: num_points,
                    actual: rows,
                });
            }
            if let Some(moments) = group.moments() {
                for moment in [&moments.moment_1, &moments.moment_2] {
                    let actual = moment.dims()[0];
                    if actual != rows {
                        return Err(StoreError::RowCount {
                            name: group.name(),
                            expected: rows,
                            actual,
                        });
                    }
                }
            }
        }

        let stats_rows = [
            Some(self.stats.means2d_gradient_accum.dims()[0]),
            Some(self.stats.denom.dims()[0]),
            Some(self.stats.max_2d_radius.dims()[0]),
            Some(self.stats.seen.dims()[0]),
            self.stats.camera_means3d.as_ref().map(|t| t.dims()[0]),
            self.stats.means2d_grad.as_ref().map(|t| t.dims()[0]),
        ];
        for actual in stats_rows.into_iter().flatten() {
            if actual != num_points {
                return Err(StoreError::StatsRows {
                    expected: num_points,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn release(&self) {
        let _span = trace_span!("Release memory").entered();
        (self.release_memory)(&self.device);
    }
}
