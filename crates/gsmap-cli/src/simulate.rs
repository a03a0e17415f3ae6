//! A synthetic stand-in for the renderer: points are pulled onto a sphere seen by a
//! single fixed camera, which produces the losses, screen-space gradients and depth
//! frames the mapping core consumes.

use anyhow::Result;
use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::prelude::Backend;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Bool, Tensor, TensorData};
use clap::Args;
use glam::Vec3;
use gsmap_scene::init::InitConfig;
use gsmap_scene::{masks, GaussianStore, ParamName, SceneParams};
use gsmap_train::{DepthFrame, FrameOutputs, MapTrainer, ScreenIndexMap, StepReport, TrainConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace_span;

pub type SimBack = Autodiff<NdArray>;
type Inner<B> = <B as AutodiffBackend>::InnerBackend;

#[derive(Config, Args)]
pub struct SceneConfig {
    /// Number of points in the initial cloud.
    #[config(default = 2000)]
    #[arg(long, help_heading = "Scene options", default_value = "2000")]
    pub num_points: usize,

    /// Radius of the sphere being mapped. Also used as the scene radius.
    #[config(default = 1.0)]
    #[arg(long, help_heading = "Scene options", default_value = "1.0")]
    pub sphere_radius: f32,

    /// How far the initial points are scattered off the sphere, relative to its radius.
    #[config(default = 0.1)]
    #[arg(long, help_heading = "Scene options", default_value = "0.1")]
    pub init_noise: f32,

    /// Width and height of the simulated depth frames.
    #[config(default = 64)]
    #[arg(long, help_heading = "Scene options", default_value = "64")]
    pub image_size: usize,

    /// Uniform noise added to the observed depth. Keep it well below the outlier error,
    /// or every covered pixel lands near the worst error and its owner is pruned.
    #[config(default = 0.002)]
    #[arg(long, help_heading = "Scene options", default_value = "0.002")]
    pub depth_noise: f32,

    /// Covered pixels per frame whose observed depth carries a gross error.
    #[config(default = 1)]
    #[arg(long, help_heading = "Scene options", default_value = "1")]
    pub depth_outliers: usize,

    /// Hand a depth frame to the pruner every this many iterations. 0 disables.
    #[config(default = 1)]
    #[arg(long, help_heading = "Scene options", default_value = "1")]
    pub depth_every: u32,
}

/// Fraction of the sphere radius the point scales are pulled towards.
const TARGET_SCALE_FRACTION: f32 = 0.02;

/// Camera distance from the sphere center, in sphere radii. Keeps every projected
/// point inside the unit screen square.
const CAMERA_DISTANCE: f32 = 3.0;

/// Depth error of an outlier pixel, in sphere radii.
const OUTLIER_ERROR_FRACTION: f32 = 0.1;

fn random_unit(rng: &mut StdRng) -> Vec3 {
    loop {
        let v = Vec3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        let len = v.length();
        if len > 1e-3 && len <= 1.0 {
            return v / len;
        }
    }
}

/// A noisy point cloud around the sphere with colors derived from the normals.
pub fn sphere_cloud(config: &SceneConfig, rng: &mut StdRng) -> (Vec<Vec3>, Vec<Vec3>) {
    (0..config.num_points)
        .map(|_| {
            let dir = random_unit(rng);
            let offset = rng.gen_range(-config.init_noise..=config.init_noise);
            let point = dir * config.sphere_radius * (1.0 + offset);
            let color = dir * 0.5 + Vec3::splat(0.5);
            (point, color)
        })
        .unzip()
}

fn column<B: Backend>(tensor: Tensor<B, 2>, index: usize) -> Tensor<B, 2> {
    let rows = tensor.dims()[0];
    if rows == 0 {
        return Tensor::zeros([0, 1], &tensor.device());
    }
    tensor.slice([0..rows, index..index + 1])
}

/// Camera-space positions with the first two columns in normalized screen space and
/// the third the depth.
fn project<B: Backend>(means: Tensor<B, 2>, sphere_radius: f32) -> Tensor<B, 2> {
    let depth = column(means.clone(), 2) + CAMERA_DISTANCE * sphere_radius;
    let x = column(means.clone(), 0) / depth.clone() + 0.5;
    let y = column(means, 1) / depth.clone() + 0.5;
    Tensor::cat(vec![x, y, depth], 1)
}

/// Render a depth frame by letting every pixel show the depth of the point that owns
/// it. The observation is the same depth with sensor noise, plus a few outliers.
fn depth_frame<B: Backend>(
    camera_means: Tensor<B, 2>,
    config: &SceneConfig,
    rng: &mut StdRng,
) -> Result<DepthFrame<B>> {
    let _span = trace_span!("Simulate depth").entered();
    let size = config.image_size;
    let device = camera_means.device();
    let depths: Vec<f32> = column(camera_means.clone(), 2)
        .into_data()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("Failed to read depths: {e:?}"))?;
    let map = ScreenIndexMap::build(camera_means, size, size);

    let mut rendered = vec![0.0; size * size];
    let mut silhouette = vec![0.0; size * size];
    let mut observed = vec![0.0; size * size];
    for y in 0..size {
        for x in 0..size {
            if let Some(owner) = map.owner(x, y) {
                let pixel = y * size + x;
                rendered[pixel] = depths[owner];
                silhouette[pixel] = 1.0;
                observed[pixel] =
                    depths[owner] + rng.gen_range(-config.depth_noise..=config.depth_noise);
            }
        }
    }

    let covered: Vec<usize> = (0..size * size).filter(|&p| silhouette[p] > 0.0).collect();
    if !covered.is_empty() {
        for _ in 0..config.depth_outliers {
            let pixel = covered[rng.gen_range(0..covered.len())];
            observed[pixel] += OUTLIER_ERROR_FRACTION * config.sphere_radius;
        }
    }

    let image =
        |values: Vec<f32>| Tensor::from_data(TensorData::new(values, [size, size]), &device);
    Ok(DepthFrame::new(image(rendered), image(silhouette), image(observed))?)
}

/// Loss of the current points against the sphere, and the screen positions it was
/// computed from.
fn sphere_loss<B: AutodiffBackend>(
    store: &GaussianStore<B>,
    screen_holder: Tensor<B, 2>,
    sphere_radius: f32,
) -> Result<Tensor<B, 1>> {
    let means = store.val(ParamName::Means3D)?;
    let num_points = means.dims()[0];
    if num_points == 0 {
        // Nothing to fit, but the camera still gets a (zero) gradient.
        return Ok(store.val(ParamName::CamTrans)?.sum() * 0.0);
    }

    let radius = means.clone().powf_scalar(2.0).sum_dim(1).sqrt();
    let norm = radius.clone().inner().clamp_min(1e-6);
    let on_sphere = means.clone().inner() / norm * sphere_radius;
    let target_screen = project(on_sphere.clone(), sphere_radius).slice([0..num_points, 0..2]);

    let screen = project(means, sphere_radius).slice([0..num_points, 0..2]) + screen_holder;
    let screen_error = (screen - Tensor::from_inner(target_screen))
        .powf_scalar(2.0)
        .sum_dim(1);
    let opacity = sigmoid(store.val(ParamName::LogitOpacities)?);
    let screen_loss = (screen_error * opacity).mean();

    let radius_loss = (radius - sphere_radius).powf_scalar(2.0).mean();

    let target_color = on_sphere / (2.0 * sphere_radius) + 0.5;
    let color_loss = (store.val(ParamName::RgbColors)? - Tensor::from_inner(target_color))
        .powf_scalar(2.0)
        .mean();

    let target_log_scale = (TARGET_SCALE_FRACTION * sphere_radius).ln();
    let scale_loss = (store.val(ParamName::LogScales)? - target_log_scale)
        .powf_scalar(2.0)
        .mean();

    let rot_norm = store
        .val(ParamName::UnnormRotations)?
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt();
    let rot_loss = (rot_norm - 1.0).powf_scalar(2.0).mean();

    Ok(screen_loss + radius_loss + color_loss + scale_loss * 0.1 + rot_loss)
}

pub struct Simulation {
    pub store: GaussianStore<SimBack>,
    trainer: MapTrainer,
    scene: SceneConfig,
    rng: StdRng,
}

impl Simulation {
    pub fn new(scene: SceneConfig, train: &TrainConfig) -> Result<Self> {
        <SimBack as Backend>::seed(train.seed);
        let mut rng = StdRng::seed_from_u64(train.seed);
        let device = Default::default();

        let (points, colors) = sphere_cloud(&scene, &mut rng);
        let params = SceneParams::from_points(&points, &colors, &InitConfig::new(), &device)?;
        let store = GaussianStore::new(params, &train.lr, train.adam.clone(), scene.sphere_radius)?;
        log::info!("Initialized {} points", store.num_points());

        Ok(Self {
            store,
            trainer: MapTrainer::new(train),
            scene,
            rng,
        })
    }

    /// Render, backpropagate and hand everything to the trainer.
    pub fn step(&mut self, iter: u32) -> Result<StepReport> {
        let num_points = self.store.num_points();
        let device = *self.store.device();

        let screen_holder =
            Tensor::<SimBack, 2>::zeros([num_points, 2], &device).require_grad();
        let loss = sphere_loss(&self.store, screen_holder.clone(), self.scene.sphere_radius)?;
        let mut grads = trace_span!("Backward pass").in_scope(|| loss.backward());

        let means2d_grad = screen_holder
            .grad_remove(&mut grads)
            .unwrap_or_else(|| Tensor::zeros([num_points, 2], &device));

        let camera_means3d = project(
            self.store.inner(ParamName::Means3D)?,
            self.scene.sphere_radius,
        );
        let seen = visible(camera_means3d.clone());
        let radii = if num_points == 0 {
            None
        } else {
            let depth = column(camera_means3d.clone(), 2).squeeze(1);
            Some(self.store.max_scales()? / depth * self.scene.image_size as f32)
        };

        let depth = if self.scene.depth_every > 0 && iter % self.scene.depth_every == 0 {
            Some(depth_frame(camera_means3d.clone(), &self.scene, &mut self.rng)?)
        } else {
            None
        };

        let frame = FrameOutputs {
            means2d_grad,
            seen,
            radii,
            camera_means3d,
            depth,
        };
        Ok(self.trainer.step(iter, &mut self.store, &mut grads, frame)?)
    }
}

/// Points in front of the camera whose projection falls on the image.
fn visible<B: Backend>(camera_means: Tensor<B, 2>) -> Tensor<B, 1, Bool> {
    let num_points = camera_means.dims()[0];
    if num_points == 0 {
        return masks::falses(0, &camera_means.device());
    }
    let in_front = column(camera_means.clone(), 2).greater_elem(0.0).squeeze(1);

    let screen = camera_means.slice([0..num_points, 0..2]);
    let both = |mask: Tensor<B, 2, Bool>| -> Tensor<B, 1, Bool> {
        mask.int().sum_dim(1).equal_elem(2).squeeze(1)
    };
    let on_screen = masks::all(
        both(screen.clone().greater_equal_elem(0.0)),
        both(screen.lower_equal_elem(1.0)),
    );
    masks::all(in_front, on_screen)
}
