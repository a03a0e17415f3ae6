use ball_tree::BallTree;
use burn::config::Config;
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use glam::Vec3;

use crate::{inverse_sigmoid, ParamName, SceneParams, StoreError};

#[derive(Config, Debug)]
pub struct InitConfig {
    /// Number of camera poses to allocate.
    #[config(default = 1)]
    pub num_frames: usize,
    /// Opacity every point starts with.
    #[config(default = 0.5)]
    pub initial_opacity: f32,
    /// Lower bound of the mean squared neighbour distance used for the initial scale.
    #[config(default = 1e-7)]
    pub min_sq_dist: f64,
}

fn rows<B: Backend>(values: Vec<f32>, width: usize, device: &B::Device) -> Tensor<B, 2> {
    let count = values.len() / width;
    Tensor::from_data(TensorData::new(values, [count, width]), device)
}

/// Identity quaternions (w, x, y, z) for `count` rows.
fn identity_rotations<B: Backend>(count: usize, device: &B::Device) -> Tensor<B, 2> {
    let values = [1.0, 0.0, 0.0, 0.0].repeat(count);
    rows(values, 4, device)
}

/// Mean squared distance of every point to its three nearest neighbours.
fn mean_neighbour_sq_dist(points: &[Vec3], min_sq_dist: f64) -> Vec<f64> {
    if points.is_empty() {
        return vec![];
    }

    let tree_pos: Vec<[f64; 3]> = points
        .iter()
        .map(|v| [v.x as f64, v.y as f64, v.z as f64])
        .collect();
    let tree = BallTree::new(tree_pos.clone(), vec![(); tree_pos.len()]);

    tree_pos
        .iter()
        .map(|p| {
            // The first hit is the point itself.
            let sq_dists: Vec<f64> = tree
                .query()
                .nn(p)
                .skip(1)
                .take(3)
                .map(|x| x.1 * x.1)
                .collect();
            let mean = sq_dists.iter().sum::<f64>() / sq_dists.len().max(1) as f64;
            mean.max(min_sq_dist)
        })
        .collect()
}

impl<B: Backend> SceneParams<B> {
    /// Initial parameters for a colored point cloud: identity rotations, a uniform
    /// opacity, isotropic scales from the neighbour spacing and identity camera poses.
    pub fn from_points(
        points: &[Vec3],
        colors: &[Vec3],
        config: &InitConfig,
        device: &B::Device,
    ) -> Result<Self, StoreError> {
        let num_points = points.len();
        if colors.len() != num_points {
            return Err(StoreError::RowCount {
                name: ParamName::RgbColors,
                expected: num_points,
                actual: colors.len(),
            });
        }

        let means: Vec<f32> = points.iter().flat_map(|p| p.to_array()).collect();
        let colors: Vec<f32> = colors.iter().flat_map(|c| c.to_array()).collect();
        let log_scales: Vec<f32> = mean_neighbour_sq_dist(points, config.min_sq_dist)
            .into_iter()
            .flat_map(|sq| [(0.5 * sq.ln()) as f32; 3])
            .collect();
        let opacity = vec![inverse_sigmoid(config.initial_opacity); num_points];

        Ok(Self {
            means3d: rows(means, 3, device),
            rgb_colors: rows(colors, 3, device),
            unnorm_rotations: identity_rotations(num_points, device),
            logit_opacities: rows(opacity, 1, device),
            log_scales: rows(log_scales, 3, device),
            cam_unnorm_rots: identity_rotations(config.num_frames, device),
            cam_trans: Tensor::zeros([config.num_frames, 3], device),
        })
    }
}
