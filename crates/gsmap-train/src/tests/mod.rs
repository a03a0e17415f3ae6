use assert_approx_eq::assert_approx_eq;
use burn::backend::{Autodiff, NdArray};
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use gsmap_scene::adam::AdamConfig;
use gsmap_scene::lr::LearningRates;
use gsmap_scene::{inverse_sigmoid, masks, GaussianStore, ParamName, SceneParams, StoreError};

use crate::config::{DensifyConfig, PruneConfig, TrainConfig};
use crate::densify::{densify_gaussians, DensifyStats};
use crate::prune::{prune_gaussians, DepthFrame};
use crate::trainer::{FrameOutputs, MapTrainer};

type Back = Autodiff<NdArray>;
type Inner = NdArray;

fn rows(values: Vec<f32>, width: usize) -> Tensor<Inner, 2> {
    let count = values.len() / width;
    Tensor::from_data(TensorData::new(values, [count, width]), &Default::default())
}

fn host(tensor: Tensor<Inner, 2>) -> Vec<Vec<f32>> {
    let [_, width] = tensor.dims();
    let values: Vec<f32> = tensor.into_data().to_vec().expect("f32 data");
    values.chunks(width).map(<[f32]>::to_vec).collect()
}

fn param(store: &GaussianStore<Back>, name: ParamName) -> Vec<Vec<f32>> {
    host(store.inner(name).expect("group exists"))
}

fn denom(store: &GaussianStore<Back>) -> Vec<f32> {
    let denom = store.stats().denom.clone();
    denom.into_data().to_vec().expect("f32 data")
}

/// A store with the given positions, isotropic scales and opacities. Colors encode the
/// point index so rows can be traced through structural changes.
fn store_with(means: &[[f32; 3]], scales: &[f32], opacities: &[f32]) -> GaussianStore<Back> {
    let n = means.len();
    let params = SceneParams {
        means3d: rows(means.iter().flatten().copied().collect(), 3),
        rgb_colors: rows((0..n).flat_map(|i| [i as f32; 3]).collect(), 3),
        unnorm_rotations: rows([1.0, 0.0, 0.0, 0.0].repeat(n), 4),
        logit_opacities: rows(opacities.iter().map(|&o| inverse_sigmoid(o)).collect(), 1),
        log_scales: rows(scales.iter().flat_map(|s| [s.ln(); 3]).collect(), 3),
        cam_unnorm_rots: rows(vec![1.0, 0.0, 0.0, 0.0], 4),
        cam_trans: rows(vec![0.0; 3], 3),
    };
    GaussianStore::new(params, &LearningRates::new(), AdamConfig::new(), 1.0)
        .expect("consistent params")
}

/// Record one observation with screen-space gradient norms `grads`, every point seen.
fn observe(store: &mut GaussianStore<Back>, grads: &[f32]) {
    let n = grads.len();
    let grad = rows(grads.iter().flat_map(|&g| [g, 0.0]).collect(), 2);
    let seen = masks::from_bools(vec![true; n], &Default::default());
    store
        .stats_mut()
        .accumulate(grad, seen)
        .expect("rows match");
}

/// One optimizer step so every point group has moments.
fn step_once(store: &mut GaussianStore<Back>) {
    let loss = ParamName::POINTS
        .into_iter()
        .map(|name| store.val(name).expect("group exists").sum())
        .reduce(|a, b| a + b)
        .expect("point groups");
    let mut grads = loss.backward();
    store.step(&mut grads);
}

fn densify_every_iter() -> DensifyConfig {
    DensifyConfig::new()
        .with_start_after(0)
        .with_stop_after(100)
        .with_densify_every(1)
        .with_reset_opacities(false)
}

fn prune_every_iter() -> PruneConfig {
    PruneConfig::new()
        .with_start_after(0)
        .with_stop_after(100)
        .with_prune_every(1)
}

#[test]
fn small_points_are_cloned() {
    let mut store = store_with(
        &[[0.0, 0.0, 0.0], [1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
        &[0.001; 3],
        &[0.5; 3],
    );
    step_once(&mut store);
    observe(&mut store, &[0.0, 0.01, 0.0]);

    let stats = densify_gaussians(&mut store, 10, &densify_every_iter())
        .expect("valid store")
        .expect("scheduled");

    assert_eq!(stats.num_cloned, 1);
    assert_eq!(stats.num_split, 0);
    assert_eq!(store.num_points(), 4);

    let means = host(store.inner(ParamName::Means3D).expect("group exists"));
    assert_eq!(means[3], means[1]);
    let moments = store
        .group(ParamName::Means3D)
        .expect("group exists")
        .moments()
        .expect("stepped");
    assert_eq!(host(moments.moment_2.clone())[3], [0.0, 0.0, 0.0]);

    // Statistics start over at the new size.
    assert_eq!(store.stats().num_points(), 4);
    assert!(denom(&store).iter().all(|&d| d == 0.0));
    store.check_consistency().expect("consistent");
}

#[test]
fn big_points_split_into_smaller_children() {
    Back::seed(7);
    let parent_scale = 0.5;
    let mut store = store_with(
        &[
            [0.0, 0.0, 0.0],
            [10.0, 10.0, 10.0],
            [-5.0, 0.0, 0.0],
            [0.0, -5.0, 0.0],
        ],
        &[parent_scale, parent_scale, parent_scale, 0.001],
        &[0.5; 4],
    );
    step_once(&mut store);
    observe(&mut store, &[0.01, 0.01, 0.0, 0.0]);
    let parent_scales = host(store.scales().expect("group exists"));
    let parent_means = host(store.inner(ParamName::Means3D).expect("group exists"));

    let config = densify_every_iter().with_num_to_split_into(2);
    let stats = densify_gaussians(&mut store, 10, &config)
        .expect("valid store")
        .expect("scheduled");

    assert_eq!(stats.num_cloned, 0);
    assert_eq!(stats.num_split, 2);
    assert_eq!(store.num_points(), 6);
    store.check_consistency().expect("consistent");

    // Survivors first, then the children block tiled twice.
    let colors = host(store.inner(ParamName::RgbColors).expect("group exists"));
    let owners: Vec<usize> = colors.iter().map(|c| c[0].round() as usize).collect();
    assert_eq!(owners, [2, 3, 0, 1, 0, 1]);

    let scales = host(store.scales().expect("group exists"));
    for (child, &owner) in scales[2..].iter().zip(&owners[2..]) {
        for (axis, parent) in child.iter().zip(&parent_scales[owner]) {
            assert_approx_eq!(*axis, *parent / (0.8 * 2.0), 1e-5);
        }
    }

    // Identity rotations, so every axis is sampled with that axis' own std.
    let means = host(store.inner(ParamName::Means3D).expect("group exists"));
    for (child, &owner) in means[2..].iter().zip(&owners[2..]) {
        let parent = &parent_means[owner];
        for ((c, p), std) in child.iter().zip(parent).zip(&parent_scales[owner]) {
            assert!(
                (c - p).abs() <= 3.0 * std,
                "{child:?} too far from {parent:?}"
            );
        }
    }

    // Survivors keep their momentum, children start from zero.
    let moments = store
        .group(ParamName::Means3D)
        .expect("group exists")
        .moments()
        .expect("stepped");
    let m1 = host(moments.moment_1.clone());
    assert!(m1[0].iter().all(|&m| m != 0.0));
    assert!(m1[2..].iter().flatten().all(|&m| m == 0.0));
}

#[test]
fn unseen_points_never_densify() {
    let mut store = store_with(&[[0.0; 3], [1.0; 3]], &[0.001, 0.5], &[0.5; 2]);
    // Nothing accumulated: 0 / 0 averages.
    let stats = densify_gaussians(&mut store, 10, &densify_every_iter())
        .expect("valid store")
        .expect("scheduled");
    assert_eq!(stats.num_cloned + stats.num_split, 0);
    assert_eq!(store.num_points(), 2);
}

#[test]
fn densify_uses_final_threshold_on_last_iteration() {
    let config = densify_every_iter()
        .with_stop_after(50)
        .with_final_removal_opacity_threshold(0.5);

    let mut store = store_with(&[[0.0; 3], [1.0; 3]], &[0.001; 2], &[0.3, 0.9]);
    let stats = densify_gaussians(&mut store, 49, &config)
        .expect("valid store")
        .expect("scheduled");
    assert_eq!(stats.num_pruned, 0);

    let stats = densify_gaussians(&mut store, 50, &config)
        .expect("valid store")
        .expect("scheduled");
    assert_eq!(stats.num_pruned, 1);
    assert_eq!(store.num_points(), 1);

    assert_eq!(densify_gaussians(&mut store, 51, &config), Ok(None));
}

#[test]
fn densify_resets_opacities_on_its_own_cadence() {
    let config = DensifyConfig::new()
        .with_start_after(10_000)
        .with_stop_after(20_000)
        .with_reset_opacities_every(3000);
    let mut store = store_with(&[[0.0; 3], [1.0; 3]], &[0.001; 2], &[0.5, 0.9]);
    step_once(&mut store);
    let means_before = host(store.inner(ParamName::Means3D).expect("group exists"));

    assert_eq!(densify_gaussians(&mut store, 2999, &config), Ok(None));

    let stats = densify_gaussians(&mut store, 3000, &config)
        .expect("valid store")
        .expect("reset scheduled");
    assert!(stats.opacities_reset);
    assert_eq!(
        stats,
        DensifyStats {
            opacities_reset: true,
            ..DensifyStats::default()
        }
    );

    for logit in param(&store, ParamName::LogitOpacities) {
        assert_approx_eq!(logit[0], inverse_sigmoid(0.01), 1e-6);
    }
    let moments = store
        .group(ParamName::LogitOpacities)
        .expect("group exists")
        .moments()
        .expect("reset allocates moments");
    let m1 = host(moments.moment_1.clone());
    assert!(m1.iter().flatten().all(|&m| m == 0.0));
    assert_eq!(
        host(store.inner(ParamName::Means3D).expect("group exists")),
        means_before
    );
}

#[test]
fn prune_removes_transparent_and_big_points() {
    let mut store = store_with(
        &[[0.0; 3], [1.0; 3], [2.0; 3], [3.0; 3]],
        &[0.001, 0.001, 0.5, 0.001],
        &[0.5, 0.001, 0.5, 0.5],
    );

    // Big points are only removed from `remove_big_after` on.
    let config = prune_every_iter().with_remove_big_after(5);
    let stats = prune_gaussians(&mut store, 4, &config, None)
        .expect("valid store")
        .expect("scheduled");
    assert_eq!(stats.num_transparent, 1);
    assert_eq!(stats.num_big, 0);
    assert_eq!(store.num_points(), 3);

    let stats = prune_gaussians(&mut store, 5, &config, None)
        .expect("valid store")
        .expect("scheduled");
    assert_eq!(stats.num_big, 1);
    assert_eq!(stats.num_removed, 1);

    let colors = host(store.inner(ParamName::RgbColors).expect("group exists"));
    assert_eq!(colors.iter().map(|c| c[0]).collect::<Vec<_>>(), [0.0, 3.0]);
    store.check_consistency().expect("consistent");
}

#[test]
fn prune_follows_its_cadence() {
    let config = PruneConfig::new()
        .with_start_after(10)
        .with_stop_after(40)
        .with_prune_every(20)
        .with_reset_opacities(false);
    let mut store = store_with(&[[0.0; 3]], &[0.001], &[0.5]);

    assert_eq!(prune_gaussians(&mut store, 0, &config, None), Ok(None));
    assert_eq!(prune_gaussians(&mut store, 15, &config, None), Ok(None));
    for iter in [20, 40] {
        let stats = prune_gaussians(&mut store, iter, &config, None).expect("valid store");
        assert!(stats.is_some(), "iteration {iter}");
    }
    assert_eq!(prune_gaussians(&mut store, 60, &config, None), Ok(None));
}

fn frame(rendered: Vec<f32>, silhouette: Vec<f32>, observed: Vec<f32>) -> DepthFrame<Inner> {
    DepthFrame::new(rows(rendered, 2), rows(silhouette, 2), rows(observed, 2))
        .expect("matching sizes")
}

#[test]
fn prune_removes_points_behind_inconsistent_depth() {
    let mut store = store_with(&[[0.0; 3], [1.0; 3], [2.0; 3]], &[0.001; 3], &[0.5; 3]);
    // Screen positions: (0, 0), (1, 1), (1, 0) on a 2x2 image.
    let camera_means = rows(vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0], 3);
    store
        .stats_mut()
        .set_camera_means(camera_means)
        .expect("rows match");

    // Pixel (0, 0) is as wrong as pixel (1, 1) but poorly covered.
    let depth = frame(
        vec![1.0, 0.0, 0.0, 1.0],
        vec![0.5, 1.0, 1.0, 1.0],
        vec![0.0; 4],
    );
    let stats = prune_gaussians(&mut store, 0, &prune_every_iter(), Some(&depth))
        .expect("valid store")
        .expect("scheduled");

    assert_eq!(stats.num_depth, 1);
    assert_eq!(stats.num_removed, 1);
    let colors = host(store.inner(ParamName::RgbColors).expect("group exists"));
    assert_eq!(colors.iter().map(|c| c[0]).collect::<Vec<_>>(), [0.0, 2.0]);
}

#[test]
fn depth_pruning_needs_current_camera_means() {
    let mut store = store_with(&[[0.0; 3], [1.0; 3]], &[0.001; 2], &[0.5; 2]);
    let depth = frame(vec![1.0; 4], vec![1.0; 4], vec![0.0; 4]);
    let stats = prune_gaussians(&mut store, 0, &prune_every_iter(), Some(&depth))
        .expect("valid store")
        .expect("scheduled");
    assert_eq!(stats.num_depth, 0);
    assert_eq!(store.num_points(), 2);
}

#[test]
fn depth_frames_must_agree_in_size() {
    let result = DepthFrame::new(
        rows(vec![0.0; 4], 2),
        rows(vec![0.0; 6], 3),
        rows(vec![0.0; 4], 2),
    );
    assert_eq!(result.err(), Some(StoreError::FrameSize([2, 2], [2, 3])));
}

fn frame_outputs(store: &GaussianStore<Back>, grad: f32) -> FrameOutputs<Inner> {
    let n = store.num_points();
    FrameOutputs {
        means2d_grad: rows(vec![grad; n * 2], 2),
        seen: masks::from_bools(vec![true; n], &Default::default()),
        radii: None,
        camera_means3d: rows(vec![0.5; n * 3], 3),
        depth: None,
    }
}

#[test]
fn trainer_accumulates_then_steps() {
    let config = TrainConfig::new()
        .with_total_steps(100)
        .with_densify(DensifyConfig::new().with_start_after(50).with_stop_after(60))
        .with_prune(PruneConfig::new().with_start_after(1000).with_stop_after(1000));
    let mut trainer = MapTrainer::new(&config);
    let mut store = store_with(&[[0.0; 3], [1.0; 3]], &[0.001; 2], &[0.5; 2]);

    let loss = store.val(ParamName::Means3D).expect("group exists").sum()
        + store.val(ParamName::LogScales).expect("group exists").sum();
    let mut grads = loss.backward();
    let frame = frame_outputs(&store, 0.1);
    let report = trainer
        .step(1, &mut store, &mut grads, frame)
        .expect("consistent inputs");

    assert_eq!(report.groups_stepped, 2);
    assert!(report.densify.is_none());
    let schedule = config.lr.means3d_schedule(100);
    assert_approx_eq!(report.lr_means3d, schedule.rate(1), 1e-12);
    assert_approx_eq!(
        store.group(ParamName::Means3D).expect("group exists").lr(),
        report.lr_means3d,
        1e-12
    );
    assert_eq!(denom(&store), [1.0, 1.0]);

    // Past the densify window nothing accumulates anymore.
    let loss = store.val(ParamName::Means3D).expect("group exists").sum();
    let mut grads = loss.backward();
    let frame = frame_outputs(&store, 0.1);
    let report = trainer
        .step(61, &mut store, &mut grads, frame)
        .expect("consistent inputs");
    assert_approx_eq!(report.lr_means3d, schedule.rate(61), 1e-12);
    assert_eq!(denom(&store), [1.0, 1.0]);
}

#[test]
fn trainer_skips_rebuilt_groups() {
    let config = TrainConfig::new()
        .with_densify(densify_every_iter())
        .with_prune(PruneConfig::new().with_start_after(1000).with_stop_after(1000));
    let mut trainer = MapTrainer::new(&config);
    let mut store = store_with(&[[0.0; 3], [1.0; 3]], &[0.001; 2], &[0.5; 2]);

    let loss = store.val(ParamName::Means3D).expect("group exists").sum();
    let mut grads = loss.backward();
    let frame = frame_outputs(&store, 0.1);
    let report = trainer
        .step(10, &mut store, &mut grads, frame)
        .expect("consistent inputs");

    let densify = report.densify.expect("scheduled");
    assert_eq!(densify.num_cloned, 2);
    assert_eq!(report.num_points, 4);
    // The position tensor was rebuilt by the clone, its gradient is stale.
    assert_eq!(report.groups_stepped, 0);
    store.check_consistency().expect("consistent");
}

#[test]
fn trainer_rejects_mismatched_frames() {
    let mut trainer = MapTrainer::new(&TrainConfig::new());
    let mut store = store_with(&[[0.0; 3], [1.0; 3]], &[0.001; 2], &[0.5; 2]);
    let loss = store.val(ParamName::Means3D).expect("group exists").sum();
    let mut grads = loss.backward();

    let mut frame = frame_outputs(&store, 0.1);
    frame.camera_means3d = rows(vec![0.5; 3], 3);
    let err = trainer.step(1, &mut store, &mut grads, frame).err();
    assert_eq!(
        err,
        Some(StoreError::StatsRows {
            expected: 2,
            actual: 1
        })
    );

    // Valid camera means next to a bad visibility mask must not be installed either.
    let lr_before = store.group(ParamName::Means3D).expect("group exists").lr();
    let mut frame = frame_outputs(&store, 0.1);
    frame.seen = masks::from_bools(vec![true], &Default::default());
    let err = trainer.step(50, &mut store, &mut grads, frame).err();
    assert!(matches!(err, Some(StoreError::StatsRows { .. })));
    assert!(store.stats().camera_means3d.is_none());
    assert_eq!(
        store.group(ParamName::Means3D).expect("group exists").lr(),
        lr_before
    );
    assert_eq!(denom(&store), [0.0, 0.0]);
}

/// A store whose every point was removed.
fn empty_store() -> GaussianStore<Back> {
    let mut store = store_with(&[[0.0; 3]], &[0.001], &[0.5]);
    let removed = store
        .shrink(masks::from_bools(vec![true], &Default::default()))
        .expect("mask matches");
    assert_eq!(removed, 1);
    store
}

#[test]
fn densify_and_prune_accept_an_empty_store() {
    let mut store = empty_store();
    observe(&mut store, &[]);

    let config = densify_every_iter()
        .with_reset_opacities(true)
        .with_reset_opacities_every(5);
    let densify = densify_gaussians(&mut store, 10, &config)
        .expect("empty store is valid")
        .expect("scheduled");
    assert_eq!(densify.num_cloned, 0);
    assert_eq!(densify.num_pruned, 0);
    assert!(densify.opacities_reset);

    let depth = frame(vec![1.0; 4], vec![1.0; 4], vec![2.0; 4]);
    let prune = prune_gaussians(&mut store, 10, &prune_every_iter(), Some(&depth))
        .expect("empty store is valid")
        .expect("scheduled");
    assert_eq!(prune.num_removed, 0);
    assert_eq!(store.num_points(), 0);
    store.check_consistency().expect("consistent");
}

#[test]
fn trainer_keeps_running_without_points() {
    let config = TrainConfig::new()
        .with_densify(densify_every_iter())
        .with_prune(prune_every_iter());
    let mut trainer = MapTrainer::new(&config);
    let mut store = empty_store();

    for iter in 1..=3 {
        let loss = store.val(ParamName::CamTrans).expect("group exists").sum();
        let mut grads = loss.backward();
        let frame = frame_outputs(&store, 0.1);
        let report = trainer
            .step(iter, &mut store, &mut grads, frame)
            .expect("empty frames match an empty store");
        assert_eq!(report.num_points, 0);
        assert!(report.densify.is_some());
        assert!(report.prune.is_some());
    }
    store.check_consistency().expect("consistent");
}
