use std::sync::atomic::{AtomicUsize, Ordering};

use assert_approx_eq::assert_approx_eq;
use burn::backend::{Autodiff, NdArray};
use burn::prelude::Backend;
use burn::tensor::{Int, Tensor, TensorData};

use crate::adam::AdamConfig;
use crate::lr::LearningRates;
use crate::{inverse_sigmoid, masks, GaussianStore, ParamName, PointRows, SceneParams, StoreError};

type Back = Autodiff<NdArray>;
type Inner = NdArray;

/// Parameters where row `i` of every point group is filled with `i`.
fn indexed_params(num_points: usize, num_frames: usize) -> SceneParams<Inner> {
    let device = Default::default();
    let filled = |width: usize| {
        let values: Vec<f32> = (0..num_points)
            .flat_map(|i| std::iter::repeat(i as f32).take(width))
            .collect();
        Tensor::<Inner, 2>::from_data(
            TensorData::new(values, [num_points, width]),
            &device,
        )
    };
    SceneParams {
        means3d: filled(3),
        rgb_colors: filled(3),
        unnorm_rotations: filled(4),
        logit_opacities: filled(1),
        log_scales: filled(3),
        cam_unnorm_rots: Tensor::zeros([num_frames, 4], &device),
        cam_trans: Tensor::zeros([num_frames, 3], &device),
    }
}

fn store(num_points: usize) -> GaussianStore<Back> {
    GaussianStore::new(
        indexed_params(num_points, 2),
        &LearningRates::new(),
        AdamConfig::new(),
        1.0,
    )
    .expect("consistent params")
}

fn first_column(tensor: Tensor<Inner, 2>) -> Vec<f32> {
    let rows = tensor.dims()[0];
    tensor
        .slice([0..rows, 0..1])
        .into_data()
        .to_vec()
        .expect("f32 data")
}

fn int_indices(values: &[i32]) -> Tensor<Inner, 1, Int> {
    Tensor::from_data(
        TensorData::new(values.to_vec(), [values.len()]),
        &Default::default(),
    )
}

/// Step every group with the gradient of a loss that weights each point by its index + 1.
fn step_once(store: &mut GaussianStore<Back>) {
    let num_points = store.num_points();
    let weights: Vec<f32> = (1..=num_points).map(|i| i as f32).collect();
    let weights = Tensor::<Back, 2>::from_inner(Tensor::from_data(
        TensorData::new(weights, [num_points, 1]),
        &Default::default(),
    ));
    let loss = ParamName::POINTS
        .into_iter()
        .map(|name| (store.val(name).expect("group exists") * weights.clone()).sum())
        .reduce(|a, b| a + b)
        .expect("point groups");
    let mut grads = loss.backward();
    assert_eq!(store.step(&mut grads), ParamName::POINTS.len());
}

fn column_of(store: &GaussianStore<Back>, name: ParamName) -> Vec<f32> {
    first_column(store.inner(name).expect("group exists"))
}

fn moment_1(store: &GaussianStore<Back>, name: ParamName) -> Vec<f32> {
    let moments = store
        .group(name)
        .expect("group exists")
        .moments()
        .expect("stepped");
    first_column(moments.moment_1.clone())
}

#[test]
fn new_rejects_mismatched_rows() {
    let mut params = indexed_params(4, 1);
    params.rgb_colors = Tensor::zeros([3, 3], &Default::default());
    let lrs = LearningRates::new();
    let err = GaussianStore::<Back>::new(params, &lrs, AdamConfig::new(), 1.0).err();
    assert_eq!(
        err,
        Some(StoreError::RowCount {
            name: ParamName::RgbColors,
            expected: 4,
            actual: 3
        })
    );
}

#[test]
fn clone_appends_copies_with_zero_momentum() {
    let mut store = store(10);
    step_once(&mut store);
    let m1_before = moment_1(&store, ParamName::Means3D);

    let rows = store.select_points(int_indices(&[1, 4, 7]));
    assert_eq!(store.grow(rows).expect("complete rows"), 3);

    assert_eq!(store.num_points(), 13);
    store.check_consistency().expect("consistent after grow");

    for name in ParamName::POINTS {
        let values = column_of(&store, name);
        let originals: Vec<f32> = [1, 4, 7].map(|i| values[i]).to_vec();
        assert_eq!(values[10..], originals[..], "{name}");

        let m1 = moment_1(&store, name);
        assert_eq!(m1[10..], [0.0, 0.0, 0.0], "{name}");
    }
    assert_eq!(moment_1(&store, ParamName::Means3D)[..10], m1_before[..]);
    assert_eq!(store.stats().num_points(), 13);
}

#[test]
fn shrink_keeps_survivors_aligned() {
    let mut store = store(6);
    step_once(&mut store);
    let m1_before = moment_1(&store, ParamName::LogScales);

    let remove = masks::from_bools(
        vec![false, true, false, true, true, false],
        &Default::default(),
    );
    assert_eq!(store.shrink(remove).expect("mask length matches"), 3);

    store.check_consistency().expect("consistent after shrink");
    assert_eq!(store.num_points(), 3);
    assert_eq!(store.num_frames(), 2);

    // Values are not the original indices anymore after the Adam step, but each
    // survivor keeps its own value and momentum.
    let m1 = moment_1(&store, ParamName::LogScales);
    assert_eq!(m1, [m1_before[0], m1_before[2], m1_before[5]]);
}

#[test]
fn shrink_without_removals_is_identity() {
    let mut store = store(5);
    step_once(&mut store);
    let means_before = column_of(&store, ParamName::Means3D);
    let m1_before = moment_1(&store, ParamName::Means3D);

    let removed = store
        .shrink(masks::falses(5, &Default::default()))
        .expect("mask length matches");

    assert_eq!(removed, 0);
    assert_eq!(column_of(&store, ParamName::Means3D), means_before);
    assert_eq!(moment_1(&store, ParamName::Means3D), m1_before);
}

#[test]
fn grow_then_shrink_restores_state() {
    let mut store = store(4);
    step_once(&mut store);
    let means_before = column_of(&store, ParamName::Means3D);
    let m1_before = moment_1(&store, ParamName::Means3D);

    let rows = store.select_points(int_indices(&[0, 2]));
    store.grow(rows).expect("complete rows");
    let remove = masks::from_bools(
        vec![false, false, false, false, true, true],
        &Default::default(),
    );
    store.shrink(remove).expect("mask length matches");

    assert_eq!(column_of(&store, ParamName::Means3D), means_before);
    assert_eq!(moment_1(&store, ParamName::Means3D), m1_before);
    store.check_consistency().expect("consistent");
}

#[test]
fn opacity_reset_overwrites_and_zeroes_momentum() {
    let mut store = store(3);
    step_once(&mut store);
    let means_before = column_of(&store, ParamName::Means3D);
    let m1_means_before = moment_1(&store, ParamName::Means3D);

    let floor = inverse_sigmoid(0.01);
    let reset = store
        .inner(ParamName::LogitOpacities)
        .expect("group exists")
        .full_like(floor);
    store
        .overwrite(ParamName::LogitOpacities, reset)
        .expect("same rows");

    for logit in column_of(&store, ParamName::LogitOpacities) {
        assert_approx_eq!(logit, floor, 1e-6);
    }
    let moments = store
        .group(ParamName::LogitOpacities)
        .expect("group exists")
        .moments()
        .expect("overwrite allocates moments");
    assert_eq!(first_column(moments.moment_1.clone()), [0.0, 0.0, 0.0]);
    assert_eq!(first_column(moments.moment_2.clone()), [0.0, 0.0, 0.0]);

    assert_eq!(column_of(&store, ParamName::Means3D), means_before);
    assert_eq!(moment_1(&store, ParamName::Means3D), m1_means_before);
}

#[test]
fn failed_preconditions_leave_store_untouched() {
    let mut store = store(4);
    step_once(&mut store);
    let means_before = column_of(&store, ParamName::Means3D);

    let short = masks::falses(3, &Default::default());
    let err = store.shrink(short).err();
    assert!(matches!(
        err,
        Some(StoreError::MaskLength {
            expected: 4,
            actual: 3,
            ..
        })
    ));

    // Missing the scales group.
    let device = Default::default();
    let incomplete = PointRows::<Inner>::new()
        .with(ParamName::Means3D, Tensor::zeros([1, 3], &device))
        .with(ParamName::RgbColors, Tensor::zeros([1, 3], &device))
        .with(ParamName::UnnormRotations, Tensor::zeros([1, 4], &device))
        .with(ParamName::LogitOpacities, Tensor::zeros([1, 1], &device));
    assert_eq!(
        store.grow(incomplete).err(),
        Some(StoreError::MissingGroup(ParamName::LogScales))
    );

    let wrong_rows = Tensor::zeros([2, 1], &device);
    let result = store.overwrite(ParamName::LogitOpacities, wrong_rows);
    assert!(result.is_err());

    assert_eq!(store.num_points(), 4);
    assert_eq!(column_of(&store, ParamName::Means3D), means_before);
    store.check_consistency().expect("consistent");
}

#[test]
fn removing_every_point_leaves_empty_groups() {
    let mut store = store(3);
    step_once(&mut store);
    let all = masks::from_bools(vec![true; 3], &Default::default());
    assert_eq!(store.shrink(all).expect("mask length matches"), 3);
    assert_eq!(store.num_points(), 0);
    assert_eq!(store.num_frames(), 2);
    store.check_consistency().expect("consistent");
}

static RELEASES: AtomicUsize = AtomicUsize::new(0);

fn count_release(_device: &<Back as Backend>::Device) {
    RELEASES.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn structural_changes_release_memory() {
    let mut store = store(4).with_memory_release(count_release);
    let before = RELEASES.load(Ordering::SeqCst);

    let rows = store.select_points(int_indices(&[0]));
    store.grow(rows).expect("complete rows");
    store
        .shrink(masks::from_bools(
            vec![true, false, false, false, false],
            &Default::default(),
        ))
        .expect("mask length matches");
    // No-op shrinks do not touch the tensors.
    store
        .shrink(masks::falses(4, &Default::default()))
        .expect("mask length matches");

    assert_eq!(RELEASES.load(Ordering::SeqCst) - before, 2);
}

#[test]
fn lazy_moments_survive_structural_changes() {
    let mut store = store(3);
    let rows = store.select_points(int_indices(&[2]));
    store.grow(rows).expect("complete rows");
    let group = store.group(ParamName::Means3D).expect("group exists");
    assert!(group.moments().is_none());

    step_once(&mut store);
    assert_eq!(moment_1(&store, ParamName::Means3D).len(), 4);
}
