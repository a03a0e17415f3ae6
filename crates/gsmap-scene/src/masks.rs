//! Small helpers for boolean row masks. Masks are always rank 1 with one entry
//! per point.

use burn::prelude::Backend;
use burn::tensor::{Bool, ElementConversion, Int, Tensor, TensorData};

pub fn from_bools<B: Backend>(values: Vec<bool>, device: &B::Device) -> Tensor<B, 1, Bool> {
    let len = values.len();
    Tensor::from_data(TensorData::new(values, [len]), device)
}

pub fn falses<B: Backend>(len: usize, device: &B::Device) -> Tensor<B, 1, Bool> {
    from_bools(vec![false; len], device)
}

pub fn to_bools<B: Backend>(mask: Tensor<B, 1, Bool>) -> Vec<bool> {
    mask.into_data()
        .to_vec::<bool>()
        .expect("bool tensors always convert to bool")
}

pub fn any<B: Backend>(a: Tensor<B, 1, Bool>, b: Tensor<B, 1, Bool>) -> Tensor<B, 1, Bool> {
    Tensor::stack::<2>(vec![a, b], 1).any_dim(1).squeeze(1)
}

pub fn all<B: Backend>(a: Tensor<B, 1, Bool>, b: Tensor<B, 1, Bool>) -> Tensor<B, 1, Bool> {
    Tensor::stack::<2>(vec![a, b], 1).all_dim(1).squeeze(1)
}

pub fn count<B: Backend>(mask: Tensor<B, 1, Bool>) -> usize {
    if mask.dims()[0] == 0 {
        return 0;
    }
    mask.int().sum().into_scalar().elem::<i64>() as usize
}

/// Indices of the set entries, in increasing order.
pub fn indices<B: Backend>(mask: Tensor<B, 1, Bool>) -> Tensor<B, 1, Int> {
    mask.argwhere().squeeze(1)
}
