//! A parameter group couples one live tensor with its optimizer state. The only
//! ways to change its row count are [`ParamGroup::append`] and
//! [`ParamGroup::compact`], which apply the same row operation to the moment
//! buffers, so row `i` of each moment always belongs to row `i` of the tensor.

use burn::optim::AdaptiveMomentumState;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Bool, Int, Tensor};
use tracing::trace_span;

use crate::adam::{AdamConfig, AdamState};
use crate::{masks, ParamName, StoreError};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

pub struct ParamGroup<B: AutodiffBackend> {
    name: ParamName,
    tensor: Tensor<B, 2>,
    state: AdamState<Inner<B>>,
    lr: f64,
}

impl<B: AutodiffBackend> ParamGroup<B> {
    pub fn new(name: ParamName, value: Tensor<Inner<B>, 2>, lr: f64) -> Result<Self, StoreError> {
        check_width(name, &value)?;
        Ok(Self {
            name,
            tensor: Tensor::from_inner(value).require_grad(),
            state: AdamState::default(),
            lr,
        })
    }

    pub fn name(&self) -> ParamName {
        self.name
    }

    pub fn is_point_indexed(&self) -> bool {
        self.name.is_point_indexed()
    }

    /// The live, gradient tracked tensor.
    pub fn val(&self) -> Tensor<B, 2> {
        self.tensor.clone()
    }

    pub fn inner(&self) -> Tensor<Inner<B>, 2> {
        self.tensor.clone().inner()
    }

    pub fn num_rows(&self) -> usize {
        self.tensor.dims()[0]
    }

    pub fn moments(&self) -> Option<&AdaptiveMomentumState<Inner<B>, 2>> {
        self.state.momentum.as_ref()
    }

    pub fn time(&self) -> usize {
        self.state.time()
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Install `value` as the live tensor, throwing away the momentum of the old one.
    /// The moments restart at zero in the shape of the new tensor; the step count is kept.
    pub fn replace(&mut self, value: Tensor<Inner<B>, 2>) -> Result<(), StoreError> {
        check_width(self.name, &value)?;
        let _span = trace_span!("Replace", group = self.name.as_str()).entered();

        self.state.reset_moments(&value);
        self.install(value);
        Ok(())
    }

    /// Append `rows` after the existing rows. Existing moment rows are kept and the new
    /// rows start with zero momentum.
    pub fn append(&mut self, rows: Tensor<Inner<B>, 2>) -> Result<(), StoreError> {
        check_width(self.name, &rows)?;
        if rows.dims()[0] == 0 {
            return Ok(());
        }
        let _span = trace_span!("Append", group = self.name.as_str()).entered();

        let fresh = Tensor::zeros_like(&rows);
        self.state
            .map_moments(|moment| Tensor::cat(vec![moment, fresh.clone()], 0));
        let value = Tensor::cat(vec![self.inner(), rows], 0);
        self.install(value);
        Ok(())
    }

    /// Keep the rows where `keep` is set, in their original order.
    pub fn compact(&mut self, keep: Tensor<Inner<B>, 1, Bool>) -> Result<(), StoreError> {
        let expected = self.num_rows();
        let actual = keep.dims()[0];
        if actual != expected {
            return Err(StoreError::MaskLength {
                name: self.name,
                expected,
                actual,
            });
        }

        if masks::count(keep.clone()) == expected {
            return Ok(());
        }
        self.keep_rows(masks::indices(keep));
        Ok(())
    }

    /// Gather `indices` from the tensor and both moments. Callers validate the indices.
    pub(crate) fn keep_rows(&mut self, indices: Tensor<Inner<B>, 1, Int>) {
        let _span = trace_span!("Compact", group = self.name.as_str()).entered();

        self.state
            .map_moments(|moment| moment.select(0, indices.clone()));
        let value = self.inner().select(0, indices);
        self.install(value);
    }

    /// Apply one optimizer step if the gradients contain an entry for the live tensor.
    pub(crate) fn optimizer_step(&mut self, grads: &mut B::Gradients, adam: &AdamConfig) -> bool {
        let Some(grad) = self.tensor.grad_remove(grads) else {
            return false;
        };
        let current = self.inner();
        let value = adam.update(&mut self.state, current, grad, self.lr);
        self.install(value);
        true
    }

    fn install(&mut self, value: Tensor<Inner<B>, 2>) {
        self.tensor = Tensor::from_inner(value).require_grad();
    }
}

fn check_width<B: burn::prelude::Backend>(
    name: ParamName,
    value: &Tensor<B, 2>,
) -> Result<(), StoreError> {
    let actual = value.dims()[1];
    if actual == name.width() {
        Ok(())
    } else {
        Err(StoreError::Width {
            name,
            expected: name.width(),
            actual,
        })
    }
}
