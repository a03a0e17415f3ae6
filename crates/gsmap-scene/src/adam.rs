use burn::config::Config;
use burn::optim::AdaptiveMomentumState;
use burn::prelude::Backend;
use burn::tensor::Tensor;

#[derive(Config, Debug)]
pub struct AdamConfig {
    #[config(default = 0.9)]
    pub beta_1: f32,
    #[config(default = 0.999)]
    pub beta_2: f32,
    #[config(default = 1e-15)]
    pub epsilon: f32,
}

/// Optimizer state of one parameter group. The momentum is only created on the
/// first step, so structural operations have to handle `momentum == None`.
#[derive(Clone)]
pub struct AdamState<B: Backend> {
    pub momentum: Option<AdaptiveMomentumState<B, 2>>,
}

impl<B: Backend> Default for AdamState<B> {
    fn default() -> Self {
        Self { momentum: None }
    }
}

impl<B: Backend> AdamState<B> {
    pub fn time(&self) -> usize {
        self.momentum.as_ref().map_or(0, |momentum| momentum.time)
    }

    /// Restart both moments at zero in the shape of `tensor`, keeping the step count.
    pub(crate) fn reset_moments(&mut self, tensor: &Tensor<B, 2>) {
        self.momentum = Some(AdaptiveMomentumState {
            time: self.time(),
            moment_1: Tensor::zeros_like(tensor),
            moment_2: Tensor::zeros_like(tensor),
        });
    }

    /// Apply the same row operation to both moments.
    pub(crate) fn map_moments(&mut self, f: impl Fn(Tensor<B, 2>) -> Tensor<B, 2>) {
        self.momentum = self.momentum.take().map(|mut momentum| {
            momentum.moment_1 = f(momentum.moment_1);
            momentum.moment_2 = f(momentum.moment_2);
            momentum
        });
    }
}

impl AdamConfig {
    /// Bias corrected Adam update of `param` given its gradient, returning the new value.
    pub(crate) fn update<B: Backend>(
        &self,
        state: &mut AdamState<B>,
        param: Tensor<B, 2>,
        grad: Tensor<B, 2>,
        lr: f64,
    ) -> Tensor<B, 2> {
        let (time, moment_1, moment_2) = match state.momentum.take() {
            Some(momentum) => (
                momentum.time,
                momentum.moment_1 * self.beta_1 + grad.clone() * (1.0 - self.beta_1),
                momentum.moment_2 * self.beta_2 + grad.powf_scalar(2.0) * (1.0 - self.beta_2),
            ),
            None => (
                0,
                grad.clone() * (1.0 - self.beta_1),
                grad.powf_scalar(2.0) * (1.0 - self.beta_2),
            ),
        };

        let time = time + 1;
        let bias_1 = 1.0 - (self.beta_1 as f64).powi(time as i32);
        let bias_2 = 1.0 - (self.beta_2 as f64).powi(time as i32);

        let denom = moment_2.clone().sqrt() / bias_2.sqrt() + self.epsilon;
        let delta = moment_1.clone() / denom * (lr / bias_1);

        state.momentum = Some(AdaptiveMomentumState {
            time,
            moment_1,
            moment_2,
        });
        param - delta
    }
}
