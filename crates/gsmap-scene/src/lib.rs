pub mod adam;
pub mod error;
pub mod init;
pub mod lr;
pub mod masks;
pub mod param;
pub mod quat;
pub mod stats;
pub mod store;
pub mod sync;

#[cfg(test)]
mod tests;

pub use error::StoreError;
pub use param::ParamName;
pub use stats::DensityStats;
pub use store::{GaussianStore, PointRows, SceneParams};
pub use sync::ParamGroup;

pub fn inverse_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}
