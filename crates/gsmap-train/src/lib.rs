pub mod config;
pub mod densify;
pub mod prune;
pub mod screen_map;
pub mod trainer;

#[cfg(test)]
mod tests;

pub use config::{DensifyConfig, PruneConfig, TrainConfig};
pub use densify::{densify_gaussians, DensifyStats};
pub use prune::{prune_gaussians, reset_opacities, DepthFrame, PruneStats};
pub use screen_map::ScreenIndexMap;
pub use trainer::{FrameOutputs, MapTrainer, StepReport};
