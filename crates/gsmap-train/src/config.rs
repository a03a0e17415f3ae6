use burn::config::Config;
use clap::Args;
use gsmap_scene::adam::AdamConfig;
use gsmap_scene::lr::LearningRates;

#[derive(Config, Args)]
pub struct DensifyConfig {
    /// First iteration at which points are cloned and split.
    #[config(default = 500)]
    #[arg(
        id = "densify_start_after",
        long = "densify-start-after",
        help_heading = "Densify options",
        default_value = "500"
    )]
    pub start_after: u32,

    /// Last iteration at which points are densified. Statistics stop accumulating after it.
    #[config(default = 5000)]
    #[arg(
        id = "densify_stop_after",
        long = "densify-stop-after",
        help_heading = "Densify options",
        default_value = "5000"
    )]
    pub stop_after: u32,

    /// Densify every this many iterations.
    #[config(default = 100)]
    #[arg(long, help_heading = "Densify options", default_value = "100")]
    pub densify_every: u32,

    /// Average screen-space gradient at which a point is cloned or split.
    #[config(default = 0.0002)]
    #[arg(long, help_heading = "Densify options", default_value = "0.0002")]
    pub grad_thresh: f32,

    /// Number of children a split point is replaced by.
    #[config(default = 2)]
    #[arg(long, help_heading = "Densify options", default_value = "2")]
    pub num_to_split_into: usize,

    /// Points less opaque than this are removed after densifying.
    #[config(default = 0.005)]
    #[arg(
        id = "densify_removal_opacity_threshold",
        long = "densify-removal-opacity-threshold",
        help_heading = "Densify options",
        default_value = "0.005"
    )]
    pub removal_opacity_threshold: f32,

    /// Opacity threshold used instead on the last densify iteration.
    #[config(default = 0.005)]
    #[arg(
        id = "densify_final_removal_opacity_threshold",
        long = "densify-final-removal-opacity-threshold",
        help_heading = "Densify options",
        default_value = "0.005"
    )]
    pub final_removal_opacity_threshold: f32,

    /// Iteration from which oversized points count as removable.
    #[config(default = 3000)]
    #[arg(
        id = "densify_remove_big_after",
        long = "densify-remove-big-after",
        help_heading = "Densify options",
        default_value = "3000"
    )]
    pub remove_big_after: u32,

    /// Reset every opacity to a small value every this many iterations. 0 disables.
    #[config(default = 3000)]
    #[arg(
        id = "densify_reset_opacities_every",
        long = "densify-reset-opacities-every",
        help_heading = "Densify options",
        default_value = "3000"
    )]
    pub reset_opacities_every: u32,

    /// Whether the periodic opacity reset runs at all.
    #[config(default = true)]
    #[arg(
        id = "densify_reset_opacities",
        long = "densify-reset-opacities",
        help_heading = "Densify options",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub reset_opacities: bool,
}

#[derive(Config, Args)]
pub struct PruneConfig {
    /// First iteration at which points are pruned.
    #[config(default = 0)]
    #[arg(
        id = "prune_start_after",
        long = "prune-start-after",
        help_heading = "Prune options",
        default_value = "0"
    )]
    pub start_after: u32,

    /// Last iteration at which points are pruned.
    #[config(default = 20)]
    #[arg(
        id = "prune_stop_after",
        long = "prune-stop-after",
        help_heading = "Prune options",
        default_value = "20"
    )]
    pub stop_after: u32,

    /// Prune every this many iterations.
    #[config(default = 20)]
    #[arg(long, help_heading = "Prune options", default_value = "20")]
    pub prune_every: u32,

    /// Points less opaque than this are removed.
    #[config(default = 0.005)]
    #[arg(
        id = "prune_removal_opacity_threshold",
        long = "prune-removal-opacity-threshold",
        help_heading = "Prune options",
        default_value = "0.005"
    )]
    pub removal_opacity_threshold: f32,

    /// Opacity threshold used instead on the last prune iteration.
    #[config(default = 0.005)]
    #[arg(
        id = "prune_final_removal_opacity_threshold",
        long = "prune-final-removal-opacity-threshold",
        help_heading = "Prune options",
        default_value = "0.005"
    )]
    pub final_removal_opacity_threshold: f32,

    /// Iteration from which points bigger than a tenth of the scene radius are removed.
    #[config(default = 0)]
    #[arg(
        id = "prune_remove_big_after",
        long = "prune-remove-big-after",
        help_heading = "Prune options",
        default_value = "0"
    )]
    pub remove_big_after: u32,

    /// Reset every opacity to a small value every this many iterations. 0 disables.
    #[config(default = 500)]
    #[arg(
        id = "prune_reset_opacities_every",
        long = "prune-reset-opacities-every",
        help_heading = "Prune options",
        default_value = "500"
    )]
    pub reset_opacities_every: u32,

    /// Whether the periodic opacity reset runs at all.
    #[config(default = false)]
    #[arg(
        id = "prune_reset_opacities",
        long = "prune-reset-opacities",
        help_heading = "Prune options",
        default_value = "false",
        action = clap::ArgAction::Set
    )]
    pub reset_opacities: bool,
}

#[derive(Config, Args)]
pub struct TrainConfig {
    /// Total number of mapping iterations. Also the horizon of the position schedule.
    #[config(default = 1000)]
    #[arg(long, help_heading = "Training options", default_value = "1000")]
    pub total_steps: u32,

    /// Random seed.
    #[config(default = 42)]
    #[arg(long, help_heading = "Training options", default_value = "42")]
    pub seed: u64,

    #[config(default = "DensifyConfig::new()")]
    #[clap(flatten)]
    pub densify: DensifyConfig,

    #[config(default = "PruneConfig::new()")]
    #[clap(flatten)]
    pub prune: PruneConfig,

    #[config(default = "LearningRates::new()")]
    #[clap(flatten)]
    pub lr: LearningRates,

    #[config(default = "AdamConfig::new()")]
    #[arg(skip = AdamConfig::new())]
    pub adam: AdamConfig,
}
