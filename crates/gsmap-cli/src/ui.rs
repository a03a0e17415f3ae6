use std::time::Duration;

use gsmap_train::StepReport;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Progress bar for a simulation run plus a line per densify or prune event.
pub struct RunProgress {
    sp: MultiProgress,
    train_progress: ProgressBar,
    stats_spinner: ProgressBar,
}

impl RunProgress {
    pub fn new(total_steps: u32) -> Self {
        let train_progress = ProgressBar::new(total_steps as u64)
            .with_style(
                ProgressStyle::with_template(
                    "[{elapsed}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg} ({per_sec}, {eta} remaining)",
                )
                .expect("Invalid indicatif config")
                .progress_chars("◍○○"),
            )
            .with_message("Steps");

        let stats_spinner = ProgressBar::new_spinner().with_style(
            ProgressStyle::with_template("{spinner:.blue} {msg}")
                .expect("Invalid indicatif config")
                .tick_strings(&["ℹ️", "ℹ️"]),
        );

        let sp = MultiProgress::new();
        let train_progress = sp.add(train_progress);
        let stats_spinner = sp.add(stats_spinner);
        stats_spinner.enable_steady_tick(Duration::from_millis(120));
        stats_spinner.set_message("Starting up");

        if cfg!(debug_assertions) {
            let _ =
                sp.println("ℹ️  running in debug mode, compile with --release for best performance");
        }

        Self {
            sp,
            train_progress,
            stats_spinner,
        }
    }

    pub fn update(&self, report: &StepReport) {
        self.train_progress.set_position(report.iter as u64);
        self.stats_spinner.set_message(format!(
            "{} points, position lr {:.2e}",
            report.num_points, report.lr_means3d
        ));

        if let Some(densify) = &report.densify {
            let _ = self.sp.println(format!(
                "🌱 iter {}: cloned {}, split {}, removed {} transparent{}",
                report.iter,
                densify.num_cloned,
                densify.num_split,
                densify.num_pruned,
                if densify.opacities_reset {
                    ", opacities reset"
                } else {
                    ""
                }
            ));
        }
        if let Some(prune) = &report.prune {
            let _ = self.sp.println(format!(
                "✂️ iter {}: removed {} ({} transparent, {} big, {} depth){}",
                report.iter,
                prune.num_removed,
                prune.num_transparent,
                prune.num_big,
                prune.num_depth,
                if prune.opacities_reset {
                    ", opacities reset"
                } else {
                    ""
                }
            ));
        }
    }

    pub fn finish(&self, num_points: usize) {
        self.train_progress.finish();
        self.stats_spinner
            .finish_with_message(format!("Done, {num_points} points"));
    }
}
