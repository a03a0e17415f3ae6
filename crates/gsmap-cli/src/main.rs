use anyhow::Result;
use clap::Parser;
use gsmap_cli::simulate::Simulation;
use gsmap_cli::ui::RunProgress;
use gsmap_cli::{Cli, Command};
use gsmap_train::TrainConfig;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;

fn main() -> Result<()> {
    let args = Cli::parse().validate()?;

    env_logger::init();

    if args.trace {
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(std::io::stderr),
            ),
        )?;
    }

    match args.command {
        Command::PrintConfig => {
            println!("{}", TrainConfig::new());
        }
        Command::Simulate(sim_args) => {
            let train = sim_args.train_config()?;
            let mut sim = Simulation::new(sim_args.scene, &train)?;
            let progress = RunProgress::new(train.total_steps);

            for iter in 1..=train.total_steps {
                let report = sim.step(iter)?;
                progress.update(&report);
            }

            sim.store.check_consistency()?;
            progress.finish(sim.store.num_points());
            log::info!("Finished with {} points", sim.store.num_points());
        }
    }

    Ok(())
}
