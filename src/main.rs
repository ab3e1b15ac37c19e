use anyhow::Result;
use clap::Parser;
use release_impact::cli::{Cli, Commands};
use release_impact::config::{load_config, resolve_state_path, resolve_working_dir};
use release_impact::logging::init_tracing;
use release_impact::orchestrator::ReleaseAnalysisOrchestrator;
use serde::Serialize;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let working_dir = resolve_working_dir(&cli)?;
    let config = load_config(&working_dir)?;
    let state_path = resolve_state_path(&cli, &working_dir, &config);
    let orchestrator = ReleaseAnalysisOrchestrator::from_config(&working_dir, state_path, &config)?;

    match cli.command {
        Commands::Analyze { reset } => {
            let result = if reset {
                orchestrator.analyze_full_reset().await?
            } else {
                orchestrator.analyze().await?
            };
            print_json(&result)?;
        }
        Commands::State => {
            let state = orchestrator.state_manager().load_state().await;
            print_json(&state)?;
        }
        Commands::Reset => {
            orchestrator.state_manager().reset_state().await;
        }
        Commands::LastRelease => {
            let release = orchestrator.optimizer().find_last_release_optimized().await?;
            print_json(&release)?;
        }
        Commands::Changes { reference } => {
            let changes = orchestrator
                .optimizer()
                .get_changes_since_optimized(&reference)
                .await?;
            print_json(&changes)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
