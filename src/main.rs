use anyhow::{Context, Result};
use insulate::cli::commands::{RunCommand, ValidateCommand};
use insulate::cli::output::*;
use insulate::cli::terminal_output::TerminalSink;
use insulate::cli::{Cli, Command};
use insulate::{DockerEngine, Orchestrator, PipelineDefinition, PipelineEvent};
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(cli.log_filter()))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let mut definition = PipelineDefinition::from_file(&cmd.file)
        .with_context(|| format!("Failed to load pipeline definition {}", cmd.file))?;
    cmd.apply(&mut definition.settings);

    println!(
        "{} Loaded {} ({} steps)",
        INFO,
        style(&cmd.file).bold(),
        style(definition.steps.len()).cyan()
    );

    let engine = DockerEngine::connect()
        .await
        .context("Failed to connect to the Docker daemon")?;

    let sink = Arc::new(TerminalSink::new());
    let mut orchestrator = Orchestrator::new(engine, definition).with_sink(sink.clone());

    // Console rendering of run events
    let pulls = PullProgress::new();
    let events_sink = sink.clone();
    orchestrator.add_event_handler(move |event| {
        pulls.on_event(&event);
        if let PipelineEvent::StepStarted { name, index, total } = &event {
            events_sink.print_step_header(*index, *total, name);
            return;
        }
        if let Some(line) = format_pipeline_event(&event) {
            events_sink.finish_line();
            println!("{}", line);
        }
    });

    println!();
    let result = orchestrator.run().await;
    let state = orchestrator.state();
    sink.print_separator();

    match result {
        Ok(()) => {
            println!(
                "{} {} steps completed {}",
                CHECK,
                style(state.completed_steps).bold(),
                style("successfully").green()
            );
            Ok(())
        }
        Err(err) => {
            println!(
                "{} Run {} after {} completed steps",
                CROSS,
                style("failed").red(),
                style(state.completed_steps).bold()
            );
            if let Some(code) = err.step_exit_status() {
                println!("  Exit status: {}", style(code).red());
            }
            error!("{}", err);
            std::process::exit(1);
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => {
            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Repositories: {}", style(definition.repositories.len()).cyan());
            println!("  Services: {}", style(definition.services.len()).cyan());
            println!("  Files: {}", style(definition.files.len()).cyan());
            println!("  Steps: {}", style(definition.steps.len()).cyan());

            if let Err(e) = definition.authorize() {
                println!("  {} {}", style("Needs permission:").yellow(), e);
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&definition)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}
