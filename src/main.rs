#![allow(clippy::result_large_err)]

use anyhow::Context;
use aquila_bootstrap::config::BootstrapConfig;
use aquila_bootstrap::migrate::{load_steps, MigrationRunner, MigrationStep, PgMigrationStore};
use aquila_bootstrap::orchestrator::{
    BootstrapOrchestrator, BootstrapReport, OrchestratorOptions,
};
use aquila_bootstrap::plan::BootstrapPlan;
use aquila_bootstrap::probe::ConnectionProbers;
use aquila_bootstrap::process::{run_host_command, ComposeProcessManager, ProcessManager};
use aquila_bootstrap::seed::PgSeedStore;
use aquila_bootstrap::telemetry;
use aquila_bootstrap::topology::LapinBrokerConnector;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const DEFAULT_PLAN_PATH: &str = "bootstrap-plan.yaml";

enum CliCommand {
    Setup,
    Start,
    Down,
    Health,
    Logs { services: Vec<String> },
    DbMigrate,
    DbDowngrade,
    Task { name: String },
    Help,
}

struct CliArgs {
    command: CliCommand,
    plan_path: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = telemetry::init_tracing() {
        eprintln!("failed to initialise telemetry: {err}");
        return ExitCode::FAILURE;
    }

    let args = match parse_cli_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> anyhow::Result<ExitCode> {
    if matches!(args.command, CliCommand::Help) {
        print_help();
        return Ok(ExitCode::SUCCESS);
    }

    let config = BootstrapConfig::load().context("failed to load configuration")?;
    let plan_path = args
        .plan_path
        .or_else(|| config.plan_path.clone())
        .unwrap_or_else(|| DEFAULT_PLAN_PATH.to_string());

    let plan = BootstrapPlan::from_path(&plan_path)
        .with_context(|| format!("failed to load bootstrap plan from {plan_path}"))?;
    let plan = Arc::new(plan);

    match args.command {
        CliCommand::Setup => {
            let steps = load_steps(&plan.migrations_dir)
                .context("failed to load migration catalogue")?;
            let orchestrator = build_orchestrator(&config, Arc::clone(&plan), steps).await?;
            Ok(finish(orchestrator.run().await))
        }
        CliCommand::Start => {
            let orchestrator = build_orchestrator(&config, Arc::clone(&plan), Vec::new()).await?;
            Ok(finish(orchestrator.run_startup().await))
        }
        CliCommand::Health => {
            let orchestrator = build_orchestrator(&config, Arc::clone(&plan), Vec::new()).await?;
            let entries = orchestrator.probe_all_once().await;

            let mut all_ready = true;
            println!("{:<24} {:<10} status", "service", "check");
            for entry in &entries {
                let status = if entry.ready { "ready" } else { "not ready" };
                println!("{:<24} {:<10} {status}", entry.service, entry.check);
                all_ready &= entry.ready;
            }

            if all_ready {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("one or more services are not ready");
                Ok(ExitCode::FAILURE)
            }
        }
        CliCommand::Down => {
            process_manager(&config).stop_all().await?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Logs { services } => {
            process_manager(&config).logs(&services).await?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::DbMigrate => {
            let steps = load_steps(&plan.migrations_dir)
                .context("failed to load migration catalogue")?;
            let store = PgMigrationStore::connect(&config.database)
                .context("invalid database configuration")?;
            let runner = MigrationRunner::new(Arc::new(store));

            match runner.apply(&steps).await {
                Ok(applied) => {
                    println!("{applied} migration step(s) applied");
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("{err}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        CliCommand::DbDowngrade => {
            let steps = load_steps(&plan.migrations_dir)
                .context("failed to load migration catalogue")?;
            let store = PgMigrationStore::connect(&config.database)
                .context("invalid database configuration")?;
            let runner = MigrationRunner::new(Arc::new(store));

            match runner.revert_last(&steps).await {
                Ok(Some(step)) => {
                    println!("reverted {step}");
                    Ok(ExitCode::SUCCESS)
                }
                Ok(None) => {
                    println!("no applied migrations to revert");
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("{err}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        CliCommand::Task { name } => {
            let Some(task) = plan.tasks.get(&name) else {
                let known = plan.tasks.keys().cloned().collect::<Vec<_>>().join(", ");
                anyhow::bail!("task `{name}` is not declared in the plan (declared: {known})");
            };

            let result = match &task.service {
                Some(service) => {
                    process_manager(&config)
                        .exec_in_service(service, &task.command)
                        .await?
                }
                None => run_host_command(&task.command).await?,
            };

            print!("{}", result.output);
            if result.exit_code == 0 {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        CliCommand::Help => unreachable!("handled above"),
    }
}

async fn build_orchestrator(
    config: &BootstrapConfig,
    plan: Arc<BootstrapPlan>,
    steps: Vec<MigrationStep>,
) -> anyhow::Result<BootstrapOrchestrator> {
    let options = OrchestratorOptions {
        worker_pool_size: config.orchestration.worker_pool_size,
        run_timeout: config.orchestration.run_timeout(),
        artifact_root: PathBuf::from("."),
    };

    let migrations =
        PgMigrationStore::connect(&config.database).context("invalid database configuration")?;
    let seeds = PgSeedStore::from_pool(migrations.pool().clone());

    Ok(BootstrapOrchestrator::new(
        plan,
        steps,
        Arc::new(ConnectionProbers::new(config.clone())),
        Arc::new(process_manager(config)),
        Arc::new(LapinBrokerConnector::new(config.broker.url.clone())),
        Arc::new(migrations),
        Arc::new(seeds),
        options,
    ))
}

fn process_manager(config: &BootstrapConfig) -> ComposeProcessManager {
    ComposeProcessManager::new(
        config.orchestration.compose_file.clone(),
        config.orchestration.compose_project.clone(),
    )
}

fn finish(report: BootstrapReport) -> ExitCode {
    for stage in &report.stages {
        if stage.error.is_none() {
            println!("{:<22} ok    {}", stage.stage.as_str(), stage.detail);
        }
    }

    if report.succeeded() {
        println!("bootstrap complete");
        return ExitCode::SUCCESS;
    }

    if let Some(failure) = report.failure() {
        let item = failure
            .error
            .as_ref()
            .map(|err| err.failing_item().to_string())
            .unwrap_or_default();
        eprintln!(
            "bootstrap failed at stage {} on `{item}`: {}",
            failure.stage.as_str(),
            failure.detail
        );
    }

    ExitCode::FAILURE
}

fn parse_cli_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliArgs {
            command: CliCommand::Help,
            plan_path: None,
        });
    };

    let command = match first.as_str() {
        "setup" => CliCommand::Setup,
        "dev" | "start" => CliCommand::Start,
        "down" => CliCommand::Down,
        "health" => CliCommand::Health,
        "logs" => CliCommand::Logs {
            services: Vec::new(),
        },
        "db-migrate" | "db-upgrade" => CliCommand::DbMigrate,
        "db-downgrade" => CliCommand::DbDowngrade,
        "test" | "lint" | "format" | "clean" => CliCommand::Task { name: first.clone() },
        "-h" | "--help" | "help" => CliCommand::Help,
        other => anyhow::bail!("unrecognised command `{other}` (see --help)"),
    };

    let mut command = command;
    let mut plan_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                if plan_path.is_some() {
                    anyhow::bail!("bootstrap plan path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("expected path after {arg}"))?;
                plan_path = Some(value);
            }
            other if other.starts_with('-') => {
                anyhow::bail!("unrecognised argument `{other}`");
            }
            other => {
                if let CliCommand::Logs { services } = &mut command {
                    services.push(other.to_string());
                } else {
                    anyhow::bail!("unexpected argument `{other}`");
                }
            }
        }
    }

    Ok(CliArgs { command, plan_path })
}

fn print_help() {
    println!(
        "\
Usage: aquila-bootstrap <COMMAND> [OPTIONS]

Commands:
  setup          Run the full bootstrap sequence
  dev | start    Start services behind their readiness gates
  health         Probe every declared readiness check once
  db-migrate     Apply pending schema migrations (alias: db-upgrade)
  db-downgrade   Revert the most recently applied migration
  test | lint | format | clean
                 Run the matching task from the plan's tasks section
  down           Stop all services
  logs [SVC...]  Show recent service logs
  help           Print this help message

Options:
  -c, --config <PATH>    Path to the bootstrap plan YAML file
                         (default: {DEFAULT_PLAN_PATH}, or the configured plan_path)

Connection parameters come from AQUILA__-prefixed environment variables
or config/local.*.
"
    );
}
