#![forbid(unsafe_code)]

use crate::artifacts::{ConfigMaterializer, ConfigWriteError, MaterializeOutcome};
use crate::metrics::metrics;
use crate::migrate::{MigrationError, MigrationRunner, MigrationStep, MigrationStore};
use crate::plan::{dependency_order, BootstrapPlan, ServiceKind, ServiceSpec};
use crate::probe::{wait_ready, ProbeOutcome, ProberFactory};
use crate::process::{ProcessError, ProcessManager, ServiceStatus};
use crate::seed::{SeedError, SeedLoader, SeedStore};
use crate::topology::{BrokerConnector, TopologyDeclarer, TopologyError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The sequential stages of one bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    StartingInfra,
    WaitingReady,
    Migrating,
    DeclaringTopology,
    Seeding,
    MaterializingConfig,
    StartingDependents,
}

impl Stage {
    pub const SEQUENCE: [Stage; 7] = [
        Stage::StartingInfra,
        Stage::WaitingReady,
        Stage::Migrating,
        Stage::DeclaringTopology,
        Stage::Seeding,
        Stage::MaterializingConfig,
        Stage::StartingDependents,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::StartingInfra => "STARTING_INFRA",
            Stage::WaitingReady => "WAITING_READY",
            Stage::Migrating => "MIGRATING",
            Stage::DeclaringTopology => "DECLARING_TOPOLOGY",
            Stage::Seeding => "SEEDING",
            Stage::MaterializingConfig => "MATERIALIZING_CONFIG",
            Stage::StartingDependents => "STARTING_DEPENDENTS",
        }
    }

    fn ordinal(self) -> usize {
        Stage::SEQUENCE
            .iter()
            .position(|stage| *stage == self)
            .expect("stage present in sequence")
    }
}

/// Observable state of the orchestrator. `Failed` is reachable from every
/// running stage; `Done` only from the last one attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    Running(Stage),
    Done,
    Failed(Stage),
}

impl BootstrapState {
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapState::Idle => "IDLE",
            BootstrapState::Running(_) => "RUNNING",
            BootstrapState::Done => "DONE",
            BootstrapState::Failed(_) => "FAILED",
        }
    }

    /// Stages advance strictly forward; a run may skip stages but never
    /// revisit one, and failure pins the stage it happened in.
    pub fn is_valid_transition(from: BootstrapState, to: BootstrapState) -> bool {
        match (from, to) {
            (BootstrapState::Idle, BootstrapState::Running(_)) => true,
            (BootstrapState::Running(a), BootstrapState::Running(b)) => b.ordinal() > a.ordinal(),
            (BootstrapState::Running(a), BootstrapState::Failed(b)) => a == b,
            (BootstrapState::Running(_), BootstrapState::Done) => true,
            _ => false,
        }
    }
}

/// Typed failure of one stage. The orchestrator halts at the first of these;
/// nothing is caught and continued.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("dependency `{target}` not ready after {attempts} attempts")]
    TimedOut { target: String, attempts: u32 },
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error(transparent)]
    ConfigWrite(#[from] ConfigWriteError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl StageError {
    /// Name of the first failing item inside the stage, for the exit message.
    pub fn failing_item(&self) -> &str {
        match self {
            StageError::TimedOut { target, .. } => target,
            StageError::Migration(err) => &err.step,
            StageError::Topology(err) => err.entity(),
            StageError::Seed(err) => err.record(),
            StageError::ConfigWrite(err) => &err.target,
            StageError::Process(err) => &err.service,
        }
    }
}

#[derive(Debug)]
pub struct StageReport {
    pub stage: Stage,
    pub detail: String,
    pub error: Option<StageError>,
}

#[derive(Debug)]
pub struct BootstrapReport {
    pub state: BootstrapState,
    pub stages: Vec<StageReport>,
}

impl BootstrapReport {
    fn new() -> Self {
        Self {
            state: BootstrapState::Idle,
            stages: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == BootstrapState::Done
    }

    pub fn failure(&self) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.error.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct HealthEntry {
    pub service: String,
    pub check: &'static str,
    pub ready: bool,
}

pub struct OrchestratorOptions {
    pub worker_pool_size: usize,
    pub run_timeout: Option<Duration>,
    pub artifact_root: PathBuf,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            run_timeout: None,
            artifact_root: PathBuf::from("."),
        }
    }
}

/// Sequences the bootstrap stages over the injected collaborators. One run
/// per environment; stages never overlap, and a failed stage is final for
/// the run — already committed work stays committed and the next run resumes
/// through each stage's idempotency.
pub struct BootstrapOrchestrator {
    plan: Arc<BootstrapPlan>,
    steps: Vec<MigrationStep>,
    probers: Arc<dyn ProberFactory>,
    process: Arc<dyn ProcessManager>,
    broker: Arc<dyn BrokerConnector>,
    migrations: Arc<dyn MigrationStore>,
    seeds: Arc<dyn SeedStore>,
    materializer: ConfigMaterializer,
    options: OrchestratorOptions,
}

impl BootstrapOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan: Arc<BootstrapPlan>,
        steps: Vec<MigrationStep>,
        probers: Arc<dyn ProberFactory>,
        process: Arc<dyn ProcessManager>,
        broker: Arc<dyn BrokerConnector>,
        migrations: Arc<dyn MigrationStore>,
        seeds: Arc<dyn SeedStore>,
        options: OrchestratorOptions,
    ) -> Self {
        let materializer = ConfigMaterializer::new(options.artifact_root.clone());
        Self {
            plan,
            steps,
            probers,
            process,
            broker,
            migrations,
            seeds,
            materializer,
            options,
        }
    }

    /// The full `setup` sequence.
    pub async fn run(&self) -> BootstrapReport {
        self.execute(&Stage::SEQUENCE).await
    }

    /// The `start` sequence: bring services up behind their gates without
    /// touching migrations, topology, seeds, or artifacts.
    pub async fn run_startup(&self) -> BootstrapReport {
        self.execute(&[
            Stage::StartingInfra,
            Stage::WaitingReady,
            Stage::StartingDependents,
        ])
        .await
    }

    async fn execute(&self, stages: &[Stage]) -> BootstrapReport {
        let shutdown = CancellationToken::new();
        let watchdog = self.options.run_timeout.map(|timeout| {
            let token = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(timeout_secs = timeout.as_secs(), "bootstrap run timed out");
                token.cancel();
            })
        });

        let report = self.execute_inner(stages, &shutdown).await;

        if let Some(handle) = watchdog {
            handle.abort();
        }

        report
    }

    async fn execute_inner(
        &self,
        stages: &[Stage],
        shutdown: &CancellationToken,
    ) -> BootstrapReport {
        let mut report = BootstrapReport::new();
        let counters = metrics();

        for stage in stages {
            debug_assert!(BootstrapState::is_valid_transition(
                report.state,
                BootstrapState::Running(*stage)
            ));
            report.state = BootstrapState::Running(*stage);
            counters.record_stage_attempt(stage.as_str());
            tracing::info!(stage = stage.as_str(), "stage starting");

            match self.run_stage(*stage, shutdown).await {
                Ok(detail) => {
                    counters.record_stage_success(stage.as_str());
                    tracing::info!(stage = stage.as_str(), detail = %detail, "stage complete");
                    report.stages.push(StageReport {
                        stage: *stage,
                        detail,
                        error: None,
                    });
                }
                Err(err) => {
                    counters.record_stage_failure(stage.as_str());
                    tracing::error!(
                        stage = stage.as_str(),
                        item = err.failing_item(),
                        error = %err,
                        "stage failed"
                    );
                    report.stages.push(StageReport {
                        stage: *stage,
                        detail: err.to_string(),
                        error: Some(err),
                    });
                    report.state = BootstrapState::Failed(*stage);
                    return report;
                }
            }
        }

        report.state = BootstrapState::Done;
        report
    }

    async fn run_stage(
        &self,
        stage: Stage,
        shutdown: &CancellationToken,
    ) -> Result<String, StageError> {
        match stage {
            Stage::StartingInfra => self.start_services(ServiceKind::Infrastructure).await,
            Stage::WaitingReady => self.wait_for_readiness(shutdown).await,
            Stage::Migrating => self.apply_migrations().await,
            Stage::DeclaringTopology => self.declare_topology().await,
            Stage::Seeding => self.load_seeds().await,
            Stage::MaterializingConfig => self.materialize_artifacts().await,
            Stage::StartingDependents => self.start_dependents(shutdown).await,
        }
    }

    async fn start_services(&self, kind: ServiceKind) -> Result<String, StageError> {
        let ordered = ordered_services(&self.plan, kind);
        let names: Vec<String> = ordered.iter().map(|spec| spec.name.clone()).collect();

        if names.is_empty() {
            return Ok("no services declared".to_string());
        }

        self.process.start(&names).await?;

        for name in &names {
            match self.process.status(name).await? {
                ServiceStatus::Running => {}
                status => {
                    return Err(StageError::Process(ProcessError::new(
                        name.clone(),
                        format!("status is {} after start", status.as_str()),
                    )));
                }
            }
        }

        Ok(format!("{} service(s) started", names.len()))
    }

    async fn wait_for_readiness(&self, shutdown: &CancellationToken) -> Result<String, StageError> {
        let targets: Vec<&ServiceSpec> = ordered_services(&self.plan, ServiceKind::Infrastructure)
            .into_iter()
            .filter(|spec| spec.readiness.is_some())
            .collect();

        let outcomes = self.probe_targets(&targets, shutdown).await?;

        for (name, outcome) in &outcomes {
            if let ProbeOutcome::TimedOut { attempts } = outcome {
                return Err(StageError::TimedOut {
                    target: name.clone(),
                    attempts: *attempts,
                });
            }
        }

        Ok(format!("{} dependency(ies) ready", outcomes.len()))
    }

    async fn apply_migrations(&self) -> Result<String, StageError> {
        let runner = MigrationRunner::new(Arc::clone(&self.migrations));
        let applied = runner.apply(&self.steps).await?;
        Ok(format!("{applied} migration step(s) applied"))
    }

    async fn declare_topology(&self) -> Result<String, StageError> {
        let mut admin = self.broker.connect().await.map_err(StageError::Topology)?;

        let declared = TopologyDeclarer::declare(admin.as_mut(), &self.plan.topology).await;
        let closed = admin.close().await;

        let declared = declared?;
        if let Err(err) = closed {
            tracing::warn!(error = %err, "broker connection close failed after declaration");
        }

        Ok(format!("{declared} topology operation(s) declared"))
    }

    async fn load_seeds(&self) -> Result<String, StageError> {
        let loader = SeedLoader::new(Arc::clone(&self.seeds));
        let inserted = loader.seed(&self.plan.seeds).await?;
        Ok(format!("{inserted} seed record(s) inserted"))
    }

    async fn materialize_artifacts(&self) -> Result<String, StageError> {
        let mut written = 0;
        let mut merged = 0;
        let mut skipped = 0;

        for artifact in &self.plan.artifacts {
            match self.materializer.materialize(artifact)? {
                MaterializeOutcome::Written => written += 1,
                MaterializeOutcome::Merged => merged += 1,
                MaterializeOutcome::Skipped => skipped += 1,
            }
        }

        Ok(format!(
            "{written} written, {merged} merged, {skipped} skipped"
        ))
    }

    async fn start_dependents(&self, shutdown: &CancellationToken) -> Result<String, StageError> {
        let ordered = ordered_services(&self.plan, ServiceKind::Application);
        let names: Vec<String> = ordered.iter().map(|spec| spec.name.clone()).collect();

        if names.is_empty() {
            return Ok("no dependent services declared".to_string());
        }

        self.process.start(&names).await?;

        let gated: Vec<&ServiceSpec> = ordered
            .iter()
            .copied()
            .filter(|spec| spec.readiness.is_some())
            .collect();
        let outcomes = self.probe_targets(&gated, shutdown).await?;

        for (name, outcome) in &outcomes {
            if !outcome.is_ready() {
                return Err(StageError::Process(ProcessError::new(
                    name.clone(),
                    "failed to report healthy",
                )));
            }
        }

        Ok(format!("{} dependent service(s) started", names.len()))
    }

    /// Fans the targets' probes out over a bounded pool and blocks until all
    /// of them resolve. Results come back in the targets' declaration order.
    async fn probe_targets(
        &self,
        targets: &[&ServiceSpec],
        shutdown: &CancellationToken,
    ) -> Result<Vec<(String, ProbeOutcome)>, StageError> {
        let semaphore = Arc::new(Semaphore::new(self.options.worker_pool_size.max(1)));
        let mut join_set = JoinSet::new();

        for (index, service) in targets.iter().enumerate() {
            let check = service
                .readiness
                .clone()
                .expect("probe targets carry readiness checks");
            let prober = self.probers.prober(service, &check);
            let semaphore = Arc::clone(&semaphore);
            let shutdown = shutdown.clone();
            let name = service.name.clone();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("readiness semaphore closed");
                let outcome = wait_ready(
                    prober.as_ref(),
                    check.interval,
                    check.max_attempts,
                    &shutdown,
                )
                .await;
                (index, name, outcome)
            });
        }

        let mut outcomes: Vec<Option<(String, ProbeOutcome)>> = vec![None; targets.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, name, outcome)) => outcomes[index] = Some((name, outcome)),
                Err(join_err) => {
                    return Err(StageError::Process(ProcessError::new(
                        "readiness-pool",
                        join_err,
                    )));
                }
            }
        }

        Ok(outcomes.into_iter().flatten().collect())
    }

    /// One non-blocking pass over every declared readiness check, for the
    /// `health` command.
    pub async fn probe_all_once(&self) -> Vec<HealthEntry> {
        let shutdown = CancellationToken::new();
        let mut entries = Vec::new();

        for service in &self.plan.services {
            let Some(check) = &service.readiness else {
                continue;
            };

            let prober = self.probers.prober(service, check);
            let outcome = wait_ready(prober.as_ref(), Duration::ZERO, 1, &shutdown).await;
            entries.push(HealthEntry {
                service: service.name.clone(),
                check: check.probe.as_str(),
                ready: outcome.is_ready(),
            });
        }

        entries
    }
}

fn ordered_services(plan: &BootstrapPlan, kind: ServiceKind) -> Vec<&ServiceSpec> {
    // The plan was validated acyclic at load time.
    dependency_order(&plan.services)
        .unwrap_or_else(|_| plan.services.iter().collect())
        .into_iter()
        .filter(|spec| spec.kind == kind)
        .collect()
}
