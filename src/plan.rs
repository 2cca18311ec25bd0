mod artifacts;
mod seeds;
mod services;
mod topology;

use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use artifacts::ConfigArtifact;
pub use seeds::{NaturalKey, SeedRecordSpec};
pub use services::{
    dependency_order, ProbeKind, ReadinessCheckSpec, ServiceKind, ServiceSpec,
};
pub use topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, TopologySpec};

/// The declarative bootstrap plan: services, broker topology, migrations
/// location, seed catalogue, config artifacts, and pass-through tasks. All of
/// it is declared statically before orchestration starts.
#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    pub api_version: ApiVersion,
    pub services: Vec<ServiceSpec>,
    pub topology: TopologySpec,
    pub migrations_dir: PathBuf,
    pub seeds: Vec<SeedRecordSpec>,
    pub artifacts: Vec<ConfigArtifact>,
    pub tasks: BTreeMap<String, TaskSpec>,
}

/// One pass-through CLI task (`test`, `lint`, ...). With a `service` the
/// command runs inside that container; without one it runs on the host.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub service: Option<String>,
    pub command: String,
}

const TOP_LEVEL_FIELDS: &str =
    "api_version, services, topology, migrations, seeds, artifacts, tasks";

impl BootstrapPlan {
    pub fn from_reader(mut reader: impl Read) -> Result<Self, PlanError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    fn from_yaml_str(contents: &str) -> Result<Self, PlanError> {
        let raw: RawPlanFile = serde_yaml::from_str(contents)?;
        Self::from_raw(raw).map_err(PlanError::Invalid)
    }

    fn from_raw(raw: RawPlanFile) -> Result<Self, PlanValidationError> {
        let RawPlanFile {
            api_version: raw_api_version,
            services: raw_services,
            topology: raw_topology,
            migrations: raw_migrations,
            seeds: raw_seeds,
            artifacts: raw_artifacts,
            tasks,
            extra_fields,
        } = raw;

        let mut errors = Vec::new();

        for key in extra_fields.keys() {
            errors.push(format!(
                "error[root]: unknown top-level key \"{key}\" (expected one of {TOP_LEVEL_FIELDS})"
            ));
        }

        let api_version = parse_api_version(raw_api_version, &mut errors);
        let services = services::parse_services(raw_services, &mut errors);
        let topology = topology::parse_topology(raw_topology, &mut errors);
        let seeds = seeds::parse_seeds(raw_seeds, &mut errors);
        let artifacts = artifacts::parse_artifacts(raw_artifacts, &mut errors);

        let migrations_dir = raw_migrations
            .and_then(|section| section.directory)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("migrations"));

        services::validate_dependency_graph(&services, &mut errors);
        topology::validate_references(&topology, &mut errors);
        seeds::validate_references(&seeds, &mut errors);

        for (name, task) in &tasks {
            if task.command.trim().is_empty() {
                errors.push(format!("error[tasks.{name}]: command must not be empty"));
            }
            if let Some(service) = &task.service {
                if !services.iter().any(|spec| &spec.name == service) {
                    errors.push(format!(
                        "error[tasks.{name}]: references undeclared service `{service}`"
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(Self {
                api_version,
                services,
                topology,
                migrations_dir,
                seeds,
                artifacts,
                tasks,
            })
        } else {
            Err(PlanValidationError::new(errors))
        }
    }

    pub fn infrastructure_services(&self) -> Vec<&ServiceSpec> {
        self.services
            .iter()
            .filter(|spec| spec.kind == ServiceKind::Infrastructure)
            .collect()
    }

    pub fn application_services(&self) -> Vec<&ServiceSpec> {
        self.services
            .iter()
            .filter(|spec| spec.kind == ServiceKind::Application)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApiVersion {
    #[default]
    V1,
    Unsupported(String),
}

fn parse_api_version(raw: Option<String>, errors: &mut Vec<String>) -> ApiVersion {
    match raw {
        None => {
            errors
                .push("error[root]: api_version is required (supported versions: v1)".to_string());
            ApiVersion::V1
        }
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.eq_ignore_ascii_case("v1") {
                ApiVersion::V1
            } else {
                errors.push(format!(
                    "error[root]: api_version `{trimmed}` is not supported (supported versions: v1)"
                ));
                ApiVersion::Unsupported(trimmed.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPlanFile {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    services: Vec<services::RawService>,
    #[serde(default)]
    topology: Option<topology::RawTopology>,
    #[serde(default)]
    migrations: Option<RawMigrationsSection>,
    #[serde(default)]
    seeds: Vec<seeds::RawSeedRecord>,
    #[serde(default)]
    artifacts: Vec<artifacts::RawArtifact>,
    #[serde(default)]
    tasks: BTreeMap<String, TaskSpec>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct RawMigrationsSection {
    #[serde(default)]
    directory: Option<String>,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read bootstrap plan: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse bootstrap plan: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(PlanValidationError),
}

#[derive(Debug, Error)]
#[error("bootstrap plan validation failed:\n{rendered}")]
pub struct PlanValidationError {
    rendered: String,
}

impl PlanValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self { rendered }
    }
}
