use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// One service the orchestrator is responsible for. Infrastructure services
/// start first and gate everything else; application services start last.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub kind: ServiceKind,
    pub depends_on: Vec<String>,
    pub readiness: Option<ReadinessCheckSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Infrastructure,
    Application,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Infrastructure => "infrastructure",
            ServiceKind::Application => "application",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheckSpec {
    pub probe: ProbeKind,
    pub interval: Duration,
    pub max_attempts: u32,
}

/// What to poll. The address/url variants are connection-free checks; the
/// postgres/redis/amqp variants open a client connection against the URL
/// configured for that backend and close it within the same attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    Tcp { address: String },
    Postgres,
    Redis,
    Amqp,
    Http { url: String },
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Tcp { .. } => "tcp",
            ProbeKind::Postgres => "postgres",
            ProbeKind::Redis => "redis",
            ProbeKind::Amqp => "amqp",
            ProbeKind::Http { .. } => "http",
        }
    }
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_ATTEMPTS: u32 = 30;

#[derive(Debug, Deserialize)]
pub(super) struct RawService {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    readiness: Option<RawReadiness>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct RawReadiness {
    #[serde(default)]
    check: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    max_attempts: Option<u32>,
}

pub(super) fn parse_services(raw: Vec<RawService>, errors: &mut Vec<String>) -> Vec<ServiceSpec> {
    let mut services = Vec::with_capacity(raw.len());
    let mut seen = BTreeSet::new();

    for (index, raw_service) in raw.into_iter().enumerate() {
        let name = match raw_service.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                errors.push(format!("error[services[{index}]]: name is required"));
                continue;
            }
        };

        if !seen.insert(name.clone()) {
            errors.push(format!(
                "error[services.{name}]: duplicate service name"
            ));
            continue;
        }

        for key in raw_service.extra_fields.keys() {
            errors.push(format!(
                "error[services.{name}]: unknown key \"{key}\" (expected one of name, kind, depends_on, readiness)"
            ));
        }

        let kind = match raw_service.kind.as_deref() {
            None | Some("infrastructure") => ServiceKind::Infrastructure,
            Some("application") => ServiceKind::Application,
            Some(other) => {
                errors.push(format!(
                    "error[services.{name}]: kind `{other}` is not supported (infrastructure, application)"
                ));
                ServiceKind::Infrastructure
            }
        };

        let readiness = raw_service
            .readiness
            .and_then(|raw| parse_readiness(&name, raw, errors));

        let depends_on = raw_service
            .depends_on
            .into_iter()
            .map(|dep| dep.trim().to_string())
            .filter(|dep| !dep.is_empty())
            .collect();

        services.push(ServiceSpec {
            name,
            kind,
            depends_on,
            readiness,
        });
    }

    services
}

fn parse_readiness(
    service: &str,
    raw: RawReadiness,
    errors: &mut Vec<String>,
) -> Option<ReadinessCheckSpec> {
    let probe = match raw.check.as_deref() {
        Some("tcp") => match raw.address {
            Some(address) if !address.trim().is_empty() => ProbeKind::Tcp {
                address: address.trim().to_string(),
            },
            _ => {
                errors.push(format!(
                    "error[services.{service}]: tcp readiness check requires an address"
                ));
                return None;
            }
        },
        Some("postgres") => ProbeKind::Postgres,
        Some("redis") => ProbeKind::Redis,
        Some("amqp") => ProbeKind::Amqp,
        Some("http") => match raw.url {
            Some(url) if !url.trim().is_empty() => ProbeKind::Http {
                url: url.trim().to_string(),
            },
            _ => {
                errors.push(format!(
                    "error[services.{service}]: http readiness check requires a url"
                ));
                return None;
            }
        },
        Some(other) => {
            errors.push(format!(
                "error[services.{service}]: readiness check `{other}` is not supported (tcp, postgres, redis, amqp, http)"
            ));
            return None;
        }
        None => {
            errors.push(format!(
                "error[services.{service}]: readiness section requires a check kind"
            ));
            return None;
        }
    };

    let interval = match raw.interval {
        Some(value) => match humantime::parse_duration(value.trim()) {
            Ok(parsed) => parsed,
            Err(err) => {
                errors.push(format!(
                    "error[services.{service}]: invalid readiness interval `{value}`: {err}"
                ));
                return None;
            }
        },
        None => DEFAULT_POLL_INTERVAL,
    };

    let max_attempts = raw.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
    if max_attempts == 0 {
        errors.push(format!(
            "error[services.{service}]: readiness max_attempts must be at least 1"
        ));
        return None;
    }

    Some(ReadinessCheckSpec {
        probe,
        interval,
        max_attempts,
    })
}

pub(super) fn validate_dependency_graph(services: &[ServiceSpec], errors: &mut Vec<String>) {
    let names: BTreeSet<&str> = services.iter().map(|spec| spec.name.as_str()).collect();

    for service in services {
        for dep in &service.depends_on {
            if !names.contains(dep.as_str()) {
                errors.push(format!(
                    "error[services.{}]: depends on undeclared service `{dep}`",
                    service.name
                ));
            }
        }
    }

    if let Err(cycle_member) = dependency_order(services) {
        errors.push(format!(
            "error[services]: dependency cycle involving `{cycle_member}`"
        ));
    }
}

/// Orders services so every dependency precedes its dependents. Ties keep
/// declaration order. Returns the name of a cycle participant on failure.
pub fn dependency_order(services: &[ServiceSpec]) -> Result<Vec<&ServiceSpec>, String> {
    let index: BTreeMap<&str, &ServiceSpec> = services
        .iter()
        .map(|spec| (spec.name.as_str(), spec))
        .collect();

    let mut ordered = Vec::with_capacity(services.len());
    let mut resolved = BTreeSet::new();
    let mut in_progress = BTreeSet::new();

    fn visit<'a>(
        spec: &'a ServiceSpec,
        index: &BTreeMap<&str, &'a ServiceSpec>,
        resolved: &mut BTreeSet<&'a str>,
        in_progress: &mut BTreeSet<&'a str>,
        ordered: &mut Vec<&'a ServiceSpec>,
    ) -> Result<(), String> {
        if resolved.contains(spec.name.as_str()) {
            return Ok(());
        }
        if !in_progress.insert(spec.name.as_str()) {
            return Err(spec.name.clone());
        }

        for dep in &spec.depends_on {
            if let Some(dep_spec) = index.get(dep.as_str()) {
                visit(dep_spec, index, resolved, in_progress, ordered)?;
            }
        }

        in_progress.remove(spec.name.as_str());
        resolved.insert(spec.name.as_str());
        ordered.push(spec);
        Ok(())
    }

    for spec in services {
        visit(spec, &index, &mut resolved, &mut in_progress, &mut ordered)?;
    }

    Ok(ordered)
}
