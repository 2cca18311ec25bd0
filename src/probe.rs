#![forbid(unsafe_code)]

use crate::config::BootstrapConfig;
use crate::metrics::metrics;
use crate::plan::{ProbeKind, ReadinessCheckSpec, ServiceSpec};
use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties};
use tokio_executor_trait::Tokio as TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Result of polling one readiness target. `TimedOut` is fatal to the stage
/// that asked; the orchestrator never proceeds past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ProbeOutcome::Ready { attempts } | ProbeOutcome::TimedOut { attempts } => *attempts,
        }
    }
}

/// One readiness predicate. `check` must not mutate the target; a probe is a
/// pure gate. Errors count as "not ready yet".
#[async_trait]
pub trait Prober: Send + Sync {
    fn target(&self) -> &str;
    async fn check(&self) -> bool;
}

/// Polls `prober` at a fixed interval until it reports ready or the attempt
/// budget is spent. No backoff. Each attempt opens and closes its own
/// connection, so cancellation only ever lands on the sleep in between.
pub async fn wait_ready(
    prober: &dyn Prober,
    interval: Duration,
    max_attempts: u32,
    shutdown: &CancellationToken,
) -> ProbeOutcome {
    let mut attempts = 0;

    while attempts < max_attempts {
        if shutdown.is_cancelled() {
            return ProbeOutcome::TimedOut { attempts };
        }

        attempts += 1;
        if prober.check().await {
            tracing::info!(target = prober.target(), attempts, "dependency ready");
            metrics().record_probe_attempts(attempts);
            return ProbeOutcome::Ready { attempts };
        }

        tracing::debug!(
            target = prober.target(),
            attempt = attempts,
            max_attempts,
            "dependency not ready yet"
        );

        if attempts < max_attempts && sleep_with_shutdown(interval, shutdown).await {
            return ProbeOutcome::TimedOut { attempts };
        }
    }

    tracing::warn!(
        target = prober.target(),
        attempts,
        "dependency never became ready"
    );
    metrics().record_probe_attempts(attempts);
    ProbeOutcome::TimedOut { attempts }
}

/// Sleeps for a duration but aborts early if the shutdown token fires.
/// Returns `true` if shutdown occurred during the wait.
pub async fn sleep_with_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Builds probers for plan-declared readiness checks from the configured
/// backend URLs.
pub trait ProberFactory: Send + Sync {
    fn prober(&self, service: &ServiceSpec, check: &ReadinessCheckSpec) -> Arc<dyn Prober>;
}

pub struct ConnectionProbers {
    config: BootstrapConfig,
}

impl ConnectionProbers {
    pub fn new(config: BootstrapConfig) -> Self {
        Self { config }
    }
}

impl ProberFactory for ConnectionProbers {
    fn prober(&self, service: &ServiceSpec, check: &ReadinessCheckSpec) -> Arc<dyn Prober> {
        match &check.probe {
            ProbeKind::Tcp { address } => Arc::new(TcpProber {
                target: service.name.clone(),
                address: address.clone(),
            }),
            ProbeKind::Postgres => Arc::new(PostgresProber {
                target: service.name.clone(),
                url: self.config.database.url.clone(),
            }),
            ProbeKind::Redis => Arc::new(RedisProber {
                target: service.name.clone(),
                url: self.config.cache.url.clone(),
            }),
            ProbeKind::Amqp => Arc::new(AmqpProber {
                target: service.name.clone(),
                url: self.config.broker.url.clone(),
            }),
            ProbeKind::Http { url } => Arc::new(HttpProber {
                target: service.name.clone(),
                url: url.clone(),
            }),
        }
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct TcpProber {
    target: String,
    address: String,
}

#[async_trait]
impl Prober for TcpProber {
    fn target(&self) -> &str {
        &self.target
    }

    async fn check(&self) -> bool {
        matches!(
            timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address)).await,
            Ok(Ok(_))
        )
    }
}

struct PostgresProber {
    target: String,
    url: String,
}

#[async_trait]
impl Prober for PostgresProber {
    fn target(&self) -> &str {
        &self.target
    }

    async fn check(&self) -> bool {
        use sqlx::Connection as _;

        let connect = async {
            let mut conn = sqlx::postgres::PgConnection::connect(&self.url).await?;
            let ping = sqlx::query("SELECT 1").execute(&mut conn).await;
            let _ = conn.close().await;
            ping.map(|_| ())
        };

        match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(target = self.target.as_str(), error = %err, "postgres probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

struct RedisProber {
    target: String,
    url: String,
}

#[async_trait]
impl Prober for RedisProber {
    fn target(&self) -> &str {
        &self.target
    }

    async fn check(&self) -> bool {
        let ping = async {
            let client = redis::Client::open(self.url.as_str())?;
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<(), redis::RedisError>(())
        };

        match timeout(CONNECT_TIMEOUT, ping).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(target = self.target.as_str(), error = %err, "redis probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

struct AmqpProber {
    target: String,
    url: String,
}

#[async_trait]
impl Prober for AmqpProber {
    fn target(&self) -> &str {
        &self.target
    }

    async fn check(&self) -> bool {
        let connect = async {
            let properties = ConnectionProperties::default().with_executor(TokioExecutor::current());
            let connection = Connection::connect(&self.url, properties).await?;
            connection.close(200, "probe").await
        };

        match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(target = self.target.as_str(), error = %err, "amqp probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

struct HttpProber {
    target: String,
    url: String,
}

#[async_trait]
impl Prober for HttpProber {
    fn target(&self) -> &str {
        &self.target
    }

    async fn check(&self) -> bool {
        let client = reqwest::Client::new();
        match client
            .get(&self.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(target = self.target.as_str(), error = %err, "http probe failed");
                false
            }
        }
    }
}
