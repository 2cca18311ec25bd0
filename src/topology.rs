#![forbid(unsafe_code)]

use crate::plan::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, TopologySpec};
use async_trait::async_trait;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, Connection, ConnectionProperties};
use thiserror::Error;
use tokio_executor_trait::Tokio as TokioExecutor;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology entity `{name}` exists with conflicting attributes")]
    Conflict { name: String },
    #[error("broker operation on `{name}` failed: {reason}")]
    Broker { name: String, reason: String },
}

impl TopologyError {
    pub fn entity(&self) -> &str {
        match self {
            TopologyError::Conflict { name } | TopologyError::Broker { name, .. } => name,
        }
    }
}

/// Administrative surface of the broker. Declarations must be idempotent for
/// identical attributes and must surface a conflict, never overwrite, when
/// attributes differ under the same name.
#[async_trait]
pub trait BrokerAdmin: Send {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), TopologyError>;
    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), TopologyError>;
    async fn bind(&mut self, spec: &BindingSpec) -> Result<(), TopologyError>;
    async fn close(&mut self) -> Result<(), TopologyError>;
}

/// Opens one admin connection per declaration stage; the orchestrator closes
/// it before the stage resolves, success or failure.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerAdmin>, TopologyError>;
}

/// A single topology operation, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyOp {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding(BindingSpec),
}

impl TopologyOp {
    pub fn name(&self) -> &str {
        match self {
            TopologyOp::Exchange(spec) => &spec.name,
            TopologyOp::Queue(spec) => &spec.name,
            TopologyOp::Binding(spec) => &spec.queue,
        }
    }
}

/// Expands the declared topology into an issue-ordered operation list:
/// exchanges first, then queues, then bindings, so a binding is never issued
/// before both of its endpoints exist, regardless of declaration order.
/// Queues with `dead_letter` gain their `_dlx`/`_dlq` companions.
pub fn ordered_operations(topology: &TopologySpec) -> Vec<TopologyOp> {
    let mut exchanges: Vec<ExchangeSpec> = topology.exchanges.clone();
    let mut queues: Vec<QueueSpec> = Vec::with_capacity(topology.queues.len());
    let mut bindings: Vec<BindingSpec> = Vec::new();

    for queue in &topology.queues {
        queues.push(queue.clone());
        if queue.dead_letter {
            exchanges.push(ExchangeSpec {
                name: dead_letter_exchange(&queue.name),
                kind: ExchangeKind::Direct,
                durable: true,
            });
            queues.push(QueueSpec {
                name: dead_letter_queue(&queue.name),
                durable: true,
                quorum: false,
                dead_letter: false,
            });
            bindings.push(BindingSpec {
                exchange: dead_letter_exchange(&queue.name),
                queue: dead_letter_queue(&queue.name),
                routing_key: dead_letter_queue(&queue.name),
            });
        }
    }

    bindings.extend(topology.bindings.iter().cloned());

    let mut ops = Vec::with_capacity(exchanges.len() + queues.len() + bindings.len());
    ops.extend(exchanges.into_iter().map(TopologyOp::Exchange));
    ops.extend(queues.into_iter().map(TopologyOp::Queue));
    ops.extend(bindings.into_iter().map(TopologyOp::Binding));
    ops
}

pub fn dead_letter_exchange(queue: &str) -> String {
    format!("{queue}_dlx")
}

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}_dlq")
}

pub struct TopologyDeclarer;

impl TopologyDeclarer {
    /// Issues every declaration in dependency order. Returns how many
    /// operations were acknowledged; the first conflict or broker failure
    /// aborts the pass.
    pub async fn declare(
        admin: &mut dyn BrokerAdmin,
        topology: &TopologySpec,
    ) -> Result<usize, TopologyError> {
        let mut declared = 0;

        for op in ordered_operations(topology) {
            match &op {
                TopologyOp::Exchange(spec) => {
                    tracing::debug!(exchange = %spec.name, kind = spec.kind.as_str(), "declaring exchange");
                    admin.declare_exchange(spec).await?;
                }
                TopologyOp::Queue(spec) => {
                    tracing::debug!(queue = %spec.name, durable = spec.durable, quorum = spec.quorum, "declaring queue");
                    admin.declare_queue(spec).await?;
                }
                TopologyOp::Binding(spec) => {
                    tracing::debug!(
                        exchange = %spec.exchange,
                        queue = %spec.queue,
                        routing_key = %spec.routing_key,
                        "declaring binding"
                    );
                    admin.bind(spec).await?;
                }
            }
            declared += 1;
        }

        Ok(declared)
    }
}

/// Queue arguments the platform's consumers rely on.
pub fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if spec.quorum {
        arguments.insert(
            ShortString::from("x-queue-type"),
            AMQPValue::LongString(LongString::from("quorum".to_string())),
        );
    }
    if spec.dead_letter {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dead_letter_exchange(&spec.name))),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(dead_letter_queue(&spec.name))),
        );
    }
    arguments
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// The server answers a redeclaration with differing attributes with a 406
/// precondition failure; that is the conflict signal, everything else is a
/// plain broker failure.
fn map_declare_error(name: &str, err: lapin::Error) -> TopologyError {
    let rendered = err.to_string();
    if rendered.contains("PRECONDITION-FAILED") || rendered.contains("PRECONDITION_FAILED") {
        TopologyError::Conflict {
            name: name.to_string(),
        }
    } else {
        TopologyError::Broker {
            name: name.to_string(),
            reason: rendered,
        }
    }
}

pub struct LapinBrokerAdmin {
    connection: Connection,
    channel: Channel,
}

pub struct LapinBrokerConnector {
    url: String,
}

impl LapinBrokerConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for LapinBrokerConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerAdmin>, TopologyError> {
        let properties = ConnectionProperties::default().with_executor(TokioExecutor::current());
        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|err| TopologyError::Broker {
                name: "connection".to_string(),
                reason: format!("failed to connect: {err}"),
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|err| TopologyError::Broker {
                name: "channel".to_string(),
                reason: format!("failed to open channel: {err}"),
            })?;

        Ok(Box::new(LapinBrokerAdmin {
            connection,
            channel,
        }))
    }
}

#[async_trait]
impl BrokerAdmin for LapinBrokerAdmin {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), TopologyError> {
        self.channel
            .exchange_declare(
                spec.name.as_str(),
                lapin_exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| map_declare_error(&spec.name, err))
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), TopologyError> {
        self.channel
            .queue_declare(
                spec.name.as_str(),
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(|err| map_declare_error(&spec.name, err))
    }

    async fn bind(&mut self, spec: &BindingSpec) -> Result<(), TopologyError> {
        self.channel
            .queue_bind(
                spec.queue.as_str(),
                spec.exchange.as_str(),
                spec.routing_key.as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| map_declare_error(&spec.queue, err))
    }

    async fn close(&mut self) -> Result<(), TopologyError> {
        if let Err(err) = self.channel.close(200, "bootstrap done").await {
            tracing::debug!(error = %err, "broker channel close failed");
        }
        self.connection
            .close(200, "bootstrap done")
            .await
            .map_err(|err| TopologyError::Broker {
                name: "connection".to_string(),
                reason: format!("failed to close: {err}"),
            })
    }
}
