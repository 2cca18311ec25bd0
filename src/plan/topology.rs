use serde::Deserialize;
use std::collections::BTreeSet;

/// The broker topology declared for the platform: exchanges, durable queues,
/// and the bindings between them.
#[derive(Debug, Clone, Default)]
pub struct TopologySpec {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Declares the queue as a quorum queue (`x-queue-type=quorum`).
    pub quorum: bool,
    /// Derives a `<name>_dlx` exchange and `<name>_dlq` queue and points the
    /// queue's dead-letter arguments at them.
    pub dead_letter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct RawTopology {
    #[serde(default)]
    exchanges: Vec<RawExchange>,
    #[serde(default)]
    queues: Vec<RawQueue>,
    #[serde(default)]
    bindings: Vec<RawBinding>,
}

#[derive(Debug, Deserialize)]
struct RawExchange {
    name: Option<String>,
    #[serde(rename = "type")]
    #[serde(default)]
    kind: Option<String>,
    #[serde(default = "default_durable")]
    durable: bool,
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    name: Option<String>,
    #[serde(default = "default_durable")]
    durable: bool,
    #[serde(default)]
    quorum: bool,
    #[serde(default)]
    dead_letter: bool,
}

#[derive(Debug, Deserialize)]
struct RawBinding {
    exchange: Option<String>,
    queue: Option<String>,
    #[serde(default)]
    routing_key: Option<String>,
}

const fn default_durable() -> bool {
    true
}

pub(super) fn parse_topology(raw: Option<RawTopology>, errors: &mut Vec<String>) -> TopologySpec {
    let Some(raw) = raw else {
        return TopologySpec::default();
    };

    let mut exchanges = Vec::with_capacity(raw.exchanges.len());
    for (index, raw_exchange) in raw.exchanges.into_iter().enumerate() {
        let Some(name) = non_empty(raw_exchange.name) else {
            errors.push(format!("error[topology.exchanges[{index}]]: name is required"));
            continue;
        };
        let kind = match raw_exchange.kind.as_deref() {
            None | Some("direct") => ExchangeKind::Direct,
            Some("topic") => ExchangeKind::Topic,
            Some("fanout") => ExchangeKind::Fanout,
            Some(other) => {
                errors.push(format!(
                    "error[topology.exchanges.{name}]: type `{other}` is not supported (direct, topic, fanout)"
                ));
                continue;
            }
        };
        exchanges.push(ExchangeSpec {
            name,
            kind,
            durable: raw_exchange.durable,
        });
    }

    let mut queues = Vec::with_capacity(raw.queues.len());
    for (index, raw_queue) in raw.queues.into_iter().enumerate() {
        let Some(name) = non_empty(raw_queue.name) else {
            errors.push(format!("error[topology.queues[{index}]]: name is required"));
            continue;
        };
        queues.push(QueueSpec {
            name,
            durable: raw_queue.durable,
            quorum: raw_queue.quorum,
            dead_letter: raw_queue.dead_letter,
        });
    }

    let mut bindings = Vec::with_capacity(raw.bindings.len());
    for (index, raw_binding) in raw.bindings.into_iter().enumerate() {
        let exchange = non_empty(raw_binding.exchange);
        let queue = non_empty(raw_binding.queue);
        match (exchange, queue) {
            (Some(exchange), Some(queue)) => bindings.push(BindingSpec {
                exchange,
                queue,
                routing_key: raw_binding.routing_key.unwrap_or_default(),
            }),
            _ => errors.push(format!(
                "error[topology.bindings[{index}]]: exchange and queue are required"
            )),
        }
    }

    TopologySpec {
        exchanges,
        queues,
        bindings,
    }
}

pub(super) fn validate_references(topology: &TopologySpec, errors: &mut Vec<String>) {
    let mut exchange_names = BTreeSet::new();
    for exchange in &topology.exchanges {
        if !exchange_names.insert(exchange.name.as_str()) {
            errors.push(format!(
                "error[topology.exchanges.{}]: duplicate exchange name",
                exchange.name
            ));
        }
    }

    let mut queue_names = BTreeSet::new();
    for queue in &topology.queues {
        if !queue_names.insert(queue.name.as_str()) {
            errors.push(format!(
                "error[topology.queues.{}]: duplicate queue name",
                queue.name
            ));
        }
    }

    for binding in &topology.bindings {
        if !exchange_names.contains(binding.exchange.as_str()) {
            errors.push(format!(
                "error[topology.bindings]: references undeclared exchange `{}`",
                binding.exchange
            ));
        }
        if !queue_names.contains(binding.queue.as_str()) {
            errors.push(format!(
                "error[topology.bindings]: references undeclared queue `{}`",
                binding.queue
            ));
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
