#![allow(dead_code)]

use aquila_bootstrap::error::Result;
use aquila_bootstrap::migrate::{MigrationStep, MigrationStore};
use aquila_bootstrap::plan::{
    BindingSpec, ExchangeSpec, QueueSpec, ReadinessCheckSpec, ServiceSpec,
};
use aquila_bootstrap::probe::{Prober, ProberFactory};
use aquila_bootstrap::process::{ExecOutput, ProcessError, ProcessManager, ServiceStatus};
use aquila_bootstrap::seed::{SeedStore, SeedTxn, SeedValue};
use aquila_bootstrap::topology::{BrokerAdmin, BrokerConnector, TopologyError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// probers

/// Prober factory with one scripted behaviour per service: ready after N
/// checks, or never. Check counts persist across stages.
#[derive(Default)]
pub struct ScriptedProbers {
    behaviours: Mutex<HashMap<String, u32>>,
    calls: Mutex<HashMap<String, Arc<AtomicU32>>>,
}

impl ScriptedProbers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The probe reports ready starting with check number `attempts`.
    pub fn ready_after(&self, service: &str, attempts: u32) {
        self.behaviours
            .lock()
            .expect("behaviours lock")
            .insert(service.to_string(), attempts);
    }

    pub fn never_ready(&self, service: &str) {
        self.ready_after(service, u32::MAX);
    }

    pub fn checks_made(&self, service: &str) -> u32 {
        self.calls
            .lock()
            .expect("calls lock")
            .get(service)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn counter(&self, service: &str) -> Arc<AtomicU32> {
        Arc::clone(
            self.calls
                .lock()
                .expect("calls lock")
                .entry(service.to_string())
                .or_default(),
        )
    }
}

impl ProberFactory for ScriptedProbers {
    fn prober(&self, service: &ServiceSpec, _check: &ReadinessCheckSpec) -> Arc<dyn Prober> {
        let ready_after = self
            .behaviours
            .lock()
            .expect("behaviours lock")
            .get(&service.name)
            .copied()
            .unwrap_or(1);

        Arc::new(ScriptedProber {
            target: service.name.clone(),
            ready_after,
            calls: self.counter(&service.name),
        })
    }
}

pub struct ScriptedProber {
    target: String,
    ready_after: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Prober for ScriptedProber {
    fn target(&self) -> &str {
        &self.target
    }

    async fn check(&self) -> bool {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        call >= self.ready_after
    }
}

// ---------------------------------------------------------------------------
// process manager

#[derive(Default)]
pub struct MockProcessManager {
    started: Mutex<Vec<Vec<String>>>,
    stopped: AtomicU32,
    fail_start_of: Mutex<Option<String>>,
}

impl MockProcessManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_start_of(&self, service: &str) {
        *self.fail_start_of.lock().expect("fail lock") = Some(service.to_string());
    }

    pub fn start_calls(&self) -> Vec<Vec<String>> {
        self.started.lock().expect("started lock").clone()
    }

    pub fn started_services(&self) -> Vec<String> {
        self.start_calls().into_iter().flatten().collect()
    }

    pub fn stop_calls(&self) -> u32 {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    async fn start(&self, services: &[String]) -> std::result::Result<(), ProcessError> {
        if let Some(failing) = self.fail_start_of.lock().expect("fail lock").clone() {
            if services.iter().any(|service| *service == failing) {
                return Err(ProcessError::new(failing, "container exited immediately"));
            }
        }

        self.started
            .lock()
            .expect("started lock")
            .push(services.to_vec());
        Ok(())
    }

    async fn status(&self, service: &str) -> std::result::Result<ServiceStatus, ProcessError> {
        if self
            .started_services()
            .iter()
            .any(|started| started == service)
        {
            Ok(ServiceStatus::Running)
        } else {
            Ok(ServiceStatus::Unknown)
        }
    }

    async fn exec_in_service(
        &self,
        _service: &str,
        _command: &str,
    ) -> std::result::Result<ExecOutput, ProcessError> {
        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn stop_all(&self) -> std::result::Result<(), ProcessError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logs(&self, _services: &[String]) -> std::result::Result<(), ProcessError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// migration store

#[derive(Default)]
pub struct MockMigrationStore {
    ledger: Mutex<BTreeMap<i64, String>>,
    pub ensure_calls: AtomicU32,
    pub apply_calls: AtomicU32,
    fail_on_version: Mutex<Option<i64>>,
}

impl MockMigrationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on_version(&self, version: i64) {
        *self.fail_on_version.lock().expect("fail lock") = Some(version);
    }

    pub fn clear_failure(&self) {
        *self.fail_on_version.lock().expect("fail lock") = None;
    }

    pub fn applied(&self) -> Vec<i64> {
        self.ledger
            .lock()
            .expect("ledger lock")
            .keys()
            .copied()
            .collect()
    }

    pub fn total_calls(&self) -> u32 {
        self.ensure_calls.load(Ordering::SeqCst) + self.apply_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MigrationStore for MockMigrationStore {
    async fn ensure_ledger(&self) -> Result<()> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<i64>> {
        Ok(self.applied())
    }

    async fn apply(&self, step: &MigrationStep) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);

        if *self.fail_on_version.lock().expect("fail lock") == Some(step.version) {
            return Err(aquila_bootstrap::error::Error::msg(format!(
                "syntax error in step {}",
                step.id()
            )));
        }

        let mut ledger = self.ledger.lock().expect("ledger lock");
        if ledger.contains_key(&step.version) {
            return Err(aquila_bootstrap::error::Error::msg(format!(
                "step {} applied twice",
                step.id()
            )));
        }
        ledger.insert(step.version, step.name.clone());
        Ok(())
    }

    async fn revert(&self, step: &MigrationStep) -> Result<()> {
        self.ledger
            .lock()
            .expect("ledger lock")
            .remove(&step.version);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// broker

#[derive(Debug, Default)]
pub struct BrokerState {
    pub exchanges: BTreeMap<String, ExchangeSpec>,
    pub queues: BTreeMap<String, QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

#[derive(Default)]
pub struct MockBrokerConnector {
    state: Arc<Mutex<BrokerState>>,
    pub connects: AtomicU32,
    closes: Arc<AtomicU32>,
    fail_connect: Mutex<bool>,
}

impl MockBrokerConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_connect(&self) {
        *self.fail_connect.lock().expect("fail lock") = true;
    }

    pub fn admin(&self) -> MockBrokerAdmin {
        MockBrokerAdmin {
            state: Arc::clone(&self.state),
            closes: Arc::clone(&self.closes),
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("broker state lock")
            .queues
            .keys()
            .cloned()
            .collect()
    }

    pub fn exchange_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("broker state lock")
            .exchanges
            .keys()
            .cloned()
            .collect()
    }

    pub fn bindings(&self) -> Vec<BindingSpec> {
        self.state
            .lock()
            .expect("broker state lock")
            .bindings
            .clone()
    }

    pub fn close_calls(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MockBrokerConnector {
    async fn connect(&self) -> std::result::Result<Box<dyn BrokerAdmin>, TopologyError> {
        if *self.fail_connect.lock().expect("fail lock") {
            return Err(TopologyError::Broker {
                name: "connection".to_string(),
                reason: "connection refused".to_string(),
            });
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.admin()))
    }
}

pub struct MockBrokerAdmin {
    state: Arc<Mutex<BrokerState>>,
    closes: Arc<AtomicU32>,
}

impl MockBrokerAdmin {
    pub fn standalone() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            closes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("broker state lock")
            .queues
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BrokerAdmin for MockBrokerAdmin {
    async fn declare_exchange(
        &mut self,
        spec: &ExchangeSpec,
    ) -> std::result::Result<(), TopologyError> {
        let mut state = self.state.lock().expect("broker state lock");
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(_) => Err(TopologyError::Conflict {
                name: spec.name.clone(),
            }),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> std::result::Result<(), TopologyError> {
        let mut state = self.state.lock().expect("broker state lock");
        match state.queues.get(&spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(_) => Err(TopologyError::Conflict {
                name: spec.name.clone(),
            }),
            None => {
                state.queues.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn bind(&mut self, spec: &BindingSpec) -> std::result::Result<(), TopologyError> {
        let mut state = self.state.lock().expect("broker state lock");
        if !state.exchanges.contains_key(&spec.exchange) {
            return Err(TopologyError::Broker {
                name: spec.exchange.clone(),
                reason: "binding references a missing exchange".to_string(),
            });
        }
        if !state.queues.contains_key(&spec.queue) {
            return Err(TopologyError::Broker {
                name: spec.queue.clone(),
                reason: "binding references a missing queue".to_string(),
            });
        }

        if !state.bindings.contains(spec) {
            state.bindings.push(spec.clone());
        }
        Ok(())
    }

    async fn close(&mut self) -> std::result::Result<(), TopologyError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// seed store

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockValue {
    Text(String),
    Id(Uuid),
}

#[derive(Debug, Clone)]
pub struct MockRow {
    pub id: Uuid,
    pub values: BTreeMap<String, MockValue>,
}

impl MockRow {
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.values.get(column) {
            Some(MockValue::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn id_value(&self, column: &str) -> Option<Uuid> {
        match self.values.get(column) {
            Some(MockValue::Id(id)) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SeedState {
    pub tables: BTreeMap<String, Vec<MockRow>>,
}

impl SeedState {
    fn find(&self, entity: &str, column: &str, value: &str) -> Option<Uuid> {
        self.tables.get(entity).and_then(|rows| {
            rows.iter()
                .find(|row| row.values.get(column) == Some(&MockValue::Text(value.to_string())))
                .map(|row| row.id)
        })
    }
}

#[derive(Default)]
pub struct MockSeedStore {
    state: Arc<Mutex<SeedState>>,
    fail_on_entity: Mutex<Option<String>>,
    pub begin_calls: AtomicU32,
}

impl MockSeedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on_entity(&self, entity: &str) {
        *self.fail_on_entity.lock().expect("fail lock") = Some(entity.to_string());
    }

    pub fn rows(&self, entity: &str) -> Vec<MockRow> {
        self.state
            .lock()
            .expect("seed state lock")
            .tables
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SeedStore for MockSeedStore {
    async fn begin(&self) -> Result<Box<dyn SeedTxn>> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSeedTxn {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
            fail_on_entity: self.fail_on_entity.lock().expect("fail lock").clone(),
        }))
    }
}

pub struct MockSeedTxn {
    state: Arc<Mutex<SeedState>>,
    staged: Vec<(String, MockRow)>,
    fail_on_entity: Option<String>,
}

#[async_trait]
impl SeedTxn for MockSeedTxn {
    async fn find_existing(
        &mut self,
        entity: &str,
        key_column: &str,
        key_value: &str,
    ) -> Result<Option<Uuid>> {
        if let Some((_, row)) = self.staged.iter().find(|(staged_entity, row)| {
            staged_entity == entity
                && row.values.get(key_column) == Some(&MockValue::Text(key_value.to_string()))
        }) {
            return Ok(Some(row.id));
        }

        Ok(self
            .state
            .lock()
            .expect("seed state lock")
            .find(entity, key_column, key_value))
    }

    async fn insert(
        &mut self,
        entity: &str,
        id: Uuid,
        values: &[(String, SeedValue)],
    ) -> Result<()> {
        if self.fail_on_entity.as_deref() == Some(entity) {
            return Err(aquila_bootstrap::error::Error::msg(format!(
                "constraint violation on {entity}"
            )));
        }

        let values = values
            .iter()
            .map(|(column, value)| {
                let value = match value {
                    SeedValue::Text(text) => MockValue::Text(text.clone()),
                    SeedValue::Id(id) => MockValue::Id(*id),
                };
                (column.clone(), value)
            })
            .collect();

        self.staged
            .push((entity.to_string(), MockRow { id, values }));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().expect("seed state lock");
        for (entity, row) in self.staged {
            state.tables.entry(entity).or_default().push(row);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
