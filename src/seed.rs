#![forbid(unsafe_code)]

use crate::config::DatabaseConfig;
use crate::error::{Context, Error, Result};
use crate::plan::SeedRecordSpec;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use uuid::Uuid;

#[derive(Debug, ThisError)]
pub enum SeedError {
    #[error("seed `{record}` references `{referent}` which has not been committed")]
    MissingReferent { record: String, referent: String },
    #[error("seed `{record}` failed: {reason}")]
    Store { record: String, reason: String },
}

impl SeedError {
    pub fn record(&self) -> &str {
        match self {
            SeedError::MissingReferent { record, .. } | SeedError::Store { record, .. } => record,
        }
    }
}

/// A column value bound during insert: either plan text or a generated
/// identifier substituted from a referent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedValue {
    Text(String),
    Id(Uuid),
}

/// One open seeding transaction. A group of mutually dependent records runs
/// through exactly one of these; partial failure rolls the whole group back.
#[async_trait]
pub trait SeedTxn: Send {
    async fn find_existing(
        &mut self,
        entity: &str,
        key_column: &str,
        key_value: &str,
    ) -> Result<Option<Uuid>>;

    async fn insert(
        &mut self,
        entity: &str,
        id: Uuid,
        values: &[(String, SeedValue)],
    ) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait SeedStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn SeedTxn>>;
}

pub struct SeedLoader {
    store: Arc<dyn SeedStore>,
}

impl SeedLoader {
    pub fn new(store: Arc<dyn SeedStore>) -> Self {
        Self { store }
    }

    /// Applies records in declaration order. Consecutive records sharing a
    /// `group` commit in one transaction; everything else commits one record
    /// at a time. Existing natural keys are skipped but still contribute
    /// their id to later `refs`.
    pub async fn seed(&self, records: &[SeedRecordSpec]) -> Result<usize, SeedError> {
        let mut ids: BTreeMap<String, Uuid> = BTreeMap::new();
        let mut inserted = 0;

        for batch in batch_by_group(records) {
            let mut txn = self.store.begin().await.map_err(|err| SeedError::Store {
                record: batch[0].label.clone(),
                reason: err.to_string(),
            })?;

            match seed_batch(txn.as_mut(), &batch, &mut ids).await {
                Ok(count) => {
                    txn.commit().await.map_err(|err| SeedError::Store {
                        record: batch[batch.len() - 1].label.clone(),
                        reason: err.to_string(),
                    })?;
                    inserted += count;
                }
                Err(err) => {
                    if let Err(rollback_err) = txn.rollback().await {
                        tracing::warn!(
                            record = err.record(),
                            error = %rollback_err,
                            "seed transaction rollback failed"
                        );
                    }
                    return Err(err);
                }
            }
        }

        Ok(inserted)
    }
}

async fn seed_batch(
    txn: &mut dyn SeedTxn,
    batch: &[&SeedRecordSpec],
    ids: &mut BTreeMap<String, Uuid>,
) -> Result<usize, SeedError> {
    let mut inserted = 0;

    for record in batch {
        let existing = txn
            .find_existing(
                &record.entity,
                &record.natural_key.column,
                &record.natural_key.value,
            )
            .await
            .map_err(|err| SeedError::Store {
                record: record.label.clone(),
                reason: err.to_string(),
            })?;

        if let Some(id) = existing {
            tracing::debug!(
                record = %record.label,
                entity = %record.entity,
                "seed record already present, skipping"
            );
            ids.insert(record.label.clone(), id);
            continue;
        }

        let mut values: Vec<(String, SeedValue)> = Vec::new();
        values.push((
            record.natural_key.column.clone(),
            SeedValue::Text(record.natural_key.value.clone()),
        ));
        for (column, value) in &record.columns {
            values.push((column.clone(), SeedValue::Text(value.clone())));
        }
        for (column, referent) in &record.refs {
            let id = ids
                .get(referent)
                .copied()
                .ok_or_else(|| SeedError::MissingReferent {
                    record: record.label.clone(),
                    referent: referent.clone(),
                })?;
            values.push((column.clone(), SeedValue::Id(id)));
        }

        let id = Uuid::new_v4();
        txn.insert(&record.entity, id, &values)
            .await
            .map_err(|err| SeedError::Store {
                record: record.label.clone(),
                reason: err.to_string(),
            })?;

        tracing::info!(record = %record.label, entity = %record.entity, "seed record inserted");
        ids.insert(record.label.clone(), id);
        inserted += 1;
    }

    Ok(inserted)
}

/// Splits the record list into transaction batches: consecutive records with
/// the same group name stay together, everything else is a singleton.
fn batch_by_group(records: &[SeedRecordSpec]) -> Vec<Vec<&SeedRecordSpec>> {
    let mut batches: Vec<Vec<&SeedRecordSpec>> = Vec::new();

    for record in records {
        let joins_previous = match (&record.group, batches.last().and_then(|batch| batch.last())) {
            (Some(group), Some(previous)) => previous.group.as_deref() == Some(group.as_str()),
            _ => false,
        };

        if joins_previous {
            batches
                .last_mut()
                .expect("previous batch exists")
                .push(record);
        } else {
            batches.push(vec![record]);
        }
    }

    batches
}

pub struct PgSeedStore {
    pool: Pool<Postgres>,
}

impl PgSeedStore {
    /// Lazy pool, for the same reason as the migration store: the seeding
    /// stage runs long after construction, behind the readiness gates.
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let max_conn = config.max_connections.unwrap_or(5);
        let acquire_timeout = config.acquire_timeout_secs.unwrap_or(5);

        let pool = PgPoolOptions::new()
            .max_connections(max_conn)
            .acquire_timeout(Duration::from_secs(acquire_timeout))
            .connect_lazy(&config.url)
            .with_context(|| format!("invalid database url {}", config.url))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SeedStore for PgSeedStore {
    async fn begin(&self) -> Result<Box<dyn SeedTxn>> {
        let tx = self.pool.begin().await.map_err(Error::from)?;
        Ok(Box::new(PgSeedTxn { tx }))
    }
}

struct PgSeedTxn {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SeedTxn for PgSeedTxn {
    async fn find_existing(
        &mut self,
        entity: &str,
        key_column: &str,
        key_value: &str,
    ) -> Result<Option<Uuid>> {
        // Identifiers were validated at plan load; only the value is bound.
        let sql = format!("SELECT id FROM {entity} WHERE {key_column} = $1");
        let id = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(key_value)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::from)?;
        Ok(id)
    }

    async fn insert(
        &mut self,
        entity: &str,
        id: Uuid,
        values: &[(String, SeedValue)],
    ) -> Result<()> {
        let mut columns = vec!["id".to_string()];
        let mut placeholders = vec!["$1".to_string()];
        for (index, (column, _)) in values.iter().enumerate() {
            columns.push(column.clone());
            placeholders.push(format!("${}", index + 2));
        }

        let sql = format!(
            "INSERT INTO {entity} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(id);
        for (_, value) in values {
            query = match value {
                SeedValue::Text(text) => query.bind(text),
                SeedValue::Id(id) => query.bind(*id),
            };
        }

        query.execute(&mut *self.tx).await.map_err(Error::from)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(Error::from)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(Error::from)
    }
}
