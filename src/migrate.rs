#![forbid(unsafe_code)]

use crate::config::DatabaseConfig;
use crate::error::{Context, Error, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;

/// One schema migration, parsed from `NNN_name.sql`. Everything before a
/// `-- down` marker line is the up script; everything after it is the
/// optional down script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    pub version: i64,
    pub name: String,
    pub up: String,
    pub down: Option<String>,
}

impl MigrationStep {
    pub fn id(&self) -> String {
        format!("{:03}_{}", self.version, self.name)
    }

    pub fn parse(file_name: &str, contents: &str) -> Result<Self> {
        let stem = file_name
            .strip_suffix(".sql")
            .ok_or_else(|| crate::err!("migration `{file_name}` must end in .sql"))?;

        let (version_part, name) = stem
            .split_once('_')
            .ok_or_else(|| crate::err!("migration `{file_name}` must be named NNN_name.sql"))?;

        let version: i64 = version_part.parse().map_err(|_| {
            crate::err!("migration `{file_name}` has a non-numeric version `{version_part}`")
        })?;

        crate::ensure_err!(
            !name.is_empty(),
            "migration `{file_name}` must carry a name after the version"
        );

        let mut up_lines = Vec::new();
        let mut down_lines = Vec::new();
        let mut in_down = false;
        for line in contents.lines() {
            if line.trim().eq_ignore_ascii_case("-- down") {
                in_down = true;
                continue;
            }
            if in_down {
                down_lines.push(line);
            } else {
                up_lines.push(line);
            }
        }

        let up = up_lines.join("\n").trim().to_string();
        crate::ensure_err!(!up.is_empty(), "migration `{file_name}` has an empty up script");

        let down = {
            let joined = down_lines.join("\n").trim().to_string();
            if joined.is_empty() {
                None
            } else {
                Some(joined)
            }
        };

        Ok(Self {
            version,
            name: name.to_string(),
            up,
            down,
        })
    }
}

/// Reads every `*.sql` file in `dir` into steps sorted by ascending version.
/// Duplicate versions are an error.
pub fn load_steps(dir: &Path) -> Result<Vec<MigrationStep>> {
    let mut steps = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read migrations directory {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !file_name.ends_with(".sql") {
            continue;
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read migration {}", path.display()))?;
        steps.push(MigrationStep::parse(file_name, &contents)?);
    }

    steps.sort_by_key(|step| step.version);

    for window in steps.windows(2) {
        crate::ensure_err!(
            window[0].version != window[1].version,
            "duplicate migration version {:03} ({} and {})",
            window[0].version,
            window[0].name,
            window[1].name
        );
    }

    Ok(steps)
}

#[derive(Debug, ThisError)]
#[error("migration `{step}` failed: {reason}")]
pub struct MigrationError {
    pub step: String,
    pub reason: String,
}

impl MigrationError {
    fn new(step: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            step: step.into(),
            reason: reason.to_string(),
        }
    }
}

/// Storage behind the runner: the applied-steps ledger plus the ability to
/// run one step's script and its ledger row in a single transaction.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn ensure_ledger(&self) -> Result<()>;
    async fn applied_versions(&self) -> Result<Vec<i64>>;
    async fn apply(&self, step: &MigrationStep) -> Result<()>;
    async fn revert(&self, step: &MigrationStep) -> Result<()>;
}

pub struct MigrationRunner {
    store: Arc<dyn MigrationStore>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn MigrationStore>) -> Self {
        Self { store }
    }

    /// Applies pending steps strictly in ascending order. Steps already in
    /// the ledger are never re-run; on failure at step *i* the earlier steps
    /// stay applied and nothing after *i* is attempted.
    pub async fn apply(&self, steps: &[MigrationStep]) -> Result<usize, MigrationError> {
        for window in steps.windows(2) {
            if window[1].version <= window[0].version {
                return Err(MigrationError::new(
                    window[1].id(),
                    "steps must be ordered by strictly ascending version",
                ));
            }
        }

        self.store
            .ensure_ledger()
            .await
            .map_err(|err| MigrationError::new("schema_migrations", err))?;

        let applied: BTreeSet<i64> = self
            .store
            .applied_versions()
            .await
            .map_err(|err| MigrationError::new("schema_migrations", err))?
            .into_iter()
            .collect();

        let mut newly_applied = 0;
        for step in steps {
            if applied.contains(&step.version) {
                tracing::debug!(step = %step.id(), "migration already applied, skipping");
                continue;
            }

            tracing::info!(step = %step.id(), "applying migration");
            self.store
                .apply(step)
                .await
                .map_err(|err| MigrationError::new(step.id(), err))?;
            newly_applied += 1;
        }

        Ok(newly_applied)
    }

    /// Reverts the most recently applied step, if any. The step must still be
    /// present in the catalogue and must carry a down script.
    pub async fn revert_last(
        &self,
        steps: &[MigrationStep],
    ) -> Result<Option<String>, MigrationError> {
        self.store
            .ensure_ledger()
            .await
            .map_err(|err| MigrationError::new("schema_migrations", err))?;

        let applied = self
            .store
            .applied_versions()
            .await
            .map_err(|err| MigrationError::new("schema_migrations", err))?;

        let Some(latest) = applied.into_iter().max() else {
            return Ok(None);
        };

        let step = steps
            .iter()
            .find(|step| step.version == latest)
            .ok_or_else(|| {
                MigrationError::new(
                    format!("{latest:03}"),
                    "applied version is missing from the migration catalogue",
                )
            })?;

        if step.down.is_none() {
            return Err(MigrationError::new(
                step.id(),
                "step has no down script and cannot be reverted",
            ));
        }

        tracing::info!(step = %step.id(), "reverting migration");
        self.store
            .revert(step)
            .await
            .map_err(|err| MigrationError::new(step.id(), err))?;

        Ok(Some(step.id()))
    }
}

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (\
     version BIGINT PRIMARY KEY, \
     name TEXT NOT NULL, \
     applied_at TIMESTAMPTZ NOT NULL DEFAULT now())";

pub struct PgMigrationStore {
    pool: Pool<Postgres>,
}

impl PgMigrationStore {
    /// The pool is lazy; the first ledger operation opens the connection.
    /// The database may not even be running when the orchestrator is built.
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

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    async fn ensure_ledger(&self) -> Result<()> {
        sqlx::query(LEDGER_DDL)
            .execute(&self.pool)
            .await
            .context("failed to create schema_migrations ledger")?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<i64>> {
        let versions =
            sqlx::query_scalar::<_, i64>("SELECT version FROM schema_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await
                .context("failed to read schema_migrations ledger")?;
        Ok(versions)
    }

    async fn apply(&self, step: &MigrationStep) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::from)?;

        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
            .bind(step.version)
            .bind(&step.name)
            .execute(&mut *tx)
            .await
            .map_err(Error::from)?;

        tx.commit().await.map_err(Error::from)?;
        Ok(())
    }

    async fn revert(&self, step: &MigrationStep) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::from)?;

        sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
            .bind(step.version)
            .execute(&mut *tx)
            .await
            .map_err(Error::from)?;

        tx.commit().await.map_err(Error::from)?;
        Ok(())
    }
}
