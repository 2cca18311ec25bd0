use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// One reference/test record to seed. Records are applied in declaration
/// order; `refs` may only point at labels declared earlier, so the plan's
/// order is also a valid referential order.
#[derive(Debug, Clone)]
pub struct SeedRecordSpec {
    pub label: String,
    /// Records sharing a group commit in one transaction.
    pub group: Option<String>,
    pub entity: String,
    pub natural_key: NaturalKey,
    pub columns: BTreeMap<String, String>,
    /// column name → label of the record whose generated id fills it.
    pub refs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalKey {
    pub column: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct RawSeedRecord {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    natural_key: Option<RawNaturalKey>,
    #[serde(default)]
    columns: BTreeMap<String, String>,
    #[serde(default)]
    refs: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawNaturalKey {
    column: Option<String>,
    value: Option<String>,
}

pub(super) fn parse_seeds(raw: Vec<RawSeedRecord>, errors: &mut Vec<String>) -> Vec<SeedRecordSpec> {
    let mut seeds = Vec::with_capacity(raw.len());

    for (index, raw_seed) in raw.into_iter().enumerate() {
        let Some(label) = non_empty(raw_seed.label) else {
            errors.push(format!("error[seeds[{index}]]: label is required"));
            continue;
        };

        let Some(entity) = non_empty(raw_seed.entity) else {
            errors.push(format!("error[seeds.{label}]: entity is required"));
            continue;
        };
        if !is_sql_identifier(&entity) {
            errors.push(format!(
                "error[seeds.{label}]: entity `{entity}` is not a valid identifier"
            ));
            continue;
        }

        let natural_key = match raw_seed.natural_key {
            Some(raw_key) => {
                let column = non_empty(raw_key.column);
                let value = non_empty(raw_key.value);
                match (column, value) {
                    (Some(column), Some(value)) if is_sql_identifier(&column) => {
                        NaturalKey { column, value }
                    }
                    (Some(column), Some(_)) => {
                        errors.push(format!(
                            "error[seeds.{label}]: natural key column `{column}` is not a valid identifier"
                        ));
                        continue;
                    }
                    _ => {
                        errors.push(format!(
                            "error[seeds.{label}]: natural_key requires column and value"
                        ));
                        continue;
                    }
                }
            }
            None => {
                errors.push(format!("error[seeds.{label}]: natural_key is required"));
                continue;
            }
        };

        let mut valid = true;
        for column in raw_seed.columns.keys().chain(raw_seed.refs.keys()) {
            if !is_sql_identifier(column) {
                errors.push(format!(
                    "error[seeds.{label}]: column `{column}` is not a valid identifier"
                ));
                valid = false;
            }
        }
        if !valid {
            continue;
        }

        seeds.push(SeedRecordSpec {
            label,
            group: raw_seed.group.and_then(|group| {
                let trimmed = group.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }),
            entity,
            natural_key,
            columns: raw_seed.columns,
            refs: raw_seed.refs,
        });
    }

    seeds
}

pub(super) fn validate_references(seeds: &[SeedRecordSpec], errors: &mut Vec<String>) {
    let mut labels_seen: BTreeSet<&str> = BTreeSet::new();

    for seed in seeds {
        if !labels_seen.insert(seed.label.as_str()) {
            errors.push(format!(
                "error[seeds.{}]: duplicate seed label",
                seed.label
            ));
            continue;
        }

        for (column, referent) in &seed.refs {
            if !labels_seen.contains(referent.as_str()) {
                errors.push(format!(
                    "error[seeds.{}]: column `{column}` references `{referent}` which is not declared earlier",
                    seed.label
                ));
            }
        }
    }
}

/// Identifiers are interpolated into SQL, so only snake_case table/column
/// names are accepted.
fn is_sql_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
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
