use serde::Deserialize;

/// A per-environment configuration artifact: a block of `KEY=value` lines
/// merged into `target` under the idempotency guard of `key_prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub target: String,
    pub key_prefix: String,
    pub template: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RawArtifact {
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    key_prefix: Option<String>,
    #[serde(default)]
    template: Vec<String>,
}

pub(super) fn parse_artifacts(raw: Vec<RawArtifact>, errors: &mut Vec<String>) -> Vec<ConfigArtifact> {
    let mut artifacts = Vec::with_capacity(raw.len());

    for (index, raw_artifact) in raw.into_iter().enumerate() {
        let Some(target) = non_empty(raw_artifact.target) else {
            errors.push(format!("error[artifacts[{index}]]: target is required"));
            continue;
        };
        let Some(key_prefix) = non_empty(raw_artifact.key_prefix) else {
            errors.push(format!(
                "error[artifacts.{target}]: key_prefix is required"
            ));
            continue;
        };
        if raw_artifact.template.is_empty() {
            errors.push(format!(
                "error[artifacts.{target}]: template must contain at least one line"
            ));
            continue;
        }

        artifacts.push(ConfigArtifact {
            target,
            key_prefix,
            template: raw_artifact.template,
        });
    }

    artifacts
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
