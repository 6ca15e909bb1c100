use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// End-of-session accounting written to `summary.json`. Handle counters are
/// expected to balance; a difference is a leaked display resource, and
/// `leaked` names each one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_runs: u64,
    pub total_artifacts: u64,
    pub handles_created: u64,
    pub handles_revoked: u64,
    pub leaked: Vec<LeakedHandle>,
}

/// A display handle still live when the session closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakedHandle {
    pub token: u64,
    pub origin: String,
}

pub fn write_summary(
    path: &Path,
    summary: &SessionSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert(
        "session_id".to_string(),
        Value::String(summary.session_id.clone()),
    );
    payload.insert(
        "started_at".to_string(),
        Value::String(summary.started_at.clone()),
    );
    payload.insert(
        "finished_at".to_string(),
        Value::String(summary.finished_at.clone()),
    );
    payload.insert(
        "total_runs".to_string(),
        Value::Number(summary.total_runs.into()),
    );
    payload.insert(
        "total_artifacts".to_string(),
        Value::Number(summary.total_artifacts.into()),
    );
    payload.insert(
        "handles_created".to_string(),
        Value::Number(summary.handles_created.into()),
    );
    payload.insert(
        "handles_revoked".to_string(),
        Value::Number(summary.handles_revoked.into()),
    );
    payload.insert("leaked".to_string(), serde_json::to_value(&summary.leaked)?);
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, LeakedHandle, SessionSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let summary = SessionSummary {
            session_id: "session-123".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            total_runs: 2,
            total_artifacts: 5,
            handles_created: 12,
            handles_revoked: 11,
            leaked: vec![LeakedHandle {
                token: 7,
                origin: "style_thumbnail".to_string(),
            }],
        };
        let mut extra = Map::new();
        extra.insert("server".to_string(), Value::String("local".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["session_id"], json!("session-123"));
        assert_eq!(parsed["total_runs"], json!(2));
        assert_eq!(parsed["total_artifacts"], json!(5));
        assert_eq!(parsed["handles_created"], json!(12));
        assert_eq!(parsed["handles_revoked"], json!(11));
        assert_eq!(
            parsed["leaked"],
            json!([{ "token": 7, "origin": "style_thumbnail" }])
        );
        assert_eq!(parsed["server"], json!("local"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
