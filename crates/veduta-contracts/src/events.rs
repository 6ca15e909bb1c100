use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for `events.jsonl`.
///
/// Every emitted event carries `type`, `session_id`, `seq`, and `ts`; the
/// caller payload is merged last and can override the defaults. One compact
/// JSON object per line. `seq` is the write order within the session; `ts`
/// alone cannot break ties between events emitted in the same cooperative
/// tick.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    seq: AtomicU64,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                seq: AtomicU64::new(0),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("seq".to_string(), Value::Number(seq.into()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        let mut payload = EventPayload::new();
        payload.insert("style".to_string(), Value::String("gothic.png".to_string()));
        let emitted = writer.emit("style_selected", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("style_selected".to_string()));
        assert_eq!(
            parsed["session_id"],
            Value::String("session-123".to_string())
        );
        assert_eq!(parsed["style"], Value::String("gothic.png".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), Value::String("override".to_string()));
        payload.insert(
            "session_id".to_string(),
            Value::String("override-session".to_string()),
        );
        let emitted = writer.emit("style_selected", payload)?;

        assert_eq!(emitted["type"], Value::String("override".to_string()));
        assert_eq!(
            emitted["session_id"],
            Value::String("override-session".to_string())
        );
        Ok(())
    }

    #[test]
    fn appended_lines_carry_the_write_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        writer.emit("one", EventPayload::new())?;
        let clone = writer.clone();
        clone.emit("two", EventPayload::new())?;
        writer.emit("three", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let events: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(events.len(), 3);

        let types: Vec<&str> = events
            .iter()
            .map(|event| event["type"].as_str().unwrap_or(""))
            .collect();
        assert_eq!(types, vec!["one", "two", "three"]);

        // Clones share one counter, so seq stays gap-free across them.
        let seqs: Vec<u64> = events
            .iter()
            .map(|event| event["seq"].as_u64().unwrap_or(u64::MAX))
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        Ok(())
    }
}
