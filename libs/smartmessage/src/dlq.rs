//! Dead-letter queue
//!
//! An append-only JSON-lines file with FIFO semantics: one record per
//! line, each carrying the full header, the payload text, its format tag,
//! the error, the originating transport, and the attempt count. All
//! operations are serialized by a process-wide mutex; corrupt lines are
//! warned about and skipped, never blocking queue progression.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use smartmessage_config::DlqSettings;
use smartmessage_errors::{Result, SmartMessageError};

use crate::header::MessageHeader;
use crate::message::Message;
use crate::registry::SchemaRegistry;
use crate::serializer::Envelope;
use crate::transport::Transport;

/// One dead-lettered envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// When the record was enqueued
    pub timestamp: DateTime<Utc>,

    /// Full header of the failed envelope
    pub header: MessageHeader,

    /// Payload text in the tagged format
    pub payload: String,

    /// Serializer name the payload was captured in
    pub payload_format: String,

    /// Rendered failure that sent the envelope here
    pub error: String,

    /// Transport the envelope arrived through
    pub transport: String,

    /// Delivery attempts before dead-lettering
    pub retry_count: u32,
}

/// Counts by message class and by error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStatistics {
    pub total: usize,
    pub by_class: HashMap<String, usize>,
    pub by_error: HashMap<String, usize>,
}

/// File-backed FIFO of failed envelopes with replay support.
pub struct DeadLetterQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeadLetterQueue {
    /// Open (creating if needed) the queue file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| file_error(&path, "create_dir", e))?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| file_error(&path, "open", e))?;

        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Open the queue at the `DLQ_PATH` environment override or the
    /// configured default location.
    pub fn with_default_path() -> Result<Self> {
        match std::env::var("DLQ_PATH") {
            Ok(path) => Self::new(path),
            Err(_) => Self::new(DlqSettings::default().path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record.
    pub fn enqueue(&self, record: DeadLetter) -> Result<()> {
        let _guard = self.guard();

        let line = serde_json::to_string(&record).map_err(|e| {
            SmartMessageError::Serialization {
                message: e.to_string(),
                format: "json".to_string(),
                code: "SERIALIZATION_ERROR".to_string(),
            }
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| file_error(&self.path, "open", e))?;
        writeln!(file, "{}", line).map_err(|e| file_error(&self.path, "write", e))?;
        Ok(())
    }

    /// Capture a failed envelope.
    pub fn enqueue_envelope(
        &self,
        envelope: &Envelope,
        payload_format: &str,
        error: &str,
        transport: &str,
        retry_count: u32,
    ) -> Result<()> {
        let payload = serde_json::to_string(&Value::Object(envelope.properties.clone()))
            .map_err(|e| SmartMessageError::Serialization {
                message: e.to_string(),
                format: "json".to_string(),
                code: "SERIALIZATION_ERROR".to_string(),
            })?;

        self.enqueue(DeadLetter {
            timestamp: Utc::now(),
            header: envelope.header.clone(),
            payload,
            payload_format: payload_format.to_string(),
            error: error.to_string(),
            transport: transport.to_string(),
            retry_count,
        })
    }

    /// Read and remove the oldest record.
    pub fn dequeue(&self) -> Result<Option<DeadLetter>> {
        let _guard = self.guard();
        let lines = self.read_lines()?;

        let mut consumed: Option<(usize, DeadLetter)> = None;
        let mut skipped = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<DeadLetter>(line) {
                Ok(record) => {
                    consumed = Some((index, record));
                    break;
                }
                Err(e) => {
                    warn!(line = index + 1, error = %e, "skipping corrupt dead letter record");
                    skipped.push(index);
                }
            }
        }

        let Some((index, record)) = consumed else {
            // Nothing parseable; drop the corrupt prefix so the file does
            // not accumulate unreadable lines.
            if !skipped.is_empty() {
                self.rewrite(&[])?;
            }
            return Ok(None);
        };

        let remaining: Vec<&str> = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > index)
            .map(|(_, line)| line.as_str())
            .collect();
        self.rewrite(&remaining)?;

        Ok(Some(record))
    }

    /// Read the oldest record without removing it.
    pub fn peek(&self) -> Result<Option<DeadLetter>> {
        let _guard = self.guard();
        Ok(self.parse_all()?.into_iter().next())
    }

    /// Number of parseable records.
    pub fn size(&self) -> Result<usize> {
        let _guard = self.guard();
        Ok(self.parse_all()?.len())
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.guard();
        self.rewrite(&[])
    }

    /// All parseable records, oldest first.
    pub fn entries(&self) -> Result<Vec<DeadLetter>> {
        let _guard = self.guard();
        self.parse_all()
    }

    /// Records whose header class matches `name`.
    pub fn filter_by_class(&self, name: &str) -> Result<Vec<DeadLetter>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|r| r.header.message_class() == name)
            .collect())
    }

    /// Records whose error matches the pattern.
    pub fn filter_by_error_pattern(&self, pattern: &Regex) -> Result<Vec<DeadLetter>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|r| pattern.is_match(&r.error))
            .collect())
    }

    /// Records enqueued inside `[t0, t1]`.
    pub fn export_range(
        &self,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<Vec<DeadLetter>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|r| r.timestamp >= t0 && r.timestamp <= t1)
            .collect())
    }

    /// Counts by class and by error.
    pub fn statistics(&self) -> Result<DlqStatistics> {
        let mut stats = DlqStatistics::default();
        for record in self.entries()? {
            stats.total += 1;
            *stats
                .by_class
                .entry(record.header.message_class().to_string())
                .or_default() += 1;
            *stats.by_error.entry(record.error.clone()).or_default() += 1;
        }
        Ok(stats)
    }

    /// Replay the oldest record, publishing through the override transport
    /// when given, otherwise through the message class's own transports.
    ///
    /// Returns the replayed message uuid. A failed replay re-enqueues the
    /// record with an incremented attempt count.
    pub async fn replay_one(
        &self,
        override_transport: Option<&Arc<dyn Transport>>,
    ) -> Result<Option<Uuid>> {
        let Some(record) = self.dequeue()? else {
            return Ok(None);
        };

        let uuid = record.header.uuid();
        match self.republish(&record, override_transport).await {
            Ok(()) => {
                info!(class = record.header.message_class(), %uuid, "replayed dead letter");
                Ok(Some(uuid))
            }
            Err(e) => {
                let mut retried = record;
                retried.retry_count += 1;
                retried.error = e.to_string();
                self.enqueue(retried)?;
                Err(e)
            }
        }
    }

    /// Replay up to `n` records; returns how many were republished.
    pub async fn replay_batch(
        &self,
        n: usize,
        override_transport: Option<&Arc<dyn Transport>>,
    ) -> Result<usize> {
        let mut replayed = 0;
        for _ in 0..n {
            match self.replay_one(override_transport).await? {
                Some(_) => replayed += 1,
                None => break,
            }
        }
        Ok(replayed)
    }

    /// Replay everything currently queued.
    pub async fn replay_all(
        &self,
        override_transport: Option<&Arc<dyn Transport>>,
    ) -> Result<usize> {
        let pending = self.size()?;
        self.replay_batch(pending, override_transport).await
    }

    async fn republish(
        &self,
        record: &DeadLetter,
        override_transport: Option<&Arc<dyn Transport>>,
    ) -> Result<()> {
        let schema = SchemaRegistry::lookup(record.header.message_class()).ok_or_else(|| {
            SmartMessageError::Configuration {
                message: format!(
                    "message class '{}' is not registered for replay",
                    record.header.message_class()
                ),
                key: None,
                code: "CONFIG_ERROR".to_string(),
            }
        })?;

        let properties = decode_payload(&record.payload, &record.payload_format)?;
        let envelope = Envelope::new(record.header.clone(), properties);
        let mut message = Message::from_envelope(schema, envelope);

        match override_transport {
            Some(transport) => transport.publish(&message).await,
            None => message.publish().await.map(|_| ()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().expect("dead letter mutex poisoned")
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        let content =
            fs::read_to_string(&self.path).map_err(|e| file_error(&self.path, "read", e))?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn parse_all(&self) -> Result<Vec<DeadLetter>> {
        let mut records = Vec::new();
        for (index, line) in self.read_lines()?.iter().enumerate() {
            match serde_json::from_str::<DeadLetter>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(line = index + 1, error = %e, "skipping corrupt dead letter record");
                }
            }
        }
        Ok(records)
    }

    fn rewrite(&self, lines: &[&str]) -> Result<()> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&self.path, content).map_err(|e| file_error(&self.path, "write", e))
    }
}

/// Decode a recorded payload; unknown format tags fall back to the
/// structured-text decoder with a warning.
fn decode_payload(payload: &str, format: &str) -> Result<Map<String, Value>> {
    if !matches!(format, "json" | "jsonl" | "compact" | "pretty") {
        warn!(format, "unknown payload format, falling back to json");
    }

    let value: Value =
        serde_json::from_str(payload).map_err(|e| SmartMessageError::Serialization {
            message: e.to_string(),
            format: format.to_string(),
            code: "SERIALIZATION_ERROR".to_string(),
        })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(SmartMessageError::Serialization {
            message: format!("expected payload object, got {}", other),
            format: format.to_string(),
            code: "SERIALIZATION_ERROR".to_string(),
        }),
    }
}

fn file_error(path: &Path, operation: &str, e: std::io::Error) -> SmartMessageError {
    SmartMessageError::FileSystem {
        message: e.to_string(),
        path: Some(path.display().to_string()),
        operation: operation.to_string(),
        code: "FILESYSTEM_ERROR".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(class: &str, error: &str, id: &str) -> DeadLetter {
        DeadLetter {
            timestamp: Utc::now(),
            header: MessageHeader::new(class, "tester", None, None, 1),
            payload: json!({ "id": id }).to_string(),
            payload_format: "json".to_string(),
            error: error.to_string(),
            transport: "memory".to_string(),
            retry_count: 0,
        }
    }

    fn queue() -> (tempfile::TempDir, DeadLetterQueue) {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dead_letters.jsonl")).unwrap();
        (dir, dlq)
    }

    #[test]
    fn fifo_enqueue_dequeue() {
        let (_dir, dlq) = queue();
        dlq.enqueue(record("Order", "boom", "A")).unwrap();
        dlq.enqueue(record("Order", "boom", "B")).unwrap();

        assert_eq!(dlq.size().unwrap(), 2);
        let first = dlq.dequeue().unwrap().unwrap();
        assert!(first.payload.contains("\"A\""));
        assert_eq!(dlq.size().unwrap(), 1);

        let second = dlq.peek().unwrap().unwrap();
        assert!(second.payload.contains("\"B\""));
        assert_eq!(dlq.size().unwrap(), 1);

        dlq.clear().unwrap();
        assert_eq!(dlq.size().unwrap(), 0);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let (_dir, dlq) = queue();
        dlq.enqueue(record("Order", "boom", "A")).unwrap();

        // Inject a torn line between two valid records.
        {
            let mut file = OpenOptions::new().append(true).open(dlq.path()).unwrap();
            writeln!(file, "{{\"timestamp\": \"not a record").unwrap();
        }
        dlq.enqueue(record("Order", "boom", "B")).unwrap();

        assert_eq!(dlq.size().unwrap(), 2);
        let first = dlq.dequeue().unwrap().unwrap();
        assert!(first.payload.contains("\"A\""));
        let second = dlq.dequeue().unwrap().unwrap();
        assert!(second.payload.contains("\"B\""));
        assert!(dlq.dequeue().unwrap().is_none());
    }

    #[test]
    fn filters_and_statistics() {
        let (_dir, dlq) = queue();
        dlq.enqueue(record("Order", "timeout", "A")).unwrap();
        dlq.enqueue(record("Order", "parse failure", "B")).unwrap();
        dlq.enqueue(record("Alert", "timeout", "C")).unwrap();

        assert_eq!(dlq.filter_by_class("Order").unwrap().len(), 2);
        assert_eq!(
            dlq.filter_by_error_pattern(&Regex::new("time").unwrap())
                .unwrap()
                .len(),
            2
        );

        let stats = dlq.statistics().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_class["Order"], 2);
        assert_eq!(stats.by_error["timeout"], 2);
    }

    #[test]
    fn export_range_bounds_by_timestamp() {
        let (_dir, dlq) = queue();
        let mut old = record("Order", "boom", "A");
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        dlq.enqueue(old).unwrap();
        dlq.enqueue(record("Order", "boom", "B")).unwrap();

        let recent = dlq
            .export_range(Utc::now() - chrono::Duration::minutes(5), Utc::now())
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].payload.contains("\"B\""));
    }

    #[test]
    fn unknown_payload_format_falls_back_to_json() {
        let properties = decode_payload("{\"id\": \"A\"}", "protobuf").unwrap();
        assert_eq!(properties.get("id"), Some(&json!("A")));
    }
}
