// crates/sentinel-gate-core/src/audit.rs
// ============================================================================
// Module: Audit Service
// Description: Append-only audit records over a bounded async channel.
// Purpose: Record enter/decision/exit for every action without blocking the
//          pipeline.
// Dependencies: chrono, serde, tokio
// ============================================================================

//! ## Overview
//! Producers (the audit interceptor, ingresses, hook batch uploads) send
//! records into a bounded channel with a short send timeout; a single
//! background flusher drains the channel into the configured [`AuditSink`] in
//! batches. Records for one action are emitted by one task in order, so they
//! stay totally ordered even though the writer is asynchronous. When the
//! channel is saturated the record is dropped, counted, and a rate-limited
//! warning is emitted.
//!
//! Security posture: audit records may contain raw internal error detail and
//! must never flow back to clients; see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::ids::CorrelationId;
use crate::ids::RuleId;
use crate::scanner::ScanFinding;

// ============================================================================
// SECTION: Records
// ============================================================================

/// Phase of the action lifecycle a record describes.
///
/// # Invariants
/// - For one action, `Enter` precedes `Decision` precedes `Exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    /// Action admitted into the chain.
    Enter,
    /// Policy decision reached.
    Decision,
    /// Action finished (reply sent or denial surfaced).
    Exit,
}

/// One audit record.
///
/// # Invariants
/// - Append-only; records are never mutated after send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Correlation identifier of the action.
    pub correlation_id: CorrelationId,
    /// Lifecycle phase.
    pub phase: AuditPhase,
    /// Action type label.
    pub action_type: String,
    /// Action name.
    pub action_name: String,
    /// Identity name (anonymous until authentication).
    pub identity: String,
    /// Ingress label.
    pub gateway: String,
    /// Decision label when known (`allow`, `deny`, `approval_required`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    /// Deciding rule, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    /// Processing latency in milliseconds (exit records).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Scanner findings collected for the action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scan_findings: Vec<ScanFinding>,
    /// Serialized request argument size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_bytes: Option<u64>,
    /// Serialized response size in bytes, when known (exit records).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<u64>,
    /// Raw internal detail (never surfaced to clients).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Record timestamp.
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// SECTION: Sink
// ============================================================================

/// Destination for flushed audit batches.
pub trait AuditSink: Send + Sync {
    /// Persists one batch of records.
    fn write_batch(&self, batch: &[AuditRecord]);
}

/// Sink that discards every record.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn write_batch(&self, _batch: &[AuditRecord]) {}
}

/// Sink that logs each record through `tracing`.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn write_batch(&self, batch: &[AuditRecord]) {
        for record in batch {
            tracing::info!(
                correlation = %record.correlation_id,
                phase = ?record.phase,
                action = %record.action_name,
                decision = record.decision.as_deref().unwrap_or(""),
                "audit"
            );
        }
    }
}

/// Bounded in-memory ring sink for admin queries and tests.
pub struct MemoryAuditSink {
    /// Retained records, oldest first.
    records: Mutex<Vec<AuditRecord>>,
    /// Maximum retained records.
    capacity: usize,
}

impl MemoryAuditSink {
    /// Creates a ring retaining at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns a copy of the retained records.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|records| records.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write_batch(&self, batch: &[AuditRecord]) {
        if let Ok(mut records) = self.records.lock() {
            records.extend_from_slice(batch);
            let len = records.len();
            if len > self.capacity {
                records.drain(0..len - self.capacity);
            }
        }
    }
}

// ============================================================================
// SECTION: Service
// ============================================================================

/// Audit service configuration.
///
/// # Invariants
/// - Constructed once at startup; any field may take its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditServiceConfig {
    /// Channel capacity in records.
    pub channel_size: usize,
    /// Maximum records per flushed batch.
    pub batch_size: usize,
    /// Flush interval in milliseconds.
    pub flush_interval_ms: u64,
    /// Producer send timeout in milliseconds.
    pub send_timeout_ms: u64,
    /// Queue-depth percentage that triggers a saturation warning.
    pub warning_threshold: u8,
}

impl Default for AuditServiceConfig {
    fn default() -> Self {
        Self {
            channel_size: 1000,
            batch_size: 100,
            flush_interval_ms: 1000,
            send_timeout_ms: 100,
            warning_threshold: 80,
        }
    }
}

/// Handle used by producers to record audit events.
#[derive(Clone)]
pub struct AuditService {
    /// Bounded record channel.
    tx: mpsc::Sender<AuditRecord>,
    /// Configuration.
    config: AuditServiceConfig,
    /// Dropped-record counter.
    dropped: Arc<AtomicU64>,
    /// Last saturation warning instant, for rate limiting the warning itself.
    last_warning: Arc<Mutex<Option<Instant>>>,
}

impl AuditService {
    /// Spawns the flusher and returns the producer handle.
    #[must_use]
    pub fn spawn(
        config: AuditServiceConfig,
        sink: Arc<dyn AuditSink>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_size.max(1));
        let flusher = tokio::spawn(flush_loop(rx, sink, config));
        (
            Self {
                tx,
                config,
                dropped: Arc::new(AtomicU64::new(0)),
                last_warning: Arc::new(Mutex::new(None)),
            },
            flusher,
        )
    }

    /// Records one audit event, dropping it when the channel stays full past
    /// the send timeout.
    pub async fn record(&self, record: AuditRecord) {
        self.warn_if_saturated();
        let timeout = Duration::from_millis(self.config.send_timeout_ms);
        if self.tx.send_timeout(record, timeout).await.is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            self.warn_rate_limited(format_args!("audit channel full; {dropped} records dropped"));
        }
    }

    /// Returns the number of dropped records so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Emits a saturation warning when queue depth crosses the threshold.
    fn warn_if_saturated(&self) {
        let capacity = self.config.channel_size.max(1);
        let used = capacity.saturating_sub(self.tx.capacity());
        let threshold = capacity * usize::from(self.config.warning_threshold) / 100;
        if used >= threshold && threshold > 0 {
            self.warn_rate_limited(format_args!(
                "audit channel at {used}/{capacity} records"
            ));
        }
    }

    /// Emits at most one warning per second.
    fn warn_rate_limited(&self, message: std::fmt::Arguments<'_>) {
        if let Ok(mut last) = self.last_warning.lock() {
            let now = Instant::now();
            if last.is_none_or(|at| now.duration_since(at) >= Duration::from_secs(1)) {
                *last = Some(now);
                tracing::warn!("{message}");
            }
        }
    }
}

/// Background flusher: batches records by size and interval.
async fn flush_loop(
    mut rx: mpsc::Receiver<AuditRecord>,
    sink: Arc<dyn AuditSink>,
    config: AuditServiceConfig,
) {
    let mut batch: Vec<AuditRecord> = Vec::with_capacity(config.batch_size.max(1));
    let mut ticker = tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= config.batch_size.max(1) {
                            sink.write_batch(&batch);
                            batch.clear();
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            sink.write_batch(&batch);
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    sink.write_batch(&batch);
                    batch.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! Audit service unit tests.
    #![allow(clippy::unwrap_used, reason = "Test-only fixture construction.")]

    use super::*;

    /// Builds a minimal record for tests.
    fn record(phase: AuditPhase) -> AuditRecord {
        AuditRecord {
            correlation_id: CorrelationId::new("c-1"),
            phase,
            action_type: "tool_call".to_string(),
            action_name: "read_file".to_string(),
            identity: "anonymous".to_string(),
            gateway: "mcp-gateway".to_string(),
            decision: None,
            rule_id: None,
            latency_ms: None,
            scan_findings: Vec::new(),
            request_bytes: None,
            response_bytes: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_flush_in_order() {
        let sink = Arc::new(MemoryAuditSink::new(100));
        let config = AuditServiceConfig {
            flush_interval_ms: 10,
            ..AuditServiceConfig::default()
        };
        let (service, flusher) = AuditService::spawn(config, sink.clone());
        service.record(record(AuditPhase::Enter)).await;
        service.record(record(AuditPhase::Decision)).await;
        service.record(record(AuditPhase::Exit)).await;
        drop(service);
        flusher.await.unwrap();
        let phases: Vec<AuditPhase> =
            sink.snapshot().iter().map(|record| record.phase).collect();
        assert_eq!(phases, vec![AuditPhase::Enter, AuditPhase::Decision, AuditPhase::Exit]);
    }

    /// Sink that stalls the flusher so the channel saturates.
    struct SlowSink;

    impl AuditSink for SlowSink {
        fn write_batch(&self, _batch: &[AuditRecord]) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn saturated_channel_drops_and_counts() {
        let config = AuditServiceConfig {
            channel_size: 1,
            batch_size: 1,
            flush_interval_ms: 60_000,
            send_timeout_ms: 1,
            warning_threshold: 100,
        };
        let (service, flusher) = AuditService::spawn(config, Arc::new(SlowSink));
        for _ in 0..16 {
            service.record(record(AuditPhase::Enter)).await;
        }
        assert!(service.dropped() > 0);
        drop(service);
        flusher.await.unwrap();
    }
}
