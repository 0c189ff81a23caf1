//! Audit events for key lifecycle compliance review
//!
//! The service emits one event per encrypt, decrypt, rotate, revoke and
//! emergency rotation call, including failures.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Operation being audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Initialize,
    Encrypt,
    Decrypt,
    Rotate,
    Revoke,
    EmergencyRotation,
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditOperation::Initialize => "initialize",
            AuditOperation::Encrypt => "encrypt",
            AuditOperation::Decrypt => "decrypt",
            AuditOperation::Rotate => "rotate",
            AuditOperation::Revoke => "revoke",
            AuditOperation::EmergencyRotation => "emergency_rotation",
        };
        f.write_str(name)
    }
}

/// Outcome of an audited operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { kind: String, message: String },
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Success)
    }
}

impl From<&Error> for AuditOutcome {
    fn from(err: &Error) -> Self {
        AuditOutcome::Failure {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    /// Key version involved, when known
    pub key_version: Option<u32>,
    /// Rotation reason, revocation reason or emergency trigger
    pub reason: Option<String>,
    /// Service identity performing the operation
    pub actor: Option<String>,
}

impl AuditEvent {
    /// Creates an event for `operation` with the given outcome
    pub fn new(operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation,
            outcome,
            key_version: None,
            reason: None,
            actor: None,
        }
    }

    pub fn with_key_version(mut self, version: Option<u32>) -> Self {
        self.key_version = version;
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }
}

/// Destination for audit events
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Records an event. Must not block on slow I/O.
    fn record(&self, event: AuditEvent);

    /// Delivers any buffered events
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes audit events through the `log` facade under the `walletkms::audit` target
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl LogAuditSink {
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        match &event.outcome {
            AuditOutcome::Success => log::info!(
                target: "walletkms::audit",
                "event_id={} operation={} result=success key_version={:?} reason={:?} actor={:?}",
                event.event_id,
                event.operation,
                event.key_version,
                event.reason,
                event.actor
            ),
            AuditOutcome::Failure { kind, message } => log::warn!(
                target: "walletkms::audit",
                "event_id={} operation={} result=failure kind={} key_version={:?} reason={:?} actor={:?}: {}",
                event.event_id,
                event.operation,
                kind,
                event.key_version,
                event.reason,
                event.actor,
                message
            ),
        }
    }
}

/// Collects audit events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded events for one operation
    pub fn events_for(&self, operation: AuditOperation) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.operation == operation)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Buffers events and forwards them to an inner sink in batches
///
/// Events are delivered when the buffer reaches `capacity` and on `flush`,
/// which the service calls during shutdown.
#[derive(Debug)]
pub struct BufferedAuditSink<S: AuditSink> {
    inner: S,
    capacity: usize,
    pending: Mutex<Vec<AuditEvent>>,
}

impl<S: AuditSink> BufferedAuditSink<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of events not yet delivered
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn drain(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<S: AuditSink> AuditSink for BufferedAuditSink<S> {
    fn record(&self, event: AuditEvent) {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.push(event);
            if pending.len() >= self.capacity {
                std::mem::take(&mut *pending)
            } else {
                Vec::new()
            }
        };
        for event in batch {
            self.inner.record(event);
        }
    }

    fn flush(&self) -> Result<()> {
        for event in self.drain() {
            self.inner.record(event);
        }
        self.inner.flush()
    }
}
