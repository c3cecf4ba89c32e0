use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{info, warn};

/// Type of operator event being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Derive,
    DepositData,
    ShareSplit,
    Reconcile,
    Verification,
    SafetyAlert,
}

impl AuditEventType {
    pub fn label(&self) -> &'static str {
        match self {
            AuditEventType::Derive => "DERIVE",
            AuditEventType::DepositData => "DEPOSIT",
            AuditEventType::ShareSplit => "SHARES",
            AuditEventType::Reconcile => "RECONCILE",
            AuditEventType::Verification => "VERIFY",
            AuditEventType::SafetyAlert => "SAFETY",
        }
    }
}

/// Record of an operator-facing event
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub session_id: String,
    /// Container, file or key the event is about.
    pub subject: Option<String>,
    pub message: String,
    pub timestamp: String,
}

impl AuditRecord {
    pub fn new(
        event_type: AuditEventType,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            subject: None,
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn event_type_label(&self) -> &'static str {
        self.event_type.label()
    }
}

/// Bounded in-memory audit trail, mirrored to tracing.
pub struct AuditTracker {
    records: Mutex<VecDeque<AuditRecord>>,
    max_entries: usize,
}

impl AuditTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditRecord>> {
        // a panicked writer cannot leave a half-pushed record behind
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new event in the audit log
    pub fn log(&self, record: AuditRecord) {
        let subject = record.subject.as_deref().unwrap_or("-");
        if record.event_type == AuditEventType::SafetyAlert {
            warn!(
                audit = record.event_type_label(),
                session = %record.session_id,
                subject,
                "{}",
                record.message
            );
        } else {
            info!(
                audit = record.event_type_label(),
                session = %record.session_id,
                subject,
                "{}",
                record.message
            );
        }

        let mut records = self.lock();
        if records.len() == self.max_entries {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent first.
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        self.lock().iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for record in self.lock().iter() {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl Default for AuditTracker {
    fn default() -> Self {
        Self::new(500)
    }
}

/// Short blake3 fingerprint for referring to files and secrets in logs
/// without printing them.
pub fn fingerprint(data: &[u8]) -> String {
    blake3::hash(data).to_hex()[..16].to_string()
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Helper to get current timestamp as RFC3339 string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
