/// Audit logging for table modifications
///
/// Every commit, conflict and counter operation performed by the binary is
/// recorded as one JSON object per line in the state directory.
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Commit,
    CommitConflict,
    ZeroCounters,
    SetPolicy,
    CreateChain,
    DeleteChain,
    FlushChain,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Table the event applies to
    pub table: String,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        table: &str,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            table: table.to_string(),
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Audit log at an explicit location
    pub fn at(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()
    }

    /// Reads the most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = std::fs::read_to_string(&self.log_path)?;

        Ok(content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

/// Records an event in the default audit log; failures are only logged.
pub fn record(event: &AuditEvent) {
    match AuditLog::new() {
        Ok(audit) => {
            if let Err(e) = audit.log(event) {
                tracing::warn!("Failed to write audit log: {}", e);
            }
        }
        Err(e) => tracing::debug!("Audit log unavailable: {}", e),
    }
}

/// Logs a staged operation together with the outcome of its commit
pub fn log_operation(
    event_type: EventType,
    table: &str,
    details: serde_json::Value,
    error: Option<String>,
) {
    record(&AuditEvent::new(
        event_type,
        table,
        error.is_none(),
        details,
        error,
    ));
}

/// Logs a commit refused because the table changed since load
pub fn log_conflict(table: &str, reason: &str) {
    record(&AuditEvent::new(
        EventType::CommitConflict,
        table,
        false,
        serde_json::json!({ "reason": reason }),
        Some(reason.to_string()),
    ));
}
