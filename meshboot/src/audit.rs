//! Audit record.
//!
//! JSON-lines file recording, in order, every resolved configuration key
//! actually applied plus run start/end timestamps. Each line is flushed
//! as it is written so the record survives an abort mid-run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::json;

use meshboot_shared::MeshbootResult;

pub struct AuditLog {
    file: Option<File>,
}

impl AuditLog {
    /// Open (truncating) the audit file and record the run start.
    pub fn create(path: &Path) -> MeshbootResult<AuditLog> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut log = AuditLog { file: Some(file) };
        log.write_line(json!({ "event": "run_start" }));
        Ok(log)
    }

    /// An audit log that records nothing. For tests and dry runs.
    pub fn disabled() -> AuditLog {
        AuditLog { file: None }
    }

    /// Record one applied configuration key.
    pub fn config_applied(&mut self, key: &str, value: &str) {
        self.write_line(json!({
            "event": "config_applied",
            "key": key,
            "value": value,
        }));
    }

    /// Record the end of the run with its final status.
    pub fn run_end(&mut self, success: bool) {
        self.write_line(json!({
            "event": "run_end",
            "success": success,
        }));
    }

    fn write_line(&mut self, mut record: serde_json::Value) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Some(map) = record.as_object_mut() {
            map.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
        }
        // Audit failures must not fail the run; log and carry on.
        if let Err(e) = writeln!(file, "{record}").and_then(|_| file.flush()) {
            tracing::warn!(error = %e, "failed to write audit record");
        }
    }
}
