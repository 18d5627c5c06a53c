// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Diagnostic records and the collaborators notified on hardware failure.

use crate::request::Status;
use parking_lot::Mutex;
use std::sync::Arc;

/// A flat diagnostic record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLogEntry {
    /// The device the record is about.
    pub device: String,
    /// Identifies the call site that produced the record.
    pub unique_error_value: u32,
    /// Operation in progress, if any.
    pub major_function: Option<&'static str>,
    /// How many times the operation had been retried.
    pub retry_count: u32,
    /// The status the operation finished with.
    pub final_status: Status,
    /// Driver-specific status.
    pub specific_status: Status,
    /// Free-form strings inserted into the rendered message.
    pub insertions: Vec<String>,
    /// Raw words attached to the record, such as register contents.
    pub dump_data: Vec<u32>,
}

/// Unique error value logged when the device is declared broken.
pub const BROKEN_HARDWARE_ERROR_VALUE: u32 = 88;

/// Unique error value logged for receive errors reported by the line status
/// register. The dump data holds the [`ErrorWord`](crate::protocol::ErrorWord)
/// bits.
pub const LINE_ERROR_ERROR_VALUE: u32 = 89;

/// Receives diagnostic records.
pub trait ErrorLogSink: Send + Sync {
    /// Records `entry`. Must not block.
    fn write_entry(&self, entry: ErrorLogEntry);
}

/// The default sink, which emits every record as a `tracing` error event.
#[derive(Debug, Default)]
pub struct TracingErrorLog;

impl ErrorLogSink for TracingErrorLog {
    fn write_entry(&self, entry: ErrorLogEntry) {
        tracing::error!(
            device = %entry.device,
            unique_error_value = entry.unique_error_value,
            major_function = entry.major_function,
            retry_count = entry.retry_count,
            final_status = ?entry.final_status,
            specific_status = ?entry.specific_status,
            insertions = ?entry.insertions,
            dump_data = ?entry.dump_data,
            "serial error log entry"
        );
    }
}

/// A sink that keeps every record, for inspection by tests and tools.
#[derive(Debug, Clone, Default)]
pub struct MemoryErrorLog {
    entries: Arc<Mutex<Vec<ErrorLogEntry>>>,
}

impl MemoryErrorLog {
    /// Returns the records written so far.
    pub fn entries(&self) -> Vec<ErrorLogEntry> {
        self.entries.lock().clone()
    }
}

impl ErrorLogSink for MemoryErrorLog {
    fn write_entry(&self, entry: ErrorLogEntry) {
        self.entries.lock().push(entry);
    }
}

/// The PnP manager's side of device invalidation.
pub trait PnpNotify: Send + Sync {
    /// Asks the PnP manager to re-query the device's state.
    fn invalidate_device_state(&self, device: &str);
}

/// A [`PnpNotify`] for devices with no PnP manager attached.
#[derive(Debug, Default)]
pub struct NoPnp;

impl PnpNotify for NoPnp {
    fn invalidate_device_state(&self, device: &str) {
        tracing::debug!(device, "no pnp manager to invalidate");
    }
}
