//! Cumulative G-code printing progress

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress report sent by the machine while a job streams
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrintProgress {
    /// Lines sent to the planner
    pub sent: Option<u64>,
    /// Lines acknowledged
    pub received: Option<u64>,
    /// Lines in the job
    pub total: Option<u64>,
    /// Machine-reported print status
    pub print_status: Option<String>,
    /// Job file name
    pub file_name: Option<String>,
}

/// Running record of the current job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcodePrintingInfo {
    /// Lines sent
    pub sent: u64,
    /// Lines acknowledged
    pub received: u64,
    /// Lines in the job
    pub total: u64,
    /// When the first progress report of this job arrived
    pub start_time: Option<DateTime<Utc>>,
    /// When every line had been acknowledged
    pub finish_time: Option<DateTime<Utc>>,
    /// Milliseconds since `start_time`
    pub elapsed_time: u64,
    /// Estimated milliseconds left, extrapolated from the acknowledge rate
    pub remaining_time: u64,
    /// Fraction of lines acknowledged, 0.0 to 1.0
    pub progress: f64,
    /// Machine-reported print status
    pub print_status: String,
    /// Job file name
    pub file_name: String,
}

impl GcodePrintingInfo {
    /// Fold a progress report into this record
    ///
    /// Returns an empty record when `received` or `total` is missing. A drop
    /// in `received` or a change of `total` starts a new job.
    pub fn fold(&self, data: &PrintProgress, now: DateTime<Utc>) -> Self {
        let (Some(received), Some(total)) = (data.received, data.total) else {
            return Self::default();
        };

        let new_job = received < self.received || total != self.total;
        let start_time = match self.start_time {
            Some(start) if !new_job => start,
            _ => now,
        };
        let elapsed_time = (now - start_time).num_milliseconds().max(0) as u64;

        let progress = if total > 0 {
            (received as f64 / total as f64).min(1.0)
        } else {
            0.0
        };
        let remaining_time = if received > 0 && received < total {
            (u128::from(elapsed_time) * u128::from(total - received) / u128::from(received))
                .min(u128::from(u64::MAX)) as u64
        } else {
            0
        };

        let finish_time = if received > 0 && received >= total {
            match self.finish_time {
                Some(finished) if !new_job => Some(finished),
                _ => Some(now),
            }
        } else {
            None
        };

        Self {
            sent: data.sent.unwrap_or(received),
            received,
            total,
            start_time: Some(start_time),
            finish_time,
            elapsed_time,
            remaining_time,
            progress,
            print_status: data
                .print_status
                .clone()
                .unwrap_or_else(|| self.print_status.clone()),
            file_name: data
                .file_name
                .clone()
                .unwrap_or_else(|| self.file_name.clone()),
        }
    }
}
