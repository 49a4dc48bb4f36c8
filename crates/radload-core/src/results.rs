use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Terminal outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Succeeded,
    NoReply,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Succeeded => "succeeded",
            Status::NoReply => "no_reply",
            Status::Failed => "failed",
        }
    }
}

/// Per-request result record; exactly one per dispatched task.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestResult {
    pub id: u64,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Debug, Serialize)]
struct ResultRow<'a> {
    id: u64,
    status: &'a str,
    start_time: String,
    duration_s: f64,
}

impl<'a> From<&'a RequestResult> for ResultRow<'a> {
    fn from(result: &'a RequestResult) -> Self {
        Self {
            id: result.id,
            status: result.status.as_str(),
            start_time: result.started_at.to_rfc3339(),
            duration_s: result.duration.as_secs_f64(),
        }
    }
}

/// Completion-ordered log of results for the current step.
#[derive(Debug, Default)]
pub struct ResultLog {
    entries: Mutex<Vec<RequestResult>>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: RequestResult) {
        self.entries.lock().push(result);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Take every result, leaving the log empty, sorted by task id.
    pub fn take_sorted(&self) -> Vec<RequestResult> {
        let mut results = std::mem::take(&mut *self.entries.lock());
        results.sort_by_key(|r| r.id);
        results
    }
}

/// Write results as CSV (`id,status,start_time,duration_s`) in id order.
pub fn write_csv<W: Write>(writer: W, results: &[RequestResult]) -> Result<()> {
    let mut sorted: Vec<&RequestResult> = results.iter().collect();
    sorted.sort_by_key(|r| r.id);

    let mut csv = csv::Writer::from_writer(writer);
    for result in sorted {
        csv.serialize(ResultRow::from(result))?;
    }
    csv.flush()?;
    Ok(())
}

pub fn save_csv(path: impl AsRef<Path>, results: &[RequestResult]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create results directory {:?}", parent))?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create results file {:?}", path))?;
    write_csv(file, results).with_context(|| format!("Failed to write results to {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn result(id: u64, status: Status, ms: u64) -> RequestResult {
        RequestResult {
            id,
            status,
            started_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            duration: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_take_sorted_restores_task_order() {
        let log = ResultLog::new();
        log.push(result(2, Status::Succeeded, 5));
        log.push(result(0, Status::NoReply, 5000));
        log.push(result(1, Status::Failed, 12));

        let results = log.take_sorted();
        let ids: Vec<u64> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(log.take_sorted().is_empty());
    }

    #[test]
    fn test_csv_export() {
        let results = vec![
            result(1, Status::Failed, 250),
            result(0, Status::Succeeded, 12),
        ];

        let mut out = Vec::new();
        write_csv(&mut out, &results).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "id,status,start_time,duration_s");
        assert_eq!(lines[1], "0,succeeded,2025-06-01T12:00:00+00:00,0.012");
        assert_eq!(lines[2], "1,failed,2025-06-01T12:00:00+00:00,0.25");
        assert_eq!(lines.len(), 3);
    }
}
