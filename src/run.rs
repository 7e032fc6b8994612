// 🪪 Run identity - who wrote a catalog row, and when
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunInfo {
    /// Unique per run, stamped on catalog rows
    pub run_id: Uuid,

    pub started_at: DateTime<Utc>,

    /// Stamp that fills the `{date}` token of output names
    pub date: String,
}

impl RunInfo {
    pub fn new(date: impl Into<String>) -> Self {
        RunInfo {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            date: date.into(),
        }
    }

    /// `YYYYmmdd_HHMMSS` of the run start, used in audit file names
    pub fn timestamp(&self) -> String {
        self.started_at.format("%Y%m%d_%H%M%S").to_string()
    }
}

/// Default `{date}` stamp: current UTC time
pub fn default_date_stamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
