use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

use crate::models::notification::NotificationRecord;

/// Lifecycle of a delivery. `Processed` is terminal; there is no transition
/// out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Processed,
}

impl NotificationStatus {
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "processed" => Some(NotificationStatus::Processed),
            _ => None,
        }
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            NotificationStatus::Processed => write!(f, "processed"),
        }
    }
}

/// What a single consumer invocation did with its delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Processed(NotificationRecord),
    AlreadyProcessed,
}

impl ProcessingOutcome {
    pub fn is_skip(&self) -> bool {
        matches!(self, ProcessingOutcome::AlreadyProcessed)
    }
}
