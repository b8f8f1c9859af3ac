use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::AttemptId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestStatus {
    Open,
    Merged,
    Closed,
}

impl PullRequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PullRequestStatus::Open => "open",
            PullRequestStatus::Merged => "merged",
            PullRequestStatus::Closed => "closed",
        }
    }
}

/// Maps a pull-request webhook action onto the status it sets, if it sets one.
pub fn status_for_action(action: &str, merged: Option<bool>) -> Option<PullRequestStatus> {
    match action.trim().to_ascii_lowercase().as_str() {
        "closed" if merged.unwrap_or(false) => Some(PullRequestStatus::Merged),
        "closed" => Some(PullRequestStatus::Closed),
        "merged" => Some(PullRequestStatus::Merged),
        "opened" | "reopened" => Some(PullRequestStatus::Open),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedWebhookRecord {
    #[serde(rename = "deliveryID")]
    pub delivery_id: String,
    #[serde(rename = "subjectID")]
    pub subject_id: String,
    pub applied_status: PullRequestStatus,
    pub applied_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookOutcome {
    pub applied: bool,
    pub duplicate: bool,
}

/// The record a webhook delivery mutates.
pub trait SubjectStore {
    fn contains(&self, subject_id: &str) -> bool;
    fn set_status(&mut self, subject_id: &str, status: PullRequestStatus, now_ms: u64);
}

/// Applies each distinct delivery exactly once.
///
/// `apply` takes `&mut self`, so the lookup and the insert happen under the
/// same exclusive borrow; callers sharing a guard must hold one lock over it.
#[derive(Debug, Clone, Default)]
pub struct WebhookGuard {
    processed: HashMap<String, ProcessedWebhookRecord>,
}

impl WebhookGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(records: Vec<ProcessedWebhookRecord>) -> Self {
        Self {
            processed: records
                .into_iter()
                .map(|record| (record.delivery_id.clone(), record))
                .collect(),
        }
    }

    /// Duplicates never touch the subject. Distinct deliveries overwrite the
    /// subject status with no ordering check; the last one applied wins.
    pub fn apply<S: SubjectStore>(
        &mut self,
        subjects: &mut S,
        delivery_id: &str,
        subject_id: &str,
        status: PullRequestStatus,
        now_ms: u64,
    ) -> WebhookOutcome {
        if self.processed.contains_key(delivery_id) {
            return WebhookOutcome {
                applied: false,
                duplicate: true,
            };
        }
        if !subjects.contains(subject_id) {
            return WebhookOutcome {
                applied: false,
                duplicate: false,
            };
        }
        subjects.set_status(subject_id, status, now_ms);
        self.processed.insert(
            delivery_id.to_string(),
            ProcessedWebhookRecord {
                delivery_id: delivery_id.to_string(),
                subject_id: subject_id.to_string(),
                applied_status: status,
                applied_at_ms: now_ms,
            },
        );
        WebhookOutcome {
            applied: true,
            duplicate: false,
        }
    }

    pub fn get(&self, delivery_id: &str) -> Option<&ProcessedWebhookRecord> {
        self.processed.get(delivery_id)
    }

    pub fn records(&self) -> Vec<ProcessedWebhookRecord> {
        let mut rows = self.processed.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.applied_at_ms
                .cmp(&b.applied_at_ms)
                .then_with(|| a.delivery_id.cmp(&b.delivery_id))
        });
        rows
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestRecord {
    pub pr_number: u64,
    #[serde(rename = "attemptID")]
    pub attempt_id: AttemptId,
    pub status: PullRequestStatus,
    pub updated_at_ms: u64,
}

/// In-memory pull requests keyed by PR number (as a string subject id).
#[derive(Debug, Clone, Default)]
pub struct PullRequestRegistry {
    records: HashMap<String, PullRequestRecord>,
}

impl PullRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(records: Vec<PullRequestRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.pr_number.to_string(), record))
                .collect(),
        }
    }

    pub fn register(
        &mut self,
        pr_number: u64,
        attempt_id: impl Into<AttemptId>,
        now_ms: u64,
    ) -> PullRequestRecord {
        let record = PullRequestRecord {
            pr_number,
            attempt_id: attempt_id.into(),
            status: PullRequestStatus::Open,
            updated_at_ms: now_ms,
        };
        self.records.insert(pr_number.to_string(), record.clone());
        record
    }

    pub fn get(&self, pr_number: u64) -> Option<&PullRequestRecord> {
        self.records.get(&pr_number.to_string())
    }

    pub fn records(&self) -> Vec<PullRequestRecord> {
        let mut rows = self.records.values().cloned().collect::<Vec<_>>();
        rows.sort_by_key(|record| record.pr_number);
        rows
    }
}

impl SubjectStore for PullRequestRegistry {
    fn contains(&self, subject_id: &str) -> bool {
        self.records.contains_key(subject_id)
    }

    fn set_status(&mut self, subject_id: &str, status: PullRequestStatus, now_ms: u64) {
        if let Some(record) = self.records.get_mut(subject_id) {
            record.status = status;
            record.updated_at_ms = now_ms;
        }
    }
}
