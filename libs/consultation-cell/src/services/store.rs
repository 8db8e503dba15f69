use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ConsultationError;
use crate::models::{
    ChangeEvent, Consultation, ConsultationStatus, QueueEntry, QueueStatus, Specialty,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsultationFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<ConsultationStatus>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ConsultationFilter {
    pub fn for_user(user_id: Uuid) -> Self {
        Self { user_id: Some(user_id), ..Self::default() }
    }

    pub fn with_status(mut self, status: ConsultationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn matches(&self, consultation: &Consultation) -> bool {
        self.user_id.map_or(true, |id| consultation.user_id == id)
            && self.status.map_or(true, |status| consultation.status == status)
            && self.created_before.map_or(true, |cutoff| consultation.created_at < cutoff)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueFilter {
    pub user_id: Option<Uuid>,
    pub specialty_id: Option<Uuid>,
    pub status: Option<QueueStatus>,
}

impl QueueFilter {
    pub fn for_user(user_id: Uuid) -> Self {
        Self { user_id: Some(user_id), ..Self::default() }
    }

    pub fn waiting() -> Self {
        Self { status: Some(QueueStatus::Waiting), ..Self::default() }
    }

    pub fn in_specialty(mut self, specialty_id: Option<Uuid>) -> Self {
        self.specialty_id = specialty_id;
        self
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        self.user_id.map_or(true, |id| entry.user_id == id)
            && self.specialty_id.map_or(true, |id| entry.specialty_id == id)
            && self.status.map_or(true, |status| entry.status == status)
    }
}

/// What the store did when asked to confirm a payment.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentTransition {
    /// The consultation moved to PAID (if it was PENDING) and a queue entry was issued.
    Applied { consultation: Consultation, queue_entry: QueueEntry },
    /// The consultation was already PAID with a queue entry; nothing changed.
    AlreadyApplied { consultation: Consultation, queue_entry: QueueEntry },
    /// The consultation is in a state that cannot be paid.
    Rejected { current: ConsultationStatus },
    Missing,
}

/// Row-level access to consultations and their queue entries.
///
/// `confirm_payment` must flip the consultation to PAID and issue its ticket
/// in one atomic step: the max-position read and the entry insert may not
/// interleave with another confirmation. The `update_*`/`mark_*` methods are
/// compare-and-set: they return `None` when the row is missing or no longer
/// in the expected status.
#[async_trait]
pub trait ConsultationStore: Send + Sync {
    async fn get_specialty(&self, id: Uuid) -> Result<Option<Specialty>, ConsultationError>;

    async fn insert_consultation(&self, consultation: &Consultation) -> Result<Consultation, ConsultationError>;

    async fn get_consultation(&self, id: Uuid) -> Result<Option<Consultation>, ConsultationError>;

    async fn find_consultation_by_payment_id(&self, payment_id: &str) -> Result<Option<Consultation>, ConsultationError>;

    /// Newest first.
    async fn list_consultations(&self, filter: &ConsultationFilter) -> Result<Vec<Consultation>, ConsultationError>;

    async fn update_consultation_status(
        &self,
        id: Uuid,
        expected: ConsultationStatus,
        next: ConsultationStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Consultation>, ConsultationError>;

    async fn confirm_payment(
        &self,
        consultation_id: Uuid,
        now: DateTime<Utc>,
        slot_minutes: u32,
    ) -> Result<PaymentTransition, ConsultationError>;

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>, ConsultationError>;

    async fn find_queue_entry_for_consultation(&self, consultation_id: Uuid) -> Result<Option<QueueEntry>, ConsultationError>;

    /// Lowest ticket first.
    async fn list_queue_entries(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>, ConsultationError>;

    async fn mark_queue_entry_ready(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueEntry>, ConsultationError>;

    /// Push feed of row changes, when the backend offers one.
    fn change_feed(&self) -> Option<broadcast::Receiver<ChangeEvent>>;
}
