use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ==============================================================================
// STATUSES
// ==============================================================================

/// Consultation status. Stored uppercase; lowercase spellings are accepted
/// on read, and the legacy `waiting` value means the consultation was paid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsultationStatus {
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "paid", alias = "waiting", alias = "WAITING")]
    Paid,
    #[serde(alias = "completed")]
    Completed,
    #[serde(alias = "expired")]
    Expired,
}

impl ConsultationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationStatus::Pending => "PENDING",
            ConsultationStatus::Paid => "PAID",
            ConsultationStatus::Completed => "COMPLETED",
            ConsultationStatus::Expired => "EXPIRED",
        }
    }

    pub fn can_transition_to(&self, target: &ConsultationStatus) -> bool {
        use ConsultationStatus::*;
        matches!(
            (self, target),
            (Pending, Paid) | (Pending, Expired) | (Paid, Completed)
        )
    }
}

impl fmt::Display for ConsultationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    #[serde(alias = "waiting")]
    Waiting,
    #[serde(alias = "ready")]
    Ready,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "WAITING",
            QueueStatus::Ready => "READY",
        }
    }

    pub fn can_transition_to(&self, target: &QueueStatus) -> bool {
        matches!((self, target), (QueueStatus::Waiting, QueueStatus::Ready))
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// ROWS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Specialty {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// List price; the consultation carries the price actually charged.
    #[serde(default)]
    pub price: Option<Decimal>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Consultation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub specialty_id: Uuid,
    pub specialty_name: String,
    pub price: Decimal,
    pub payment_id: String,
    pub status: ConsultationStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub patient_name: String,
    pub patient_email: String,
    pub symptoms: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Consultation {
    pub fn new(request: NewConsultation, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: request.patient_id,
            specialty_id: request.specialty_id,
            specialty_name: request.specialty_name.trim().to_string(),
            price: request.price,
            payment_id: request.payment_reference.trim().to_string(),
            status: ConsultationStatus::Pending,
            paid_at: None,
            patient_name: request.contact.patient_name.trim().to_string(),
            patient_email: request.contact.patient_email.trim().to_string(),
            symptoms: request.contact.symptoms,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: Uuid,
    pub consultation_id: Uuid,
    pub user_id: Uuid,
    pub specialty_id: Uuid,
    pub position: u32,
    pub status: QueueStatus,
    pub estimated_wait_minutes: u32,
    pub created_at: DateTime<Utc>,
    pub called_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn waiting(consultation: &Consultation, position: u32, slot_minutes: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            consultation_id: consultation.id,
            user_id: consultation.user_id,
            specialty_id: consultation.specialty_id,
            position,
            status: QueueStatus::Waiting,
            estimated_wait_minutes: crate::services::queue::estimated_wait_minutes(position, slot_minutes),
            created_at: now,
            called_at: None,
        }
    }
}

// ==============================================================================
// REQUESTS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactInfo {
    pub patient_name: String,
    pub patient_email: String,
    pub symptoms: Option<String>,
}

/// Input to the create-consultation transition.
#[derive(Debug, Clone)]
pub struct NewConsultation {
    pub patient_id: Uuid,
    pub specialty_id: Uuid,
    pub specialty_name: String,
    pub price: Decimal,
    pub payment_reference: String,
    pub contact: ContactInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConsultationRequest {
    pub specialty_id: Uuid,
    pub specialty_name: String,
    pub price: Decimal,
    /// Provider reference; generated when absent (simulated payments).
    pub payment_reference: Option<String>,
    pub patient_name: String,
    pub patient_email: String,
    pub symptoms: Option<String>,
}

impl CreateConsultationRequest {
    pub fn into_new_consultation(self, patient_id: Uuid, payment_reference: String) -> NewConsultation {
        NewConsultation {
            patient_id,
            specialty_id: self.specialty_id,
            specialty_name: self.specialty_name,
            price: self.price,
            payment_reference,
            contact: ContactInfo {
                patient_name: self.patient_name,
                patient_email: self.patient_email,
                symptoms: self.symptoms,
            },
        }
    }
}

/// Provider callback body: `{ type, action, data: { id } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentNotification {
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub action: Option<String>,
    pub data: Option<PaymentNotificationData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentNotificationData {
    pub id: Value,
}

impl PaymentNotification {
    pub fn is_payment_update(&self) -> bool {
        self.notification_type.as_deref() == Some("payment")
            && self.action.as_deref() == Some("payment.updated")
    }

    /// Providers send the id either as a string or as a number.
    pub fn payment_reference(&self) -> Option<String> {
        match self.data.as_ref().map(|d| &d.id) {
            Some(Value::String(id)) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        }
    }
}

// ==============================================================================
// VIEWS AND RESULTS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentConfirmation {
    pub consultation: Consultation,
    pub queue_entry: QueueEntry,
    /// Set when the consultation was already paid and the existing entry is returned.
    pub already_confirmed: bool,
}

/// A queue entry with its live rank next to the stored ticket position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueStatusView {
    pub entry: QueueEntry,
    pub live_rank: u32,
    pub live_wait_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsultationView {
    pub consultation: Consultation,
    pub queue: Option<QueueStatusView>,
}

// ==============================================================================
// CHANGE NOTIFICATIONS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    Consultation { old: Option<Consultation>, new: Consultation },
    QueueEntry { old: Option<QueueEntry>, new: QueueEntry },
}

/// Row change delivered by the store: `{ eventType, old, new }`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub record: ChangeRecord,
}

impl ChangeEvent {
    pub fn consultation_updated(old: Consultation, new: Consultation) -> Self {
        Self {
            event_type: ChangeEventType::Update,
            record: ChangeRecord::Consultation { old: Some(old), new },
        }
    }

    pub fn consultation_inserted(new: Consultation) -> Self {
        Self {
            event_type: ChangeEventType::Insert,
            record: ChangeRecord::Consultation { old: None, new },
        }
    }

    pub fn queue_entry_updated(old: QueueEntry, new: QueueEntry) -> Self {
        Self {
            event_type: ChangeEventType::Update,
            record: ChangeRecord::QueueEntry { old: Some(old), new },
        }
    }

    pub fn queue_entry_inserted(new: QueueEntry) -> Self {
        Self {
            event_type: ChangeEventType::Insert,
            record: ChangeRecord::QueueEntry { old: None, new },
        }
    }

    pub fn user_id(&self) -> Uuid {
        match &self.record {
            ChangeRecord::Consultation { new, .. } => new.user_id,
            ChangeRecord::QueueEntry { new, .. } => new.user_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerSignal {
    PaymentApproved { consultation_id: Uuid },
    ReadyForConsultation { consultation_id: Uuid, queue_entry_id: Uuid },
}

impl ListenerSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            ListenerSignal::PaymentApproved { .. } => "payment_approved",
            ListenerSignal::ReadyForConsultation { .. } => "ready_for_consultation",
        }
    }
}
