use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::ConsultationError;
use crate::models::{
    ChangeEvent, Consultation, ConsultationStatus, QueueEntry, QueueStatus, Specialty,
};
use crate::services::queue;
use crate::services::store::{ConsultationFilter, ConsultationStore, PaymentTransition, QueueFilter};

#[derive(Default)]
struct MemoryState {
    specialties: HashMap<Uuid, Specialty>,
    consultations: HashMap<Uuid, Consultation>,
    queue: HashMap<Uuid, QueueEntry>,
}

impl MemoryState {
    fn entry_for(&self, consultation_id: Uuid) -> Option<&QueueEntry> {
        self.queue.values().find(|entry| entry.consultation_id == consultation_id)
    }
}

/// Process-local store with a push change feed. Every operation runs under
/// one lock, which makes `confirm_payment` atomic.
pub struct InMemoryConsultationStore {
    state: Mutex<MemoryState>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl InMemoryConsultationStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MemoryState::default()),
            changes,
        }
    }

    pub fn with_specialties<I>(specialties: I) -> Self
    where
        I: IntoIterator<Item = Specialty>,
    {
        let (changes, _) = broadcast::channel(256);
        let state = MemoryState {
            specialties: specialties.into_iter().map(|s| (s.id, s)).collect(),
            ..MemoryState::default()
        };
        Self {
            state: Mutex::new(state),
            changes,
        }
    }

    pub async fn add_specialty(&self, specialty: Specialty) {
        let mut state = self.state.lock().await;
        state.specialties.insert(specialty.id, specialty);
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        if self.changes.send(event).is_err() {
            debug!("No change listeners subscribed");
        }
    }
}

/// Catalog used when running without a database.
pub fn local_specialties() -> Vec<Specialty> {
    [
        (1, "General Medicine", 6000),
        (2, "Cardiology", 8000),
        (3, "Dermatology", 7000),
        (4, "Pediatrics", 6500),
    ]
    .into_iter()
    .map(|(n, name, cents)| Specialty {
        id: Uuid::from_u128(n),
        name: name.to_string(),
        is_active: true,
        price: Some(Decimal::new(cents, 2)),
    })
    .collect()
}

impl Default for InMemoryConsultationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsultationStore for InMemoryConsultationStore {
    async fn get_specialty(&self, id: Uuid) -> Result<Option<Specialty>, ConsultationError> {
        let state = self.state.lock().await;
        Ok(state.specialties.get(&id).cloned())
    }

    async fn insert_consultation(&self, consultation: &Consultation) -> Result<Consultation, ConsultationError> {
        let mut state = self.state.lock().await;

        if state.consultations.contains_key(&consultation.id) {
            return Err(ConsultationError::Store(format!(
                "Duplicate consultation id {}", consultation.id
            )));
        }
        if state.consultations.values().any(|c| c.payment_id == consultation.payment_id) {
            return Err(ConsultationError::Store(format!(
                "Payment reference {} is already in use", consultation.payment_id
            )));
        }

        state.consultations.insert(consultation.id, consultation.clone());
        drop(state);

        self.publish(ChangeEvent::consultation_inserted(consultation.clone()));
        Ok(consultation.clone())
    }

    async fn get_consultation(&self, id: Uuid) -> Result<Option<Consultation>, ConsultationError> {
        let state = self.state.lock().await;
        Ok(state.consultations.get(&id).cloned())
    }

    async fn find_consultation_by_payment_id(&self, payment_id: &str) -> Result<Option<Consultation>, ConsultationError> {
        let state = self.state.lock().await;
        Ok(state.consultations.values().find(|c| c.payment_id == payment_id).cloned())
    }

    async fn list_consultations(&self, filter: &ConsultationFilter) -> Result<Vec<Consultation>, ConsultationError> {
        let state = self.state.lock().await;
        let mut consultations: Vec<Consultation> = state
            .consultations
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        consultations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(consultations)
    }

    async fn update_consultation_status(
        &self,
        id: Uuid,
        expected: ConsultationStatus,
        next: ConsultationStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Consultation>, ConsultationError> {
        let mut state = self.state.lock().await;

        let Some(current) = state.consultations.get_mut(&id) else {
            return Ok(None);
        };
        if current.status != expected {
            return Ok(None);
        }

        let old = current.clone();
        current.status = next;
        current.updated_at = now;
        let updated = current.clone();
        drop(state);

        self.publish(ChangeEvent::consultation_updated(old, updated.clone()));
        Ok(Some(updated))
    }

    async fn confirm_payment(
        &self,
        consultation_id: Uuid,
        now: DateTime<Utc>,
        slot_minutes: u32,
    ) -> Result<PaymentTransition, ConsultationError> {
        let mut state = self.state.lock().await;

        let Some(current) = state.consultations.get(&consultation_id).cloned() else {
            return Ok(PaymentTransition::Missing);
        };

        match (current.status, state.entry_for(consultation_id).cloned()) {
            (ConsultationStatus::Paid, Some(entry)) => {
                return Ok(PaymentTransition::AlreadyApplied {
                    consultation: current,
                    queue_entry: entry,
                });
            }
            (ConsultationStatus::Pending, _) | (ConsultationStatus::Paid, None) => {}
            (status, _) => return Ok(PaymentTransition::Rejected { current: status }),
        }

        let mut paid = current.clone();
        if paid.status == ConsultationStatus::Pending {
            paid.status = ConsultationStatus::Paid;
            paid.paid_at = Some(now);
            paid.updated_at = now;
        }

        let position = queue::next_position(state.queue.values().map(|entry| entry.position));
        let entry = QueueEntry::waiting(&paid, position, slot_minutes, now);

        state.consultations.insert(paid.id, paid.clone());
        state.queue.insert(entry.id, entry.clone());
        drop(state);

        if current.status != paid.status {
            self.publish(ChangeEvent::consultation_updated(current, paid.clone()));
        }
        self.publish(ChangeEvent::queue_entry_inserted(entry.clone()));

        Ok(PaymentTransition::Applied {
            consultation: paid,
            queue_entry: entry,
        })
    }

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>, ConsultationError> {
        let state = self.state.lock().await;
        Ok(state.queue.get(&id).cloned())
    }

    async fn find_queue_entry_for_consultation(&self, consultation_id: Uuid) -> Result<Option<QueueEntry>, ConsultationError> {
        let state = self.state.lock().await;
        Ok(state.entry_for(consultation_id).cloned())
    }

    async fn list_queue_entries(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>, ConsultationError> {
        let state = self.state.lock().await;
        let mut entries: Vec<QueueEntry> = state
            .queue
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.position);
        Ok(entries)
    }

    async fn mark_queue_entry_ready(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueEntry>, ConsultationError> {
        let mut state = self.state.lock().await;

        let Some(current) = state.queue.get_mut(&id) else {
            return Ok(None);
        };
        if current.status != QueueStatus::Waiting {
            return Ok(None);
        }

        let old = current.clone();
        current.status = QueueStatus::Ready;
        current.called_at = Some(now);
        let updated = current.clone();
        drop(state);

        self.publish(ChangeEvent::queue_entry_updated(old, updated.clone()));
        Ok(Some(updated))
    }

    fn change_feed(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.changes.subscribe())
    }
}
