use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::ConsultationError;
use crate::models::{
    Consultation, ConsultationStatus, ConsultationView, NewConsultation, PaymentConfirmation,
    QueueEntry, QueueStatus, QueueStatusView,
};
use crate::services::queue;
use crate::services::store::{ConsultationFilter, ConsultationStore, PaymentTransition, QueueFilter};

/// Tunables for the consultation lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleRules {
    pub slot_minutes: u32,
    pub read_retries: u32,
    pub read_retry_delay_ms: u64,
    pub pending_payment_timeout_minutes: i64,
}

impl Default for LifecycleRules {
    fn default() -> Self {
        Self {
            slot_minutes: queue::DEFAULT_SLOT_MINUTES,
            read_retries: 3,
            read_retry_delay_ms: 200,
            pending_payment_timeout_minutes: 30,
        }
    }
}

impl LifecycleRules {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            slot_minutes: config.queue_slot_minutes,
            read_retries: config.store_read_retries,
            pending_payment_timeout_minutes: config.pending_payment_timeout_minutes,
            ..Self::default()
        }
    }
}

/// Owns every status transition of a consultation and its queue entry.
pub struct ConsultationLifecycleService {
    store: Arc<dyn ConsultationStore>,
    rules: LifecycleRules,
}

impl ConsultationLifecycleService {
    pub fn new(store: Arc<dyn ConsultationStore>, rules: LifecycleRules) -> Self {
        Self { store, rules }
    }

    pub fn store(&self) -> Arc<dyn ConsultationStore> {
        Arc::clone(&self.store)
    }

    pub fn rules(&self) -> &LifecycleRules {
        &self.rules
    }

    // ==========================================================================
    // TRANSITIONS
    // ==========================================================================

    #[instrument(skip(self, request), fields(patient_id = %request.patient_id, specialty_id = %request.specialty_id))]
    pub async fn create_consultation(&self, mut request: NewConsultation) -> Result<Consultation, ConsultationError> {
        self.validate_new_consultation(&request)?;

        let specialty = self
            .read_with_retry("get_specialty", || self.store.get_specialty(request.specialty_id))
            .await?
            .ok_or_else(|| ConsultationError::Validation(format!(
                "Specialty {} does not exist", request.specialty_id
            )))?;

        if !specialty.is_active {
            return Err(ConsultationError::Validation(format!(
                "Specialty {} is not accepting consultations", specialty.name
            )));
        }
        if !request.specialty_name.trim().eq_ignore_ascii_case(specialty.name.trim()) {
            return Err(ConsultationError::Validation(format!(
                "specialty_name '{}' does not match specialty {} ({})",
                request.specialty_name.trim(), specialty.id, specialty.name
            )));
        }
        if let Some(list_price) = specialty.price {
            if request.price != list_price {
                return Err(ConsultationError::Validation(format!(
                    "price {} does not match the {} price of {}",
                    request.price, specialty.name, list_price
                )));
            }
        }

        // Stored name always comes from the catalog
        request.specialty_name = specialty.name;

        let consultation = Consultation::new(request, Utc::now());
        let stored = self.store.insert_consultation(&consultation).await?;

        info!("Consultation {} created with payment reference {}", stored.id, stored.payment_id);
        Ok(stored)
    }

    /// Mark a PENDING consultation as paid and issue its queue ticket.
    /// Replaying the call on a PAID consultation returns the existing ticket.
    #[instrument(skip(self))]
    pub async fn confirm_payment(&self, consultation_id: Uuid) -> Result<PaymentConfirmation, ConsultationError> {
        let transition = self
            .store
            .confirm_payment(consultation_id, Utc::now(), self.rules.slot_minutes)
            .await?;

        match transition {
            PaymentTransition::Applied { consultation, queue_entry } => {
                info!(
                    "Payment confirmed for consultation {}: ticket {} (~{} min)",
                    consultation.id, queue_entry.position, queue_entry.estimated_wait_minutes
                );
                Ok(PaymentConfirmation { consultation, queue_entry, already_confirmed: false })
            }
            PaymentTransition::AlreadyApplied { consultation, queue_entry } => {
                warn!(
                    "Duplicate payment confirmation for consultation {}; keeping ticket {}",
                    consultation.id, queue_entry.position
                );
                Ok(PaymentConfirmation { consultation, queue_entry, already_confirmed: true })
            }
            PaymentTransition::Rejected { current } => {
                warn!("Payment confirmation rejected for consultation {} in status {}", consultation_id, current);
                Err(ConsultationError::invalid_state("consultation", current, ConsultationStatus::Paid))
            }
            PaymentTransition::Missing => Err(ConsultationError::not_found("consultation", consultation_id)),
        }
    }

    #[instrument(skip(self))]
    pub async fn call_next(&self, queue_entry_id: Uuid) -> Result<QueueEntry, ConsultationError> {
        let entry = self
            .read_with_retry("get_queue_entry", || self.store.get_queue_entry(queue_entry_id))
            .await?
            .ok_or_else(|| ConsultationError::not_found("queue entry", queue_entry_id))?;

        if !entry.status.can_transition_to(&QueueStatus::Ready) {
            return Err(ConsultationError::invalid_state("queue entry", entry.status, QueueStatus::Ready));
        }

        match self.store.mark_queue_entry_ready(queue_entry_id, Utc::now()).await? {
            Some(called) => {
                info!("Queue ticket {} called for consultation {}", called.position, called.consultation_id);
                Ok(called)
            }
            // Lost the race to another caller
            None => {
                let current = self.store.get_queue_entry(queue_entry_id).await?
                    .ok_or_else(|| ConsultationError::not_found("queue entry", queue_entry_id))?;
                Err(ConsultationError::invalid_state("queue entry", current.status, QueueStatus::Ready))
            }
        }
    }

    /// Call the waiting entry with the lowest ticket, optionally within one specialty.
    pub async fn call_next_waiting(&self, specialty_id: Option<Uuid>) -> Result<QueueEntry, ConsultationError> {
        let filter = QueueFilter::waiting().in_specialty(specialty_id);
        let waiting = self
            .read_with_retry("list_queue_entries", || self.store.list_queue_entries(&filter))
            .await?;

        for candidate in waiting {
            match self.call_next(candidate.id).await {
                Ok(called) => return Ok(called),
                Err(ConsultationError::InvalidState { .. }) => {
                    debug!("Ticket {} was called concurrently, trying the next one", candidate.position);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ConsultationError::not_found(
            "waiting queue entry",
            specialty_id.map(|id| id.to_string()).unwrap_or_else(|| "any specialty".to_string()),
        ))
    }

    #[instrument(skip(self))]
    pub async fn complete_consultation(&self, consultation_id: Uuid) -> Result<Consultation, ConsultationError> {
        let completed = self
            .advance_consultation(consultation_id, ConsultationStatus::Paid, ConsultationStatus::Completed)
            .await?;
        info!("Consultation {} completed", completed.id);
        Ok(completed)
    }

    /// Abandon a consultation whose payment never arrived.
    #[instrument(skip(self))]
    pub async fn expire_consultation(&self, consultation_id: Uuid) -> Result<Consultation, ConsultationError> {
        let expired = self
            .advance_consultation(consultation_id, ConsultationStatus::Pending, ConsultationStatus::Expired)
            .await?;
        info!("Consultation {} expired before payment", expired.id);
        Ok(expired)
    }

    /// Expire every PENDING consultation older than the payment timeout.
    pub async fn expire_stale_consultations(&self, now: DateTime<Utc>) -> Result<Vec<Consultation>, ConsultationError> {
        let cutoff = now - Duration::minutes(self.rules.pending_payment_timeout_minutes);
        let filter = ConsultationFilter::default()
            .with_status(ConsultationStatus::Pending)
            .created_before(cutoff);

        let stale = self
            .read_with_retry("list_consultations", || self.store.list_consultations(&filter))
            .await?;

        let mut expired = Vec::new();
        for consultation in stale {
            match self
                .store
                .update_consultation_status(consultation.id, ConsultationStatus::Pending, ConsultationStatus::Expired, now)
                .await?
            {
                Some(updated) => expired.push(updated),
                None => debug!("Consultation {} left PENDING before it could expire", consultation.id),
            }
        }

        if !expired.is_empty() {
            info!("Expired {} unpaid consultation(s)", expired.len());
        }
        Ok(expired)
    }

    async fn advance_consultation(
        &self,
        consultation_id: Uuid,
        expected: ConsultationStatus,
        next: ConsultationStatus,
    ) -> Result<Consultation, ConsultationError> {
        let current = self.get_consultation(consultation_id).await?;
        if current.status != expected || !expected.can_transition_to(&next) {
            return Err(ConsultationError::invalid_state("consultation", current.status, next));
        }

        match self.store.update_consultation_status(consultation_id, expected, next, Utc::now()).await? {
            Some(updated) => Ok(updated),
            None => {
                let latest = self.get_consultation(consultation_id).await?;
                Err(ConsultationError::invalid_state("consultation", latest.status, next))
            }
        }
    }

    // ==========================================================================
    // READS
    // ==========================================================================

    pub async fn get_consultation(&self, consultation_id: Uuid) -> Result<Consultation, ConsultationError> {
        self.read_with_retry("get_consultation", || self.store.get_consultation(consultation_id))
            .await?
            .ok_or_else(|| ConsultationError::not_found("consultation", consultation_id))
    }

    pub async fn find_by_payment_reference(&self, payment_reference: &str) -> Result<Consultation, ConsultationError> {
        self.read_with_retry("find_consultation_by_payment_id", || {
            self.store.find_consultation_by_payment_id(payment_reference)
        })
        .await?
        .ok_or_else(|| ConsultationError::not_found("consultation with payment reference", payment_reference))
    }

    pub async fn consultations_for_user(&self, user_id: Uuid) -> Result<Vec<ConsultationView>, ConsultationError> {
        let filter = ConsultationFilter::for_user(user_id);
        let consultations = self
            .read_with_retry("list_consultations", || self.store.list_consultations(&filter))
            .await?;

        let queue_filter = QueueFilter::for_user(user_id);
        let entries = self
            .read_with_retry("list_queue_entries", || self.store.list_queue_entries(&queue_filter))
            .await?;
        let waiting = self.waiting_entries(None).await?;

        Ok(consultations
            .into_iter()
            .map(|consultation| {
                let queue = entries
                    .iter()
                    .find(|entry| entry.consultation_id == consultation.id)
                    .map(|entry| self.view_of(entry.clone(), &waiting));
                ConsultationView { consultation, queue }
            })
            .collect())
    }

    /// Ticket and live rank for a consultation, if it has been queued.
    pub async fn queue_status(&self, consultation_id: Uuid) -> Result<Option<QueueStatusView>, ConsultationError> {
        let entry = self
            .read_with_retry("find_queue_entry_for_consultation", || {
                self.store.find_queue_entry_for_consultation(consultation_id)
            })
            .await?;

        match entry {
            Some(entry) => {
                let waiting = self.waiting_entries(None).await?;
                Ok(Some(self.view_of(entry, &waiting)))
            }
            None => Ok(None),
        }
    }

    pub async fn waiting_queue(&self, specialty_id: Option<Uuid>) -> Result<Vec<QueueStatusView>, ConsultationError> {
        let waiting = self.waiting_entries(None).await?;
        Ok(waiting
            .iter()
            .filter(|entry| specialty_id.map_or(true, |id| entry.specialty_id == id))
            .map(|entry| self.view_of(entry.clone(), &waiting))
            .collect())
    }

    async fn waiting_entries(&self, specialty_id: Option<Uuid>) -> Result<Vec<QueueEntry>, ConsultationError> {
        let filter = QueueFilter::waiting().in_specialty(specialty_id);
        self.read_with_retry("list_queue_entries", || self.store.list_queue_entries(&filter))
            .await
    }

    fn view_of(&self, entry: QueueEntry, waiting: &[QueueEntry]) -> QueueStatusView {
        let live_rank = queue::live_rank(&entry, waiting);
        QueueStatusView {
            live_wait_minutes: queue::live_wait_minutes(live_rank, self.rules.slot_minutes),
            live_rank,
            entry,
        }
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    fn validate_new_consultation(&self, request: &NewConsultation) -> Result<(), ConsultationError> {
        let mut problems = Vec::new();

        if request.specialty_name.trim().is_empty() {
            problems.push("specialty_name is required");
        }
        if request.price <= Decimal::ZERO {
            problems.push("price must be greater than zero");
        }
        if request.payment_reference.trim().is_empty() {
            problems.push("payment_reference is required");
        }
        if request.contact.patient_name.trim().is_empty() {
            problems.push("patient_name is required");
        }
        let email = request.contact.patient_email.trim();
        if email.is_empty() || !email.contains('@') {
            problems.push("patient_email must be a valid address");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConsultationError::Validation(problems.join("; ")))
        }
    }

    /// Retry an idempotent read on store failures. Mutations never go through here.
    async fn read_with_retry<T, F, Fut>(&self, operation: &str, mut read: F) -> Result<T, ConsultationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConsultationError>>,
    {
        let mut attempt = 0;
        loop {
            match read().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.rules.read_retries => {
                    attempt += 1;
                    warn!("{} failed (attempt {}/{}): {}", operation, attempt, self.rules.read_retries, e);
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.rules.read_retry_delay_ms * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!("{} failed after {} retries: {}", operation, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}
