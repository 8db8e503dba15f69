use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use uuid::Uuid;

use consultation_cell::{
    ChangeEvent, Consultation, ConsultationChangeListener, ConsultationError, ConsultationFilter,
    ConsultationLifecycleService, ConsultationStatus, ConsultationStore, ContactInfo,
    InMemoryConsultationStore, LifecycleRules, ListenerSignal, NewConsultation, PaymentTransition,
    QueueEntry, QueueFilter, Specialty,
};

/// Delegates to the in-memory store but hides its push feed, forcing polling.
struct PollOnlyStore(Arc<InMemoryConsultationStore>);

#[async_trait]
impl ConsultationStore for PollOnlyStore {
    async fn get_specialty(&self, id: Uuid) -> Result<Option<Specialty>, ConsultationError> {
        self.0.get_specialty(id).await
    }

    async fn insert_consultation(&self, consultation: &Consultation) -> Result<Consultation, ConsultationError> {
        self.0.insert_consultation(consultation).await
    }

    async fn get_consultation(&self, id: Uuid) -> Result<Option<Consultation>, ConsultationError> {
        self.0.get_consultation(id).await
    }

    async fn find_consultation_by_payment_id(&self, payment_id: &str) -> Result<Option<Consultation>, ConsultationError> {
        self.0.find_consultation_by_payment_id(payment_id).await
    }

    async fn list_consultations(&self, filter: &ConsultationFilter) -> Result<Vec<Consultation>, ConsultationError> {
        self.0.list_consultations(filter).await
    }

    async fn update_consultation_status(
        &self,
        id: Uuid,
        expected: ConsultationStatus,
        next: ConsultationStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Consultation>, ConsultationError> {
        self.0.update_consultation_status(id, expected, next, now).await
    }

    async fn confirm_payment(
        &self,
        consultation_id: Uuid,
        now: DateTime<Utc>,
        slot_minutes: u32,
    ) -> Result<PaymentTransition, ConsultationError> {
        self.0.confirm_payment(consultation_id, now, slot_minutes).await
    }

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>, ConsultationError> {
        self.0.get_queue_entry(id).await
    }

    async fn find_queue_entry_for_consultation(&self, consultation_id: Uuid) -> Result<Option<QueueEntry>, ConsultationError> {
        self.0.find_queue_entry_for_consultation(consultation_id).await
    }

    async fn list_queue_entries(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>, ConsultationError> {
        self.0.list_queue_entries(filter).await
    }

    async fn mark_queue_entry_ready(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueEntry>, ConsultationError> {
        self.0.mark_queue_entry_ready(id, now).await
    }

    fn change_feed(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}

async fn seeded_store() -> (Arc<InMemoryConsultationStore>, Uuid) {
    let store = Arc::new(InMemoryConsultationStore::new());
    let specialty_id = Uuid::new_v4();
    store
        .add_specialty(Specialty {
            id: specialty_id,
            name: "Pediatrics".to_string(),
            is_active: true,
            price: None,
        })
        .await;
    (store, specialty_id)
}

fn request(patient_id: Uuid, specialty_id: Uuid, reference: &str) -> NewConsultation {
    NewConsultation {
        patient_id,
        specialty_id,
        specialty_name: "Pediatrics".to_string(),
        price: Decimal::new(6500, 2),
        payment_reference: reference.to_string(),
        contact: ContactInfo {
            patient_name: "Clara Dias".to_string(),
            patient_email: "clara@example.com".to_string(),
            symptoms: Some("Fever".to_string()),
        },
    }
}

async fn next_signal(signals: &mut broadcast::Receiver<ListenerSignal>) -> ListenerSignal {
    tokio::time::timeout(Duration::from_secs(2), signals.recv())
        .await
        .expect("timed out waiting for a listener signal")
        .unwrap()
}

#[tokio::test]
async fn test_push_listener_signals_payment_and_call() {
    let (store, specialty_id) = seeded_store().await;
    let lifecycle = ConsultationLifecycleService::new(store.clone(), LifecycleRules::default());
    let patient_id = Uuid::new_v4();

    let listener = Arc::new(ConsultationChangeListener::new(store.clone(), patient_id));
    let mut signals = listener.subscribe();
    let _handle = listener.clone().spawn(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let consultation = lifecycle.create_consultation(request(patient_id, specialty_id, "pay-1")).await.unwrap();
    let confirmation = lifecycle.confirm_payment(consultation.id).await.unwrap();

    assert_eq!(
        next_signal(&mut signals).await,
        ListenerSignal::PaymentApproved { consultation_id: consultation.id }
    );

    lifecycle.call_next(confirmation.queue_entry.id).await.unwrap();

    assert_eq!(
        next_signal(&mut signals).await,
        ListenerSignal::ReadyForConsultation {
            consultation_id: consultation.id,
            queue_entry_id: confirmation.queue_entry.id,
        }
    );

    let projection = listener.snapshot().await;
    assert_eq!(projection.consultations[&consultation.id].status, ConsultationStatus::Paid);
}

#[tokio::test]
async fn test_push_listener_ignores_other_users() {
    let (store, specialty_id) = seeded_store().await;
    let lifecycle = ConsultationLifecycleService::new(store.clone(), LifecycleRules::default());

    let listener = Arc::new(ConsultationChangeListener::new(store.clone(), Uuid::new_v4()));
    let mut signals = listener.subscribe();
    let _handle = listener.clone().spawn(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let other = lifecycle.create_consultation(request(Uuid::new_v4(), specialty_id, "pay-1")).await.unwrap();
    lifecycle.confirm_payment(other.id).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(200), signals.recv()).await;
    assert!(outcome.is_err());
    assert!(listener.snapshot().await.consultations.is_empty());
}

#[tokio::test]
async fn test_poll_once_diffs_against_projection() {
    let (store, specialty_id) = seeded_store().await;
    let poll_store: Arc<dyn ConsultationStore> = Arc::new(PollOnlyStore(store.clone()));
    let lifecycle = ConsultationLifecycleService::new(poll_store.clone(), LifecycleRules::default());
    let patient_id = Uuid::new_v4();

    let listener = ConsultationChangeListener::new(poll_store, patient_id);
    let consultation = lifecycle.create_consultation(request(patient_id, specialty_id, "pay-1")).await.unwrap();

    // First read only establishes the baseline
    assert!(listener.poll_once().await.unwrap().is_empty());

    let confirmation = lifecycle.confirm_payment(consultation.id).await.unwrap();
    assert_eq!(
        listener.poll_once().await.unwrap(),
        vec![ListenerSignal::PaymentApproved { consultation_id: consultation.id }]
    );
    assert!(listener.poll_once().await.unwrap().is_empty());

    lifecycle.call_next(confirmation.queue_entry.id).await.unwrap();
    assert_eq!(
        listener.poll_once().await.unwrap(),
        vec![ListenerSignal::ReadyForConsultation {
            consultation_id: consultation.id,
            queue_entry_id: confirmation.queue_entry.id,
        }]
    );
}

#[tokio::test]
async fn test_poll_signals_rows_created_and_advanced_between_reads() {
    let (store, specialty_id) = seeded_store().await;
    let poll_store: Arc<dyn ConsultationStore> = Arc::new(PollOnlyStore(store.clone()));
    let lifecycle = ConsultationLifecycleService::new(poll_store.clone(), LifecycleRules::default());
    let patient_id = Uuid::new_v4();

    let listener = ConsultationChangeListener::new(poll_store, patient_id);
    assert!(listener.poll_once().await.unwrap().is_empty());

    let consultation = lifecycle.create_consultation(request(patient_id, specialty_id, "pay-1")).await.unwrap();
    let confirmation = lifecycle.confirm_payment(consultation.id).await.unwrap();
    lifecycle.call_next(confirmation.queue_entry.id).await.unwrap();

    let mut signals = listener.poll_once().await.unwrap();
    signals.sort_by_key(|signal| matches!(signal, ListenerSignal::ReadyForConsultation { .. }));
    assert_eq!(
        signals,
        vec![
            ListenerSignal::PaymentApproved { consultation_id: consultation.id },
            ListenerSignal::ReadyForConsultation {
                consultation_id: consultation.id,
                queue_entry_id: confirmation.queue_entry.id,
            },
        ]
    );
    assert!(listener.poll_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_poll_baseline_does_not_signal_existing_paid_rows() {
    let (store, specialty_id) = seeded_store().await;
    let poll_store: Arc<dyn ConsultationStore> = Arc::new(PollOnlyStore(store.clone()));
    let lifecycle = ConsultationLifecycleService::new(poll_store.clone(), LifecycleRules::default());
    let patient_id = Uuid::new_v4();

    let consultation = lifecycle.create_consultation(request(patient_id, specialty_id, "pay-1")).await.unwrap();
    lifecycle.confirm_payment(consultation.id).await.unwrap();

    let listener = ConsultationChangeListener::new(poll_store, patient_id);
    assert!(listener.poll_once().await.unwrap().is_empty());
    assert_eq!(listener.snapshot().await.consultations.len(), 1);
}

#[tokio::test]
async fn test_poll_listener_runs_in_background() {
    let (store, specialty_id) = seeded_store().await;
    let poll_store: Arc<dyn ConsultationStore> = Arc::new(PollOnlyStore(store));
    let lifecycle = ConsultationLifecycleService::new(poll_store.clone(), LifecycleRules::default());
    let patient_id = Uuid::new_v4();

    let consultation = lifecycle.create_consultation(request(patient_id, specialty_id, "pay-1")).await.unwrap();

    let listener = Arc::new(ConsultationChangeListener::new(poll_store, patient_id));
    let mut signals = listener.subscribe();
    let handle = listener.clone().spawn(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(60)).await;

    lifecycle.confirm_payment(consultation.id).await.unwrap();

    assert_eq!(
        next_signal(&mut signals).await,
        ListenerSignal::PaymentApproved { consultation_id: consultation.id }
    );

    drop(handle);
}
