use std::collections::HashSet;
use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use consultation_cell::{
    ConsultationError, ConsultationLifecycleService, ConsultationStatus, ConsultationStore,
    ContactInfo, InMemoryConsultationStore, LifecycleRules, NewConsultation, QueueFilter, QueueStatus,
    Specialty,
};

// ==============================================================================
// TEST FIXTURES
// ==============================================================================

struct TestSetup {
    store: Arc<InMemoryConsultationStore>,
    lifecycle: Arc<ConsultationLifecycleService>,
    specialty_id: Uuid,
}

impl TestSetup {
    async fn new() -> Self {
        let store = Arc::new(InMemoryConsultationStore::new());
        let specialty_id = Uuid::new_v4();
        store
            .add_specialty(Specialty {
                id: specialty_id,
                name: "Cardiology".to_string(),
                is_active: true,
                price: Some(Decimal::new(8000, 2)),
            })
            .await;

        let rules = LifecycleRules {
            read_retry_delay_ms: 1,
            ..LifecycleRules::default()
        };
        let lifecycle = Arc::new(ConsultationLifecycleService::new(store.clone(), rules));

        Self { store, lifecycle, specialty_id }
    }

    fn request(&self, payment_reference: &str) -> NewConsultation {
        NewConsultation {
            patient_id: Uuid::new_v4(),
            specialty_id: self.specialty_id,
            specialty_name: "Cardiology".to_string(),
            price: Decimal::new(8000, 2),
            payment_reference: payment_reference.to_string(),
            contact: ContactInfo {
                patient_name: "Ana Souza".to_string(),
                patient_email: "ana@example.com".to_string(),
                symptoms: Some("Palpitations".to_string()),
            },
        }
    }

    async fn queue_len(&self) -> usize {
        self.store
            .list_queue_entries(&QueueFilter::default())
            .await
            .unwrap()
            .len()
    }
}

// ==============================================================================
// CREATION
// ==============================================================================

#[tokio::test]
async fn test_create_consultation_starts_pending() {
    let setup = TestSetup::new().await;

    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();

    assert_eq!(consultation.status, ConsultationStatus::Pending);
    assert!(consultation.paid_at.is_none());
    assert_eq!(consultation.payment_id, "pay-1");
    assert_eq!(consultation.price, Decimal::new(8000, 2));
}

#[tokio::test]
async fn test_create_consultation_rejects_invalid_input() {
    let setup = TestSetup::new().await;

    let mut zero_price = setup.request("pay-1");
    zero_price.price = Decimal::ZERO;
    assert_matches!(
        setup.lifecycle.create_consultation(zero_price).await,
        Err(ConsultationError::Validation(msg)) if msg.contains("price")
    );

    let mut bad_email = setup.request("pay-2");
    bad_email.contact.patient_email = "not-an-email".to_string();
    assert_matches!(
        setup.lifecycle.create_consultation(bad_email).await,
        Err(ConsultationError::Validation(_))
    );

    let mut unknown_specialty = setup.request("pay-3");
    unknown_specialty.specialty_id = Uuid::new_v4();
    assert_matches!(
        setup.lifecycle.create_consultation(unknown_specialty).await,
        Err(ConsultationError::Validation(msg)) if msg.contains("does not exist")
    );
}

#[tokio::test]
async fn test_create_consultation_rejects_inactive_specialty() {
    let setup = TestSetup::new().await;
    let inactive = Uuid::new_v4();
    setup
        .store
        .add_specialty(Specialty {
            id: inactive,
            name: "Radiology".to_string(),
            is_active: false,
            price: None,
        })
        .await;

    let mut request = setup.request("pay-1");
    request.specialty_id = inactive;

    assert_matches!(
        setup.lifecycle.create_consultation(request).await,
        Err(ConsultationError::Validation(msg)) if msg.contains("not accepting")
    );
}

#[tokio::test]
async fn test_create_consultation_rejects_name_of_another_specialty() {
    let setup = TestSetup::new().await;

    let mut request = setup.request("pay-1");
    request.specialty_name = "Neurosurgery".to_string();

    assert_matches!(
        setup.lifecycle.create_consultation(request).await,
        Err(ConsultationError::Validation(msg)) if msg.contains("specialty_name")
    );
    assert_eq!(setup.store.list_consultations(&Default::default()).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_create_consultation_stores_catalog_specialty_name() {
    let setup = TestSetup::new().await;

    let mut request = setup.request("pay-1");
    request.specialty_name = "  cardiology ".to_string();

    let consultation = setup.lifecycle.create_consultation(request).await.unwrap();
    assert_eq!(consultation.specialty_name, "Cardiology");
}

#[tokio::test]
async fn test_create_consultation_enforces_list_price() {
    let setup = TestSetup::new().await;

    let mut discounted = setup.request("pay-1");
    discounted.price = Decimal::new(100, 2);
    assert_matches!(
        setup.lifecycle.create_consultation(discounted).await,
        Err(ConsultationError::Validation(msg)) if msg.contains("price")
    );

    // Same amount at a different scale is the same price
    let mut rescaled = setup.request("pay-2");
    rescaled.price = Decimal::new(80, 0);
    assert!(setup.lifecycle.create_consultation(rescaled).await.is_ok());
}

#[tokio::test]
async fn test_unpriced_specialty_accepts_any_positive_price() {
    let setup = TestSetup::new().await;
    let unpriced = Uuid::new_v4();
    setup
        .store
        .add_specialty(Specialty {
            id: unpriced,
            name: "Psychiatry".to_string(),
            is_active: true,
            price: None,
        })
        .await;

    let mut request = setup.request("pay-1");
    request.specialty_id = unpriced;
    request.specialty_name = "Psychiatry".to_string();
    request.price = Decimal::new(12345, 2);

    let consultation = setup.lifecycle.create_consultation(request).await.unwrap();
    assert_eq!(consultation.price, Decimal::new(12345, 2));
}

#[tokio::test]
async fn test_duplicate_payment_reference_is_a_store_error() {
    let setup = TestSetup::new().await;
    setup.lifecycle.create_consultation(setup.request("pay-dup")).await.unwrap();

    assert_matches!(
        setup.lifecycle.create_consultation(setup.request("pay-dup")).await,
        Err(ConsultationError::Store(_))
    );
}

// ==============================================================================
// PAYMENT CONFIRMATION
// ==============================================================================

#[tokio::test]
async fn test_first_confirmation_gets_ticket_one() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();

    let confirmation = setup.lifecycle.confirm_payment(consultation.id).await.unwrap();

    assert!(!confirmation.already_confirmed);
    assert_eq!(confirmation.consultation.status, ConsultationStatus::Paid);
    assert!(confirmation.consultation.paid_at.is_some());
    assert_eq!(confirmation.queue_entry.position, 1);
    assert_eq!(confirmation.queue_entry.estimated_wait_minutes, 5);
    assert_eq!(confirmation.queue_entry.status, QueueStatus::Waiting);
    assert_eq!(confirmation.queue_entry.consultation_id, consultation.id);
}

#[tokio::test]
async fn test_second_confirmation_gets_next_ticket() {
    let setup = TestSetup::new().await;
    let first = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();
    let second = setup.lifecycle.create_consultation(setup.request("pay-2")).await.unwrap();

    setup.lifecycle.confirm_payment(first.id).await.unwrap();
    let confirmation = setup.lifecycle.confirm_payment(second.id).await.unwrap();

    assert_eq!(confirmation.queue_entry.position, 2);
    assert_eq!(confirmation.queue_entry.estimated_wait_minutes, 10);
}

#[tokio::test]
async fn test_confirming_paid_consultation_returns_existing_ticket() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();

    let first = setup.lifecycle.confirm_payment(consultation.id).await.unwrap();
    let replay = setup.lifecycle.confirm_payment(consultation.id).await.unwrap();

    assert!(replay.already_confirmed);
    assert_eq!(replay.queue_entry.id, first.queue_entry.id);
    assert_eq!(replay.consultation.paid_at, first.consultation.paid_at);
    assert_eq!(setup.queue_len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_confirmations_get_distinct_consecutive_tickets() {
    let setup = TestSetup::new().await;
    let n = 25;

    let mut ids = Vec::new();
    for i in 0..n {
        let consultation = setup
            .lifecycle
            .create_consultation(setup.request(&format!("pay-{}", i)))
            .await
            .unwrap();
        ids.push(consultation.id);
    }

    let tasks: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let lifecycle = setup.lifecycle.clone();
            tokio::spawn(async move { lifecycle.confirm_payment(id).await })
        })
        .collect();

    let mut positions = HashSet::new();
    for task in futures::future::join_all(tasks).await {
        let confirmation = task.unwrap().unwrap();
        positions.insert(confirmation.queue_entry.position);
    }

    let expected: HashSet<u32> = (1..=n).collect();
    assert_eq!(positions, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_confirmations_issue_one_ticket() {
    let setup = TestSetup::new().await;
    let consultation_id = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap().id;

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let lifecycle = setup.lifecycle.clone();
            tokio::spawn(async move { lifecycle.confirm_payment(consultation_id).await })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|c| !c.already_confirmed).count(), 1);
    assert_eq!(setup.queue_len().await, 1);
}

#[tokio::test]
async fn test_confirm_missing_consultation_is_not_found() {
    let setup = TestSetup::new().await;

    assert_matches!(
        setup.lifecycle.confirm_payment(Uuid::new_v4()).await,
        Err(ConsultationError::NotFound { entity: "consultation", .. })
    );
}

#[tokio::test]
async fn test_completed_consultation_cannot_be_paid_again() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();
    setup.lifecycle.confirm_payment(consultation.id).await.unwrap();
    setup.lifecycle.complete_consultation(consultation.id).await.unwrap();

    assert_matches!(
        setup.lifecycle.confirm_payment(consultation.id).await,
        Err(ConsultationError::InvalidState { from, .. }) if from == "COMPLETED"
    );

    let reread = setup.lifecycle.get_consultation(consultation.id).await.unwrap();
    assert_eq!(reread.status, ConsultationStatus::Completed);
    assert_eq!(setup.queue_len().await, 1);
}

// ==============================================================================
// CALLING AND COMPLETING
// ==============================================================================

#[tokio::test]
async fn test_call_next_marks_entry_ready() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();
    let confirmation = setup.lifecycle.confirm_payment(consultation.id).await.unwrap();

    let called = setup.lifecycle.call_next(confirmation.queue_entry.id).await.unwrap();

    assert_eq!(called.status, QueueStatus::Ready);
    assert!(called.called_at.is_some());
    assert_eq!(called.position, confirmation.queue_entry.position);
}

#[tokio::test]
async fn test_call_next_on_ready_entry_fails_without_mutation() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();
    let confirmation = setup.lifecycle.confirm_payment(consultation.id).await.unwrap();
    let called = setup.lifecycle.call_next(confirmation.queue_entry.id).await.unwrap();

    assert_matches!(
        setup.lifecycle.call_next(confirmation.queue_entry.id).await,
        Err(ConsultationError::InvalidState { from, .. }) if from == "READY"
    );

    let entry = setup.store.get_queue_entry(called.id).await.unwrap().unwrap();
    assert_eq!(entry.called_at, called.called_at);
}

#[tokio::test]
async fn test_call_next_on_missing_entry_is_not_found() {
    let setup = TestSetup::new().await;

    assert_matches!(
        setup.lifecycle.call_next(Uuid::new_v4()).await,
        Err(ConsultationError::NotFound { .. })
    );
    assert_eq!(setup.queue_len().await, 0);
}

#[tokio::test]
async fn test_call_next_waiting_serves_lowest_ticket_and_live_rank_moves() {
    let setup = TestSetup::new().await;
    let mut entries = Vec::new();
    for i in 0..3 {
        let c = setup.lifecycle.create_consultation(setup.request(&format!("pay-{}", i))).await.unwrap();
        entries.push(setup.lifecycle.confirm_payment(c.id).await.unwrap());
    }

    let before = setup.lifecycle.queue_status(entries[2].consultation.id).await.unwrap().unwrap();
    assert_eq!(before.live_rank, 2);
    assert_eq!(before.live_wait_minutes, 15);

    let called = setup.lifecycle.call_next_waiting(None).await.unwrap();
    assert_eq!(called.position, 1);

    let after = setup.lifecycle.queue_status(entries[2].consultation.id).await.unwrap().unwrap();
    assert_eq!(after.live_rank, 1);
    assert_eq!(after.entry.position, 3);
    assert_eq!(after.entry.estimated_wait_minutes, 15);

    let waiting = setup.lifecycle.waiting_queue(None).await.unwrap();
    let positions: Vec<u32> = waiting.iter().map(|v| v.entry.position).collect();
    assert_eq!(positions, vec![2, 3]);
}

#[tokio::test]
async fn test_call_next_waiting_on_empty_queue_is_not_found() {
    let setup = TestSetup::new().await;

    assert_matches!(
        setup.lifecycle.call_next_waiting(None).await,
        Err(ConsultationError::NotFound { .. })
    );
}

#[tokio::test]
async fn test_complete_requires_payment() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();

    assert_matches!(
        setup.lifecycle.complete_consultation(consultation.id).await,
        Err(ConsultationError::InvalidState { from, to, .. }) if from == "PENDING" && to == "COMPLETED"
    );
}

#[tokio::test]
async fn test_complete_leaves_queue_entry_untouched() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();
    let confirmation = setup.lifecycle.confirm_payment(consultation.id).await.unwrap();

    let completed = setup.lifecycle.complete_consultation(consultation.id).await.unwrap();

    assert_eq!(completed.status, ConsultationStatus::Completed);
    assert_eq!(completed.paid_at, confirmation.consultation.paid_at);
    let entry = setup.store.get_queue_entry(confirmation.queue_entry.id).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Waiting);
}

// ==============================================================================
// EXPIRY
// ==============================================================================

#[tokio::test]
async fn test_expired_consultation_rejects_late_payment() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();

    let expired = setup.lifecycle.expire_consultation(consultation.id).await.unwrap();
    assert_eq!(expired.status, ConsultationStatus::Expired);

    assert_matches!(
        setup.lifecycle.confirm_payment(consultation.id).await,
        Err(ConsultationError::InvalidState { from, .. }) if from == "EXPIRED"
    );
    assert_eq!(setup.queue_len().await, 0);
}

#[tokio::test]
async fn test_paid_consultation_cannot_expire() {
    let setup = TestSetup::new().await;
    let consultation = setup.lifecycle.create_consultation(setup.request("pay-1")).await.unwrap();
    setup.lifecycle.confirm_payment(consultation.id).await.unwrap();

    assert_matches!(
        setup.lifecycle.expire_consultation(consultation.id).await,
        Err(ConsultationError::InvalidState { .. })
    );
}

#[tokio::test]
async fn test_expire_stale_only_touches_old_pending_consultations() {
    let setup = TestSetup::new().await;
    let stale = setup.lifecycle.create_consultation(setup.request("pay-old")).await.unwrap();
    let paid = setup.lifecycle.create_consultation(setup.request("pay-paid")).await.unwrap();
    setup.lifecycle.confirm_payment(paid.id).await.unwrap();

    // Nothing is old enough yet
    let none = setup.lifecycle.expire_stale_consultations(Utc::now()).await.unwrap();
    assert!(none.is_empty());

    let later = Utc::now() + Duration::minutes(31);
    let expired = setup.lifecycle.expire_stale_consultations(later).await.unwrap();

    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, stale.id);
    assert_eq!(
        setup.lifecycle.get_consultation(paid.id).await.unwrap().status,
        ConsultationStatus::Paid
    );
}

// ==============================================================================
// READS
// ==============================================================================

#[tokio::test]
async fn test_consultations_for_user_include_queue_view() {
    let setup = TestSetup::new().await;
    let request = setup.request("pay-1");
    let patient_id = request.patient_id;
    let consultation = setup.lifecycle.create_consultation(request).await.unwrap();
    setup.lifecycle.confirm_payment(consultation.id).await.unwrap();

    let views = setup.lifecycle.consultations_for_user(patient_id).await.unwrap();

    assert_eq!(views.len(), 1);
    let queue = views[0].queue.as_ref().unwrap();
    assert_eq!(queue.entry.position, 1);
    assert_eq!(queue.live_rank, 0);

    let stranger = setup.lifecycle.consultations_for_user(Uuid::new_v4()).await.unwrap();
    assert!(stranger.is_empty());
}
