use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::{Order, RowQuery, SupabaseApiError, SupabaseClient};

use crate::error::ConsultationError;
use crate::models::{
    ChangeEvent, Consultation, ConsultationStatus, QueueEntry, QueueStatus, Specialty,
};
use crate::services::store::{ConsultationFilter, ConsultationStore, PaymentTransition, QueueFilter};

const SPECIALTIES_TABLE: &str = "specialties";
const CONSULTATIONS_TABLE: &str = "consultations";
const QUEUE_TABLE: &str = "consultation_queue";
const CONFIRM_PAYMENT_FUNCTION: &str = "confirm_consultation_payment";

/// Result row of the `confirm_consultation_payment` Postgres function.
#[derive(Debug, Deserialize)]
struct ConfirmPaymentRow {
    outcome: String,
    status: Option<ConsultationStatus>,
    consultation: Option<Consultation>,
    queue_entry: Option<QueueEntry>,
}

impl ConfirmPaymentRow {
    fn into_transition(self) -> Result<PaymentTransition, ConsultationError> {
        match (self.outcome.as_str(), self.consultation, self.queue_entry) {
            ("applied", Some(consultation), Some(queue_entry)) => {
                Ok(PaymentTransition::Applied { consultation, queue_entry })
            }
            ("already_applied", Some(consultation), Some(queue_entry)) => {
                Ok(PaymentTransition::AlreadyApplied { consultation, queue_entry })
            }
            ("rejected", _, _) => match self.status {
                Some(current) => Ok(PaymentTransition::Rejected { current }),
                None => Err(ConsultationError::Store(
                    "Payment confirmation rejected without a status".to_string(),
                )),
            },
            ("missing", _, _) => Ok(PaymentTransition::Missing),
            (outcome, _, _) => Err(ConsultationError::Store(format!(
                "Unexpected payment confirmation outcome: {}", outcome
            ))),
        }
    }
}

/// Store backed by Supabase's PostgREST API, authenticated with the
/// service-role key. Supabase realtime is not consumed here, so there is no
/// push feed and listeners fall back to polling.
pub struct SupabaseConsultationStore {
    client: SupabaseClient,
    service_key: String,
}

impl SupabaseConsultationStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: SupabaseClient::new(config),
            service_key: config.service_key().to_string(),
        }
    }

    fn auth(&self) -> Option<&str> {
        if self.service_key.is_empty() {
            None
        } else {
            Some(&self.service_key)
        }
    }

    async fn first<T>(&self, query: RowQuery) -> Result<Option<T>, ConsultationError>
    where
        T: serde::de::DeserializeOwned,
    {
        let rows: Vec<T> = self.client
            .select(&query.limit(1), self.auth())
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().next())
    }
}

fn store_error(error: anyhow::Error) -> ConsultationError {
    match error.downcast_ref::<SupabaseApiError>() {
        Some(api_error) if api_error.is_conflict() => {
            warn!("Conflicting write rejected by store: {}", api_error.body);
            ConsultationError::Store(format!("Conflicting row: {}", api_error.body))
        }
        _ => ConsultationError::Store(error.to_string()),
    }
}

#[async_trait]
impl ConsultationStore for SupabaseConsultationStore {
    async fn get_specialty(&self, id: Uuid) -> Result<Option<Specialty>, ConsultationError> {
        self.first(RowQuery::table(SPECIALTIES_TABLE).eq("id", id)).await
    }

    async fn insert_consultation(&self, consultation: &Consultation) -> Result<Consultation, ConsultationError> {
        let row = serde_json::to_value(consultation)?;
        self.client
            .insert(CONSULTATIONS_TABLE, row, self.auth())
            .await
            .map_err(store_error)
    }

    async fn get_consultation(&self, id: Uuid) -> Result<Option<Consultation>, ConsultationError> {
        self.first(RowQuery::table(CONSULTATIONS_TABLE).eq("id", id)).await
    }

    async fn find_consultation_by_payment_id(&self, payment_id: &str) -> Result<Option<Consultation>, ConsultationError> {
        self.first(RowQuery::table(CONSULTATIONS_TABLE).eq("payment_id", payment_id)).await
    }

    async fn list_consultations(&self, filter: &ConsultationFilter) -> Result<Vec<Consultation>, ConsultationError> {
        let mut query = RowQuery::table(CONSULTATIONS_TABLE);
        if let Some(user_id) = filter.user_id {
            query = query.eq("user_id", user_id);
        }
        if let Some(status) = filter.status {
            query = query.eq("status", status.as_str());
        }
        if let Some(cutoff) = filter.created_before {
            query = query.lt("created_at", cutoff.to_rfc3339());
        }

        self.client
            .select(&query.order("created_at", Order::Desc), self.auth())
            .await
            .map_err(store_error)
    }

    async fn update_consultation_status(
        &self,
        id: Uuid,
        expected: ConsultationStatus,
        next: ConsultationStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Consultation>, ConsultationError> {
        let query = RowQuery::table(CONSULTATIONS_TABLE)
            .eq("id", id)
            .eq("status", expected.as_str());

        let rows: Vec<Consultation> = self.client
            .update(&query, json!({ "status": next, "updated_at": now }), self.auth())
            .await
            .map_err(store_error)?;

        debug!("Consultation {} {} -> {} updated {} row(s)", id, expected, next, rows.len());
        Ok(rows.into_iter().next())
    }

    async fn confirm_payment(
        &self,
        consultation_id: Uuid,
        now: DateTime<Utc>,
        slot_minutes: u32,
    ) -> Result<PaymentTransition, ConsultationError> {
        let args = json!({
            "p_consultation_id": consultation_id,
            "p_paid_at": now,
            "p_slot_minutes": slot_minutes,
        });

        let row: ConfirmPaymentRow = self.client
            .rpc(CONFIRM_PAYMENT_FUNCTION, args, self.auth())
            .await
            .map_err(store_error)?;

        row.into_transition()
    }

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>, ConsultationError> {
        self.first(RowQuery::table(QUEUE_TABLE).eq("id", id)).await
    }

    async fn find_queue_entry_for_consultation(&self, consultation_id: Uuid) -> Result<Option<QueueEntry>, ConsultationError> {
        self.first(RowQuery::table(QUEUE_TABLE).eq("consultation_id", consultation_id)).await
    }

    async fn list_queue_entries(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>, ConsultationError> {
        let mut query = RowQuery::table(QUEUE_TABLE);
        if let Some(user_id) = filter.user_id {
            query = query.eq("user_id", user_id);
        }
        if let Some(specialty_id) = filter.specialty_id {
            query = query.eq("specialty_id", specialty_id);
        }
        if let Some(status) = filter.status {
            query = query.eq("status", status.as_str());
        }

        self.client
            .select(&query.order("position", Order::Asc), self.auth())
            .await
            .map_err(store_error)
    }

    async fn mark_queue_entry_ready(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueEntry>, ConsultationError> {
        let query = RowQuery::table(QUEUE_TABLE)
            .eq("id", id)
            .eq("status", QueueStatus::Waiting.as_str());

        let rows: Vec<QueueEntry> = self.client
            .update(&query, json!({ "status": QueueStatus::Ready, "called_at": now }), self.auth())
            .await
            .map_err(store_error)?;

        Ok(rows.into_iter().next())
    }

    fn change_feed(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}
