use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    Extension,
};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared_config::PaymentMode;
use shared_models::{auth::User, error::AppError};
use shared_utils::extractor::require_role;

use crate::context::ConsultationContext;
use crate::error::ConsultationError;
use crate::models::{
    Consultation, CreateConsultationRequest, PaymentConfirmation, PaymentNotification, QueueEntry,
};
use crate::services::ConsultationChangeListener;

const ROLE_ADMIN: &str = "admin";
const ROLE_DOCTOR: &str = "doctor";

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub specialty_id: Option<Uuid>,
}

fn user_uuid(user: &User) -> Result<Uuid, AppError> {
    Uuid::parse_str(&user.id).map_err(|_| AppError::Auth("Token subject is not a valid user id".to_string()))
}

/// Patients see their own consultations; staff see every consultation.
fn ensure_can_view(user: &User, consultation: &Consultation) -> Result<(), AppError> {
    if user.has_any_role(&[ROLE_ADMIN, ROLE_DOCTOR]) || user_uuid(user)? == consultation.user_id {
        Ok(())
    } else {
        Err(AppError::Forbidden("Consultation belongs to another user".to_string()))
    }
}

// ==============================================================================
// PATIENT ENDPOINTS
// ==============================================================================

/// Book a consultation for the caller and start its payment.
pub async fn create_consultation(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateConsultationRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let patient_id = user_uuid(&user)?;
    info!("Consultation request from user {} for specialty {}", patient_id, request.specialty_id);

    let payment_reference = match (&request.payment_reference, ctx.config.payment_mode) {
        (Some(reference), _) => reference.clone(),
        (None, PaymentMode::Simulated) => format!("sim-{}", Uuid::new_v4()),
        (None, PaymentMode::Webhook) => {
            return Err(AppError::ValidationError(
                "payment_reference is required in webhook mode".to_string(),
            ));
        }
    };

    let consultation = ctx
        .lifecycle
        .create_consultation(request.into_new_consultation(patient_id, payment_reference))
        .await?;

    let payment_mode = match ctx.config.payment_mode {
        PaymentMode::Simulated => {
            ctx.simulator.schedule(&consultation.payment_id).await;
            "simulated"
        }
        PaymentMode::Webhook => "webhook",
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "consultation": consultation,
            "payment_mode": payment_mode,
        })),
    ))
}

/// List the caller's consultations with their queue tickets.
pub async fn list_my_consultations(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let views = ctx.lifecycle.consultations_for_user(user_uuid(&user)?).await?;

    Ok(Json(json!({
        "consultations": views,
        "count": views.len(),
    })))
}

/// Get one consultation by id.
pub async fn get_consultation(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<Consultation>, AppError> {
    let consultation = ctx.lifecycle.get_consultation(consultation_id).await?;
    ensure_can_view(&user, &consultation)?;
    Ok(Json(consultation))
}

/// Live queue position and wait for a consultation.
pub async fn get_consultation_queue(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let consultation = ctx.lifecycle.get_consultation(consultation_id).await?;
    ensure_can_view(&user, &consultation)?;

    let queue = ctx
        .lifecycle
        .queue_status(consultation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Consultation {} is not queued", consultation_id)))?;

    Ok(Json(json!({
        "consultation_status": consultation.status,
        "queue": queue,
    })))
}

/// Abandon an unpaid consultation.
pub async fn expire_consultation(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<Consultation>, AppError> {
    let consultation = ctx.lifecycle.get_consultation(consultation_id).await?;
    if !user.has_any_role(&[ROLE_ADMIN]) && user_uuid(&user)? != consultation.user_id {
        return Err(AppError::Forbidden("Only the owner can abandon a consultation".to_string()));
    }

    let expired = ctx.lifecycle.expire_consultation(consultation_id).await?;
    ctx.simulator.cancel(&expired.payment_id).await;

    Ok(Json(expired))
}

/// Stream "payment approved" and "ready for consultation" signals for the caller.
pub async fn consultation_events(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let user_id = user_uuid(&user)?;
    debug!("Opening consultation event stream for user {}", user_id);

    let listener = Arc::new(ConsultationChangeListener::new(ctx.store(), user_id));
    let signals = listener.subscribe();
    let handle = listener.spawn(ctx.poll_interval());

    // The handle lives in the stream state, so the listener stops with the connection
    let events = stream::unfold((signals, handle), |(mut signals, handle)| async move {
        loop {
            match signals.recv().await {
                Ok(signal) => {
                    let event = Event::default().event(signal.event_name()).json_data(&signal);
                    return Some((event, (signals, handle)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event stream skipped {} signals", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ==============================================================================
// STAFF ENDPOINTS
// ==============================================================================

/// Manual reconciliation of a payment the provider never reported.
pub async fn confirm_consultation_payment(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<PaymentConfirmation>, AppError> {
    require_role(&user, &[ROLE_ADMIN])?;
    info!("Manual payment confirmation for consultation {} by {}", consultation_id, user.id);

    let confirmation = ctx.lifecycle.confirm_payment(consultation_id).await?;
    ctx.simulator.cancel(&confirmation.consultation.payment_id).await;

    Ok(Json(confirmation))
}

/// Close a paid consultation once the doctor is done.
pub async fn complete_consultation(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<Consultation>, AppError> {
    require_role(&user, &[ROLE_DOCTOR, ROLE_ADMIN])?;
    let completed = ctx.lifecycle.complete_consultation(consultation_id).await?;
    Ok(Json(completed))
}

/// Waiting tickets in call order, optionally for one specialty.
pub async fn get_waiting_queue(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Value>, AppError> {
    require_role(&user, &[ROLE_DOCTOR, ROLE_ADMIN])?;
    let waiting = ctx.lifecycle.waiting_queue(query.specialty_id).await?;

    Ok(Json(json!({
        "waiting": waiting,
        "count": waiting.len(),
    })))
}

/// Call the lowest waiting ticket.
pub async fn call_next_waiting(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<QueueEntry>, AppError> {
    require_role(&user, &[ROLE_DOCTOR, ROLE_ADMIN])?;
    let called = ctx.lifecycle.call_next_waiting(query.specialty_id).await?;
    Ok(Json(called))
}

/// Call a specific queue ticket.
pub async fn call_queue_entry(
    State(ctx): State<ConsultationContext>,
    Extension(user): Extension<User>,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<QueueEntry>, AppError> {
    require_role(&user, &[ROLE_DOCTOR, ROLE_ADMIN])?;
    let called = ctx.lifecycle.call_next(entry_id).await?;
    Ok(Json(called))
}

// ==============================================================================
// PAYMENT PROVIDER WEBHOOK
// ==============================================================================

/// Health check for the payment provider.
pub async fn payment_webhook_status() -> Json<Value> {
    Json(json!({
        "status": "Webhook is running",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Provider callback. Anything other than an internal failure is answered
/// with 200 so the provider stops retrying.
pub async fn payment_webhook(
    State(ctx): State<ConsultationContext>,
    payload: Result<Json<PaymentNotification>, JsonRejection>,
) -> Response {
    let Json(notification) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!("Malformed payment notification: {}", rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(json!({ "status": "INVALID" }))).into_response();
        }
    };

    if !notification.is_payment_update() {
        debug!(
            "Ignoring notification type={:?} action={:?}",
            notification.notification_type, notification.action
        );
        return (StatusCode::OK, Json(json!({ "status": "OK" }))).into_response();
    }

    let Some(reference) = notification.payment_reference() else {
        warn!("Payment notification without a payment id");
        return (StatusCode::OK, Json(json!({ "status": "OK" }))).into_response();
    };

    info!("Payment notification for reference {}", reference);

    match ctx.payments.on_payment_confirmed(&reference).await {
        Ok(_) => {
            ctx.simulator.cancel(&reference).await;
            (StatusCode::OK, Json(json!({ "status": "OK" }))).into_response()
        }
        Err(ConsultationError::InvalidState { from, .. }) => {
            error!("Payment {} reported for a consultation already {}", reference, from);
            (StatusCode::OK, Json(json!({ "status": "IGNORED" }))).into_response()
        }
        Err(e) => {
            error!("Payment notification {} failed: {}", reference, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "status": "ERROR" }))).into_response()
        }
    }
}
