use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::context::ConsultationContext;
use crate::handlers::{
    call_next_waiting, call_queue_entry, complete_consultation, confirm_consultation_payment,
    consultation_events, create_consultation, expire_consultation, get_consultation,
    get_consultation_queue, get_waiting_queue, list_my_consultations, payment_webhook,
    payment_webhook_status,
};

pub fn create_consultation_router(ctx: ConsultationContext) -> Router {
    let protected_routes = Router::new()
        .route("/consultations", post(create_consultation).get(list_my_consultations))
        .route("/consultations/events", get(consultation_events))
        .route("/consultations/{id}", get(get_consultation))
        .route("/consultations/{id}/queue", get(get_consultation_queue))
        .route("/consultations/{id}/confirm-payment", post(confirm_consultation_payment))
        .route("/consultations/{id}/expire", post(expire_consultation))
        .route("/consultations/{id}/complete", post(complete_consultation))
        .route("/queue", get(get_waiting_queue))
        .route("/queue/call-next", post(call_next_waiting))
        .route("/queue/{entry_id}/call", post(call_queue_entry))
        .layer(middleware::from_fn_with_state(ctx.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(ctx)
}

/// Public: the payment provider cannot send a user token.
pub fn create_payment_webhook_router(ctx: ConsultationContext) -> Router {
    Router::new()
        .route("/webhooks/payment", get(payment_webhook_status).post(payment_webhook))
        .with_state(ctx)
}
