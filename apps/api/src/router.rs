use axum::{
    Router,
    routing::get,
};

use consultation_cell::{
    create_consultation_router, create_payment_webhook_router, ConsultationContext,
};

pub fn create_router(ctx: ConsultationContext) -> Router {
    Router::new()
        .route("/", get(|| async { "TeleMed consultation API is running!" }))
        .merge(create_payment_webhook_router(ctx.clone()))
        .merge(create_consultation_router(ctx))
}
