pub mod models;
pub mod services;
pub mod error;
pub mod context;
pub mod handlers;
pub mod router;

pub use models::*;
pub use error::*;
pub use services::*;
pub use context::ConsultationContext;
pub use router::{create_consultation_router, create_payment_webhook_router};
