use std::sync::Arc;

use tokio::time::Duration;
use tracing::info;

use shared_config::{AppConfig, StoreBackend};

use crate::services::{
    local_specialties, ConsultationLifecycleService, ConsultationStore, InMemoryConsultationStore, LifecycleRules,
    PaymentConfirmationAdapter, PaymentConfirmationHandler, PaymentSimulator, SupabaseConsultationStore,
};

/// Everything the consultation handlers and background tasks share. Built
/// once at startup and handed to the router as state.
#[derive(Clone)]
pub struct ConsultationContext {
    pub config: Arc<AppConfig>,
    pub lifecycle: Arc<ConsultationLifecycleService>,
    pub payments: Arc<dyn PaymentConfirmationHandler>,
    pub simulator: Arc<PaymentSimulator>,
}

impl ConsultationContext {
    pub fn new(config: Arc<AppConfig>, store: Arc<dyn ConsultationStore>) -> Self {
        let lifecycle = Arc::new(ConsultationLifecycleService::new(
            store,
            LifecycleRules::from_config(&config),
        ));
        let payments: Arc<dyn PaymentConfirmationHandler> =
            Arc::new(PaymentConfirmationAdapter::new(Arc::clone(&lifecycle)));
        let simulator = Arc::new(PaymentSimulator::new(
            Arc::clone(&payments),
            Duration::from_secs(config.payment_simulation_delay_seconds),
        ));

        Self {
            config,
            lifecycle,
            payments,
            simulator,
        }
    }

    /// Pick the store named by `STORE_BACKEND`.
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        let store: Arc<dyn ConsultationStore> = match config.store_backend {
            StoreBackend::Supabase => {
                info!("Using Supabase consultation store at {}", config.supabase_url);
                Arc::new(SupabaseConsultationStore::new(&config))
            }
            StoreBackend::Memory => {
                info!("Using in-memory consultation store");
                Arc::new(InMemoryConsultationStore::with_specialties(local_specialties()))
            }
        };

        Self::new(config, store)
    }

    pub fn store(&self) -> Arc<dyn ConsultationStore> {
        self.lifecycle.store()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.change_poll_interval_seconds.max(1))
    }
}
