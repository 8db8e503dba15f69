use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ConsultationError;
use crate::models::PaymentConfirmation;
use crate::services::lifecycle::ConsultationLifecycleService;

/// Entry point shared by the payment simulator and the provider webhook.
#[async_trait]
pub trait PaymentConfirmationHandler: Send + Sync {
    /// `Ok(None)` when no consultation carries the reference.
    async fn on_payment_confirmed(
        &self,
        payment_reference: &str,
    ) -> Result<Option<PaymentConfirmation>, ConsultationError>;
}

pub struct PaymentConfirmationAdapter {
    lifecycle: Arc<ConsultationLifecycleService>,
}

impl PaymentConfirmationAdapter {
    pub fn new(lifecycle: Arc<ConsultationLifecycleService>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl PaymentConfirmationHandler for PaymentConfirmationAdapter {
    #[instrument(skip(self))]
    async fn on_payment_confirmed(
        &self,
        payment_reference: &str,
    ) -> Result<Option<PaymentConfirmation>, ConsultationError> {
        let consultation = match self.lifecycle.find_by_payment_reference(payment_reference).await {
            Ok(consultation) => consultation,
            Err(e) if e.is_not_found() => {
                warn!("No consultation found for payment reference {}, ignoring", payment_reference);
                return Ok(None);
            }
            Err(e) => {
                error!("Lookup for payment reference {} failed: {}", payment_reference, e);
                return Err(e);
            }
        };

        match self.lifecycle.confirm_payment(consultation.id).await {
            Ok(confirmation) => Ok(Some(confirmation)),
            Err(e) if e.is_not_found() => {
                warn!("Consultation for payment reference {} vanished before confirmation", payment_reference);
                Ok(None)
            }
            Err(e) => {
                error!("Payment confirmation for reference {} failed: {}", payment_reference, e);
                Err(e)
            }
        }
    }
}

/// Confirms payments a fixed delay after they are scheduled. Each reference
/// has at most one pending confirmation, which can be cancelled.
pub struct PaymentSimulator {
    handler: Arc<dyn PaymentConfirmationHandler>,
    delay: Duration,
    pending: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl PaymentSimulator {
    pub fn new(handler: Arc<dyn PaymentConfirmationHandler>, delay: Duration) -> Self {
        Self {
            handler,
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn schedule(&self, payment_reference: &str) {
        let reference = payment_reference.to_string();
        let handler = Arc::clone(&self.handler);
        let pending = Arc::clone(&self.pending);
        let delay = self.delay;

        let mut tasks = self.pending.lock().await;

        let task_reference = reference.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Deregister first so a late cancel cannot abort the confirmation mid-write
            pending.lock().await.remove(&task_reference);

            match handler.on_payment_confirmed(&task_reference).await {
                Ok(Some(confirmation)) => info!(
                    "Simulated payment {} confirmed, ticket {}",
                    task_reference, confirmation.queue_entry.position
                ),
                Ok(None) => debug!("Simulated payment {} matched no consultation", task_reference),
                Err(e) => warn!("Simulated payment {} not applied: {}", task_reference, e),
            }
        });

        if let Some(previous) = tasks.insert(reference.clone(), handle) {
            previous.abort();
            debug!("Rescheduled simulated payment {}", reference);
        } else {
            debug!("Simulated payment {} scheduled in {:?}", reference, delay);
        }
    }

    /// Returns true when a pending confirmation was aborted.
    pub async fn cancel(&self, payment_reference: &str) -> bool {
        match self.pending.lock().await.remove(payment_reference) {
            Some(handle) => {
                handle.abort();
                info!("Cancelled simulated payment {}", payment_reference);
                true
            }
            None => false,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Drop for PaymentSimulator {
    fn drop(&mut self) {
        if let Ok(tasks) = self.pending.try_lock() {
            for handle in tasks.values() {
                handle.abort();
            }
        }
    }
}
