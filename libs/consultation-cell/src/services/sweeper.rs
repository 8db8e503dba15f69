use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::services::lifecycle::ConsultationLifecycleService;
use crate::services::payment::PaymentSimulator;

/// Periodically expire unpaid consultations and drop their simulated payments.
pub fn spawn_expiry_sweeper(
    lifecycle: Arc<ConsultationLifecycleService>,
    simulator: Arc<PaymentSimulator>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Expiry sweeper started: every {:?}, timeout {} min",
            interval,
            lifecycle.rules().pending_payment_timeout_minutes
        );
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            sweep_once(&lifecycle, &simulator).await;
        }
    })
}

/// One sweep; returns how many consultations were expired.
pub async fn sweep_once(lifecycle: &ConsultationLifecycleService, simulator: &PaymentSimulator) -> usize {
    match lifecycle.expire_stale_consultations(Utc::now()).await {
        Ok(expired) => {
            for consultation in &expired {
                simulator.cancel(&consultation.payment_id).await;
            }
            debug!("Expiry sweep finished, {} expired", expired.len());
            expired.len()
        }
        Err(e) => {
            warn!("Expiry sweep failed: {}", e);
            0
        }
    }
}
