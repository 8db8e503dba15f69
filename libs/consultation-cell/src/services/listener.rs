use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ConsultationError;
use crate::models::{
    ChangeEvent, ChangeEventType, ChangeRecord, Consultation, ConsultationStatus, ListenerSignal,
    QueueEntry, QueueStatus,
};
use crate::services::store::{ConsultationFilter, ConsultationStore, QueueFilter};

/// One user's consultations and queue entries, as last read from the store.
#[derive(Debug, Clone, Default)]
pub struct UserProjection {
    pub consultations: HashMap<Uuid, Consultation>,
    pub queue_entries: HashMap<Uuid, QueueEntry>,
}

/// Read-only projector of a single user's rows. Emits a signal when a
/// consultation becomes PAID or a queue entry becomes READY.
pub struct ConsultationChangeListener {
    store: Arc<dyn ConsultationStore>,
    user_id: Uuid,
    /// `None` until the first read establishes a baseline.
    projection: RwLock<Option<UserProjection>>,
    signals: broadcast::Sender<ListenerSignal>,
}

impl ConsultationChangeListener {
    pub fn new(store: Arc<dyn ConsultationStore>, user_id: Uuid) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            store,
            user_id,
            projection: RwLock::new(None),
            signals,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerSignal> {
        self.signals.subscribe()
    }

    pub async fn snapshot(&self) -> UserProjection {
        self.projection.read().await.clone().unwrap_or_default()
    }

    pub async fn reload(&self) -> Result<UserProjection, ConsultationError> {
        let fresh = self.read_user_rows().await?;
        *self.projection.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// Apply one pushed change event. Events for other users are dropped.
    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<Option<ListenerSignal>, ConsultationError> {
        if event.user_id() != self.user_id {
            return Ok(None);
        }

        let signal = signal_for(event);
        self.reload().await?;

        if let Some(signal) = &signal {
            self.emit(signal.clone());
        }
        Ok(signal)
    }

    /// Diff a fresh read against the projection, for stores without a push feed.
    /// The first read only takes the baseline.
    pub async fn poll_once(&self) -> Result<Vec<ListenerSignal>, ConsultationError> {
        let fresh = self.read_user_rows().await?;
        let mut projection = self.projection.write().await;

        let Some(previous) = projection.take() else {
            *projection = Some(fresh);
            return Ok(Vec::new());
        };

        // Rows unseen since the baseline may have been created and advanced
        // between two reads, so they are diffed as updates from nothing.
        let mut signals = Vec::new();
        for consultation in fresh.consultations.values() {
            let event = ChangeEvent {
                event_type: ChangeEventType::Update,
                record: ChangeRecord::Consultation {
                    old: previous.consultations.get(&consultation.id).cloned(),
                    new: consultation.clone(),
                },
            };
            signals.extend(signal_for(&event));
        }
        for entry in fresh.queue_entries.values() {
            let event = ChangeEvent {
                event_type: ChangeEventType::Update,
                record: ChangeRecord::QueueEntry {
                    old: previous.queue_entries.get(&entry.id).cloned(),
                    new: entry.clone(),
                },
            };
            signals.extend(signal_for(&event));
        }

        *projection = Some(fresh);
        drop(projection);

        for signal in &signals {
            self.emit(signal.clone());
        }
        Ok(signals)
    }

    /// Run the listener in the background: push when the store has a feed,
    /// otherwise poll on `poll_interval`.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> ListenerHandle {
        let task = tokio::spawn(async move {
            if let Err(e) = self.reload().await {
                warn!("Initial load for user {} failed: {}", self.user_id, e);
            }

            match self.store.change_feed() {
                Some(feed) => self.run_push(feed).await,
                None => self.run_poll(poll_interval).await,
            }
        });

        ListenerHandle { task }
    }

    async fn run_push(&self, mut feed: broadcast::Receiver<ChangeEvent>) {
        debug!("Listening for pushed changes for user {}", self.user_id);
        loop {
            match feed.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle_event(&event).await {
                        warn!("Failed to apply change for user {}: {}", self.user_id, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Listener for user {} lagged by {} events, resyncing", self.user_id, skipped);
                    if let Err(e) = self.poll_once().await {
                        warn!("Resync for user {} failed: {}", self.user_id, e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Change feed closed, listener for user {} stopping", self.user_id);
                    break;
                }
            }
        }
    }

    async fn run_poll(&self, poll_interval: Duration) {
        debug!("Polling changes for user {} every {:?}", self.user_id, poll_interval);
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.poll_once().await {
                warn!("Poll for user {} failed: {}", self.user_id, e);
            }
        }
    }

    async fn read_user_rows(&self) -> Result<UserProjection, ConsultationError> {
        let consultations = self
            .store
            .list_consultations(&ConsultationFilter::for_user(self.user_id))
            .await?;
        let queue_entries = self
            .store
            .list_queue_entries(&QueueFilter::for_user(self.user_id))
            .await?;

        Ok(UserProjection {
            consultations: consultations.into_iter().map(|c| (c.id, c)).collect(),
            queue_entries: queue_entries.into_iter().map(|e| (e.id, e)).collect(),
        })
    }

    fn emit(&self, signal: ListenerSignal) {
        if self.signals.send(signal).is_err() {
            debug!("No subscribers for user {} signals", self.user_id);
        }
    }
}

/// Signal raised by a change, if any. Only edges count: a row that was
/// already PAID or READY before the change raises nothing. An update with
/// no previous row counts as an edge from PENDING or WAITING.
pub fn signal_for(event: &ChangeEvent) -> Option<ListenerSignal> {
    match &event.record {
        ChangeRecord::Consultation { old, new } => {
            let was_paid = old.as_ref().map_or(false, |o| o.status == ConsultationStatus::Paid);
            (event.event_type == ChangeEventType::Update
                && new.status == ConsultationStatus::Paid
                && !was_paid)
                .then(|| ListenerSignal::PaymentApproved { consultation_id: new.id })
        }
        ChangeRecord::QueueEntry { old, new } => {
            let was_ready = old.as_ref().map_or(false, |o| o.status == QueueStatus::Ready);
            (event.event_type == ChangeEventType::Update
                && new.status == QueueStatus::Ready
                && !was_ready)
                .then(|| ListenerSignal::ReadyForConsultation {
                    consultation_id: new.consultation_id,
                    queue_entry_id: new.id,
                })
        }
    }
}

/// Stops the background listener when dropped.
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
