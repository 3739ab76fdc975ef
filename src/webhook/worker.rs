use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::{DropReason, Interpretation, WebhookOutcome, interpret};
use crate::ledger::{CreditOutcome, LedgerService};
use crate::stripe::WebhookEvent;

/// Event ids whose credit is already settled (applied or duplicate).
pub type RecentEvents = Cache<String, ()>;

pub fn recent_events_cache(capacity: u64, ttl: Duration) -> RecentEvents {
    assert!(capacity > 0, "Recent events capacity must be positive");
    Cache::builder()
        .max_capacity(capacity)
        .time_to_live(ttl)
        .build()
}

#[derive(Debug, Clone, Copy)]
pub struct WebhookSettings {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl WebhookSettings {
    pub fn new(max_attempts: u32, retry_backoff: Duration) -> Self {
        assert!(max_attempts > 0, "At least one attempt is required");
        assert!(max_attempts <= 20, "Retry attempts exceed bound");
        Self {
            max_attempts,
            retry_backoff,
        }
    }
}

/// Applies one event to the ledger, retrying storage failures.
#[derive(Clone)]
pub struct WebhookProcessor {
    ledger: LedgerService,
    recent: RecentEvents,
    settings: WebhookSettings,
}

impl WebhookProcessor {
    pub fn new(ledger: LedgerService, recent: RecentEvents, settings: WebhookSettings) -> Self {
        Self {
            ledger,
            recent,
            settings,
        }
    }

    pub fn is_settled(&self, event_id: &str) -> bool {
        self.recent.contains_key(event_id)
    }

    pub fn recent_events(&self) -> &RecentEvents {
        &self.recent
    }

    pub async fn process_event(&self, event: WebhookEvent) -> WebhookOutcome {
        let instruction = match interpret(&event) {
            Interpretation::Credit(instruction) => instruction,
            Interpretation::Drop(reason) => {
                error!("Dropping webhook event {} ({}): {reason}", event.id, event.event_type);
                return WebhookOutcome::Dropped(reason);
            }
            Interpretation::Ignore => {
                info!("Ignoring unhandled webhook event type {} ({})", event.event_type, event.id);
                return WebhookOutcome::Ignored;
            }
        };

        info!(
            "Processing checkout {} for user {}: package {} ({} tokens)",
            instruction.session_id,
            instruction.user_id,
            instruction.package,
            instruction.package.tokens()
        );

        let mut attempt = 1;
        loop {
            match self.ledger.apply(instruction.credit_request()).await {
                Ok(outcome) => {
                    self.recent.insert(event.id.clone(), ()).await;
                    return match outcome {
                        CreditOutcome::Applied { entry, wallet } => WebhookOutcome::Applied {
                            entry_id: entry.id,
                            balance: wallet.balance,
                        },
                        CreditOutcome::Duplicate { entry_id } => {
                            WebhookOutcome::Duplicate { entry_id }
                        }
                    };
                }
                Err(err) if err.is_retryable() && attempt < self.settings.max_attempts => {
                    warn!(
                        "Webhook event {} attempt {attempt}/{} failed: {err}",
                        event.id, self.settings.max_attempts
                    );
                    sleep(self.settings.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    error!(
                        reconcile = true,
                        event_id = %event.id,
                        user_id = %instruction.user_id,
                        package = %instruction.package,
                        attempts = attempt,
                        "Paid checkout could not be credited: {err}"
                    );
                    return WebhookOutcome::Failed { attempts: attempt };
                }
                Err(err) => {
                    let reason = DropReason::Rejected(err.to_string());
                    error!("Dropping webhook event {}: {reason}", event.id);
                    return WebhookOutcome::Dropped(reason);
                }
            }
        }
    }
}

/// Sending half held by the HTTP layer.
#[derive(Clone)]
pub struct WebhookQueue {
    sender: mpsc::Sender<WebhookEvent>,
    processor: WebhookProcessor,
    detached: Arc<Mutex<JoinSet<()>>>,
}

impl WebhookQueue {
    /// Hands the event off without waiting for it to be processed.
    ///
    /// A full or closed queue moves the event onto a tracked task; call
    /// [`WebhookQueue::wait_detached`] before exiting so none is lost.
    pub fn dispatch(&self, event: WebhookEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                warn!(
                    "Webhook queue unavailable; processing {} on a detached task",
                    event.id
                );
                let processor = self.processor.clone();
                let mut detached = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
                while detached.try_join_next().is_some() {}
                detached.spawn(async move {
                    processor.process_event(event).await;
                });
            }
        }
    }

    /// Waits for every detached task, including ones spawned while waiting.
    pub async fn wait_detached(&self) {
        let mut finished = 0_usize;
        loop {
            let mut pending = {
                let mut detached = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *detached)
            };
            if pending.is_empty() {
                break;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(join_err) = joined {
                    error!("Detached webhook task failed: {join_err}");
                }
                finished += 1;
            }
        }
        if finished > 0 {
            info!("Awaited {finished} detached webhook tasks");
        }
    }

    pub fn detached_count(&self) -> usize {
        self.detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn processor(&self) -> &WebhookProcessor {
        &self.processor
    }
}

pub struct WebhookWorker {
    receiver: mpsc::Receiver<WebhookEvent>,
    processor: WebhookProcessor,
}

pub fn webhook_channel(
    processor: WebhookProcessor,
    capacity: usize,
) -> (WebhookQueue, WebhookWorker) {
    assert!(capacity > 0, "Webhook queue capacity must be positive");
    assert!(capacity <= 65_536, "Webhook queue capacity exceeds bound");
    let (sender, receiver) = mpsc::channel(capacity);
    let queue = WebhookQueue {
        sender,
        processor: processor.clone(),
        detached: Arc::new(Mutex::new(JoinSet::new())),
    };
    (queue, WebhookWorker { receiver, processor })
}

impl WebhookWorker {
    /// Processes events until shutdown, then drains whatever is still queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting webhook worker");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Webhook worker shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            warn!(
                                "Shutdown channel closed unexpectedly. Draining webhook queue"
                            );
                            break;
                        }
                    }
                }
                received = self.receiver.recv() => {
                    match received {
                        Some(event) => {
                            self.processor.process_event(event).await;
                        }
                        None => {
                            info!("Webhook queue closed");
                            return;
                        }
                    }
                }
            }
        }

        self.receiver.close();
        let mut drained = 0_usize;
        while let Some(event) = self.receiver.recv().await {
            self.processor.process_event(event).await;
            drained += 1;
        }
        info!("Webhook worker drained {drained} queued events");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use sea_orm::DbErr;
    use uuid::Uuid;

    use super::*;
    use crate::ledger::{
        AppendRequest, AuditSnapshot, BalanceFeed, LedgerEntry, LedgerError, LedgerStore,
        MemoryLedgerStore, Wallet,
    };
    use crate::webhook::tests::checkout_event;

    /// Fails the first `failures` appends with a storage error.
    struct FlakyStore {
        inner: MemoryLedgerStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryLedgerStore::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, LedgerError> {
            self.inner.get_wallet(user_id).await
        }

        async fn ensure_wallet(&self, user_id: Uuid) -> Result<Wallet, LedgerError> {
            self.inner.ensure_wallet(user_id).await
        }

        async fn append_entry_if_absent(
            &self,
            request: AppendRequest,
        ) -> Result<CreditOutcome, LedgerError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(LedgerError::Storage(DbErr::Custom(
                    "connection reset".to_string(),
                )));
            }
            self.inner.append_entry_if_absent(request).await
        }

        async fn list_entries(
            &self,
            user_id: Uuid,
            limit: u64,
            offset: u64,
        ) -> Result<Vec<LedgerEntry>, LedgerError> {
            self.inner.list_entries(user_id, limit, offset).await
        }

        async fn audit_snapshot(&self, user_id: Uuid) -> Result<AuditSnapshot, LedgerError> {
            self.inner.audit_snapshot(user_id).await
        }

        async fn ping(&self) -> Result<(), LedgerError> {
            self.inner.ping().await
        }
    }

    fn processor_with(store: Arc<dyn LedgerStore>) -> (WebhookProcessor, LedgerService) {
        let ledger = LedgerService::new(store, Arc::new(BalanceFeed::default()), 0);
        let processor = WebhookProcessor::new(
            ledger.clone(),
            recent_events_cache(100, Duration::from_secs(60)),
            WebhookSettings::new(3, Duration::from_millis(1)),
        );
        (processor, ledger)
    }

    fn processor() -> (WebhookProcessor, LedgerService) {
        processor_with(Arc::new(MemoryLedgerStore::new()))
    }

    #[tokio::test]
    async fn replayed_event_credits_once() {
        let (processor, ledger) = processor();
        let user = Uuid::now_v7();
        let event = checkout_event("evt_1", user, "100");

        let first = processor.process_event(event.clone()).await;
        assert!(matches!(first, WebhookOutcome::Applied { balance: 100, .. }));
        assert!(processor.is_settled("evt_1"));

        let second = processor.process_event(event).await;
        assert!(matches!(second, WebhookOutcome::Duplicate { .. }));
        assert_eq!(ledger.balance(user).await.unwrap(), 100);
        assert_eq!(ledger.history(user, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_package_leaves_balance_untouched() {
        let (processor, ledger) = processor();
        let user = Uuid::now_v7();
        let outcome = processor
            .process_event(checkout_event("evt_999", user, "999"))
            .await;
        assert!(matches!(
            outcome,
            WebhookOutcome::Dropped(DropReason::UnknownPackage { .. })
        ));
        assert_eq!(ledger.balance(user).await.unwrap(), 0);
        assert!(!processor.is_settled("evt_999"));
    }

    #[tokio::test]
    async fn transient_storage_failures_are_retried() {
        let (processor, ledger) = processor_with(Arc::new(FlakyStore::new(2)));
        let user = Uuid::now_v7();
        let outcome = processor
            .process_event(checkout_event("evt_retry", user, "30"))
            .await;
        assert!(matches!(outcome, WebhookOutcome::Applied { balance: 30, .. }));
        assert_eq!(ledger.balance(user).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn exhausted_retries_are_reported() {
        let (processor, ledger) = processor_with(Arc::new(FlakyStore::new(10)));
        let user = Uuid::now_v7();
        let outcome = processor
            .process_event(checkout_event("evt_down", user, "250"))
            .await;
        assert_eq!(outcome, WebhookOutcome::Failed { attempts: 3 });
        assert_eq!(ledger.balance(user).await.unwrap(), 0);
        assert!(!processor.is_settled("evt_down"));
    }

    #[tokio::test]
    async fn worker_drains_queue_on_shutdown() {
        let (processor, ledger) = processor();
        let (queue, worker) = webhook_channel(processor, 8);
        let user = Uuid::now_v7();
        for index in 0..3 {
            queue.dispatch(checkout_event(&format!("evt_q{index}"), user, "30"));
        }
        assert_eq!(queue.depth(), 3);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        worker.run(shutdown_rx).await;

        assert_eq!(ledger.balance(user).await.unwrap(), 90);
    }

    #[tokio::test]
    async fn full_queue_falls_back_to_detached_task() {
        let (processor, ledger) = processor();
        let (queue, _worker) = webhook_channel(processor, 1);
        let user = Uuid::now_v7();
        queue.dispatch(checkout_event("evt_a", user, "30"));
        queue.dispatch(checkout_event("evt_b", user, "100"));
        assert_eq!(queue.depth(), 1);

        queue.wait_detached().await;
        assert_eq!(queue.detached_count(), 0);
        assert_eq!(ledger.balance(user).await.unwrap(), 100);
    }

    #[test]
    fn credit_dispatched_after_worker_exit_lands_before_runtime_drops() {
        let (processor, ledger) = processor();
        let user = Uuid::now_v7();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (queue, worker) = webhook_channel(processor, 8);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            shutdown_tx.send(true).unwrap();
            worker.run(shutdown_rx).await;

            // The receiver is gone; an acknowledged event must still be credited.
            queue.dispatch(checkout_event("evt_late", user, "100"));
            assert_eq!(queue.detached_count(), 1);
            queue.wait_detached().await;
        });
        drop(runtime);

        let check = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert_eq!(check.block_on(ledger.balance(user)).unwrap(), 100);
    }
}
