//! Durable payment queue: priority tiers, exponential-backoff delayed retry,
//! and a dead-letter queue for transactions that exhaust their retries.
//! Structurally mirrors the teacher's `BatchQueue` (`Arc<Mutex<..>>` plus a
//! spawned background loop) generalized from a single flush-on-threshold
//! queue to three priority tiers and a delay bucket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ledger::LedgerAdapter;
use crate::payment::PaymentService;
use crate::store::{TransactionStore, UserStore};

/// Caps the delayed-retry backoff at 5 minutes, matching the source's
/// `min(5 * 2^(retry_count-1), 300)`.
const MAX_DELAY_SECS: u64 = 300;
const DLQ_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Retrying,
    FailedPermanently,
}

#[derive(Debug, Clone)]
pub struct QueuedPayment {
    pub queue_id: String,
    pub sender_phone: String,
    pub receiver_phone: String,
    pub amount: Decimal,
    pub note: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: QueueStatus,
    pub last_error: Option<String>,
}

impl QueuedPayment {
    fn new(sender_phone: String, receiver_phone: String, amount: Decimal, note: String, priority: Priority) -> Self {
        Self {
            queue_id: format!("tx:{sender_phone}:{}", Uuid::new_v4()),
            sender_phone,
            receiver_phone,
            amount,
            note,
            priority,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: 5,
            status: QueueStatus::Pending,
            last_error: None,
        }
    }
}

/// backoff(retry_count) = min(5 * 2^(retry_count-1), 300) seconds.
fn backoff_delay(retry_count: u32) -> Duration {
    let secs = 5u64.saturating_mul(1u64 << retry_count.saturating_sub(1).min(62));
    Duration::from_secs(secs.min(MAX_DELAY_SECS))
}

struct DelayedItem {
    ready_at: DateTime<Utc>,
    payment: QueuedPayment,
}

struct DeadLetterItem {
    moved_at: DateTime<Utc>,
    payment: QueuedPayment,
    final_error: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub delayed: usize,
    pub dead_letter: usize,
}

/// In-process durable queue. Production deployments back this with Redis
/// lists (the source's `tx_queue:{priority}` / `tx_queue:retry:{delay}` /
/// `tx_dlq:*` keys); this in-memory form gives the same enqueue/dequeue/
/// retry/DLQ contract for a single process.
pub struct PersistentQueue {
    high: Mutex<VecDeque<QueuedPayment>>,
    normal: Mutex<VecDeque<QueuedPayment>>,
    low: Mutex<VecDeque<QueuedPayment>>,
    delayed: Mutex<Vec<DelayedItem>>,
    dead_letter: Mutex<Vec<DeadLetterItem>>,
}

impl PersistentQueue {
    pub fn new() -> Self {
        Self {
            high: Mutex::new(VecDeque::new()),
            normal: Mutex::new(VecDeque::new()),
            low: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(Vec::new()),
            dead_letter: Mutex::new(Vec::new()),
        }
    }

    fn tier(&self, priority: Priority) -> &Mutex<VecDeque<QueuedPayment>> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    pub async fn enqueue(
        &self,
        sender_phone: String,
        receiver_phone: String,
        amount: Decimal,
        note: String,
        priority: Priority,
    ) -> String {
        let payment = QueuedPayment::new(sender_phone, receiver_phone, amount, note, priority);
        let queue_id = payment.queue_id.clone();
        self.tier(priority).lock().await.push_back(payment);
        info!(queue_id = %queue_id, ?priority, "payment enqueued");
        queue_id
    }

    /// Pops the next item for a tier, highest priority first when `priority`
    /// is `None` (checks high, then normal, then low).
    pub async fn dequeue(&self, priority: Option<Priority>) -> Option<QueuedPayment> {
        match priority {
            Some(p) => self.tier(p).lock().await.pop_front(),
            None => {
                for p in [Priority::High, Priority::Normal, Priority::Low] {
                    if let Some(payment) = self.tier(p).lock().await.pop_front() {
                        return Some(payment);
                    }
                }
                None
            }
        }
    }

    /// Re-queues a failed payment with exponential backoff, or moves it to
    /// the dead-letter queue once `max_retries` is exceeded.
    pub async fn requeue_failed(&self, mut payment: QueuedPayment, error_message: String) {
        payment.retry_count += 1;

        if payment.retry_count > payment.max_retries {
            error!(
                queue_id = %payment.queue_id,
                max_retries = payment.max_retries,
                "transaction exceeded max retries, moving to dead letter queue"
            );
            payment.status = QueueStatus::FailedPermanently;
            self.dead_letter.lock().await.push(DeadLetterItem {
                moved_at: Utc::now(),
                payment,
                final_error: error_message,
            });
            return;
        }

        let delay = backoff_delay(payment.retry_count);
        payment.status = QueueStatus::Retrying;
        payment.last_error = Some(error_message);

        warn!(
            queue_id = %payment.queue_id,
            retry_count = payment.retry_count,
            max_retries = payment.max_retries,
            delay_secs = delay.as_secs(),
            "transaction re-queued for retry"
        );

        self.delayed.lock().await.push(DelayedItem {
            ready_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
            payment,
        });
    }

    /// Moves delayed items whose backoff has elapsed back into their
    /// priority tier. Call periodically from a background task.
    async fn promote_ready_delayed(&self) {
        let mut delayed = self.delayed.lock().await;
        let now = Utc::now();
        let mut i = 0;
        while i < delayed.len() {
            if delayed[i].ready_at <= now {
                let item = delayed.remove(i);
                let priority = item.payment.priority;
                debug!(queue_id = %item.payment.queue_id, "promoting delayed payment back to queue");
                self.tier(priority).lock().await.push_back(item.payment);
            } else {
                i += 1;
            }
        }
    }

    /// Drops dead-letter entries older than the retention window.
    async fn evict_expired_dead_letter(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(DLQ_RETENTION).unwrap_or_default();
        let mut dlq = self.dead_letter.lock().await;
        let before = dlq.len();
        dlq.retain(|item| item.moved_at > cutoff);
        let removed = before - dlq.len();
        if removed > 0 {
            debug!(removed, "evicted expired dead-letter entries");
        }
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            high: self.high.lock().await.len(),
            normal: self.normal.lock().await.len(),
            low: self.low.lock().await.len(),
            delayed: self.delayed.lock().await.len(),
            dead_letter: self.dead_letter.lock().await.len(),
        }
    }

    pub async fn dead_letter_items(&self) -> Vec<QueuedPayment> {
        self.dead_letter.lock().await.iter().map(|i| i.payment.clone()).collect()
    }

    /// Spawns the background loop that promotes ready delayed items and
    /// prunes expired dead-letter entries. Runs until the queue is dropped.
    pub fn spawn_maintenance_loop(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                queue.promote_ready_delayed().await;
                queue.evict_expired_dead_letter().await;
            }
        });
    }

    /// Spawns the worker that drains the queue in priority order and calls
    /// Payment Service for each item: on a retryable ledger error it goes
    /// back through `requeue_failed`'s backoff schedule, on any other error
    /// it is left failed (Payment Service already recorded the failed
    /// transaction) and is not rescheduled.
    pub fn spawn_payment_worker<S, L>(self: &Arc<Self>, payment: Arc<PaymentService<S, L>>)
    where
        S: UserStore + TransactionStore + 'static,
        L: LedgerAdapter + 'static,
    {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(item) = queue.dequeue(None).await else {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                };

                let queue_id = item.queue_id.clone();
                match payment.send_payment(&item.sender_phone, &item.receiver_phone, item.amount, &item.note).await {
                    Ok(record) => {
                        info!(queue_id = %queue_id, tx_id = ?record.tx_id, "queued payment processed");
                    }
                    Err(err) if err.is_retryable() => {
                        queue.requeue_failed(item, err.to_string()).await;
                    }
                    Err(err) => {
                        error!(queue_id = %queue_id, error = %err, "queued payment failed, not rescheduled");
                    }
                }
            }
        });
    }
}

impl Default for PersistentQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(priority: Priority) -> (String, String, Decimal, String, Priority) {
        ("+15550001".into(), "+15550002".into(), dec!(10), "lunch".into(), priority)
    }

    #[tokio::test]
    async fn dequeue_respects_priority_order() {
        let queue = PersistentQueue::new();
        let (s, r, a, n, _) = sample(Priority::Normal);
        queue.enqueue(s, r, a, n, Priority::Low).await;
        let (s, r, a, n, _) = sample(Priority::Normal);
        queue.enqueue(s, r, a, n, Priority::High).await;

        let next = queue.dequeue(None).await.unwrap();
        assert_eq!(next.priority, Priority::High);
    }

    #[tokio::test]
    async fn requeue_backoff_matches_formula() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
        assert_eq!(backoff_delay(10), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn exceeding_max_retries_moves_to_dead_letter() {
        let queue = PersistentQueue::new();
        let (s, r, a, n, p) = sample(Priority::Normal);
        let mut payment = QueuedPayment::new(s, r, a, n, p);
        payment.retry_count = payment.max_retries;

        queue.requeue_failed(payment, "ledger down".into()).await;
        let stats = queue.stats().await;
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.delayed, 0);
    }

    #[tokio::test]
    async fn under_max_retries_goes_to_delayed_bucket() {
        let queue = PersistentQueue::new();
        let (s, r, a, n, p) = sample(Priority::Normal);
        let payment = QueuedPayment::new(s, r, a, n, p);

        queue.requeue_failed(payment, "timeout".into()).await;
        let stats = queue.stats().await;
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.dead_letter, 0);
    }

    #[tokio::test]
    async fn payment_worker_drains_queue_and_completes_transaction() {
        use crate::crypto::CryptoService;
        use crate::ledger::fake::FakeLedger;
        use crate::store::InMemoryStore;
        use crate::wallet::WalletService;
        use std::time::Duration as StdDuration;

        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(FakeLedger::new());
        let crypto = Arc::new(CryptoService::new("test-secret"));
        let wallet = Arc::new(WalletService::new(store.clone(), ledger.clone(), crypto));
        let payment = Arc::new(PaymentService::new(store.clone(), ledger.clone(), wallet.clone()));

        let (sender, _) = wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&sender.wallet_address, rust_decimal_macros::dec!(100));

        let queue = Arc::new(PersistentQueue::new());
        queue.spawn_payment_worker(payment.clone());
        queue
            .enqueue("+15550001".into(), "+15550002".into(), rust_decimal_macros::dec!(10), "lunch".into(), Priority::High)
            .await;

        let mut waited = StdDuration::ZERO;
        loop {
            let history = payment.history("+15550001", 10).await.unwrap();
            if !history.is_empty() {
                assert_eq!(history[0].status, crate::store::TransactionStatus::Completed);
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            waited += StdDuration::from_millis(20);
            assert!(waited < StdDuration::from_secs(5), "worker never processed the queued payment");
        }
    }
}
