//! Per-aggregate persistence traits plus an in-memory implementation.
//! Generalizes the teacher's `BatchStore`/`IdempotencyStore`/`RateLimitStore`/
//! `NoteStore` pattern (several small traits, one `DashMap`-backed struct
//! implementing all of them, a `build_store()` factory) from batch/proof
//! bookkeeping to the aggregate roots this service owns: users, transactions,
//! split bills, funds, events/tickets, commitments, and reliability scores.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::AppConfig;

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Users / wallets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub phone: String,
    pub wallet_address: String,
    pub encrypted_secret: String,
    pub created_at: DateTime<Utc>,
}

pub trait UserStore: Send + Sync + 'static {
    fn get_user(&self, phone: &str) -> impl std::future::Future<Output = Result<Option<UserRecord>, StoreError>> + Send;
    fn save_user(&self, record: &UserRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Transactions (payment history)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub sender_phone: String,
    pub receiver: String,
    pub amount: Decimal,
    pub note: String,
    pub tx_id: Option<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// `record` upserts by `id`: the first call for a payment inserts a row
/// (typically PENDING), a later call with the same id replaces it in place
/// (typically CONFIRMED or FAILED), matching the source's insert-then-update
/// pattern around a single ledger submission.
pub trait TransactionStore: Send + Sync + 'static {
    fn record(&self, record: &TransactionRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
    fn history(&self, phone: &str, limit: usize) -> impl std::future::Future<Output = Result<Vec<TransactionRecord>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Split bills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitParticipant {
    pub phone: String,
    pub share_amount: Decimal,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitBillStatus {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitBillRecord {
    pub id: String,
    pub initiator_phone: String,
    pub title: String,
    pub total_amount: Decimal,
    pub participants: Vec<SplitParticipant>,
    pub status: SplitBillStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SplitBillRecord {
    pub fn is_fully_paid(&self) -> bool {
        self.participants.iter().all(|p| p.paid)
    }
}

pub trait SplitStore: Send + Sync + 'static {
    fn save_split(&self, record: &SplitBillRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
    fn get_split(&self, id: &str) -> impl std::future::Future<Output = Result<Option<SplitBillRecord>, StoreError>> + Send;
    fn list_splits_for(&self, phone: &str) -> impl std::future::Future<Output = Result<Vec<SplitBillRecord>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Funds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundContribution {
    pub phone: String,
    pub amount: Decimal,
    pub contributed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundRecord {
    pub id: String,
    pub organizer_phone: String,
    pub title: String,
    pub description: String,
    pub goal_amount: Decimal,
    pub total_contributed: Decimal,
    pub contributions: Vec<FundContribution>,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl FundRecord {
    pub fn is_goal_met(&self) -> bool {
        self.total_contributed >= self.goal_amount
    }

    pub fn is_active(&self) -> bool {
        self.closed_at.is_none()
    }
}

pub trait FundStore: Send + Sync + 'static {
    fn save_fund(&self, record: &FundRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
    fn get_fund(&self, id: &str) -> impl std::future::Future<Output = Result<Option<FundRecord>, StoreError>> + Send;
    fn list_active_funds(&self) -> impl std::future::Future<Output = Result<Vec<FundRecord>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Events / tickets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub organizer_phone: String,
    pub title: String,
    pub price: Decimal,
    pub total_tickets: u32,
    pub tickets_sold: u32,
    pub date: DateTime<Utc>,
    pub category: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: String,
    pub event_id: String,
    pub owner_phone: String,
    pub asset_id: u64,
    pub ticket_number: String,
    pub ticket_metadata: String,
    pub used: bool,
    pub is_valid: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub purchased_at: DateTime<Utc>,
}

pub trait TicketStore: Send + Sync + 'static {
    fn save_event(&self, record: &EventRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
    fn get_event(&self, id: &str) -> impl std::future::Future<Output = Result<Option<EventRecord>, StoreError>> + Send;
    fn list_events(&self, cap: usize) -> impl std::future::Future<Output = Result<Vec<EventRecord>, StoreError>> + Send;
    fn save_ticket(&self, record: &TicketRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
    fn get_ticket(&self, id: &str) -> impl std::future::Future<Output = Result<Option<TicketRecord>, StoreError>> + Send;
    fn get_ticket_by_number(&self, ticket_number: &str) -> impl std::future::Future<Output = Result<Option<TicketRecord>, StoreError>> + Send;
    fn list_tickets_for(&self, phone: &str) -> impl std::future::Future<Output = Result<Vec<TicketRecord>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Commitments (escrow) / reliability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Active,
    Completed,
    Canceled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Locked,
    Released,
    Refunded,
    Missed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentRecord {
    pub id: String,
    pub organizer_phone: String,
    pub title: String,
    pub description: String,
    pub amount_per_person: Decimal,
    pub total_participants: u32,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub escrow_address: String,
    pub encrypted_escrow_key: String,
    pub status: CommitmentStatus,
    pub total_locked: Decimal,
    pub participants_locked: u32,
    pub released_at: Option<DateTime<Utc>>,
    pub released_tx_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentParticipantRecord {
    pub id: String,
    pub commitment_id: String,
    pub phone: String,
    pub wallet_address: String,
    pub amount: Decimal,
    pub status: ParticipantStatus,
    pub invited_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub lock_tx_id: Option<String>,
    pub release_tx_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityRecord {
    pub phone: String,
    pub total_commitments: u32,
    pub fulfilled_on_time: u32,
    pub fulfilled_late: u32,
    pub missed: u32,
    pub score: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReliabilityRecord {
    pub fn new(phone: String) -> Self {
        let now = Utc::now();
        Self {
            phone,
            total_commitments: 0,
            fulfilled_on_time: 0,
            fulfilled_late: 0,
            missed: 0,
            score: 100,
            created_at: now,
            updated_at: now,
        }
    }
}

pub trait CommitmentStore: Send + Sync + 'static {
    fn save_commitment(&self, record: &CommitmentRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
    fn get_commitment(&self, id: &str) -> impl std::future::Future<Output = Result<Option<CommitmentRecord>, StoreError>> + Send;
    fn list_active_commitments(&self) -> impl std::future::Future<Output = Result<Vec<CommitmentRecord>, StoreError>> + Send;
    fn save_participant(&self, record: &CommitmentParticipantRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
    fn get_participant(&self, id: &str) -> impl std::future::Future<Output = Result<Option<CommitmentParticipantRecord>, StoreError>> + Send;
    fn list_participants(&self, commitment_id: &str) -> impl std::future::Future<Output = Result<Vec<CommitmentParticipantRecord>, StoreError>> + Send;
    fn list_commitments_for(&self, phone: &str) -> impl std::future::Future<Output = Result<Vec<CommitmentRecord>, StoreError>> + Send;
}

pub trait ReliabilityStore: Send + Sync + 'static {
    fn get_score(&self, phone: &str) -> impl std::future::Future<Output = Result<ReliabilityRecord, StoreError>> + Send;
    fn save_score(&self, record: &ReliabilityRecord) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

const IDLE_TRANSACTION_RETENTION_SECS: u64 = 90 * 24 * 3600;

pub struct InMemoryStore {
    users: DashMap<String, UserRecord>,
    transactions: DashMap<String, Vec<TransactionRecord>>,
    splits: DashMap<String, SplitBillRecord>,
    funds: DashMap<String, FundRecord>,
    events: DashMap<String, EventRecord>,
    tickets: DashMap<String, TicketRecord>,
    commitments: DashMap<String, CommitmentRecord>,
    participants: DashMap<String, CommitmentParticipantRecord>,
    reliability: DashMap<String, ReliabilityRecord>,
    eviction_counter: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            transactions: DashMap::new(),
            splits: DashMap::new(),
            funds: DashMap::new(),
            events: DashMap::new(),
            tickets: DashMap::new(),
            commitments: DashMap::new(),
            participants: DashMap::new(),
            reliability: DashMap::new(),
            eviction_counter: AtomicU64::new(0),
        }
    }

    /// Spawns a background task that periodically trims unbounded growth
    /// (old completed transaction history beyond the retention window).
    pub fn spawn_eviction_task(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                store.evict_old_transactions();
            }
        });
    }

    fn evict_old_transactions(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(Duration::from_secs(IDLE_TRANSACTION_RETENTION_SECS)).unwrap_or_default();
        let mut evicted = 0usize;
        for mut entry in self.transactions.iter_mut() {
            let before = entry.len();
            entry.retain(|t| t.created_at > cutoff);
            evicted += before - entry.len();
        }
        self.eviction_counter.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            debug!(evicted, "evicted stale transaction history entries");
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for InMemoryStore {
    async fn get_user(&self, phone: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.get(phone).map(|r| r.value().clone()))
    }

    async fn save_user(&self, record: &UserRecord) -> Result<(), StoreError> {
        self.users.insert(record.phone.clone(), record.clone());
        Ok(())
    }
}

fn upsert_by_id(mut records: impl std::ops::DerefMut<Target = Vec<TransactionRecord>>, record: &TransactionRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

impl TransactionStore for InMemoryStore {
    async fn record(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        upsert_by_id(self.transactions.entry(record.sender_phone.clone()).or_default(), record);
        upsert_by_id(self.transactions.entry(record.receiver.clone()).or_default(), record);
        Ok(())
    }

    async fn history(&self, phone: &str, limit: usize) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut records = self
            .transactions
            .get(phone)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

impl SplitStore for InMemoryStore {
    async fn save_split(&self, record: &SplitBillRecord) -> Result<(), StoreError> {
        self.splits.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_split(&self, id: &str) -> Result<Option<SplitBillRecord>, StoreError> {
        Ok(self.splits.get(id).map(|r| r.value().clone()))
    }

    async fn list_splits_for(&self, phone: &str) -> Result<Vec<SplitBillRecord>, StoreError> {
        Ok(self
            .splits
            .iter()
            .filter(|e| {
                e.value().initiator_phone == phone
                    || e.value().participants.iter().any(|p| p.phone == phone)
            })
            .map(|e| e.value().clone())
            .collect())
    }
}

impl FundStore for InMemoryStore {
    async fn save_fund(&self, record: &FundRecord) -> Result<(), StoreError> {
        self.funds.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_fund(&self, id: &str) -> Result<Option<FundRecord>, StoreError> {
        Ok(self.funds.get(id).map(|r| r.value().clone()))
    }

    async fn list_active_funds(&self) -> Result<Vec<FundRecord>, StoreError> {
        Ok(self
            .funds
            .iter()
            .filter(|e| e.value().closed_at.is_none())
            .map(|e| e.value().clone())
            .collect())
    }
}

impl TicketStore for InMemoryStore {
    async fn save_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        self.events.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_event(&self, id: &str) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.events.get(id).map(|r| r.value().clone()))
    }

    async fn list_events(&self, cap: usize) -> Result<Vec<EventRecord>, StoreError> {
        let mut events: Vec<EventRecord> = self
            .events
            .iter()
            .map(|e| e.value().clone())
            .filter(|e| e.is_active)
            .collect();
        events.sort_by_key(|e| e.date);
        events.truncate(cap);
        Ok(events)
    }

    async fn save_ticket(&self, record: &TicketRecord) -> Result<(), StoreError> {
        self.tickets.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: &str) -> Result<Option<TicketRecord>, StoreError> {
        Ok(self.tickets.get(id).map(|r| r.value().clone()))
    }

    async fn get_ticket_by_number(&self, ticket_number: &str) -> Result<Option<TicketRecord>, StoreError> {
        Ok(self
            .tickets
            .iter()
            .find(|e| e.value().ticket_number == ticket_number)
            .map(|e| e.value().clone()))
    }

    async fn list_tickets_for(&self, phone: &str) -> Result<Vec<TicketRecord>, StoreError> {
        Ok(self
            .tickets
            .iter()
            .filter(|e| e.value().owner_phone == phone)
            .map(|e| e.value().clone())
            .collect())
    }
}

impl CommitmentStore for InMemoryStore {
    async fn save_commitment(&self, record: &CommitmentRecord) -> Result<(), StoreError> {
        self.commitments.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_commitment(&self, id: &str) -> Result<Option<CommitmentRecord>, StoreError> {
        Ok(self.commitments.get(id).map(|r| r.value().clone()))
    }

    async fn list_active_commitments(&self) -> Result<Vec<CommitmentRecord>, StoreError> {
        Ok(self
            .commitments
            .iter()
            .filter(|e| e.value().status == CommitmentStatus::Active)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn save_participant(&self, record: &CommitmentParticipantRecord) -> Result<(), StoreError> {
        self.participants.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_participant(&self, id: &str) -> Result<Option<CommitmentParticipantRecord>, StoreError> {
        Ok(self.participants.get(id).map(|r| r.value().clone()))
    }

    async fn list_participants(&self, commitment_id: &str) -> Result<Vec<CommitmentParticipantRecord>, StoreError> {
        Ok(self
            .participants
            .iter()
            .filter(|e| e.value().commitment_id == commitment_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_commitments_for(&self, phone: &str) -> Result<Vec<CommitmentRecord>, StoreError> {
        let participant_commitment_ids: std::collections::HashSet<String> = self
            .participants
            .iter()
            .filter(|e| e.value().phone == phone)
            .map(|e| e.value().commitment_id.clone())
            .collect();

        Ok(self
            .commitments
            .iter()
            .filter(|e| e.value().organizer_phone == phone || participant_commitment_ids.contains(e.key()))
            .map(|e| e.value().clone())
            .collect())
    }
}

impl ReliabilityStore for InMemoryStore {
    async fn get_score(&self, phone: &str) -> Result<ReliabilityRecord, StoreError> {
        Ok(self
            .reliability
            .get(phone)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| ReliabilityRecord::new(phone.to_string())))
    }

    async fn save_score(&self, record: &ReliabilityRecord) -> Result<(), StoreError> {
        self.reliability.insert(record.phone.clone(), record.clone());
        Ok(())
    }
}

/// Allocates a fresh id for any aggregate that doesn't derive one from
/// business data (splits, funds, events, tickets, commitments).
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4())
}

pub fn build_store(config: &AppConfig) -> Arc<InMemoryStore> {
    let _ = config;
    Arc::new(InMemoryStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn user_round_trips() {
        let store = InMemoryStore::new();
        let record = UserRecord {
            phone: "+15550001".into(),
            wallet_address: "ADDR1".into(),
            encrypted_secret: "blob".into(),
            created_at: Utc::now(),
        };
        store.save_user(&record).await.unwrap();
        let fetched = store.get_user("+15550001").await.unwrap().unwrap();
        assert_eq!(fetched.wallet_address, "ADDR1");
        assert!(store.get_user("+15559999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transaction_history_is_most_recent_first_and_capped() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .record(&TransactionRecord {
                    id: format!("tx{i}"),
                    sender_phone: "+15550001".into(),
                    receiver: "+15550002".into(),
                    amount: dec!(1),
                    note: String::new(),
                    tx_id: None,
                    status: TransactionStatus::Completed,
                    created_at: Utc::now() + chrono::Duration::seconds(i),
                    confirmed_at: None,
                })
                .await
                .unwrap();
        }
        let history = store.history("+15550001", 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, "tx4");
    }

    #[tokio::test]
    async fn split_is_fully_paid_requires_every_participant() {
        let split = SplitBillRecord {
            id: "split1".into(),
            initiator_phone: "+15550001".into(),
            title: "dinner".into(),
            total_amount: dec!(30),
            participants: vec![
                SplitParticipant { phone: "+15550002".into(), share_amount: dec!(15), paid: true, paid_at: Some(Utc::now()) },
                SplitParticipant { phone: "+15550003".into(), share_amount: dec!(15), paid: false, paid_at: None },
            ],
            status: SplitBillStatus::Pending,
            completed_at: None,
            created_at: Utc::now(),
        };
        assert!(!split.is_fully_paid());
    }

    #[tokio::test]
    async fn event_listing_caps_and_orders_soonest_first() {
        let store = InMemoryStore::new();
        for i in 0..7 {
            store
                .save_event(&EventRecord {
                    id: format!("ev{i}"),
                    organizer_phone: "+15550001".into(),
                    title: format!("event {i}"),
                    price: dec!(5),
                    total_tickets: 100,
                    tickets_sold: 0,
                    date: Utc::now() + chrono::Duration::days(7 - i),
                    category: "music".into(),
                    is_active: true,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let events = store.list_events(5).await.unwrap();
        assert_eq!(events.len(), 5);
        // ev6 has the soonest date (7 - 6 = 1 day out), ev0 the furthest.
        assert_eq!(events[0].id, "ev6");
        assert_eq!(events[4].id, "ev2");
    }

    #[tokio::test]
    async fn event_listing_excludes_inactive_events() {
        let store = InMemoryStore::new();
        store
            .save_event(&EventRecord {
                id: "ev-cancelled".into(),
                organizer_phone: "+15550001".into(),
                title: "cancelled show".into(),
                price: dec!(5),
                total_tickets: 100,
                tickets_sold: 0,
                date: Utc::now() + chrono::Duration::days(1),
                category: "music".into(),
                is_active: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let events = store.list_events(5).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn reliability_defaults_to_score_100_for_unknown_phone() {
        let store = InMemoryStore::new();
        let score = store.get_score("+15559999").await.unwrap();
        assert_eq!(score.score, 100);
        assert_eq!(score.total_commitments, 0);
    }
}
