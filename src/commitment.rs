//! The commitment escrow engine: organizers lock a per-person amount from
//! each participant into a dedicated escrow account, then release it (or
//! refund it) as a single batch settlement. Grounded on the source's
//! `CommitmentService` + `EscrowService`, with reliability scoring from
//! `ReliabilityScore`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::amount::{has_sufficient_balance, validate_amount, LEDGER_FEE};
use crate::crypto::CryptoService;
use crate::error::AppError;
use crate::ledger::LedgerAdapter;
use crate::retry::{retry_with, RetryConfig};
use crate::store::{
    new_id, CommitmentParticipantRecord, CommitmentRecord, CommitmentStatus, CommitmentStore, ParticipantStatus,
    ReliabilityRecord, ReliabilityStore, UserStore,
};
use crate::wallet::WalletService;

pub enum ReliabilityAction {
    Locked,
    Released,
    Missed,
}

pub struct CommitmentService<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    pub(crate) wallet: Arc<WalletService<S, L>>,
    crypto: Arc<CryptoService>,
}

impl<S, L> CommitmentService<S, L>
where
    S: UserStore + CommitmentStore + ReliabilityStore,
    L: LedgerAdapter,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, wallet: Arc<WalletService<S, L>>, crypto: Arc<CryptoService>) -> Self {
        Self { store, ledger, wallet, crypto }
    }

    pub async fn create_commitment(
        &self,
        organizer_phone: &str,
        title: &str,
        description: &str,
        amount_per_person: Decimal,
        total_participants: u32,
        deadline: DateTime<Utc>,
    ) -> Result<CommitmentRecord, AppError> {
        validate_amount(amount_per_person)?;
        if total_participants < 1 {
            return Err(AppError::validation("total_participants must be at least 1"));
        }
        if deadline <= Utc::now() {
            return Err(AppError::validation("deadline must be in the future"));
        }

        self.wallet
            .get_user_by_phone(organizer_phone)
            .await?
            .ok_or_else(|| AppError::not_found(format!("organizer {organizer_phone}")))?;

        let config = RetryConfig::default();
        let (escrow_secret, escrow_address, _mnemonic) = retry_with(&config, || self.ledger.derive_account()).await?;
        let encrypted_escrow_key = self.crypto.encrypt(&escrow_secret)?;

        let commitment = CommitmentRecord {
            id: new_id("commit"),
            organizer_phone: organizer_phone.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            amount_per_person,
            total_participants,
            deadline,
            created_at: Utc::now(),
            escrow_address,
            encrypted_escrow_key,
            status: CommitmentStatus::Active,
            total_locked: Decimal::ZERO,
            participants_locked: 0,
            released_at: None,
            released_tx_id: None,
        };

        self.store.save_commitment(&commitment).await.map_err(|e| AppError::Internal(e.to_string()))?;
        info!(commitment_id = %commitment.id, title, "commitment created");
        Ok(commitment)
    }

    /// Idempotent: returns the existing row if `phone` is already invited.
    pub async fn add_participant(&self, commitment_id: &str, phone: &str) -> Result<CommitmentParticipantRecord, AppError> {
        let commitment = self.active_commitment(commitment_id).await?;

        if let Some(existing) = self.find_participant(commitment_id, phone).await? {
            return Ok(existing);
        }

        let (user, _) = self.wallet.get_or_create_wallet(phone).await?;
        let participant = CommitmentParticipantRecord {
            id: new_id("cpart"),
            commitment_id: commitment.id.clone(),
            phone: phone.to_string(),
            wallet_address: user.wallet_address,
            amount: commitment.amount_per_person,
            status: ParticipantStatus::Invited,
            invited_at: Utc::now(),
            locked_at: None,
            released_at: None,
            lock_tx_id: None,
            release_tx_id: None,
        };
        self.store.save_participant(&participant).await.map_err(|e| AppError::Internal(e.to_string()))?;
        info!(commitment_id, phone, "participant invited");
        Ok(participant)
    }

    pub async fn lock_funds(&self, commitment_id: &str, participant_phone: &str) -> Result<CommitmentParticipantRecord, AppError> {
        let mut commitment = self.active_commitment(commitment_id).await?;

        let mut participant = match self.find_participant(commitment_id, participant_phone).await? {
            Some(p) => p,
            None => self.add_participant(commitment_id, participant_phone).await?,
        };

        if participant.status == ParticipantStatus::Locked {
            return Err(AppError::state("funds already locked"));
        }

        let config = RetryConfig::default();
        let balance = retry_with(&config, || self.ledger.balance(&participant.wallet_address)).await?;
        if !has_sufficient_balance(balance, commitment.amount_per_person) {
            return Err(AppError::InsufficientBalance { required: commitment.amount_per_person, available: balance });
        }

        let secret = self.wallet.get_secret(participant_phone).await?;
        let note = format!("Locked for: {}", commitment.title);
        let tx_id = retry_with(&config, || {
            self.ledger.send_payment(&secret, &commitment.escrow_address, commitment.amount_per_person, &note)
        })
        .await?;

        participant.status = ParticipantStatus::Locked;
        participant.locked_at = Some(Utc::now());
        participant.lock_tx_id = Some(tx_id);
        self.store.save_participant(&participant).await.map_err(|e| AppError::Internal(e.to_string()))?;

        commitment.participants_locked += 1;
        commitment.total_locked += commitment.amount_per_person;
        self.store.save_commitment(&commitment).await.map_err(|e| AppError::Internal(e.to_string()))?;

        self.update_reliability(participant_phone, ReliabilityAction::Locked).await?;
        info!(commitment_id, participant_phone, "funds locked");
        Ok(participant)
    }

    /// Batch settlement: releases the whole escrow to the organizer and
    /// resolves every participant's terminal status in one pass.
    pub async fn release_commitment(&self, commitment_id: &str) -> Result<String, AppError> {
        let mut commitment = self
            .store
            .get_commitment(commitment_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("commitment {commitment_id}")))?;

        if commitment.status != CommitmentStatus::Active {
            return Err(AppError::state("commitment already processed"));
        }

        let config = RetryConfig::default();
        let escrow_balance = retry_with(&config, || self.ledger.balance(&commitment.escrow_address)).await?;
        let release_amount = escrow_balance - LEDGER_FEE;
        if release_amount <= Decimal::ZERO {
            return Err(AppError::state("no funds to release from escrow"));
        }

        let escrow_secret = self.crypto.decrypt(&commitment.encrypted_escrow_key)?;
        let organizer = self
            .wallet
            .get_user_by_phone(&commitment.organizer_phone)
            .await?
            .ok_or_else(|| AppError::not_found(format!("organizer {}", commitment.organizer_phone)))?;

        let note = format!("Released: {}", commitment.title);
        let tx_id = retry_with(&config, || self.ledger.send_payment(&escrow_secret, &organizer.wallet_address, release_amount, &note)).await?;

        commitment.status = CommitmentStatus::Completed;
        commitment.released_at = Some(Utc::now());
        commitment.released_tx_id = Some(tx_id.clone());
        self.store.save_commitment(&commitment).await.map_err(|e| AppError::Internal(e.to_string()))?;

        let participants = self.store.list_participants(commitment_id).await.map_err(|e| AppError::Internal(e.to_string()))?;
        for mut participant in participants {
            match participant.status {
                ParticipantStatus::Locked => {
                    participant.status = ParticipantStatus::Released;
                    participant.released_at = Some(Utc::now());
                    participant.release_tx_id = Some(tx_id.clone());
                    self.store.save_participant(&participant).await.map_err(|e| AppError::Internal(e.to_string()))?;
                    self.update_reliability(&participant.phone, ReliabilityAction::Released).await?;
                }
                ParticipantStatus::Invited => {
                    participant.status = ParticipantStatus::Missed;
                    self.store.save_participant(&participant).await.map_err(|e| AppError::Internal(e.to_string()))?;
                    self.update_reliability(&participant.phone, ReliabilityAction::Missed).await?;
                }
                _ => {}
            }
        }

        info!(commitment_id, tx_id = %tx_id, "commitment released");
        Ok(tx_id)
    }

    /// Refunds every locked participant from escrow. A per-participant
    /// refund failure is recorded and skipped rather than aborting the rest
    /// of the batch.
    pub async fn cancel_commitment(&self, commitment_id: &str, organizer_phone: &str) -> Result<HashMap<String, String>, AppError> {
        let mut commitment = self
            .store
            .get_commitment(commitment_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("commitment {commitment_id}")))?;

        if commitment.organizer_phone != organizer_phone {
            return Err(AppError::validation("only the organizer can cancel this commitment"));
        }
        if commitment.status != CommitmentStatus::Active {
            return Err(AppError::state("commitment already processed"));
        }

        let escrow_secret = self.crypto.decrypt(&commitment.encrypted_escrow_key)?;
        let participants = self.store.list_participants(commitment_id).await.map_err(|e| AppError::Internal(e.to_string()))?;
        let note = format!("Refund: {} canceled", commitment.title);
        let config = RetryConfig::default();

        let mut results = HashMap::new();
        for mut participant in participants.into_iter().filter(|p| p.status == ParticipantStatus::Locked) {
            match retry_with(&config, || self.ledger.send_payment(&escrow_secret, &participant.wallet_address, participant.amount, &note)).await {
                Ok(tx_id) => {
                    participant.status = ParticipantStatus::Refunded;
                    participant.released_at = Some(Utc::now());
                    participant.release_tx_id = Some(tx_id.clone());
                    self.store.save_participant(&participant).await.map_err(|e| AppError::Internal(e.to_string()))?;
                    results.insert(participant.phone.clone(), tx_id);
                }
                Err(err) => {
                    error!(commitment_id, phone = %participant.phone, error = %err, "refund failed, leaving participant locked");
                }
            }
        }

        commitment.status = CommitmentStatus::Canceled;
        self.store.save_commitment(&commitment).await.map_err(|e| AppError::Internal(e.to_string()))?;
        info!(commitment_id, "commitment canceled");
        Ok(results)
    }

    /// Marks an overdue, not-fully-locked commitment EXPIRED without moving
    /// any funds. A scheduler external to this engine decides when `now`
    /// has passed the deadline and calls this (or `release_commitment`).
    pub async fn expire_commitment(&self, commitment_id: &str, now: DateTime<Utc>) -> Result<CommitmentRecord, AppError> {
        let mut commitment = self
            .store
            .get_commitment(commitment_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("commitment {commitment_id}")))?;

        if commitment.status != CommitmentStatus::Active {
            return Err(AppError::state("commitment already processed"));
        }
        if now <= commitment.deadline {
            return Err(AppError::state("deadline has not passed yet"));
        }
        if commitment.participants_locked >= commitment.total_participants {
            return Err(AppError::state("commitment is fully committed, release it instead"));
        }

        commitment.status = CommitmentStatus::Expired;
        self.store.save_commitment(&commitment).await.map_err(|e| AppError::Internal(e.to_string()))?;
        warn!(commitment_id, "commitment expired without full participation");
        Ok(commitment)
    }

    pub async fn get_commitment_status(&self, commitment_id: &str) -> Result<CommitmentDetails, AppError> {
        let commitment = self
            .store
            .get_commitment(commitment_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("commitment {commitment_id}")))?;

        let participants = self.store.list_participants(commitment_id).await.map_err(|e| AppError::Internal(e.to_string()))?;
        let locked = participants.iter().filter(|p| p.status == ParticipantStatus::Locked).cloned().collect();
        let pending = participants.iter().filter(|p| p.status == ParticipantStatus::Invited).cloned().collect();

        let completion_percentage = if commitment.total_participants == 0 {
            0
        } else {
            (commitment.participants_locked * 100) / commitment.total_participants
        };
        let days_until_deadline = if Utc::now() > commitment.deadline {
            0
        } else {
            (commitment.deadline - Utc::now()).num_days().max(0) as u32
        };

        Ok(CommitmentDetails { commitment, locked_participants: locked, pending_participants: pending, completion_percentage, days_until_deadline })
    }

    pub async fn get_user_reliability(&self, phone: &str) -> Result<ReliabilityRecord, AppError> {
        self.store.get_score(phone).await.map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn list_my_commitments(&self, phone: &str) -> Result<Vec<CommitmentRecord>, AppError> {
        self.store.list_commitments_for(phone).await.map_err(|e| AppError::Internal(e.to_string()))
    }

    async fn active_commitment(&self, commitment_id: &str) -> Result<CommitmentRecord, AppError> {
        let commitment = self
            .store
            .get_commitment(commitment_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("commitment {commitment_id}")))?;

        if commitment.status != CommitmentStatus::Active || Utc::now() >= commitment.deadline {
            return Err(AppError::state("commitment is no longer active"));
        }
        Ok(commitment)
    }

    async fn find_participant(&self, commitment_id: &str, phone: &str) -> Result<Option<CommitmentParticipantRecord>, AppError> {
        let participants = self.store.list_participants(commitment_id).await.map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(participants.into_iter().find(|p| p.phone == phone))
    }

    async fn update_reliability(&self, phone: &str, action: ReliabilityAction) -> Result<(), AppError> {
        let mut score = self.store.get_score(phone).await.map_err(|e| AppError::Internal(e.to_string()))?;

        match action {
            ReliabilityAction::Locked => score.total_commitments += 1,
            ReliabilityAction::Released => score.fulfilled_on_time += 1,
            ReliabilityAction::Missed => {
                score.missed += 1;
                score.total_commitments += 1;
            }
        }

        score.score = if score.total_commitments == 0 {
            100
        } else {
            ((score.fulfilled_on_time * 100 + score.total_commitments / 2) / score.total_commitments).min(100)
        };
        score.updated_at = Utc::now();

        self.store.save_score(&score).await.map_err(|e| AppError::Internal(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CommitmentDetails {
    pub commitment: CommitmentRecord,
    pub locked_participants: Vec<CommitmentParticipantRecord>,
    pub pending_participants: Vec<CommitmentParticipantRecord>,
    pub completion_percentage: u32,
    pub days_until_deadline: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::fake::FakeLedger;
    use crate::store::InMemoryStore;
    use rust_decimal_macros::dec;

    fn services() -> (Arc<InMemoryStore>, Arc<FakeLedger>, CommitmentService<InMemoryStore, FakeLedger>) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(FakeLedger::new());
        let crypto = Arc::new(CryptoService::new("test-secret"));
        let wallet = Arc::new(WalletService::new(store.clone(), ledger.clone(), crypto.clone()));
        let commitments = CommitmentService::new(store.clone(), ledger.clone(), wallet, crypto);
        (store, ledger, commitments)
    }

    async fn organizer(commitments: &CommitmentService<InMemoryStore, FakeLedger>) -> String {
        commitments.wallet.get_or_create_wallet("+15559999").await.unwrap();
        "+15559999".to_string()
    }

    #[tokio::test]
    async fn create_commitment_requires_existing_organizer() {
        let (_, _, commitments) = services();
        let deadline = Utc::now() + chrono::Duration::days(1);
        let result = commitments.create_commitment("+15559999", "Goa Trip", "", dec!(100), 3, deadline).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn lock_funds_moves_amount_to_escrow_and_updates_totals() {
        let (_, ledger, commitments) = services();
        let organizer_phone = organizer(&commitments).await;
        let deadline = Utc::now() + chrono::Duration::days(1);
        let commitment = commitments.create_commitment(&organizer_phone, "Goa Trip", "", dec!(100), 2, deadline).await.unwrap();

        let (participant, _) = commitments.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&participant.wallet_address, dec!(200));

        let locked = commitments.lock_funds(&commitment.id, "+15550001").await.unwrap();
        assert_eq!(locked.status, ParticipantStatus::Locked);

        let refreshed = commitments.get_commitment_status(&commitment.id).await.unwrap();
        assert_eq!(refreshed.commitment.participants_locked, 1);
        assert_eq!(refreshed.commitment.total_locked, dec!(100));
    }

    #[tokio::test]
    async fn locking_twice_is_rejected() {
        let (_, ledger, commitments) = services();
        let organizer_phone = organizer(&commitments).await;
        let deadline = Utc::now() + chrono::Duration::days(1);
        let commitment = commitments.create_commitment(&organizer_phone, "Goa Trip", "", dec!(100), 2, deadline).await.unwrap();

        let (participant, _) = commitments.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&participant.wallet_address, dec!(200));

        commitments.lock_funds(&commitment.id, "+15550001").await.unwrap();
        let second = commitments.lock_funds(&commitment.id, "+15550001").await;
        assert!(matches!(second, Err(AppError::State(_))));
    }

    #[tokio::test]
    async fn release_marks_locked_released_and_invited_missed() {
        let (_, ledger, commitments) = services();
        let organizer_phone = organizer(&commitments).await;
        let deadline = Utc::now() + chrono::Duration::days(1);
        let commitment = commitments.create_commitment(&organizer_phone, "Goa Trip", "", dec!(100), 2, deadline).await.unwrap();

        let (locked_participant, _) = commitments.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&locked_participant.wallet_address, dec!(200));
        commitments.lock_funds(&commitment.id, "+15550001").await.unwrap();
        commitments.add_participant(&commitment.id, "+15550002").await.unwrap();

        let tx_id = commitments.release_commitment(&commitment.id).await.unwrap();
        assert!(!tx_id.is_empty());

        let details = commitments.get_commitment_status(&commitment.id).await.unwrap();
        assert_eq!(details.commitment.status, CommitmentStatus::Completed);

        let locked_score = commitments.get_user_reliability("+15550001").await.unwrap();
        assert_eq!(locked_score.fulfilled_on_time, 1);
        let missed_score = commitments.get_user_reliability("+15550002").await.unwrap();
        assert_eq!(missed_score.missed, 1);
    }

    #[tokio::test]
    async fn release_twice_is_rejected() {
        let (_, ledger, commitments) = services();
        let organizer_phone = organizer(&commitments).await;
        let deadline = Utc::now() + chrono::Duration::days(1);
        let commitment = commitments.create_commitment(&organizer_phone, "Goa Trip", "", dec!(100), 1, deadline).await.unwrap();

        let (participant, _) = commitments.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&participant.wallet_address, dec!(200));
        commitments.lock_funds(&commitment.id, "+15550001").await.unwrap();

        commitments.release_commitment(&commitment.id).await.unwrap();
        let second = commitments.release_commitment(&commitment.id).await;
        assert!(matches!(second, Err(AppError::State(_))));
    }

    #[tokio::test]
    async fn cancel_refunds_locked_participants_and_leaves_no_reliability_change() {
        let (_, ledger, commitments) = services();
        let organizer_phone = organizer(&commitments).await;
        let deadline = Utc::now() + chrono::Duration::days(1);
        let commitment = commitments.create_commitment(&organizer_phone, "Goa Trip", "", dec!(100), 1, deadline).await.unwrap();

        let (participant, _) = commitments.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&participant.wallet_address, dec!(200));
        commitments.lock_funds(&commitment.id, "+15550001").await.unwrap();

        let refunds = commitments.cancel_commitment(&commitment.id, &organizer_phone).await.unwrap();
        assert_eq!(refunds.len(), 1);

        let score = commitments.get_user_reliability("+15550001").await.unwrap();
        assert_eq!(score.total_commitments, 1); // unchanged from the lock action
    }

    #[tokio::test]
    async fn cancel_by_non_organizer_is_rejected() {
        let (_, _, commitments) = services();
        let organizer_phone = organizer(&commitments).await;
        let deadline = Utc::now() + chrono::Duration::days(1);
        let commitment = commitments.create_commitment(&organizer_phone, "Goa Trip", "", dec!(100), 1, deadline).await.unwrap();

        let result = commitments.cancel_commitment(&commitment.id, "+19999999999").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn lock_funds_exactly_at_deadline_is_rejected() {
        let (store, ledger, commitments) = services();
        let organizer_phone = organizer(&commitments).await;
        let deadline = Utc::now() + chrono::Duration::days(1);
        let commitment = commitments.create_commitment(&organizer_phone, "Goa Trip", "", dec!(100), 2, deadline).await.unwrap();

        let (participant, _) = commitments.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&participant.wallet_address, dec!(200));

        let mut stored = store.get_commitment(&commitment.id).await.unwrap().unwrap();
        stored.deadline = Utc::now();
        store.save_commitment(&stored).await.unwrap();

        let result = commitments.lock_funds(&commitment.id, "+15550001").await;
        assert!(matches!(result, Err(AppError::State(_))));
    }

    #[tokio::test]
    async fn expire_requires_deadline_passed_and_incomplete() {
        let (_, _, commitments) = services();
        let organizer_phone = organizer(&commitments).await;
        let deadline = Utc::now() + chrono::Duration::seconds(1);
        let commitment = commitments.create_commitment(&organizer_phone, "Goa Trip", "", dec!(100), 2, deadline).await.unwrap();

        let too_early = commitments.expire_commitment(&commitment.id, Utc::now()).await;
        assert!(matches!(too_early, Err(AppError::State(_))));

        let later = Utc::now() + chrono::Duration::days(2);
        let expired = commitments.expire_commitment(&commitment.id, later).await.unwrap();
        assert_eq!(expired.status, CommitmentStatus::Expired);
    }
}
