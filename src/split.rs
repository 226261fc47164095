//! Splits a bill evenly among the initiator and a participant list, and
//! collects each participant's share as a normal ledger payment to the
//! initiator. Grounded on the source's `SplitPaymentService`.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::amount::{has_sufficient_balance, validate_amount};
use crate::error::AppError;
use crate::ledger::LedgerAdapter;
use crate::retry::{retry_with, RetryConfig};
use crate::store::{
    new_id, SplitBillRecord, SplitBillStatus, SplitParticipant, SplitStore, TransactionRecord, TransactionStatus,
    TransactionStore, UserStore,
};
use crate::wallet::WalletService;

pub struct SplitService<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    wallet: Arc<WalletService<S, L>>,
}

impl<S, L> SplitService<S, L>
where
    S: UserStore + SplitStore + TransactionStore,
    L: LedgerAdapter,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, wallet: Arc<WalletService<S, L>>) -> Self {
        Self { store, ledger, wallet }
    }

    /// Splits `total_amount` evenly among the initiator and every distinct
    /// participant phone number (the initiator pays a share too, per the
    /// source's `all_people = [initiator] + participants`).
    pub async fn create_split_bill(
        &self,
        initiator_phone: &str,
        total_amount: Decimal,
        description: &str,
        participant_phones: &[String],
    ) -> Result<SplitBillRecord, AppError> {
        validate_amount(total_amount)?;
        if participant_phones.is_empty() {
            return Err(AppError::validation("at least one participant is required"));
        }

        let mut distinct: Vec<String> = participant_phones
            .iter()
            .filter(|p| p.as_str() != initiator_phone)
            .cloned()
            .collect();
        distinct.sort();
        distinct.dedup();

        let mut all_people = vec![initiator_phone.to_string()];
        all_people.extend(distinct);
        let num_people = Decimal::from(all_people.len() as u64);
        let per_person = total_amount / num_people;

        let record = SplitBillRecord {
            id: new_id("split"),
            initiator_phone: initiator_phone.to_string(),
            title: description.to_string(),
            total_amount,
            participants: all_people
                .into_iter()
                .map(|phone| SplitParticipant { phone, share_amount: per_person, paid: false, paid_at: None })
                .collect(),
            status: SplitBillStatus::Pending,
            completed_at: None,
            created_at: Utc::now(),
        };

        self.store.save_split(&record).await.map_err(|e| AppError::Internal(e.to_string()))?;
        info!(split_id = %record.id, initiator = initiator_phone, "split bill created");
        Ok(record)
    }

    /// Pays the caller's outstanding share, transferring it to the
    /// initiator. Returns the updated record.
    pub async fn pay_split_share(&self, split_bill_id: &str, participant_phone: &str) -> Result<SplitBillRecord, AppError> {
        let mut split = self
            .store
            .get_split(split_bill_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("split bill {split_bill_id}")))?;

        if split.is_fully_paid() {
            return Err(AppError::state("split bill is already fully paid"));
        }

        let share_index = split
            .participants
            .iter()
            .position(|p| p.phone == participant_phone)
            .ok_or_else(|| AppError::validation("you are not a participant in this split bill"))?;

        if split.participants[share_index].paid {
            return Err(AppError::state("you have already paid your share"));
        }

        let share_amount = split.participants[share_index].share_amount;

        let (participant, _) = self.wallet.get_or_create_wallet(participant_phone).await?;
        let (initiator, _) = self.wallet.get_or_create_wallet(&split.initiator_phone).await?;

        let config = RetryConfig::default();
        let balance = retry_with(&config, || self.ledger.balance(&participant.wallet_address)).await?;
        if !has_sufficient_balance(balance, share_amount) {
            return Err(AppError::InsufficientBalance { required: share_amount, available: balance });
        }

        let secret = self.wallet.get_secret(participant_phone).await?;
        let note = format!("Split: {}", truncate(&split.title, 50));
        let tx_id = retry_with(&config, || self.ledger.send_payment(&secret, &initiator.wallet_address, share_amount, &note)).await?;

        split.participants[share_index].paid = true;
        split.participants[share_index].paid_at = Some(Utc::now());

        if split.is_fully_paid() {
            split.status = SplitBillStatus::Completed;
            split.completed_at = Some(Utc::now());
        }

        self.store.save_split(&split).await.map_err(|e| AppError::Internal(e.to_string()))?;

        self.store
            .record(&TransactionRecord {
                id: new_id("tx"),
                sender_phone: participant_phone.to_string(),
                receiver: split.initiator_phone.clone(),
                amount: share_amount,
                note,
                tx_id: Some(tx_id),
                status: TransactionStatus::Completed,
                created_at: Utc::now(),
                confirmed_at: Some(Utc::now()),
            })
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        if split.status == SplitBillStatus::Completed {
            info!(split_id = %split.id, "split bill fully paid");
        } else {
            warn!(split_id = %split.id, "split bill partially paid, still pending");
        }

        Ok(split)
    }

    pub async fn get_split_bill_details(&self, split_bill_id: &str) -> Result<SplitBillRecord, AppError> {
        self.store
            .get_split(split_bill_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("split bill {split_bill_id}")))
    }

    /// All split bills involving `phone` (as initiator or participant) that
    /// still have an outstanding share.
    pub async fn get_my_split_bills(&self, phone: &str) -> Result<Vec<SplitBillRecord>, AppError> {
        let bills = self.store.list_splits_for(phone).await.map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(bills.into_iter().filter(|b| !b.is_fully_paid()).collect())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoService;
    use crate::ledger::fake::FakeLedger;
    use crate::store::InMemoryStore;
    use rust_decimal_macros::dec;

    fn services() -> (Arc<FakeLedger>, Arc<WalletService<InMemoryStore, FakeLedger>>, SplitService<InMemoryStore, FakeLedger>) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(FakeLedger::new());
        let crypto = Arc::new(CryptoService::new("test-secret"));
        let wallet = Arc::new(WalletService::new(store.clone(), ledger.clone(), crypto));
        let split = SplitService::new(store.clone(), ledger.clone(), wallet.clone());
        (ledger, wallet, split)
    }

    #[tokio::test]
    async fn splits_amount_evenly_including_initiator() {
        let (_, _, split) = services();
        let bill = split
            .create_split_bill("+1000", dec!(30), "dinner", &["+2000".into(), "+3000".into()])
            .await
            .unwrap();
        assert_eq!(bill.participants.len(), 3);
        assert!(bill.participants.iter().all(|p| p.share_amount == dec!(10)));
        assert!(bill.participants.iter().any(|p| p.phone == "+1000"));
    }

    #[tokio::test]
    async fn deduplicates_participants_and_excludes_initiator_duplicate() {
        let (_, _, split) = services();
        let bill = split
            .create_split_bill("+1000", dec!(20), "dinner", &["+2000".into(), "+2000".into(), "+1000".into()])
            .await
            .unwrap();
        assert_eq!(bill.participants.len(), 2);
    }

    #[tokio::test]
    async fn rejects_empty_participant_list() {
        let (_, _, split) = services();
        assert!(split.create_split_bill("+1000", dec!(20), "dinner", &[]).await.is_err());
    }

    #[tokio::test]
    async fn paying_share_transfers_funds_and_marks_paid() {
        let (ledger, wallet, split) = services();
        let (participant, _) = wallet.get_or_create_wallet("+2000").await.unwrap();
        ledger.seed_balance(&participant.wallet_address, dec!(100));

        let bill = split.create_split_bill("+1000", dec!(20), "dinner", &["+2000".into()]).await.unwrap();
        let updated = split.pay_split_share(&bill.id, "+2000").await.unwrap();

        let share = updated.participants.iter().find(|p| p.phone == "+2000").unwrap();
        assert!(share.paid);
    }

    #[tokio::test]
    async fn paying_last_share_marks_bill_completed() {
        let (ledger, wallet, split) = services();
        let (participant, _) = wallet.get_or_create_wallet("+2000").await.unwrap();
        ledger.seed_balance(&participant.wallet_address, dec!(100));
        let (initiator, _) = wallet.get_or_create_wallet("+1000").await.unwrap();
        ledger.seed_balance(&initiator.wallet_address, dec!(100));

        let bill = split.create_split_bill("+1000", dec!(20), "dinner", &["+2000".into()]).await.unwrap();
        assert_eq!(bill.status, crate::store::SplitBillStatus::Pending);
        assert!(bill.completed_at.is_none());

        let updated = split.pay_split_share(&bill.id, "+1000").await.unwrap();
        assert_eq!(updated.status, crate::store::SplitBillStatus::Pending);
        let updated = split.pay_split_share(&bill.id, "+2000").await.unwrap();
        assert_eq!(updated.status, crate::store::SplitBillStatus::Completed);
        assert!(updated.completed_at.is_some());
    }

    #[tokio::test]
    async fn paying_twice_is_rejected() {
        let (ledger, wallet, split) = services();
        let (participant, _) = wallet.get_or_create_wallet("+2000").await.unwrap();
        ledger.seed_balance(&participant.wallet_address, dec!(100));

        let bill = split.create_split_bill("+1000", dec!(20), "dinner", &["+2000".into()]).await.unwrap();
        split.pay_split_share(&bill.id, "+2000").await.unwrap();
        let second = split.pay_split_share(&bill.id, "+2000").await;
        assert!(matches!(second, Err(AppError::State(_))));
    }

    #[tokio::test]
    async fn non_participant_cannot_pay() {
        let (_, _, split) = services();
        let bill = split.create_split_bill("+1000", dec!(20), "dinner", &["+2000".into()]).await.unwrap();
        let result = split.pay_split_share(&bill.id, "+9999").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
