//! Fundraising pools: contributions flow straight to the organizer's
//! wallet, which doubles as escrow until the goal is reached or the pool
//! is closed. Grounded on the source's `FundService`.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::amount::{has_sufficient_balance, validate_amount};
use crate::error::AppError;
use crate::ledger::LedgerAdapter;
use crate::retry::{retry_with, RetryConfig};
use crate::store::{new_id, FundContribution, FundRecord, FundStore, TransactionRecord, TransactionStatus, TransactionStore, UserStore};
use crate::wallet::WalletService;

const DEFAULT_DEADLINE_HOURS: i64 = 168;

pub struct FundService<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    pub(crate) wallet: Arc<WalletService<S, L>>,
}

impl<S, L> FundService<S, L>
where
    S: UserStore + FundStore + TransactionStore,
    L: LedgerAdapter,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, wallet: Arc<WalletService<S, L>>) -> Self {
        Self { store, ledger, wallet }
    }

    pub async fn create_fund(
        &self,
        creator_phone: &str,
        title: &str,
        description: &str,
        goal_amount: Decimal,
        deadline_hours: Option<i64>,
    ) -> Result<FundRecord, AppError> {
        validate_amount(goal_amount)?;
        self.wallet.get_or_create_wallet(creator_phone).await?;

        let deadline = Utc::now() + chrono::Duration::hours(deadline_hours.unwrap_or(DEFAULT_DEADLINE_HOURS));
        let fund = FundRecord {
            id: new_id("fund"),
            organizer_phone: creator_phone.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            goal_amount,
            total_contributed: Decimal::ZERO,
            contributions: Vec::new(),
            deadline,
            created_at: Utc::now(),
            closed_at: None,
        };

        self.store.save_fund(&fund).await.map_err(|e| AppError::Internal(e.to_string()))?;
        info!(fund_id = %fund.id, title, %goal_amount, "fund created");
        Ok(fund)
    }

    /// Sends the contribution straight to the organizer's wallet (the fund
    /// escrow) and records it against the fund.
    pub async fn contribute_to_fund(
        &self,
        fund_id: &str,
        contributor_phone: &str,
        amount: Decimal,
    ) -> Result<FundRecord, AppError> {
        validate_amount(amount)?;

        let mut fund = self
            .store
            .get_fund(fund_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("fund {fund_id}")))?;

        if !fund.is_active() {
            return Err(AppError::state("fund is no longer active"));
        }
        if Utc::now() > fund.deadline {
            return Err(AppError::state("fund deadline has passed"));
        }

        let (contributor, _) = self.wallet.get_or_create_wallet(contributor_phone).await?;
        let (organizer, _) = self.wallet.get_or_create_wallet(&fund.organizer_phone).await?;

        let config = RetryConfig::default();
        let balance = retry_with(&config, || self.ledger.balance(&contributor.wallet_address)).await?;
        if !has_sufficient_balance(balance, amount) {
            return Err(AppError::InsufficientBalance { required: amount, available: balance });
        }

        let secret = self.wallet.get_secret(contributor_phone).await?;
        let note = format!("Fund: {}", fund.title);

        let tx_id = match retry_with(&config, || self.ledger.send_payment(&secret, &organizer.wallet_address, amount, &note)).await {
            Ok(tx_id) => tx_id,
            Err(err) => {
                error!(fund_id, contributor = contributor_phone, error = %err, "fund contribution failed");
                return Err(err);
            }
        };

        fund.contributions.push(FundContribution {
            phone: contributor_phone.to_string(),
            amount,
            contributed_at: Utc::now(),
        });
        fund.total_contributed += amount;
        let goal_met = fund.is_goal_met();

        self.store.save_fund(&fund).await.map_err(|e| AppError::Internal(e.to_string()))?;

        self.store
            .record(&TransactionRecord {
                id: new_id("tx"),
                sender_phone: contributor_phone.to_string(),
                receiver: fund.organizer_phone.clone(),
                amount,
                note,
                tx_id: Some(tx_id),
                status: TransactionStatus::Completed,
                created_at: Utc::now(),
                confirmed_at: Some(Utc::now()),
            })
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        if goal_met {
            info!(fund_id, "fund reached its goal");
        }
        info!(fund_id, contributor = contributor_phone, %amount, "fund contribution recorded");
        Ok(fund)
    }

    pub async fn get_fund_details(&self, fund_id: &str) -> Result<FundDetails, AppError> {
        let fund = self
            .store
            .get_fund(fund_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("fund {fund_id}")))?;

        let percentage = if fund.goal_amount > Decimal::ZERO {
            (fund.total_contributed / fund.goal_amount) * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        Ok(FundDetails {
            is_goal_met: fund.is_goal_met(),
            is_active: fund.is_active(),
            percentage,
            fund,
        })
    }

    pub async fn list_active_funds(&self) -> Result<Vec<FundRecord>, AppError> {
        self.store.list_active_funds().await.map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn close_fund(&self, fund_id: &str) -> Result<FundRecord, AppError> {
        let mut fund = self
            .store
            .get_fund(fund_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("fund {fund_id}")))?;

        if !fund.is_active() {
            return Err(AppError::state("fund is already closed"));
        }
        fund.closed_at = Some(Utc::now());
        self.store.save_fund(&fund).await.map_err(|e| AppError::Internal(e.to_string()))?;
        info!(fund_id, "fund closed");
        Ok(fund)
    }
}

#[derive(Debug, Clone)]
pub struct FundDetails {
    pub fund: FundRecord,
    pub percentage: Decimal,
    pub is_goal_met: bool,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoService;
    use crate::ledger::fake::FakeLedger;
    use crate::store::InMemoryStore;
    use rust_decimal_macros::dec;

    fn services() -> (Arc<InMemoryStore>, Arc<FakeLedger>, FundService<InMemoryStore, FakeLedger>) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(FakeLedger::new());
        let crypto = Arc::new(CryptoService::new("test-secret"));
        let wallet = Arc::new(WalletService::new(store.clone(), ledger.clone(), crypto));
        let funds = FundService::new(store.clone(), ledger.clone(), wallet);
        (store, ledger, funds)
    }

    #[tokio::test]
    async fn rejects_non_positive_goal() {
        let (_, _, funds) = services();
        let result = funds.create_fund("+15559999", "Relief", "", dec!(0), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn contribution_accumulates_and_flags_goal_met() {
        let (_, ledger, funds) = services();
        let fund = funds.create_fund("+15559999", "Relief", "", dec!(20), None).await.unwrap();

        let (contributor, _) = funds.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&contributor.wallet_address, dec!(100));

        let updated = funds.contribute_to_fund(&fund.id, "+15550001", dec!(20)).await.unwrap();
        assert!(updated.is_goal_met());
        assert_eq!(updated.total_contributed, dec!(20));
    }

    #[tokio::test]
    async fn rejects_contribution_to_closed_fund() {
        let (_, ledger, funds) = services();
        let fund = funds.create_fund("+15559999", "Relief", "", dec!(20), None).await.unwrap();
        funds.close_fund(&fund.id).await.unwrap();

        let (contributor, _) = funds.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&contributor.wallet_address, dec!(100));

        let result = funds.contribute_to_fund(&fund.id, "+15550001", dec!(5)).await;
        assert!(matches!(result, Err(AppError::State(_))));
    }

    #[tokio::test]
    async fn rejects_contribution_past_deadline() {
        let (store, ledger, funds) = services();
        let mut fund = funds.create_fund("+15559999", "Relief", "", dec!(20), Some(1)).await.unwrap();
        fund.deadline = Utc::now() - chrono::Duration::hours(1);
        store.save_fund(&fund).await.unwrap();

        let (contributor, _) = funds.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&contributor.wallet_address, dec!(100));

        let result = funds.contribute_to_fund(&fund.id, "+15550001", dec!(5)).await;
        assert!(matches!(result, Err(AppError::State(_))));
    }

    #[tokio::test]
    async fn details_compute_percentage() {
        let (_, ledger, funds) = services();
        let fund = funds.create_fund("+15559999", "Relief", "", dec!(50), None).await.unwrap();
        let (contributor, _) = funds.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&contributor.wallet_address, dec!(100));
        funds.contribute_to_fund(&fund.id, "+15550001", dec!(25)).await.unwrap();

        let details = funds.get_fund_details(&fund.id).await.unwrap();
        assert_eq!(details.percentage, dec!(50));
        assert!(!details.is_goal_met);
    }
}
