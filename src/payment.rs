//! Direct wallet-to-wallet and wallet-to-address payments, plus history.
//! Grounded on the source's `PaymentService`.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info};
use uuid::Uuid;

use crate::amount::{has_sufficient_balance, validate_amount};
use crate::error::AppError;
use crate::ledger::LedgerAdapter;
use crate::retry::{retry_with, RetryConfig};
use crate::store::{TransactionRecord, TransactionStatus, TransactionStore, UserStore};
use crate::wallet::WalletService;

pub struct PaymentService<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    wallet: Arc<WalletService<S, L>>,
}

impl<S, L> PaymentService<S, L>
where
    S: UserStore + TransactionStore,
    L: LedgerAdapter,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, wallet: Arc<WalletService<S, L>>) -> Self {
        Self { store, ledger, wallet }
    }

    /// Sends to a registered phone number, creating its wallet if this is
    /// the first time it's seen (mirrors the source's `get_or_create_wallet`
    /// call on the receiver side).
    pub async fn send_payment(
        &self,
        sender_phone: &str,
        receiver_phone: &str,
        amount: Decimal,
        note: &str,
    ) -> Result<TransactionRecord, AppError> {
        validate_amount(amount)?;

        let sender = self
            .wallet
            .get_user_by_phone(sender_phone)
            .await?
            .ok_or_else(|| AppError::not_found(format!("sender wallet {sender_phone}")))?;
        let (receiver, _) = self.wallet.get_or_create_wallet(receiver_phone).await?;

        self.execute_transfer(sender_phone, &sender.wallet_address, receiver_phone, &receiver.wallet_address, amount, note)
            .await
    }

    /// Sends directly to a ledger address that may not belong to a
    /// registered user.
    pub async fn send_payment_to_address(
        &self,
        sender_phone: &str,
        receiver_address: &str,
        amount: Decimal,
        note: &str,
    ) -> Result<TransactionRecord, AppError> {
        validate_amount(amount)?;

        let sender = self
            .wallet
            .get_user_by_phone(sender_phone)
            .await?
            .ok_or_else(|| AppError::not_found(format!("sender wallet {sender_phone}")))?;

        self.execute_transfer(sender_phone, &sender.wallet_address, receiver_address, receiver_address, amount, note)
            .await
    }

    async fn execute_transfer(
        &self,
        sender_phone: &str,
        sender_address: &str,
        receiver_identifier: &str,
        receiver_address: &str,
        amount: Decimal,
        note: &str,
    ) -> Result<TransactionRecord, AppError> {
        let config = RetryConfig::default();
        let sender_balance = retry_with(&config, || self.ledger.balance(sender_address)).await?;
        if !has_sufficient_balance(sender_balance, amount) {
            return Err(AppError::InsufficientBalance { required: amount, available: sender_balance });
        }

        let secret = self.wallet.get_secret(sender_phone).await?;

        info!(sender = sender_phone, receiver = receiver_identifier, %amount, "payment initiated");

        let record_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let pending = TransactionRecord {
            id: record_id.clone(),
            sender_phone: sender_phone.to_string(),
            receiver: receiver_identifier.to_string(),
            amount,
            note: note.to_string(),
            tx_id: None,
            status: TransactionStatus::Pending,
            created_at,
            confirmed_at: None,
        };
        self.store.record(&pending).await.map_err(|e| AppError::Internal(e.to_string()))?;

        match retry_with(&config, || self.ledger.send_payment(&secret, receiver_address, amount, note)).await {
            Ok(tx_id) => {
                let record = TransactionRecord {
                    status: TransactionStatus::Completed,
                    tx_id: Some(tx_id.clone()),
                    confirmed_at: Some(Utc::now()),
                    ..pending
                };
                self.store.record(&record).await.map_err(|e| AppError::Internal(e.to_string()))?;
                info!(tx_id = %tx_id, "payment completed");
                Ok(record)
            }
            Err(err) => {
                let record = TransactionRecord { status: TransactionStatus::Failed, ..pending };
                self.store.record(&record).await.map_err(|e| AppError::Internal(e.to_string()))?;
                error!(sender = sender_phone, error = %err, "payment failed");
                Err(err)
            }
        }
    }

    pub async fn history(&self, phone_number: &str, limit: usize) -> Result<Vec<TransactionRecord>, AppError> {
        self.store.history(phone_number, limit).await.map_err(|e| AppError::Internal(e.to_string()))
    }
}
