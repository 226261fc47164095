//! Maps phone numbers to custodial wallets: get-or-create, balance lookup,
//! and decrypted-secret retrieval for transaction signing. Grounded on the
//! source's `WalletService`.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::crypto::CryptoService;
use crate::error::AppError;
use crate::ledger::LedgerAdapter;
use crate::retry::{retry_with, RetryConfig};
use crate::store::{UserRecord, UserStore};

/// Validates the `+<10-15 digits>` phone format used throughout the bot.
pub fn validate_phone_number(phone: &str) -> bool {
    let Some(rest) = phone.strip_prefix('+') else { return false };
    let digits: String = rest.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
    digits.len() >= 10 && digits.len() <= 15 && digits.chars().all(|c| c.is_ascii_digit())
}

pub struct WalletService<S, L> {
    store: Arc<S>,
    pub(crate) ledger: Arc<L>,
    crypto: Arc<CryptoService>,
}

impl<S, L> WalletService<S, L>
where
    S: UserStore,
    L: LedgerAdapter,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, crypto: Arc<CryptoService>) -> Self {
        Self { store, ledger, crypto }
    }

    /// Returns `(user, created)`. Creates a fresh custodial wallet the
    /// first time a phone number is seen.
    pub async fn get_or_create_wallet(&self, phone_number: &str) -> Result<(UserRecord, bool), AppError> {
        if !validate_phone_number(phone_number) {
            return Err(AppError::validation(format!("invalid phone number format: {phone_number}")));
        }

        if let Some(user) = self.store.get_user(phone_number).await.map_err(|e| AppError::Internal(e.to_string()))? {
            info!(phone = phone_number, "retrieved existing wallet");
            return Ok((user, false));
        }

        let config = RetryConfig::default();
        let (secret, address, _mnemonic) = retry_with(&config, || self.ledger.derive_account()).await?;
        let encrypted_secret = self.crypto.encrypt(&secret)?;

        let user = UserRecord {
            phone: phone_number.to_string(),
            wallet_address: address.clone(),
            encrypted_secret,
            created_at: Utc::now(),
        };
        self.store.save_user(&user).await.map_err(|e| AppError::Internal(e.to_string()))?;
        info!(phone = phone_number, address = %address, "created new wallet");
        Ok((user, true))
    }

    pub async fn get_user_by_phone(&self, phone_number: &str) -> Result<Option<UserRecord>, AppError> {
        self.store.get_user(phone_number).await.map_err(|e| AppError::Internal(e.to_string()))
    }

    /// Decrypts and returns the user's ledger secret. Never logged.
    pub async fn get_secret(&self, phone_number: &str) -> Result<String, AppError> {
        let user = self
            .store
            .get_user(phone_number)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("wallet for {phone_number}")))?;
        self.crypto.decrypt(&user.encrypted_secret)
    }

    pub async fn get_balance(&self, phone_number: &str) -> Result<Decimal, AppError> {
        let user = self
            .store
            .get_user(phone_number)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("wallet for {phone_number}")))?;
        let config = RetryConfig::default();
        retry_with(&config, || self.ledger.balance(&user.wallet_address)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::fake::FakeLedger;
    use crate::store::InMemoryStore;
    use rust_decimal_macros::dec;

    fn service() -> WalletService<InMemoryStore, FakeLedger> {
        WalletService::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(FakeLedger::new()),
            Arc::new(CryptoService::new("test-secret")),
        )
    }

    #[test]
    fn validates_phone_shape() {
        assert!(validate_phone_number("+15550001234"));
        assert!(!validate_phone_number("5550001234"));
        assert!(!validate_phone_number("+123"));
    }

    #[tokio::test]
    async fn creates_wallet_once_then_returns_existing() {
        let svc = service();
        let (first, created) = svc.get_or_create_wallet("+15550001234").await.unwrap();
        assert!(created);

        let (second, created_again) = svc.get_or_create_wallet("+15550001234").await.unwrap();
        assert!(!created_again);
        assert_eq!(first.wallet_address, second.wallet_address);
    }

    #[tokio::test]
    async fn rejects_malformed_phone_numbers() {
        let svc = service();
        assert!(svc.get_or_create_wallet("not-a-phone").await.is_err());
    }

    #[tokio::test]
    async fn secret_round_trips_through_encryption() {
        let svc = service();
        let (user, _) = svc.get_or_create_wallet("+15550001234").await.unwrap();
        let secret = svc.get_secret("+15550001234").await.unwrap();
        assert!(!secret.is_empty());
        assert_ne!(secret, user.encrypted_secret);
    }

    #[tokio::test]
    async fn balance_reflects_ledger_state() {
        let svc = service();
        let (user, _) = svc.get_or_create_wallet("+15550001234").await.unwrap();
        svc.ledger.seed_balance(&user.wallet_address, dec!(42));
        assert_eq!(svc.get_balance("+15550001234").await.unwrap(), dec!(42));
    }
}
