//! Event tickets minted as ledger NFTs. Grounded on the source's
//! `TicketService`.

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::amount::has_sufficient_balance;
use crate::error::AppError;
use crate::ledger::LedgerAdapter;
use crate::retry::{retry_with, RetryConfig};
use crate::store::{new_id, EventRecord, TicketRecord, TicketStore, UserStore};
use crate::wallet::WalletService;

const MAX_EVENTS_LISTED: usize = 5;

pub struct TicketService<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    pub(crate) wallet: Arc<WalletService<S, L>>,
}

impl<S, L> TicketService<S, L>
where
    S: UserStore + TicketStore,
    L: LedgerAdapter,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, wallet: Arc<WalletService<S, L>>) -> Self {
        Self { store, ledger, wallet }
    }

    pub async fn list_events(&self) -> Result<Vec<EventRecord>, AppError> {
        self.store.list_events(MAX_EVENTS_LISTED).await.map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn list_my_tickets(&self, phone: &str) -> Result<Vec<TicketRecord>, AppError> {
        self.store.list_tickets_for(phone).await.map_err(|e| AppError::Internal(e.to_string()))
    }

    /// Purchases one ticket for an event looked up by id or by exact/partial
    /// name match, mirroring the source's `purchase_ticket` dispatch.
    pub async fn purchase_ticket(
        &self,
        buyer_phone: &str,
        event_id: Option<&str>,
        event_name: Option<&str>,
    ) -> Result<TicketPurchase, AppError> {
        let mut event = match (event_id, event_name) {
            (Some(id), _) => self
                .store
                .get_event(id)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?
                .ok_or_else(|| AppError::not_found(format!("event {id}")))?,
            (None, Some(name)) => self.find_event_by_name(name).await?,
            (None, None) => return Err(AppError::validation("either event_id or event_name is required")),
        };

        if event.tickets_sold >= event.total_tickets {
            return Err(AppError::state(format!("{} is sold out", event.title)));
        }

        let (buyer, _) = self.wallet.get_or_create_wallet(buyer_phone).await?;
        let config = RetryConfig::default();
        let balance = retry_with(&config, || self.ledger.balance(&buyer.wallet_address)).await?;
        if !has_sufficient_balance(balance, event.price) {
            return Err(AppError::InsufficientBalance { required: event.price, available: balance });
        }

        let secret = self.wallet.get_secret(buyer_phone).await?;
        let asset_name = format!("{} Ticket", event.title);
        let ticket_number = generate_ticket_number(&event.title);
        let metadata_url = format!("https://algochat.app/tickets/{ticket_number}");

        let asset_id = match retry_with(&config, || self.ledger.create_nft(&secret, &asset_name, "TIX", 1, &metadata_url)).await {
            Ok(id) => id,
            Err(err) => {
                error!(event = %event.title, buyer = buyer_phone, error = %err, "ticket mint failed");
                return Err(err);
            }
        };

        let ticket_metadata = serde_json::json!({
            "event": event.title,
            "category": event.category,
            "date": event.date,
            "price": event.price,
        })
        .to_string();

        let ticket = TicketRecord {
            id: new_id("ticket"),
            event_id: event.id.clone(),
            owner_phone: buyer_phone.to_string(),
            asset_id,
            ticket_number: ticket_number.clone(),
            ticket_metadata,
            used: false,
            is_valid: true,
            used_at: None,
            purchased_at: Utc::now(),
        };
        self.store.save_ticket(&ticket).await.map_err(|e| AppError::Internal(e.to_string()))?;

        event.tickets_sold += 1;
        self.store.save_event(&event).await.map_err(|e| AppError::Internal(e.to_string()))?;
        let remaining_tickets = event.total_tickets - event.tickets_sold;

        info!(ticket_number = %ticket.ticket_number, event = %event.title, buyer = buyer_phone, "ticket purchased");
        Ok(TicketPurchase { ticket, event, remaining_tickets })
    }

    /// Confirms the ticket hasn't already been used and that the owner's
    /// wallet still actually holds the minted asset on-chain.
    pub async fn verify_ticket(&self, ticket_number: &str) -> Result<TicketVerification, AppError> {
        let ticket = self
            .store
            .get_ticket_by_number(ticket_number)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("ticket {ticket_number}")))?;

        if ticket.used || !ticket.is_valid {
            return Ok(TicketVerification { valid: false, reason: "ticket already used".into() });
        }

        let (owner, _) = self.wallet.get_or_create_wallet(&ticket.owner_phone).await?;
        let owned = self
            .ledger
            .account_assets(&owner.wallet_address)
            .await?
            .iter()
            .any(|holding| holding.asset_id == ticket.asset_id);
        if !owned {
            return Ok(TicketVerification { valid: false, reason: "asset not found in owner's wallet".into() });
        }

        Ok(TicketVerification { valid: true, reason: "ok".into() })
    }

    pub async fn mark_ticket_used(&self, ticket_number: &str) -> Result<TicketRecord, AppError> {
        let mut ticket = self
            .store
            .get_ticket_by_number(ticket_number)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .ok_or_else(|| AppError::not_found(format!("ticket {ticket_number}")))?;

        if ticket.used {
            return Err(AppError::state("ticket already used"));
        }
        ticket.used = true;
        ticket.is_valid = false;
        ticket.used_at = Some(Utc::now());
        self.store.save_ticket(&ticket).await.map_err(|e| AppError::Internal(e.to_string()))?;
        info!(ticket_number = %ticket.ticket_number, "ticket marked used");
        Ok(ticket)
    }

    async fn find_event_by_name(&self, name: &str) -> Result<EventRecord, AppError> {
        let events = self.store.list_events(usize::MAX).await.map_err(|e| AppError::Internal(e.to_string()))?;
        let lowered = name.to_lowercase();

        events
            .iter()
            .find(|e| e.title.to_lowercase() == lowered)
            .or_else(|| events.iter().find(|e| e.title.to_lowercase().contains(&lowered)))
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("event {name}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TicketVerification {
    pub valid: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct TicketPurchase {
    pub ticket: TicketRecord,
    pub event: EventRecord,
    pub remaining_tickets: u32,
}

/// `PREFIX-XXXXXXXXXXXX`, mirroring the source's `secrets.token_hex(6)`.
pub fn generate_ticket_number(event_name: &str) -> String {
    let prefix: String = event_name.chars().take(3).collect::<String>().to_uppercase();
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!("{prefix}-{hex}")
}

pub fn new_event(
    organizer_phone: &str,
    title: &str,
    price: Decimal,
    total_tickets: u32,
    date: chrono::DateTime<Utc>,
    category: &str,
) -> EventRecord {
    EventRecord {
        id: new_id("event"),
        organizer_phone: organizer_phone.to_string(),
        title: title.to_string(),
        price,
        total_tickets,
        tickets_sold: 0,
        date,
        category: category.to_string(),
        is_active: true,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoService;
    use crate::ledger::fake::FakeLedger;
    use crate::store::InMemoryStore;
    use rust_decimal_macros::dec;

    fn services() -> (Arc<InMemoryStore>, Arc<FakeLedger>, TicketService<InMemoryStore, FakeLedger>) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(FakeLedger::new());
        let crypto = Arc::new(CryptoService::new("test-secret"));
        let wallet = Arc::new(WalletService::new(store.clone(), ledger.clone(), crypto));
        let tickets = TicketService::new(store.clone(), ledger.clone(), wallet);
        (store, ledger, tickets)
    }

    #[test]
    fn ticket_number_has_uppercase_prefix_and_hex_suffix() {
        let n = generate_ticket_number("summer fest");
        assert!(n.starts_with("SUM-"));
        assert_eq!(n.len(), "SUM-".len() + 12);
    }

    #[tokio::test]
    async fn purchase_fails_for_unknown_event() {
        let (_, _, tickets) = services();
        let result = tickets.purchase_ticket("+15550001", Some("nope"), None).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn purchase_fails_when_sold_out() {
        let (store, _, tickets) = services();
        let mut event = new_event("+15559999", "Concert", dec!(5), 1, Utc::now(), "music");
        event.tickets_sold = 1;
        store.save_event(&event).await.unwrap();

        let result = tickets.purchase_ticket("+15550001", Some(&event.id), None).await;
        assert!(matches!(result, Err(AppError::State(_))));
    }

    #[tokio::test]
    async fn purchase_mints_ticket_and_increments_sold_count() {
        let (store, ledger, tickets) = services();
        let event = new_event("+15559999", "Concert", dec!(5), 10, Utc::now(), "music");
        store.save_event(&event).await.unwrap();

        let (buyer, _) = tickets.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&buyer.wallet_address, dec!(50));

        let purchase = tickets.purchase_ticket("+15550001", Some(&event.id), None).await.unwrap();
        assert_eq!(purchase.ticket.owner_phone, "+15550001");
        assert_eq!(purchase.event.tickets_sold, 1);
        assert_eq!(purchase.remaining_tickets, 9);
    }

    #[tokio::test]
    async fn verify_rejects_already_used_ticket() {
        let (store, ledger, tickets) = services();
        let event = new_event("+15559999", "Concert", dec!(5), 10, Utc::now(), "music");
        store.save_event(&event).await.unwrap();
        let (buyer, _) = tickets.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&buyer.wallet_address, dec!(50));

        let purchase = tickets.purchase_ticket("+15550001", Some(&event.id), None).await.unwrap();
        tickets.mark_ticket_used(&purchase.ticket.ticket_number).await.unwrap();

        let verification = tickets.verify_ticket(&purchase.ticket.ticket_number).await.unwrap();
        assert!(!verification.valid);
    }

    #[tokio::test]
    async fn verify_accepts_unused_ticket_by_ticket_number() {
        let (store, ledger, tickets) = services();
        let event = new_event("+15559999", "Concert", dec!(5), 10, Utc::now(), "music");
        store.save_event(&event).await.unwrap();
        let (buyer, _) = tickets.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&buyer.wallet_address, dec!(50));

        let purchase = tickets.purchase_ticket("+15550001", Some(&event.id), None).await.unwrap();
        let verification = tickets.verify_ticket(&purchase.ticket.ticket_number).await.unwrap();
        assert!(verification.valid);
    }

    #[tokio::test]
    async fn find_event_by_partial_name_match() {
        let (store, ledger, tickets) = services();
        let event = new_event("+15559999", "Summer Music Festival", dec!(5), 10, Utc::now(), "music");
        store.save_event(&event).await.unwrap();
        let (buyer, _) = tickets.wallet.get_or_create_wallet("+15550001").await.unwrap();
        ledger.seed_balance(&buyer.wallet_address, dec!(50));

        let purchase = tickets.purchase_ticket("+15550001", None, Some("music")).await.unwrap();
        assert_eq!(purchase.event.id, event.id);
    }
}
