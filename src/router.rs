//! Single entry point for an inbound chat message. Normalizes the sender's
//! identifier, advances any in-progress guided flow, otherwise parses the
//! message as a command (falling back to the natural-language mapper),
//! dispatches to the owning domain service, and renders a reply. Grounded on
//! the source bot package's webhook dispatch order (conversation state
//! first, then the command parser) and on the teacher's `routes.rs` for the
//! handler-composition style.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::warn;

use crate::commitment::CommitmentService;
use crate::conversation::ConversationStateManager;
use crate::error::AppError;
use crate::fund::FundService;
use crate::ledger::LedgerAdapter;
use crate::nl_mapper::{self, NlCommand};
use crate::notification::{self, notify_best_effort, NotificationDispatcher};
use crate::parser::{self, Command};
use crate::payment::PaymentService;
use crate::split::SplitService;
use crate::store::{CommitmentStore, FundStore, ReliabilityStore, SplitStore, TicketStore, TransactionStore, UserStore};
use crate::ticket::TicketService;
use crate::wallet::WalletService;

/// Confidence below which a natural-language match is treated as noise
/// rather than acted on.
const NL_CONFIDENCE_FLOOR: f64 = 0.8;

pub struct Router<S, L> {
    conversations: Arc<ConversationStateManager>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    wallet: Arc<WalletService<S, L>>,
    payment: Arc<PaymentService<S, L>>,
    split: Arc<SplitService<S, L>>,
    ticket: Arc<TicketService<S, L>>,
    fund: Arc<FundService<S, L>>,
    commitment: Arc<CommitmentService<S, L>>,
}

impl<S, L> Router<S, L>
where
    S: UserStore + TransactionStore + SplitStore + FundStore + TicketStore + CommitmentStore + ReliabilityStore,
    L: LedgerAdapter,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<ConversationStateManager>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        wallet: Arc<WalletService<S, L>>,
        payment: Arc<PaymentService<S, L>>,
        split: Arc<SplitService<S, L>>,
        ticket: Arc<TicketService<S, L>>,
        fund: Arc<FundService<S, L>>,
        commitment: Arc<CommitmentService<S, L>>,
    ) -> Self {
        Self { conversations, dispatcher, wallet, payment, split, ticket, fund, commitment }
    }

    /// Normalizes `user_identifier`, routes the message, and returns the
    /// reply text. Never returns an `Err`: failures are rendered as the
    /// error's sanitized public message so the caller always has something
    /// to send back.
    pub async fn handle(&self, user_identifier: &str, text: &str) -> String {
        let phone = user_identifier.trim();
        let _ = self.wallet.get_or_create_wallet(phone).await;

        if let Some(reply) = self.advance_guided_flow(phone, text).await {
            return reply;
        }

        if text.trim().eq_ignore_ascii_case("create commitment") || text.trim().eq_ignore_ascii_case("new commitment") {
            self.conversations.create_state(phone, "create_commitment");
            return "Let's set up a commitment. What's the title?".to_string();
        }

        let command = parser::parse(text);
        if command != Command::Unknown {
            return self.dispatch(phone, command).await;
        }

        match nl_mapper::parse_natural_language(text) {
            Some(m) if m.confidence >= NL_CONFIDENCE_FLOOR => self.dispatch_nl(phone, m.command).await,
            _ => {
                warn!(phone, text, "no command or natural-language match, showing help");
                self.help_text()
            }
        }
    }

    /// Drives the multi-step guided commitment-creation flow. Returns `None`
    /// if there's no active flow for this phone (the caller should fall
    /// through to normal command parsing).
    async fn advance_guided_flow(&self, phone: &str, text: &str) -> Option<String> {
        let mut state = self.conversations.get_state(phone)?;
        if state.flow_type != "create_commitment" {
            return None;
        }

        let input = text.trim();
        match state.step {
            0 => {
                state.set_data("title", json!(input));
                state.next_step();
                self.conversations.update_state(phone, state);
                Some("How much does each participant lock in (e.g. 25)?".to_string())
            }
            1 => {
                let Ok(amount) = Decimal::from_str(input) else {
                    return Some("That doesn't look like a number. How much does each participant lock in?".to_string());
                };
                state.set_data("amount", json!(amount.to_string()));
                state.next_step();
                self.conversations.update_state(phone, state);
                Some("How many participants (including you)?".to_string())
            }
            2 => {
                let Ok(participants) = input.parse::<u32>() else {
                    return Some("That doesn't look like a whole number. How many participants?".to_string());
                };
                state.set_data("participants", json!(participants));
                state.next_step();
                self.conversations.update_state(phone, state);
                Some("How many days until the deadline?".to_string())
            }
            3 => {
                let Ok(days) = input.parse::<i64>() else {
                    return Some("That doesn't look like a whole number. How many days until the deadline?".to_string());
                };

                let title = state.get_data("title").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
                let amount = state
                    .get_data("amount")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .and_then(|s| Decimal::from_str(&s).ok())
                    .unwrap_or(Decimal::ZERO);
                let participants = state.get_data("participants").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let deadline = chrono::Utc::now() + chrono::Duration::days(days);

                self.conversations.clear_state(phone);

                match self.commitment.create_commitment(phone, &title, "", amount, participants, deadline).await {
                    Ok(commitment) => Some(format!(
                        "Commitment '{}' created. id: {}\nAsk participants to lock in with: lock {}",
                        commitment.title, commitment.id, commitment.id
                    )),
                    Err(err) => Some(err.public_message()),
                }
            }
            _ => {
                self.conversations.clear_state(phone);
                None
            }
        }
    }

    async fn dispatch(&self, phone: &str, command: Command) -> String {
        match command {
            Command::Help => self.help_text(),
            Command::Balance => match self.wallet.get_balance(phone).await {
                Ok(balance) => format!("Your balance: {balance}"),
                Err(err) => err.public_message(),
            },
            Command::Pay { amount, receiver_phone } => self.do_pay(phone, &receiver_phone, amount).await,
            Command::Split { amount, description, participants } => {
                self.do_create_split(phone, amount, &description, &participants).await
            }
            Command::PaySplit { split_bill_id } => self.do_pay_split(phone, &split_bill_id).await,
            Command::ViewSplit { split_bill_id } => match self.split.get_split_bill_details(&split_bill_id).await {
                Ok(bill) => render_split(&bill),
                Err(err) => err.public_message(),
            },
            Command::MySplits => match self.split.get_my_split_bills(phone).await {
                Ok(bills) if bills.is_empty() => "You have no outstanding split bills.".to_string(),
                Ok(bills) => bills.iter().map(render_split).collect::<Vec<_>>().join("\n---\n"),
                Err(err) => err.public_message(),
            },
            Command::CreateFund { title, goal_amount } => match self.fund.create_fund(phone, &title, "", goal_amount, None).await {
                Ok(fund) => format!("Fund '{}' created. id: {}, goal: {}", fund.title, fund.id, fund.goal_amount),
                Err(err) => err.public_message(),
            },
            Command::Contribute { fund_id, amount } => match self.fund.contribute_to_fund(&fund_id, phone, amount).await {
                Ok(fund) => format!(
                    "Contributed {amount} to '{}'. Total raised: {} / {}",
                    fund.title, fund.total_contributed, fund.goal_amount
                ),
                Err(err) => err.public_message(),
            },
            Command::ViewFund { fund_id } => match self.fund.get_fund_details(&fund_id).await {
                Ok(details) => format!(
                    "{} — {} / {} ({}%){}",
                    details.fund.title,
                    details.fund.total_contributed,
                    details.fund.goal_amount,
                    details.percentage.round(),
                    if details.is_goal_met { " goal met!" } else { "" }
                ),
                Err(err) => err.public_message(),
            },
            Command::ListFunds => match self.fund.list_active_funds().await {
                Ok(funds) if funds.is_empty() => "No active funds right now.".to_string(),
                Ok(funds) => funds
                    .iter()
                    .map(|f| format!("{} (id: {}) — {} / {}", f.title, f.id, f.total_contributed, f.goal_amount))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(err) => err.public_message(),
            },
            Command::BuyTicket { event_id, event_name } => {
                match self.ticket.purchase_ticket(phone, event_id.as_deref(), event_name.as_deref()).await {
                    Ok(purchase) => format!(
                        "Ticket purchased for {}. ticket number: {} ({} remaining)",
                        purchase.event.title, purchase.ticket.ticket_number, purchase.remaining_tickets
                    ),
                    Err(err) => err.public_message(),
                }
            }
            Command::VerifyTicket { ticket_number } => match self.ticket.verify_ticket(&ticket_number).await {
                Ok(v) if v.valid => "Ticket is valid.".to_string(),
                Ok(v) => format!("Ticket is not valid: {}", v.reason),
                Err(err) => err.public_message(),
            },
            Command::MyTickets => match self.ticket.list_my_tickets(phone).await {
                Ok(tickets) if tickets.is_empty() => "You have no tickets.".to_string(),
                Ok(tickets) => tickets
                    .iter()
                    .map(|t| format!("{} (event: {}){}", t.ticket_number, t.event_id, if t.used { " used" } else { "" }))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(err) => err.public_message(),
            },
            Command::ListEvents => match self.ticket.list_events().await {
                Ok(events) if events.is_empty() => "No upcoming events.".to_string(),
                Ok(events) => events
                    .iter()
                    .map(|e| format!("{} (id: {}) — {} ({}/{} sold)", e.title, e.id, e.price, e.tickets_sold, e.total_tickets))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(err) => err.public_message(),
            },
            Command::History => match self.payment.history(phone, 10).await {
                Ok(history) if history.is_empty() => "No transaction history yet.".to_string(),
                Ok(history) => history
                    .iter()
                    .map(|t| format!("{} -> {}: {} ({:?})", t.sender_phone, t.receiver, t.amount, t.status))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(err) => err.public_message(),
            },
            Command::CreateCommitment { title, amount, participants, days } => {
                let deadline = chrono::Utc::now() + chrono::Duration::days(days as i64);
                match self.commitment.create_commitment(phone, &title, "", amount, participants, deadline).await {
                    Ok(commitment) => format!("Commitment '{}' created. id: {}", commitment.title, commitment.id),
                    Err(err) => err.public_message(),
                }
            }
            Command::CommitFunds { commitment_id } => match self.commitment.lock_funds(&commitment_id, phone).await {
                Ok(_) => format!("Funds locked for commitment {commitment_id}."),
                Err(err) => err.public_message(),
            },
            Command::ViewCommitment { commitment_id } => match self.commitment.get_commitment_status(&commitment_id).await {
                Ok(details) => format!(
                    "{} — {}% locked, {} days left, status {:?}",
                    details.commitment.title,
                    details.completion_percentage,
                    details.days_until_deadline,
                    details.commitment.status
                ),
                Err(err) => err.public_message(),
            },
            Command::CancelCommitment { commitment_id } => match self.commitment.cancel_commitment(&commitment_id, phone).await {
                Ok(refunds) => format!("Commitment {commitment_id} canceled, {} refunds issued.", refunds.len()),
                Err(err) => err.public_message(),
            },
            Command::AddParticipant { commitment_id, phone: participant_phone } => {
                match self.commitment.add_participant(&commitment_id, &participant_phone).await {
                    Ok(_) => format!("{participant_phone} invited to commitment {commitment_id}."),
                    Err(err) => err.public_message(),
                }
            }
            Command::Reliability => match self.commitment.get_user_reliability(phone).await {
                Ok(score) => format!(
                    "Reliability score: {} ({} fulfilled, {} missed, {} total)",
                    score.score, score.fulfilled_on_time, score.missed, score.total_commitments
                ),
                Err(err) => err.public_message(),
            },
            Command::MyCommitments => match self.commitment.list_my_commitments(phone).await {
                Ok(commitments) if commitments.is_empty() => "You have no commitments.".to_string(),
                Ok(commitments) => commitments
                    .iter()
                    .map(|c| format!("{} (id: {}) — {:?}", c.title, c.id, c.status))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(err) => err.public_message(),
            },
            Command::Unknown => self.help_text(),
        }
    }

    async fn dispatch_nl(&self, phone: &str, command: NlCommand) -> String {
        match command {
            NlCommand::Menu | NlCommand::Help => self.help_text(),
            NlCommand::Balance => self.dispatch(phone, Command::Balance).await,
            NlCommand::History => self.dispatch(phone, Command::History).await,
            NlCommand::Events => self.dispatch(phone, Command::ListEvents).await,
            NlCommand::Funds => self.dispatch(phone, Command::ListFunds).await,
            NlCommand::MySplits => self.dispatch(phone, Command::MySplits).await,
            NlCommand::Pay { amount, phone: receiver_phone } => {
                let Ok(amount) = Decimal::from_str(&amount) else { return "I couldn't read that amount.".to_string() };
                self.dispatch(phone, Command::Pay { amount, receiver_phone }).await
            }
            NlCommand::BuyTicket { event_id } => self.dispatch(phone, Command::BuyTicket { event_id: Some(event_id), event_name: None }).await,
            NlCommand::Contribute { amount, fund_id } => {
                let Ok(amount) = Decimal::from_str(&amount) else { return "I couldn't read that amount.".to_string() };
                self.dispatch(phone, Command::Contribute { fund_id, amount }).await
            }
            NlCommand::Split { amount, participants } => {
                let Ok(amount) = Decimal::from_str(&amount) else { return "I couldn't read that amount.".to_string() };
                self.dispatch(phone, Command::Split { amount, description: "split".to_string(), participants }).await
            }
            NlCommand::PaySplit { split_id } => self.dispatch(phone, Command::PaySplit { split_bill_id: split_id }).await,
        }
    }

    async fn do_pay(&self, sender_phone: &str, receiver_phone: &str, amount: Decimal) -> String {
        match self.payment.send_payment(sender_phone, receiver_phone, amount, "").await {
            Ok(record) => {
                let text = notification::payment_received(sender_phone, amount, record.tx_id.as_deref());
                notify_best_effort(self.dispatcher.as_ref(), receiver_phone, &text).await;
                format!("Sent {amount} to {receiver_phone}. tx: {}", record.tx_id.unwrap_or_default())
            }
            Err(err) => err.public_message(),
        }
    }

    async fn do_create_split(&self, initiator_phone: &str, amount: Decimal, description: &str, participants: &[String]) -> String {
        match self.split.create_split_bill(initiator_phone, amount, description, participants).await {
            Ok(bill) => {
                let per_person = bill.participants.first().map(|p| p.share_amount).unwrap_or(Decimal::ZERO);
                for participant in &bill.participants {
                    if participant.phone == initiator_phone {
                        continue;
                    }
                    let text = notification::split_bill_created(initiator_phone, &bill.id, per_person, description);
                    notify_best_effort(self.dispatcher.as_ref(), &participant.phone, &text).await;
                }
                format!("Split bill created (id: {}), {} each for {} people.", bill.id, per_person, bill.participants.len())
            }
            Err(err) => err.public_message(),
        }
    }

    async fn do_pay_split(&self, participant_phone: &str, split_bill_id: &str) -> String {
        match self.split.pay_split_share(split_bill_id, participant_phone).await {
            Ok(bill) => {
                let share = bill
                    .participants
                    .iter()
                    .find(|p| p.phone == participant_phone)
                    .map(|p| p.share_amount)
                    .unwrap_or(Decimal::ZERO);
                let text = notification::split_payment_received(participant_phone, share, bill.is_fully_paid());
                notify_best_effort(self.dispatcher.as_ref(), &bill.initiator_phone, &text).await;
                format!("Paid your share of split {split_bill_id}.")
            }
            Err(err) => err.public_message(),
        }
    }

    fn help_text(&self) -> String {
        "Commands: balance, pay <amt> to <phone>, split <amt> <desc> with <phones>, pay split <id>, \
         my splits, create fund <title> goal <amt>, contribute <amt> to fund <id>, funds, buy ticket <id|name>, \
         verify ticket <id>, my tickets, events, history, lock create <title> <amt> <participants> <days>, \
         commit <id>, commitment <id>, cancel <id>, add <id> <phone>, reliability, my commitments"
            .to_string()
    }
}

fn render_split(bill: &crate::store::SplitBillRecord) -> String {
    let rows = bill
        .participants
        .iter()
        .map(|p| format!("  {} — {} {}", p.phone, p.share_amount, if p.paid { "paid" } else { "pending" }))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Split {} ({}): total {}\n{}{}",
        bill.id,
        bill.title,
        bill.total_amount,
        rows,
        if bill.status == crate::store::SplitBillStatus::Completed { "\nfully paid" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoService;
    use crate::ledger::fake::FakeLedger;
    use crate::notification::LoggingNotificationDispatcher;
    use crate::store::InMemoryStore;

    fn router() -> Router<InMemoryStore, FakeLedger> {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(FakeLedger::new());
        let crypto = Arc::new(CryptoService::new("test-secret"));
        let wallet = Arc::new(WalletService::new(store.clone(), ledger.clone(), crypto.clone()));
        let payment = Arc::new(PaymentService::new(store.clone(), ledger.clone(), wallet.clone()));
        let split = Arc::new(SplitService::new(store.clone(), ledger.clone(), wallet.clone()));
        let ticket = Arc::new(TicketService::new(store.clone(), ledger.clone(), wallet.clone()));
        let fund = Arc::new(FundService::new(store.clone(), ledger.clone(), wallet.clone()));
        let commitment = Arc::new(CommitmentService::new(store.clone(), ledger.clone(), wallet.clone(), crypto));
        let conversations = Arc::new(ConversationStateManager::new());
        let dispatcher = Arc::new(LoggingNotificationDispatcher);
        Router::new(conversations, dispatcher, wallet, payment, split, ticket, fund, commitment)
    }

    #[tokio::test]
    async fn unknown_text_returns_help() {
        let r = router();
        let reply = r.handle("+15550001", "asdkjashdkj").await;
        assert!(reply.contains("Commands:"));
    }

    #[tokio::test]
    async fn balance_command_reports_zero_for_new_wallet() {
        let r = router();
        let reply = r.handle("+15550001", "balance").await;
        assert!(reply.contains("Your balance"));
    }

    #[tokio::test]
    async fn guided_commitment_flow_completes_after_four_steps() {
        let r = router();
        let phone = "+15550001";
        r.handle(phone, "balance").await;

        assert!(r.handle(phone, "create commitment").await.contains("title"));
        assert!(r.handle(phone, "Goa Trip").await.contains("lock in"));
        assert!(r.handle(phone, "25").await.contains("participants"));
        assert!(r.handle(phone, "3").await.contains("deadline"));
        let done = r.handle(phone, "7").await;
        assert!(done.contains("created"));
    }

    #[tokio::test]
    async fn natural_language_balance_request_is_routed() {
        let r = router();
        let reply = r.handle("+15550001", "what's my balance").await;
        assert!(reply.contains("Your balance"));
    }

    #[tokio::test]
    async fn pay_command_fails_gracefully_without_balance() {
        let r = router();
        let reply = r.handle("+15550001", "pay 10 to +15550002").await;
        assert!(reply.contains("insufficient") || reply.contains("balance"));
    }
}
