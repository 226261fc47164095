//! Outbound notifications to whichever transport a user last reached the
//! bot from. Core code never builds transport-specific payloads; it calls
//! `NotificationDispatcher::send(user_identifier, rendered_text)` and the
//! adapter underneath decides how to actually deliver it. Grounded on the
//! source's `NotificationService`, reduced to the abstract contract (the
//! concrete WhatsApp/Twilio wiring is an excluded outer transport).

use async_trait::async_trait;
use tracing::{info, warn};

/// Implemented once per real transport (WhatsApp, Telegram, ...). `send`
/// returns whether delivery succeeded; callers treat notification failures
/// as best-effort and never let them abort the triggering operation,
/// mirroring the source's exception-swallowing `send_whatsapp_notification`.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, user_identifier: &str, rendered_text: &str) -> bool;
}

/// Logs the notification instead of calling out to a real transport.
/// Useful standalone and as the base every real adapter wraps for
/// observability.
pub struct LoggingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LoggingNotificationDispatcher {
    async fn send(&self, user_identifier: &str, rendered_text: &str) -> bool {
        info!(to = user_identifier, message = rendered_text, "notification dispatched");
        true
    }
}

/// Sends through the given dispatcher, logging and swallowing failure
/// rather than propagating it — notifications are never allowed to fail
/// the operation that triggered them.
pub async fn notify_best_effort(dispatcher: &dyn NotificationDispatcher, user_identifier: &str, rendered_text: &str) {
    if !dispatcher.send(user_identifier, rendered_text).await {
        warn!(to = user_identifier, "notification delivery failed");
    }
}

pub fn payment_received(sender_phone: &str, amount: rust_decimal::Decimal, tx_id: Option<&str>) -> String {
    let mut lines = vec![format!("Payment received: {amount} from {sender_phone}")];
    if let Some(tx_id) = tx_id {
        lines.push(format!("tx: {tx_id}"));
    }
    lines.push("Check your balance: type 'balance'".to_string());
    lines.join("\n")
}

pub fn split_bill_created(initiator_phone: &str, split_id: &str, amount_per_person: rust_decimal::Decimal, description: &str) -> String {
    format!(
        "{initiator_phone} wants to split a bill with you!\n{description}\nYour share: {amount_per_person}\nTo pay, type: pay split {split_id}"
    )
}

pub fn split_payment_received(participant_phone: &str, amount: rust_decimal::Decimal, is_fully_paid: bool) -> String {
    let status = if is_fully_paid { "All participants have paid!" } else { "Waiting for others..." };
    format!("{participant_phone} paid their share of {amount}.\n{status}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn logging_dispatcher_always_reports_success() {
        let dispatcher = LoggingNotificationDispatcher;
        assert!(dispatcher.send("+15550001", "hello").await);
    }

    #[test]
    fn payment_received_includes_tx_id_when_present() {
        let text = payment_received("+15550001", dec!(10), Some("TX123"));
        assert!(text.contains("TX123"));
        assert!(text.contains("+15550001"));
    }

    #[test]
    fn split_payment_received_reflects_full_payment_status() {
        let text = split_payment_received("+15550001", dec!(5), true);
        assert!(text.contains("All participants have paid"));
    }
}
