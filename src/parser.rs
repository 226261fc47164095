//! Regex-driven command parser: turns a raw inbound chat message into a
//! typed `Command`. Each command type tries its patterns in declaration
//! order; the first full match wins. Falls through to `Command::Unknown`
//! so the router can hand the message to the natural-language fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Balance,
    Pay { amount: Decimal, receiver_phone: String },
    Split { amount: Decimal, description: String, participants: Vec<String> },
    PaySplit { split_bill_id: String },
    ViewSplit { split_bill_id: String },
    MySplits,
    CreateFund { title: String, goal_amount: Decimal },
    Contribute { fund_id: String, amount: Decimal },
    ViewFund { fund_id: String },
    ListFunds,
    BuyTicket { event_id: Option<String>, event_name: Option<String> },
    VerifyTicket { ticket_number: String },
    MyTickets,
    ListEvents,
    History,
    CreateCommitment { title: String, amount: Decimal, participants: u32, days: u32 },
    CommitFunds { commitment_id: String },
    ViewCommitment { commitment_id: String },
    CancelCommitment { commitment_id: String },
    AddParticipant { commitment_id: String, phone: String },
    Reliability,
    MyCommitments,
    Unknown,
}

struct PatternSet {
    patterns: Vec<Regex>,
    extract: fn(&regex::Captures, &str) -> Command,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("command pattern is a valid regex")
}

fn parse_amount(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

static PHONE_RE: Lazy<Regex> = Lazy::new(|| re(r"\+\d{10,15}"));

fn extract_phone_numbers(text: &str) -> Vec<String> {
    PHONE_RE.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

static TABLE: Lazy<Vec<PatternSet>> = Lazy::new(|| {
    vec![
        PatternSet {
            patterns: vec![re(r"^(?i)(help|start|hi|hello|menu)$")],
            extract: |_, _| Command::Help,
        },
        PatternSet {
            patterns: vec![re(r"^(?i)(balance|bal|wallet|show balance)$")],
            extract: |_, _| Command::Balance,
        },
        PatternSet {
            patterns: vec![
                re(r"^(?i)pay\s+(\d+\.?\d*)\s+(?:algo\s+)?to\s+(\+\d+)"),
                re(r"^(?i)send\s+(\d+\.?\d*)\s+(?:algo\s+)?to\s+(\+\d+)"),
            ],
            extract: |c, _| Command::Pay {
                amount: parse_amount(&c[1]),
                receiver_phone: c[2].to_string(),
            },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)split\s+(\d+\.?\d*)\s+(?:algo\s+)?(.+?)\s+with\s+(.+)")],
            extract: |c, _| Command::Split {
                amount: parse_amount(&c[1]),
                description: c[2].trim().to_string(),
                participants: extract_phone_numbers(&c[3]),
            },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)pay split\s+(\d+)$")],
            extract: |c, _| Command::PaySplit { split_bill_id: c[1].to_string() },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)(?:view|show)\s+split\s+(\d+)$")],
            extract: |c, _| Command::ViewSplit { split_bill_id: c[1].to_string() },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)(?:my splits|splits)$")],
            extract: |_, _| Command::MySplits,
        },
        PatternSet {
            patterns: vec![re(r"^(?i)create fund\s+(.+?)\s+goal\s+(\d+\.?\d*)\s+(?:algo)?")],
            extract: |c, _| Command::CreateFund {
                title: c[1].trim().to_string(),
                goal_amount: parse_amount(&c[2]),
            },
        },
        PatternSet {
            patterns: vec![
                re(r"^(?i)contribute\s+(\d+\.?\d*)\s+(?:algo\s+)?to\s+fund\s+(\d+)"),
                re(r"^(?i)fund\s+(\d+)\s+(\d+\.?\d*)\s+(?:algo)?"),
            ],
            extract: |c, raw| {
                // Two patterns share a slot: "contribute X to fund Y" has
                // "fund" in the text before the amount; "fund Y X" doesn't.
                let lower = raw.to_lowercase();
                if lower.starts_with("contribute") {
                    Command::Contribute { amount: parse_amount(&c[1]), fund_id: c[2].to_string() }
                } else {
                    Command::Contribute { fund_id: c[1].to_string(), amount: parse_amount(&c[2]) }
                }
            },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)(?:view|show)\s+fund\s+(\d+)")],
            extract: |c, _| Command::ViewFund { fund_id: c[1].to_string() },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)(?:list|show)\s+funds?$"), re(r"^(?i)funds?$")],
            extract: |_, _| Command::ListFunds,
        },
        PatternSet {
            patterns: vec![re(r"^(?i)buy ticket\s+(\d+)$"), re(r"^(?i)buy ticket\s+(.+)")],
            extract: |c, _| {
                let ident = c[1].trim();
                if ident.chars().all(|ch| ch.is_ascii_digit()) {
                    Command::BuyTicket { event_id: Some(ident.to_string()), event_name: None }
                } else {
                    Command::BuyTicket { event_id: None, event_name: Some(ident.to_string()) }
                }
            },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)verify ticket\s+(.+)")],
            extract: |c, _| Command::VerifyTicket { ticket_number: c[1].trim().to_uppercase() },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)(?:my tickets|tickets)$")],
            extract: |_, _| Command::MyTickets,
        },
        PatternSet {
            patterns: vec![re(r"^(?i)(?:list|show)\s+events?$"), re(r"^(?i)events?$")],
            extract: |_, _| Command::ListEvents,
        },
        PatternSet {
            patterns: vec![re(r"^(?i)(?:history|transactions)$")],
            extract: |_, _| Command::History,
        },
        PatternSet {
            patterns: vec![
                re(r#"^(?i)lock create\s+(.+?)\s+(\d+\.?\d*)\s+(\d+)\s+(\d+)$"#),
                re(r#"^(?i)/lock\s+create\s+(.+?)\s+(\d+\.?\d*)\s+(\d+)\s+(\d+)$"#),
            ],
            extract: |c, _| Command::CreateCommitment {
                title: c[1].trim().to_string(),
                amount: parse_amount(&c[2]),
                participants: c[3].parse().unwrap_or(0),
                days: c[4].parse().unwrap_or(0),
            },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)commit\s+(\d+)$"), re(r"^(?i)/commit\s+(\d+)$"), re(r"^(?i)lock\s+(\d+)$")],
            extract: |c, _| Command::CommitFunds { commitment_id: c[1].to_string() },
        },
        PatternSet {
            patterns: vec![
                re(r"^(?i)commitment\s+(\d+)$"),
                re(r"^(?i)/commitment\s+(\d+)$"),
                re(r"^(?i)show commitment\s+(\d+)$"),
            ],
            extract: |c, _| Command::ViewCommitment { commitment_id: c[1].to_string() },
        },
        PatternSet {
            patterns: vec![
                re(r"^(?i)cancel\s+(\d+)$"),
                re(r"^(?i)/cancel\s+(\d+)$"),
                re(r"^(?i)cancel commitment\s+(\d+)$"),
            ],
            extract: |c, _| Command::CancelCommitment { commitment_id: c[1].to_string() },
        },
        PatternSet {
            patterns: vec![re(r"^(?i)add\s+(\d+)\s+(\+\d+)$"), re(r"^(?i)/add\s+(\d+)\s+(\+\d+)$")],
            extract: |c, _| Command::AddParticipant { commitment_id: c[1].to_string(), phone: c[2].to_string() },
        },
        PatternSet {
            patterns: vec![
                re(r"^(?i)reliability$"),
                re(r"^(?i)/reliability$"),
                re(r"^(?i)my reliability$"),
                re(r"^(?i)score$"),
            ],
            extract: |_, _| Command::Reliability,
        },
        PatternSet {
            patterns: vec![
                re(r"^(?i)my commitments?$"),
                re(r"^(?i)/commitments?$"),
                re(r"^(?i)commitments?$"),
            ],
            extract: |_, _| Command::MyCommitments,
        },
    ]
});

/// Parses a raw inbound message. The message is trimmed but *not*
/// lower-cased before matching — each pattern carries its own `(?i)` flag so
/// captured free-text fields (split description, fund title, commitment
/// title) keep the user's original casing.
pub fn parse(message: &str) -> Command {
    let text = message.trim();
    for set in TABLE.iter() {
        for pattern in &set.patterns {
            if let Some(captures) = pattern.captures(text) {
                return (set.extract)(&captures, text);
            }
        }
    }
    Command::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_pay_command() {
        let cmd = parse("pay 50 to +919999999999");
        assert_eq!(cmd, Command::Pay { amount: dec!(50), receiver_phone: "+919999999999".into() });
    }

    #[test]
    fn parses_split_command_with_multiple_participants() {
        let cmd = parse("split 400 dinner with +919999999999 +918888888888");
        assert_eq!(
            cmd,
            Command::Split {
                amount: dec!(400),
                description: "dinner".into(),
                participants: vec!["+919999999999".into(), "+918888888888".into()],
            }
        );
    }

    #[test]
    fn contribute_distinguishes_its_two_patterns() {
        let a = parse("contribute 50 to fund 1");
        assert_eq!(a, Command::Contribute { amount: dec!(50), fund_id: "1".into() });
        let b = parse("fund 1 50");
        assert_eq!(b, Command::Contribute { fund_id: "1".into(), amount: dec!(50) });
    }

    #[test]
    fn buy_ticket_distinguishes_id_from_name() {
        assert_eq!(parse("buy ticket 7"), Command::BuyTicket { event_id: Some("7".into()), event_name: None });
        assert_eq!(
            parse("buy ticket TechFest 2026"),
            Command::BuyTicket { event_id: None, event_name: Some("TechFest 2026".into()) }
        );
    }

    #[test]
    fn parses_create_commitment_with_positional_fields() {
        let cmd = parse("lock create Goa Trip 500 5 7");
        assert_eq!(
            cmd,
            Command::CreateCommitment { title: "Goa Trip".into(), amount: dec!(500), participants: 5, days: 7 }
        );
    }

    #[test]
    fn unmatched_text_falls_through_to_unknown() {
        assert_eq!(parse("what's the weather like"), Command::Unknown);
    }

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(parse("BALANCE"), Command::Balance);
        assert_eq!(parse("Help"), Command::Help);
    }
}
