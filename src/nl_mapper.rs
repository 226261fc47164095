//! Conversational fallback mapper: when `parser::parse` can't match a
//! message against its anchored command grammar, this scans the same text
//! with looser, unanchored patterns scored by confidence and returns the
//! highest-confidence hit. Grounded on the source's
//! `NaturalLanguageMapper.patterns` list.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum NlCommand {
    Menu,
    Balance,
    History,
    Pay { amount: String, phone: String },
    Events,
    BuyTicket { event_id: String },
    Funds,
    Contribute { amount: String, fund_id: String },
    Split { amount: String, participants: Vec<String> },
    MySplits,
    PaySplit { split_id: String },
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NlMatch {
    pub command: NlCommand,
    pub confidence: f64,
}

struct Rule {
    pattern: Lazy<Regex>,
    confidence: f64,
    build: fn(&regex::Captures) -> NlCommand,
}

macro_rules! rule {
    ($pat:expr, $conf:expr, $build:expr) => {
        Rule {
            pattern: Lazy::new(|| Regex::new($pat).expect("nl pattern is valid regex")),
            confidence: $conf,
            build: $build,
        }
    };
}

static RULES: &[Rule] = &[
    rule!(r"(?i)\b(?:show|display|get)\s+(?:the\s+)?menu\b", 1.0, |_| NlCommand::Menu),
    rule!(r"(?i)\bmenu\b", 0.9, |_| NlCommand::Menu),
    rule!(r"(?i)\bquick\s+(?:commands?|actions?)\b", 0.95, |_| NlCommand::Menu),
    rule!(
        r"(?i)\b(?:show|check|what's|display|get)\s+(?:me\s+)?(?:my\s+)?balance\b",
        1.0,
        |_| NlCommand::Balance
    ),
    rule!(r"(?i)\bbalance\s+(?:check|inquiry|status)\b", 0.9, |_| NlCommand::Balance),
    rule!(
        r"(?i)\bhow\s+much\s+(?:money|algo|algos?)\s+(?:do\s+i\s+have|have\s+i\s+got)\b",
        0.95,
        |_| NlCommand::Balance
    ),
    rule!(
        r"(?i)\b(?:show|display|get|list)\s+(?:me\s+)?(?:my\s+)?(?:transaction\s+)?history\b",
        1.0,
        |_| NlCommand::History
    ),
    rule!(r"(?i)\b(?:recent|past|previous)\s+transactions?\b", 0.95, |_| NlCommand::History),
    rule!(r"(?i)\bwhat\s+(?:have\s+i\s+)?(?:sent|received|paid|spent)\b", 0.85, |_| NlCommand::History),
    rule!(
        r"(?i)\b(?:send|pay|transfer)\s+(\d+(?:\.\d+)?)\s+(?:algo|algos?)\s+to\s+([+\d\s\-()]+)",
        1.0,
        |c| NlCommand::Pay { amount: c[1].to_string(), phone: clean_phone(c[2].trim()) }
    ),
    rule!(
        r"(?i)\bpay\s+([+\d\s\-()]+)\s+(\d+(?:\.\d+)?)\s+(?:algo|algos?)\b",
        0.95,
        |c| NlCommand::Pay { phone: clean_phone(c[1].trim()), amount: c[2].to_string() }
    ),
    rule!(
        r"(?i)\btransfer\s+(\d+(?:\.\d+)?)\s+to\s+([+\d\s\-()]+)",
        0.9,
        |c| NlCommand::Pay { amount: c[1].to_string(), phone: clean_phone(c[2].trim()) }
    ),
    rule!(
        r"(?i)\b(?:show|list|display|get|what|see)\s+(?:me\s+)?(?:all\s+)?(?:available\s+)?events?\b",
        1.0,
        |_| NlCommand::Events
    ),
    rule!(r"(?i)\bevents?\s+(?:list|available)\b", 0.95, |_| NlCommand::Events),
    rule!(
        r"(?i)\bwhat\s+events?\s+(?:are\s+)?(?:available|happening|coming up)\b",
        0.9,
        |_| NlCommand::Events
    ),
    rule!(
        r"(?i)\b(?:buy|purchase|get)\s+(?:a\s+)?ticket\s+(?:for\s+)?event\s+(\d+)",
        1.0,
        |c| NlCommand::BuyTicket { event_id: c[1].to_string() }
    ),
    rule!(r"(?i)\bticket\s+(?:for\s+)?event\s+(\d+)", 0.9, |c| NlCommand::BuyTicket {
        event_id: c[1].to_string()
    }),
    rule!(r"(?i)\bregister\s+(?:for\s+)?event\s+(\d+)", 0.85, |c| NlCommand::BuyTicket {
        event_id: c[1].to_string()
    }),
    rule!(
        r"(?i)\b(?:show|list|display|get|see)\s+(?:me\s+)?(?:all\s+)?(?:available\s+)?(?:fundraisers?|funds?|campaigns?)\b",
        1.0,
        |_| NlCommand::Funds
    ),
    rule!(r"(?i)\b(?:fundraisers?|campaigns?)\s+(?:list|available)\b", 0.95, |_| NlCommand::Funds),
    rule!(
        r"(?i)\bwhat\s+(?:fundraisers?|campaigns?)\s+(?:are\s+)?(?:available|active)\b",
        0.9,
        |_| NlCommand::Funds
    ),
    rule!(
        r"(?i)\b(?:contribute|donate)\s+(\d+(?:\.\d+)?)\s+(?:algo|algos?)\s+to\s+(?:fund|fundraiser|campaign)\s+(\d+)",
        1.0,
        |c| NlCommand::Contribute { amount: c[1].to_string(), fund_id: c[2].to_string() }
    ),
    rule!(
        r"(?i)\bdonate\s+to\s+(?:fund|fundraiser|campaign)\s+(\d+)\s+(\d+(?:\.\d+)?)\s+(?:algo|algos?)",
        0.95,
        |c| NlCommand::Contribute { fund_id: c[1].to_string(), amount: c[2].to_string() }
    ),
    rule!(r"(?i)\bfund\s+(\d+)\s+contribute\s+(\d+(?:\.\d+)?)", 0.9, |c| NlCommand::Contribute {
        fund_id: c[1].to_string(),
        amount: c[2].to_string()
    }),
    rule!(
        r"(?i)\b(?:split|divide)\s+(?:a\s+)?bill\s+(?:of\s+)?(\d+(?:\.\d+)?)\s+(?:algo|algos?)\s+(?:with|among|between)\s+(.+)",
        1.0,
        |c| NlCommand::Split { amount: c[1].to_string(), participants: parse_participants(&c[2]) }
    ),
    rule!(
        r"(?i)\bcreate\s+(?:a\s+)?split\s+(?:for\s+)?(\d+(?:\.\d+)?)\s+with\s+(.+)",
        0.95,
        |c| NlCommand::Split { amount: c[1].to_string(), participants: parse_participants(&c[2]) }
    ),
    rule!(r"(?i)\b(?:show|list|display|get)\s+(?:my\s+)?splits?\b", 1.0, |_| NlCommand::MySplits),
    rule!(r"(?i)\bwhat\s+splits?\s+(?:do\s+i\s+have|am\s+i\s+in)\b", 0.9, |_| NlCommand::MySplits),
    rule!(
        r"(?i)\bpay\s+(?:my\s+)?(?:share|part)\s+(?:for|in|of)\s+split\s+(\d+)",
        1.0,
        |c| NlCommand::PaySplit { split_id: c[1].to_string() }
    ),
    rule!(r"(?i)\bsettle\s+split\s+(\d+)", 0.95, |c| NlCommand::PaySplit { split_id: c[1].to_string() }),
    rule!(r"(?i)\b(?:help|commands?|what\s+can\s+you\s+do|how\s+to\s+use)\b", 1.0, |_| NlCommand::Help),
];

fn clean_phone(phone: &str) -> String {
    let cleaned: String = phone.chars().filter(|c| !matches!(c, ' ' | '-' | '(' | ')')).collect();
    if cleaned.starts_with('+') {
        cleaned
    } else if cleaned.len() == 10 {
        format!("+91{cleaned}")
    } else {
        format!("+{cleaned}")
    }
}

fn parse_participants(text: &str) -> Vec<String> {
    static SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,\s]+(?:and|&)?\s*").expect("valid"));
    static PHONE_CHUNK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[+\d][\d\s\-()]+").expect("valid"));

    SPLIT_RE
        .split(text)
        .filter_map(|part| PHONE_CHUNK_RE.find(part).map(|m| clean_phone(m.as_str())))
        .collect()
}

/// Tries every rule against `text`, returning the highest-confidence match.
/// `None` if nothing matches (or the text is blank), mirroring
/// `parse_natural_language`'s `Optional[ParsedCommand]` return.
pub fn parse_natural_language(text: &str) -> Option<NlMatch> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut best: Option<NlMatch> = None;
    for rule in RULES {
        if let Some(captures) = rule.pattern.captures(trimmed) {
            if best.as_ref().map(|b| rule.confidence > b.confidence).unwrap_or(true) {
                best = Some(NlMatch { command: (rule.build)(&captures), confidence: rule.confidence });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_confidence_among_overlapping_matches() {
        // "menu" alone matches the 0.9 rule; this phrase also hits the 1.0 rule.
        let m = parse_natural_language("can you show the menu please").unwrap();
        assert_eq!(m.command, NlCommand::Menu);
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn pay_extracts_amount_and_cleans_phone() {
        let m = parse_natural_language("send 25 algo to 9876543210").unwrap();
        assert_eq!(m.command, NlCommand::Pay { amount: "25".into(), phone: "+919876543210".into() });
    }

    #[test]
    fn split_parses_multiple_participants() {
        let m = parse_natural_language("split a bill of 300 algo with +911111111111 and +912222222222").unwrap();
        match m.command {
            NlCommand::Split { amount, participants } => {
                assert_eq!(amount, "300");
                assert_eq!(participants, vec!["+911111111111", "+912222222222"]);
            }
            _ => panic!("expected Split"),
        }
    }

    #[test]
    fn blank_text_returns_none() {
        assert!(parse_natural_language("   ").is_none());
    }

    #[test]
    fn unrelated_text_returns_none() {
        assert!(parse_natural_language("what a nice day").is_none());
    }
}
