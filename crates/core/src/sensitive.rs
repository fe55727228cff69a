use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{SensitiveCategory, SensitiveFinding};

static CARD_PATTERN: Lazy<Regex> = Lazy::new(|| build(r"\b(?:\d[ -]*?){12,18}\d\b"));
static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| build(r"\b[\w.-]+@[\w.-]+\.\w{2,4}\b"));
static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    build(r"\b(?:\+?\d{1,3}[-.\s]?)?\(?\d{2,4}\)?(?:[-.\s]?\d{2,4}){3,5}\b")
});

const MIN_PHONE_DIGITS: usize = 10;

fn build(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid built-in pattern {pattern}: {err}"),
    }
}

/// Pattern-based detector for card numbers, email addresses and phone
/// numbers. Pure: no state, no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensitiveDataScanner;

impl SensitiveDataScanner {
    pub fn new() -> Self {
        Self
    }

    pub fn scan(&self, text: &str) -> bool {
        self.classify(text).matched
    }

    /// First qualifying family in fixed order: card, email, phone.
    pub fn classify(&self, text: &str) -> SensitiveFinding {
        if self.matches_card(text) {
            return SensitiveFinding::of(SensitiveCategory::CreditCard);
        }
        if EMAIL_PATTERN.is_match(text) {
            return SensitiveFinding::of(SensitiveCategory::Email);
        }
        // A phone match only counts when the matched span itself carries
        // enough digits; numbered steps never do.
        let phone = PHONE_PATTERN.find_iter(text).any(|m| {
            m.as_str().chars().filter(|c| c.is_ascii_digit()).count() >= MIN_PHONE_DIGITS
        });
        if phone {
            return SensitiveFinding::of(SensitiveCategory::Phone);
        }
        SensitiveFinding::none()
    }

    pub fn matches_card(&self, text: &str) -> bool {
        CARD_PATTERN.is_match(text)
    }
}
