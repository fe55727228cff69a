use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use whatlang::Lang;

use crate::model::PrecheckResult;

pub const LANGUAGE_REASON: &str =
    "Language is not supported (Only French and English are accepted).";
pub const SPAM_REASON: &str = "Ticket identified as spam.";

const SUPPORTED_LANGUAGES: [&str; 2] = ["fr", "en"];
const DETECTION_CONFIDENCE: f64 = 0.8;
const SHORT_TEXT_CHARS: usize = 10;

const SHORT_TOKENS: &[&str] = &["aide", "help", "svp", "please", "merci", "thanks", "bug"];

const STRONG_INDICATORS: &[&str] = &[
    "est", "sont", "fait", "marche", "probleme", "bonjour", "salut", "svp", "merci", "aide",
    "vos", "notre", "votre", "veux", "savoir", "the", "is", "are", "works", "problem", "hello",
    "thanks", "please", "want", "know",
];

const SPAM_PHRASES: &[&str] = &[
    "win money",
    "free gift",
    "click here",
    "subscribe now",
    "lottery",
    "congratulations",
    "urgent action required",
    "buy now",
    "limited time",
    "cash prize",
    "earn money",
    "work from home",
    "no cost",
    "risk free",
    "winner",
    "claim now",
    "exclusive deal",
    "investment",
    "crypto",
    "bitcoin",
    "gagner de l'argent",
    "cadeau gratuit",
    "cliquez ici",
    "abonnez-vous",
    "loterie",
    "félicitations",
    "action urgente",
    "offre exclusive",
    "investissement",
    "gagner gros",
    "promotion",
    "rabais",
];

static PUNCTUATION: Lazy<Regex> = Lazy::new(|| match Regex::new(r"[^\w\s]") {
    Ok(regex) => regex,
    Err(err) => panic!("invalid punctuation pattern: {err}"),
});

/// One candidate language with its probability.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageGuess {
    /// ISO 639-1 code where one exists ("fr", "en"), ISO 639-3 otherwise.
    pub code: String,
    pub probability: f64,
}

/// Probabilistic language identification. `None` means detection failed.
pub trait LanguageDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<Vec<LanguageGuess>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WhatlangDetector;

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> Option<Vec<LanguageGuess>> {
        let info = whatlang::detect(text)?;
        let code = match info.lang() {
            Lang::Fra => "fr".to_string(),
            Lang::Eng => "en".to_string(),
            other => other.code().to_string(),
        };
        Some(vec![LanguageGuess {
            code,
            probability: info.confidence(),
        }])
    }
}

/// Two-letter response language for `text`: "fr" or "en" when detected,
/// `None` for anything else.
pub fn response_language(detector: &dyn LanguageDetector, text: &str) -> Option<&'static str> {
    let guesses = detector.detect(text)?;
    let top = guesses.first()?;
    match top.code.as_str() {
        "fr" => Some("fr"),
        "en" => Some("en"),
        _ => None,
    }
}

/// Admissibility filter run before anything costly: language and spam.
#[derive(Clone)]
pub struct Gate {
    detector: Arc<dyn LanguageDetector>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(Arc::new(WhatlangDetector))
    }
}

impl Gate {
    pub fn new(detector: Arc<dyn LanguageDetector>) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> Arc<dyn LanguageDetector> {
        Arc::clone(&self.detector)
    }

    pub fn run_precheck(&self, text: &str) -> PrecheckResult {
        let is_supported_language = self.check_language(text);
        let is_spam = self.is_spam(text);
        let mut reasons = Vec::new();
        if !is_supported_language {
            reasons.push(LANGUAGE_REASON.to_string());
        }
        if is_spam {
            reasons.push(SPAM_REASON.to_string());
        }
        PrecheckResult {
            is_supported_language,
            is_spam,
            passed: is_supported_language && !is_spam,
            reasons,
        }
    }

    pub fn check_language(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        if text.trim().chars().count() < SHORT_TEXT_CHARS {
            return SHORT_TOKENS.iter().any(|token| lower.contains(token));
        }

        let Some(guesses) = self.detector.detect(text) else {
            return false;
        };
        let supported = |guess: &LanguageGuess| SUPPORTED_LANGUAGES.contains(&guess.code.as_str());
        if guesses
            .iter()
            .any(|guess| supported(guess) && guess.probability > DETECTION_CONFIDENCE)
        {
            return true;
        }

        let cleaned = PUNCTUATION.replace_all(&lower, " ");
        let words: HashSet<&str> = cleaned.split_whitespace().collect();
        let indicators = STRONG_INDICATORS
            .iter()
            .filter(|word| words.contains(*word))
            .count();
        let detector_saw_supported = guesses.iter().any(supported);
        (detector_saw_supported && indicators >= 1) || indicators >= 2
    }

    pub fn is_spam(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        SPAM_PHRASES.iter().any(|phrase| lower.contains(phrase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDetector(Option<Vec<LanguageGuess>>);

    impl LanguageDetector for FixedDetector {
        fn detect(&self, _text: &str) -> Option<Vec<LanguageGuess>> {
            self.0.clone()
        }
    }

    fn gate_with(guesses: Option<Vec<(&str, f64)>>) -> Gate {
        let guesses = guesses.map(|list| {
            list.into_iter()
                .map(|(code, probability)| LanguageGuess {
                    code: code.to_string(),
                    probability,
                })
                .collect()
        });
        Gate::new(Arc::new(FixedDetector(guesses)))
    }

    #[test]
    fn short_text_needs_a_help_token() {
        let gate = gate_with(None);
        assert!(gate.check_language("Aide SVP"));
        assert!(gate.check_language("bug!"));
        assert!(!gate.check_language("hola"));
    }

    #[test]
    fn confident_detection_is_accepted() {
        let gate = gate_with(Some(vec![("es", 0.6), ("fr", 0.85)]));
        assert!(gate.check_language("Je n'arrive plus à me connecter depuis hier"));
        let gate = gate_with(Some(vec![("fr", 0.8)]));
        assert!(!gate.check_language("xxxxxxxxxxxx yyyyyyyyy"));
    }

    #[test]
    fn lexical_overlap_rescues_weak_detection() {
        let gate = gate_with(Some(vec![("it", 0.7), ("fr", 0.3)]));
        assert!(gate.check_language("Bonjour, ça ne fonctionne plus du tout"));

        let gate = gate_with(Some(vec![("it", 0.9)]));
        assert!(!gate.check_language("Bonjour, ça ne fonctionne plus du tout"));
        assert!(gate.check_language("Hello, the export is broken again"));
    }

    #[test]
    fn detection_failure_is_not_admissible() {
        let gate = gate_with(None);
        assert!(!gate.check_language("the product is not working at all"));
    }

    #[test]
    fn spam_is_case_insensitive() {
        let gate = gate_with(None);
        assert!(gate.is_spam("CLICK HERE to claim"));
        assert!(gate.is_spam("Félicitations, vous avez gagné"));
        assert!(!gate.is_spam("Mon export PDF échoue"));
    }

    #[test]
    fn precheck_orders_reasons() {
        let gate = gate_with(Some(vec![("de", 0.99)]));
        let result = gate.run_precheck("Gewinnen Sie jetzt bitcoin und mehr");
        assert!(!result.passed);
        assert!(result.is_spam);
        assert!(!result.is_supported_language);
        assert_eq!(result.reasons, vec![LANGUAGE_REASON, SPAM_REASON]);

        let gate = gate_with(Some(vec![("en", 0.95)]));
        let result = gate.run_precheck("How do I reset my password?");
        assert!(result.passed);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn whatlang_rejects_non_latin_script() {
        let gate = Gate::default();
        assert!(!gate.check_language("ログインできません。パスワードを忘れました。助けてください。"));
        assert!(gate.check_language(
            "Bonjour, votre application ne marche plus depuis la mise à jour, est-ce normal ?"
        ));
    }

    #[test]
    fn response_language_maps_to_two_letters() {
        let detector = FixedDetector(Some(vec![LanguageGuess {
            code: "fr".into(),
            probability: 0.4,
        }]));
        assert_eq!(response_language(&detector, "x"), Some("fr"));
        let detector = FixedDetector(Some(vec![LanguageGuess {
            code: "deu".into(),
            probability: 0.9,
        }]));
        assert_eq!(response_language(&detector, "x"), None);
        assert_eq!(response_language(&FixedDetector(None), "x"), None);
    }
}
