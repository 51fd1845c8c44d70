//! Deterministic ticket analysis used when no generative provider is available
//! or the provider call fails.
//!
//! Everything here is a pure function of its inputs: no I/O, no clock, no
//! randomness. [`analyze`] cannot fail, which is what lets the run pipeline
//! promise a structured result for every ticket it can load.

use crate::models::{Analysis, Category, Persona, Priority, Urgency};

const URGENT_TERMS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "now",
    "today",
    "emergency",
    "right away",
];

const NEAR_TERM_TERMS: &[&str] = &["soon", "tomorrow", "this week"];

const POSITIVE_TERMS: &[&str] = &[
    "thanks",
    "thank you",
    "great",
    "love",
    "appreciate",
    "excellent",
    "happy",
    "awesome",
];

const NEGATIVE_TERMS: &[&str] = &[
    "angry",
    "terrible",
    "awful",
    "worst",
    "frustrated",
    "disappointed",
    "unacceptable",
    "ridiculous",
    "broken",
    "still waiting",
];

const REFUND_FRAUD_TERMS: &[&str] = &[
    "refund",
    "chargeback",
    "fraud",
    "scam",
    "stolen",
    "unauthorized",
];

const POLITE_HELP_TERMS: &[&str] = &["please", "help", "kindly", "could you"];

const BASELINE_SENTIMENT: i32 = 6;
const MAX_POSITIVE_BONUS: i32 = 3;
const MAX_NEGATIVE_PENALTY: i32 = 4;
const REFUND_FRAUD_PENALTY: i32 = 2;
const POLITE_PENALTY: i32 = 1;

/// Fields of a ticket the analyzer looks at.
#[derive(Debug, Clone, Copy)]
pub struct TicketSignals<'a> {
    pub priority: Priority,
    pub content: &'a str,
    pub category: Category,
    pub subject: &'a str,
}

/// Analyze a ticket without any model involvement.
pub fn analyze(signals: &TicketSignals<'_>, persona: Persona) -> Analysis {
    let text = NormalizedText::new(signals.content);
    let sentiment = sentiment(&text);

    Analysis {
        intent: intent(signals.category, signals.subject),
        urgency: urgency(signals.priority, &text),
        confidence: confidence_for(sentiment),
        sentiment,
        draft_response: draft(signals.category, persona),
    }
}

/// Lowercased text with every non-alphanumeric run collapsed to one space and
/// padded with spaces, so lexicon terms match on word boundaries only.
struct NormalizedText(String);

impl NormalizedText {
    fn new(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len() + 2);
        out.push(' ');
        for c in raw.chars() {
            if c.is_alphanumeric() {
                out.extend(c.to_lowercase());
            } else if !out.ends_with(' ') {
                out.push(' ');
            }
        }
        if !out.ends_with(' ') {
            out.push(' ');
        }
        Self(out)
    }

    fn contains_term(&self, term: &str) -> bool {
        self.0.contains(&format!(" {} ", term))
    }

    fn count_matches(&self, terms: &[&str]) -> i32 {
        terms.iter().filter(|t| self.contains_term(t)).count() as i32
    }

    fn matches_any(&self, terms: &[&str]) -> bool {
        terms.iter().any(|t| self.contains_term(t))
    }
}

fn urgency(priority: Priority, text: &NormalizedText) -> Urgency {
    if priority == Priority::High || text.matches_any(URGENT_TERMS) {
        Urgency::High
    } else if priority == Priority::Medium || text.matches_any(NEAR_TERM_TERMS) {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

fn sentiment(text: &NormalizedText) -> i32 {
    let mut score = BASELINE_SENTIMENT;
    score += text.count_matches(POSITIVE_TERMS).min(MAX_POSITIVE_BONUS);
    score -= text.count_matches(NEGATIVE_TERMS).min(MAX_NEGATIVE_PENALTY);
    if text.matches_any(REFUND_FRAUD_TERMS) {
        score -= REFUND_FRAUD_PENALTY;
    }
    // Polite requests for help skew toward frustrated-but-courteous customers.
    if text.matches_any(POLITE_HELP_TERMS) {
        score -= POLITE_PENALTY;
    }
    score.clamp(1, 10)
}

/// Placeholder confidence proxy derived from sentiment. Not a calibrated
/// probability.
pub fn confidence_for(sentiment: i32) -> i32 {
    (65 + 3 * sentiment).clamp(0, 100)
}

fn intent(category: Category, subject: &str) -> String {
    match category {
        Category::Refund => "Refund Request".to_string(),
        Category::Shipping => "Shipping Issue".to_string(),
        Category::Product => "Product Issue".to_string(),
        Category::Billing => "Billing Issue".to_string(),
        Category::General => format!("General Inquiry: {}", subject.trim()),
    }
}

fn draft(category: Category, persona: Persona) -> String {
    let (opener, closer) = match persona {
        Persona::Professional => (
            "Hello,\n\nThank you for contacting us. We have received your request.",
            "Best regards,\nCustomer Support Team",
        ),
        Persona::Friendly => (
            "Hi there!\n\nThanks so much for reaching out, we're glad you got in touch.",
            "Cheers,\nThe Support Team",
        ),
        Persona::Concise => ("Hi,", "Thanks,\nSupport"),
    };

    let body = match category {
        Category::Refund => {
            "We're reviewing your refund request now. Once it is approved, the refund \
             will be issued to your original payment method, and you will receive a \
             confirmation email with the details."
        }
        Category::Shipping => {
            "We're checking the status of your shipment with our carrier. We'll share \
             updated tracking information as soon as we have it, and we'll make sure \
             your order gets to you."
        }
        Category::Product => {
            "We're sorry the product isn't working as expected. Could you share any \
             error messages or photos of the issue? That will help us troubleshoot or \
             arrange a replacement."
        }
        Category::Billing => {
            "We're looking into the charges on your account. We'll review your billing \
             history and correct anything that doesn't look right."
        }
        Category::General => {
            "We're looking into your question and will follow up with more details \
             shortly."
        }
    };

    format!("{}\n\n{}\n\n{}", opener, body, closer)
}
