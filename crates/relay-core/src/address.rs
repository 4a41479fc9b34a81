//! Destination address extraction from booking notification bodies.
//!
//! Notification mails carry the guest's number as two labelled fields:
//!
//! ```text
//! CountryCode: +91
//! SelectedCountryCode: +91
//! Phone: 9876543210
//! ```
//!
//! Extraction tries an ordered list of strategies; the first one that matches wins.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::{domain::ChatAddress, utils::truncate_text};

/// Suffix the messaging network uses for person-to-person chats.
pub const NETWORK_SUFFIX: &str = "c.us";

const PREVIEW_CHARS: usize = 200;

/// Validated `{country code, subscriber number}` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DestinationAddress {
    /// `+` followed by digits.
    pub country_code: String,
    /// Digits only, never empty.
    pub subscriber_number: String,
}

impl DestinationAddress {
    /// Returns `None` unless the country code is `+<digits>` and the subscriber number is
    /// a non-empty digit string.
    pub fn new(country_code: &str, subscriber_number: &str) -> Option<Self> {
        let cc_digits = country_code.strip_prefix('+')?;
        if cc_digits.is_empty() || !all_digits(cc_digits) {
            return None;
        }
        if subscriber_number.is_empty() || !all_digits(subscriber_number) {
            return None;
        }
        Some(Self {
            country_code: country_code.to_string(),
            subscriber_number: subscriber_number.to_string(),
        })
    }

    /// `+<country><subscriber>`, the form reported back to callers.
    pub fn e164(&self) -> String {
        format!("{}{}", self.country_code, self.subscriber_number)
    }

    /// `<country><subscriber>@c.us`, the form the bridge sends to.
    pub fn chat_address(&self) -> ChatAddress {
        let digits = self.country_code.trim_start_matches('+');
        ChatAddress(format!(
            "{digits}{}@{NETWORK_SUFFIX}",
            self.subscriber_number
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("no phone number found")]
    NotFound,
}

type Strategy = fn(&str) -> Option<DestinationAddress>;

/// Tried in order; each returns a definite match or `None`.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("separate-markers", separate_markers),
    ("combined-markers", combined_markers),
];

/// Find the destination address in a notification body.
///
/// Multiple phone-like fields are not disambiguated: the first textual match wins.
pub fn extract(body: &str) -> Result<DestinationAddress, ExtractionError> {
    for (name, strategy) in STRATEGIES {
        if let Some(address) = strategy(body) {
            tracing::debug!(strategy = name, "destination address extracted");
            return Ok(address);
        }
    }
    Err(ExtractionError::NotFound)
}

/// Canonical form: country code `+<digits>` and a digit-only subscriber number.
///
/// Everything except digits is dropped; a leading `+` is kept (or added) on the
/// country code. Idempotent.
pub fn normalize(address: &DestinationAddress) -> DestinationAddress {
    let cc = normalize_number(&address.country_code);
    DestinationAddress {
        country_code: cc,
        subscriber_number: address
            .subscriber_number
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect(),
    }
}

/// Strip all characters except digits and a single leading `+`; prepend `+` if missing.
pub fn normalize_number(raw: &str) -> String {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    format!("+{digits}")
}

/// Diagnostic view of what extraction would do with a body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractionPreview {
    pub extracted_phone: Option<String>,
    pub chat_address: Option<ChatAddress>,
    pub body_preview: String,
}

pub fn preview(body: &str) -> ExtractionPreview {
    let address = extract(body).ok().map(|a| normalize(&a));
    ExtractionPreview {
        extracted_phone: address.as_ref().map(DestinationAddress::e164),
        chat_address: address.as_ref().map(DestinationAddress::chat_address),
        body_preview: truncate_text(body, PREVIEW_CHARS),
    }
}

fn separate_markers(body: &str) -> Option<DestinationAddress> {
    static CC: OnceLock<Regex> = OnceLock::new();
    static PHONE: OnceLock<Regex> = OnceLock::new();
    let cc = CC.get_or_init(|| Regex::new(r"(?i)CountryCode:\s*(\+\d+)").expect("valid regex"));
    let phone = PHONE.get_or_init(|| Regex::new(r"(?i)Phone:\s*(\d+)").expect("valid regex"));

    let cc = cc.captures(body)?.get(1)?.as_str();
    let number = phone.captures(body)?.get(1)?.as_str();
    DestinationAddress::new(cc, number)
}

fn combined_markers(body: &str) -> Option<DestinationAddress> {
    static COMBINED: OnceLock<Regex> = OnceLock::new();
    let re = COMBINED.get_or_init(|| {
        Regex::new(r"(?is)CountryCode:\s*(\+\d+).*?Phone:\s*(\d+)").expect("valid regex")
    });

    let caps = re.captures(body)?;
    DestinationAddress::new(caps.get(1)?.as_str(), caps.get(2)?.as_str())
}

fn all_digits(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_digit())
}
