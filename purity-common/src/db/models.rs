//! Database models

use crate::fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validity reason persisted when a trial license runs out of quota
pub const TRIAL_EXPIRED_REASON: &str = "trial license has expired";

/// Safe-search likelihood scores, each on the provider scale
/// `UNKNOWN=0, VERY_UNLIKELY=1, UNLIKELY=2, POSSIBLE=3, LIKELY=4, VERY_LIKELY=5`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeSearchScores {
    pub adult: i16,
    pub spoof: i16,
    pub medical: i16,
    pub violence: i16,
    pub racy: i16,
}

/// Cached classification result for one image reference
///
/// Serialized field order is part of the public response format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAnnotation {
    pub hash: String,
    pub uri: String,
    pub error: Option<String>,
    #[serde(rename = "dateAdded")]
    pub date_added: DateTime<Utc>,
    pub adult: i16,
    pub spoof: i16,
    pub medical: i16,
    pub violence: i16,
    pub racy: i16,
}

impl ImageAnnotation {
    /// Build a fresh record for `uri`, fingerprinted and stamped now
    pub fn new(uri: &str, scores: SafeSearchScores, error: Option<String>) -> Self {
        Self {
            hash: fingerprint(uri),
            uri: uri.to_string(),
            error,
            date_added: Utc::now(),
            adult: scores.adult,
            spoof: scores.spoof,
            medical: scores.medical,
            violence: scores.violence,
            racy: scores.racy,
        }
    }

    pub fn scores(&self) -> SafeSearchScores {
        SafeSearchScores {
            adult: self.adult,
            spoof: self.spoof,
            medical: self.medical,
            violence: self.violence,
            racy: self.racy,
        }
    }
}

/// Billing and authorization record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub id: String,
    pub email: String,
    #[serde(rename = "stripeID")]
    pub stripe_id: String,
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    #[serde(rename = "isValid")]
    pub is_valid: bool,
    #[serde(rename = "validityReason")]
    pub validity_reason: String,
    #[serde(rename = "requestCount")]
    pub request_count: u64,
    #[serde(rename = "isTrial")]
    pub is_trial: bool,
}

impl License {
    /// Billed images left before the trial quota is reached (negative when over)
    pub fn trial_remaining(&self, trial_max_usage: u64) -> i64 {
        trial_max_usage as i64 - self.request_count as i64
    }

    /// Trial whose counter reached the maximum
    pub fn is_trial_exhausted(&self, trial_max_usage: u64) -> bool {
        self.is_trial && self.request_count >= trial_max_usage
    }
}
