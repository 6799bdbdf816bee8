use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reply-handling settings fetched from the host install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplySettings {
    #[serde(default)]
    pub replies_via_email_enabled: bool,
    #[serde(default)]
    pub active_handler: String,
    #[serde(default)]
    pub policy: PolicySettings,
}

impl ReplySettings {
    /// Returns the trust policy configuration.
    pub fn policy(&self) -> &PolicySettings {
        &self.policy
    }
}

/// Trust policy knobs controlling when a reply is force-classified as spam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default = "PolicySettings::default_max_spam_score")]
    pub max_spam_score: f64,
    /// `0` disables the SPF check; `1..=4` shrink the accepted result set.
    #[serde(default = "PolicySettings::default_check_level")]
    pub spf_check_level: u8,
    /// `0` disables the DKIM check; `2` makes a valid signature mandatory.
    #[serde(default = "PolicySettings::default_check_level")]
    pub dkim_check_level: u8,
}

impl PolicySettings {
    fn default_max_spam_score() -> f64 {
        5.0
    }

    fn default_check_level() -> u8 {
        1
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_spam_score: Self::default_max_spam_score(),
            spf_check_level: Self::default_check_level(),
            dkim_check_level: Self::default_check_level(),
        }
    }
}

/// SPF verdict reported by the provider for the inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    Pass,
    Neutral,
    Softfail,
    Fail,
    None,
}

impl SpfResult {
    /// Maps a provider-supplied result string onto the known verdicts.
    ///
    /// Matching is case-insensitive; anything unrecognized (including an
    /// absent value) collapses to [`SpfResult::None`].
    pub fn from_provider(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pass" => Self::Pass,
            "neutral" => Self::Neutral,
            "softfail" => Self::Softfail,
            "fail" => Self::Fail,
            _ => Self::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Neutral => "neutral",
            Self::Softfail => "softfail",
            Self::Fail => "fail",
            Self::None => "none",
        }
    }
}

/// Moderation status a posted comment can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    Approved,
    Pending,
    Spam,
}

impl CommentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Spam => "spam",
        }
    }
}

/// Typed projection of one inbound-reply event after filtering/extraction.
///
/// `dkim_valid` carries no meaning when `dkim_signed` is false; the policy
/// engine must not treat it as implying a signature was present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReplyEvent {
    pub reply_to_email: String,
    pub from_name: String,
    pub from_email: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    pub spam_score: f64,
    pub spf_result: SpfResult,
    pub dkim_signed: bool,
    pub dkim_valid: bool,
    pub occurred_at: DateTime<Utc>,
}

impl NormalizedReplyEvent {
    /// Produces a redacted JSON representation suitable for tap output.
    ///
    /// Addresses and bodies are masked; the trust signals stay visible so
    /// policy behaviour can be observed live.
    pub fn redacted(&self) -> Value {
        json!({
            "reply_to_email": mask(&self.reply_to_email),
            "from_email": mask(&self.from_email),
            "subject": self.subject,
            "spam_score": self.spam_score,
            "spf_result": self.spf_result.as_str(),
            "dkim_signed": self.dkim_signed,
            "dkim_valid": self.dkim_valid,
            "occurred_at": self.occurred_at,
        })
    }
}

fn mask(value: &str) -> Option<&'static str> {
    if value.is_empty() {
        None
    } else {
        Some("***")
    }
}

/// Outcome of trust policy evaluation.
///
/// The policy can only ever force `spam`; when no check fires the host's
/// default moderation status applies and `forced_status` stays unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyDecision {
    pub forced_status: Option<CommentStatus>,
}

impl PolicyDecision {
    /// Returns `true` when a check forced the spam status.
    pub fn is_forced_spam(&self) -> bool {
        matches!(self.forced_status, Some(CommentStatus::Spam))
    }

    /// Returns a redacted payload suitable for tap output.
    pub fn redacted(&self) -> Value {
        json!({
            "forced_status": self.forced_status.map(CommentStatus::as_str),
        })
    }
}
