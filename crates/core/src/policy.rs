use crate::types::{CommentStatus, NormalizedReplyEvent, PolicyDecision, PolicySettings, SpfResult};

/// Trust policy engine deciding whether a reply must be force-classified
/// as spam before it is posted.
///
/// The spam-score, SPF, and DKIM checks are independent and OR-accumulate:
/// once any check fires, no later passing check can clear the decision.
/// The engine never forces approval; when nothing fires the host's default
/// moderation status applies.
#[derive(Debug, Default)]
pub struct TrustPolicy;

impl TrustPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates all checks against a normalized reply event.
    pub fn evaluate(
        &self,
        settings: &PolicySettings,
        event: &NormalizedReplyEvent,
    ) -> PolicyDecision {
        let mut decision = PolicyDecision::default();

        if event.spam_score >= settings.max_spam_score {
            decision.forced_status = Some(CommentStatus::Spam);
        }
        if spf_rejects(settings.spf_check_level, event.spf_result) {
            decision.forced_status = Some(CommentStatus::Spam);
        }
        if dkim_rejects(settings.dkim_check_level, event.dkim_signed, event.dkim_valid) {
            decision.forced_status = Some(CommentStatus::Spam);
        }
        decision
    }
}

/// Each level accepts a strictly smaller result set than the one below it.
/// Levels above 4 behave like 4.
fn spf_rejects(level: u8, result: SpfResult) -> bool {
    match level {
        0 => false,
        1 => !matches!(
            result,
            SpfResult::Pass | SpfResult::Neutral | SpfResult::Softfail | SpfResult::None
        ),
        2 => !matches!(
            result,
            SpfResult::Pass | SpfResult::Neutral | SpfResult::None
        ),
        3 => !matches!(result, SpfResult::Pass | SpfResult::Neutral),
        _ => !matches!(result, SpfResult::Pass),
    }
}

/// Level 1 tolerates unsigned mail but rejects a broken signature; level 2
/// (and above) requires a valid signature outright.
fn dkim_rejects(level: u8, signed: bool, valid: bool) -> bool {
    match level {
        0 => false,
        1 => signed && !valid,
        _ => !signed || !valid,
    }
}
