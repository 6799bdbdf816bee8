use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{NormalizedReplyEvent, SpfResult};

/// Events older than this window relative to processing time are dropped.
pub const STALENESS_WINDOW_DAYS: i64 = 7;

/// Provider event-type string for inbound mail notifications.
pub const INBOUND_EVENT_TYPE: &str = "inbound";

/// Reasons an event is dropped before reaching the policy stage.
///
/// Skips are per-event and silent towards the provider; they are surfaced
/// only through logs, metrics, and the debug tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("event has no usable timestamp")]
    MissingTimestamp,
    #[error("event timestamp is older than the staleness window")]
    Stale,
    #[error("event type is not an inbound mail notification")]
    WrongEventType,
    #[error("event has no message object")]
    MissingMessage,
    #[error("message has no reply-to address")]
    MissingReplyAddress,
    #[error("reply body is empty after normalization")]
    EmptyBody,
}

impl SkipReason {
    /// Returns the label used for metrics and tap messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingTimestamp => "missing_timestamp",
            Self::Stale => "stale",
            Self::WrongEventType => "wrong_event_type",
            Self::MissingMessage => "missing_message",
            Self::MissingReplyAddress => "missing_reply_address",
            Self::EmptyBody => "empty_body",
        }
    }
}

/// Filters one raw provider event and extracts its typed projection.
pub struct ReplyExtractor;

impl ReplyExtractor {
    /// Applies the event filter, then extracts every field with a
    /// type-appropriate zero default.
    ///
    /// Extraction itself never fails; only the filter conditions (missing or
    /// stale timestamp, wrong event type, missing message object, missing
    /// reply address) reject an event. Trust decisions happen later in the
    /// policy stage.
    pub fn extract(
        event: &Value,
        now: DateTime<Utc>,
    ) -> Result<NormalizedReplyEvent, SkipReason> {
        let ts = event
            .get("ts")
            .and_then(Value::as_i64)
            .filter(|ts| *ts > 0)
            .ok_or(SkipReason::MissingTimestamp)?;
        let occurred_at = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or(SkipReason::MissingTimestamp)?;
        // Exactly at the cutoff is still fresh; only strictly older is stale.
        if occurred_at < now - Duration::days(STALENESS_WINDOW_DAYS) {
            return Err(SkipReason::Stale);
        }

        match event.get("event").and_then(Value::as_str) {
            Some(INBOUND_EVENT_TYPE) => {}
            _ => return Err(SkipReason::WrongEventType),
        }

        let msg = event
            .get("msg")
            .and_then(Value::as_object)
            .ok_or(SkipReason::MissingMessage)?;

        let reply_to_email = string_field(msg, &["email"]);
        if reply_to_email.is_empty() {
            return Err(SkipReason::MissingReplyAddress);
        }

        Ok(NormalizedReplyEvent {
            reply_to_email,
            from_name: string_field(msg, &["from_name"]),
            from_email: string_field(msg, &["from_email"]),
            subject: string_field(msg, &["subject"]),
            text_body: string_field(msg, &["text"]),
            html_body: string_field(msg, &["html"]),
            spam_score: float_field(msg, &["spam_report", "score"]).max(0.0),
            spf_result: SpfResult::from_provider(&string_field(msg, &["spf", "result"])),
            dkim_signed: bool_field(msg, &["dkim", "signed"]),
            dkim_valid: bool_field(msg, &["dkim", "valid"]),
            occurred_at,
        })
    }
}

fn field<'a>(msg: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = msg.get(*first)?;
    for key in rest {
        current = current.get(key)?;
    }
    Some(current)
}

fn string_field(msg: &Map<String, Value>, path: &[&str]) -> String {
    field(msg, path)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn float_field(msg: &Map<String, Value>, path: &[&str]) -> f64 {
    match field(msg, path) {
        Some(Value::Number(number)) => number.as_f64().unwrap_or_default(),
        // Providers occasionally quote numeric scores.
        Some(Value::String(raw)) => raw.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

fn bool_field(msg: &Map<String, Value>, path: &[&str]) -> bool {
    match field(msg, path) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().unwrap_or_default() != 0.0,
        Some(Value::String(raw)) => {
            let raw = raw.trim();
            !raw.is_empty() && raw != "0" && !raw.eq_ignore_ascii_case("false")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    fn inbound_event(ts: i64) -> Value {
        json!({
            "ts": ts,
            "event": "inbound",
            "msg": {
                "email": "r+abc123@reply.example.com",
                "from_name": "Jane Reader",
                "from_email": "jane@example.net",
                "subject": "Re: New comment on your post",
                "text": "Thanks!",
                "html": "<p>Thanks!</p>",
                "spam_report": { "score": 1.2 },
                "spf": { "result": "Pass" },
                "dkim": { "signed": true, "valid": true }
            }
        })
    }

    #[test]
    fn extracts_all_fields_from_full_event() {
        let event = inbound_event(now().timestamp());
        let extracted = ReplyExtractor::extract(&event, now()).expect("extract");

        assert_eq!(extracted.reply_to_email, "r+abc123@reply.example.com");
        assert_eq!(extracted.from_name, "Jane Reader");
        assert_eq!(extracted.from_email, "jane@example.net");
        assert_eq!(extracted.subject, "Re: New comment on your post");
        assert_eq!(extracted.text_body, "Thanks!");
        assert_eq!(extracted.html_body, "<p>Thanks!</p>");
        assert_eq!(extracted.spam_score, 1.2);
        assert_eq!(extracted.spf_result, SpfResult::Pass);
        assert!(extracted.dkim_signed);
        assert!(extracted.dkim_valid);
    }

    #[test]
    fn defaults_apply_for_missing_optional_fields() {
        let event = json!({
            "ts": now().timestamp(),
            "event": "inbound",
            "msg": { "email": "r@reply.example.com" }
        });
        let extracted = ReplyExtractor::extract(&event, now()).expect("extract");

        assert_eq!(extracted.from_name, "");
        assert_eq!(extracted.from_email, "");
        assert_eq!(extracted.subject, "");
        assert_eq!(extracted.text_body, "");
        assert_eq!(extracted.html_body, "");
        assert_eq!(extracted.spam_score, 0.0);
        assert_eq!(extracted.spf_result, SpfResult::None);
        assert!(!extracted.dkim_signed);
        assert!(!extracted.dkim_valid);
    }

    #[test]
    fn quoted_spam_score_is_cast() {
        let mut event = inbound_event(now().timestamp());
        event["msg"]["spam_report"]["score"] = json!("3.5");
        let extracted = ReplyExtractor::extract(&event, now()).expect("extract");
        assert_eq!(extracted.spam_score, 3.5);
    }

    #[test]
    fn negative_spam_score_clamps_to_zero() {
        let mut event = inbound_event(now().timestamp());
        event["msg"]["spam_report"]["score"] = json!(-4.3);
        let extracted = ReplyExtractor::extract(&event, now()).expect("extract");
        assert_eq!(extracted.spam_score, 0.0);
    }

    #[test]
    fn rejects_missing_or_zero_timestamp() {
        let mut event = inbound_event(0);
        assert_eq!(
            ReplyExtractor::extract(&event, now()),
            Err(SkipReason::MissingTimestamp)
        );
        event.as_object_mut().expect("object").remove("ts");
        assert_eq!(
            ReplyExtractor::extract(&event, now()),
            Err(SkipReason::MissingTimestamp)
        );
    }

    #[test]
    fn cutoff_boundary_is_not_stale_one_second_older_is() {
        let cutoff = now() - Duration::days(STALENESS_WINDOW_DAYS);

        let at_cutoff = inbound_event(cutoff.timestamp());
        assert!(ReplyExtractor::extract(&at_cutoff, now()).is_ok());

        let one_second_older = inbound_event(cutoff.timestamp() - 1);
        assert_eq!(
            ReplyExtractor::extract(&one_second_older, now()),
            Err(SkipReason::Stale)
        );
    }

    #[test]
    fn rejects_non_inbound_events() {
        let mut event = inbound_event(now().timestamp());
        event["event"] = json!("send");
        assert_eq!(
            ReplyExtractor::extract(&event, now()),
            Err(SkipReason::WrongEventType)
        );
    }

    #[test]
    fn rejects_missing_or_non_object_message() {
        let mut event = inbound_event(now().timestamp());
        event["msg"] = json!("not an object");
        assert_eq!(
            ReplyExtractor::extract(&event, now()),
            Err(SkipReason::MissingMessage)
        );
        event.as_object_mut().expect("object").remove("msg");
        assert_eq!(
            ReplyExtractor::extract(&event, now()),
            Err(SkipReason::MissingMessage)
        );
    }

    #[test]
    fn rejects_missing_reply_address() {
        let mut event = inbound_event(now().timestamp());
        event["msg"]["email"] = json!("   ");
        assert_eq!(
            ReplyExtractor::extract(&event, now()),
            Err(SkipReason::MissingReplyAddress)
        );
    }
}
