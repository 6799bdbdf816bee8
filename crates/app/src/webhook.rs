use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::StatusCode,
    response::Response,
};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info};
use uuid::Uuid;

use reply_gate_core::batch::decode_event_batch;
use reply_gate_core::extract::{ReplyExtractor, SkipReason};
use reply_gate_core::normalize::ContentNormalizer;
use reply_gate_core::types::{NormalizedReplyEvent, PolicyDecision, ReplySettings};
use reply_gate_wp::NewReplyComment;

use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StageMetadata, StagePayload};

/// Handler identifier the install must have selected for this endpoint to act.
pub const HANDLER_IDENTIFIER: &str = "mandrill";

/// Fixed component identifier signed with the install secret to derive the
/// webhook key.
pub const COMPONENT_IDENTIFIER: &str = "reply-gate/rve-mandrill";

#[derive(Debug, Default, Deserialize)]
pub struct HookQuery {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HookForm {
    #[serde(default)]
    events: Option<String>,
}

/// Inbound-reply webhook endpoint.
///
/// The provider always receives the same fixed acknowledgement: per-event
/// failures, authorization failures, and malformed batches are invisible to
/// it by design, so a probing caller cannot distinguish which check failed
/// and the provider never enters a retry storm.
pub async fn handle(
    State(state): State<AppState>,
    query: Option<Query<HookQuery>>,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let trace_id = Uuid::new_v4().to_string();
    let key = query.and_then(|Query(query)| query.key);
    let form: HookForm = serde_urlencoded::from_bytes(&body).unwrap_or_default();

    let settings = match state.bridge().fetch_settings().await {
        Ok(settings) => settings,
        Err(err) => {
            error!(stage = "ingress", %trace_id, error = %err, "failed to fetch reply settings");
            counter!("webhook_ingress_total", "result" => "settings_error").increment(1);
            return ack(start);
        }
    };

    if !authorize(&settings, key.as_deref(), &state.install_secret()) {
        // Acknowledge without revealing which check failed.
        info!(stage = "ingress", %trace_id, "unauthorized webhook call ignored");
        counter!("webhook_ingress_total", "result" => "unauthorized").increment(1);
        return ack(start);
    }
    counter!("webhook_ingress_total", "result" => "authorized").increment(1);

    let events = decode_event_batch(form.events.as_deref());
    emit_stage(
        &state,
        &trace_id,
        StageKind::Ingress,
        Value::Null,
        json!({ "status": 200, "batch_size": events.len() }),
        StageMetadata {
            size_bytes: Some(body.len() as u64),
            latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
            ..StageMetadata::default()
        },
    );

    for event in &events {
        process_event(&state, &settings, &trace_id, event).await;
    }

    ack(start)
}

/// Runs one raw event through filter, extraction, normalization, policy,
/// and posting. Failures never abort the surrounding batch.
async fn process_event(
    state: &AppState,
    settings: &ReplySettings,
    trace_id: &str,
    event: &Value,
) {
    let start = Instant::now();
    let extracted = match ReplyExtractor::extract(event, state.now()) {
        Ok(extracted) => extracted,
        Err(reason) => {
            skip_event(state, trace_id, reason, sanitize_event(event), start);
            return;
        }
    };
    emit_stage(
        state,
        trace_id,
        StageKind::Extract,
        sanitize_event(event),
        extracted.redacted(),
        stage_meta(start),
    );

    let Some(reply_body) =
        ContentNormalizer::reply_body(&extracted.text_body, &extracted.html_body)
    else {
        skip_event(state, trace_id, SkipReason::EmptyBody, extracted.redacted(), start);
        return;
    };
    emit_stage(
        state,
        trace_id,
        StageKind::Normalize,
        extracted.redacted(),
        json!({ "body_len": reply_body.len() }),
        stage_meta(start),
    );

    let decision = state.policy().evaluate(settings.policy(), &extracted);
    if decision.is_forced_spam() {
        counter!("policy_forced_spam_total").increment(1);
    }
    emit_stage(
        state,
        trace_id,
        StageKind::Policy,
        extracted.redacted(),
        decision.redacted(),
        stage_meta(start),
    );

    post_reply(state, trace_id, &extracted, &reply_body, decision).await;
}

async fn post_reply(
    state: &AppState,
    trace_id: &str,
    event: &NormalizedReplyEvent,
    body: &str,
    decision: PolicyDecision,
) {
    let start = Instant::now();

    let context = match state.bridge().resolve_reply_address(&event.reply_to_email).await {
        Ok(Some(context)) => context,
        Ok(None) => {
            debug!(stage = "post", %trace_id, "reply address has no subscription");
            counter!("webhook_skipped_events_total", "reason" => "no_subscription").increment(1);
            counter!("webhook_events_total", "outcome" => "skipped").increment(1);
            emit_stage(
                state,
                trace_id,
                StageKind::Post,
                event.redacted(),
                json!({ "skipped": "no_subscription" }),
                stage_meta(start),
            );
            return;
        }
        Err(err) => {
            fail_event(state, trace_id, event, "subscription lookup failed", &err.to_string(), start);
            return;
        }
    };

    let comment = NewReplyComment {
        post_id: context.post_id,
        comment_parent_id: context.comment_parent_id,
        author_name: &event.from_name,
        author_email: &event.from_email,
        subject: &event.subject,
        body,
        status: decision.forced_status,
    };

    match state.bridge().create_reply(&comment).await {
        Ok(created) => {
            info!(
                stage = "post",
                %trace_id,
                comment_id = created.comment_id,
                forced_spam = decision.is_forced_spam(),
                "reply comment created"
            );
            counter!("webhook_events_total", "outcome" => "posted").increment(1);
            emit_stage(
                state,
                trace_id,
                StageKind::Post,
                event.redacted(),
                json!({
                    "comment_id": created.comment_id,
                    "forced_status": decision.forced_status.map(|status| status.as_str()),
                }),
                stage_meta(start),
            );
        }
        Err(err) => {
            fail_event(state, trace_id, event, "comment creation failed", &err.to_string(), start);
        }
    }
}

fn skip_event(
    state: &AppState,
    trace_id: &str,
    reason: SkipReason,
    redacted_in: Value,
    start: Instant,
) {
    debug!(stage = "extract", %trace_id, reason = reason.as_str(), "event skipped");
    counter!("webhook_skipped_events_total", "reason" => reason.as_str()).increment(1);
    counter!("webhook_events_total", "outcome" => "skipped").increment(1);
    emit_stage(
        state,
        trace_id,
        StageKind::Extract,
        redacted_in,
        json!({ "skipped": reason.as_str() }),
        StageMetadata {
            message: Some(reason.as_str().to_string()),
            latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
            ..StageMetadata::default()
        },
    );
}

fn fail_event(
    state: &AppState,
    trace_id: &str,
    event: &NormalizedReplyEvent,
    what: &'static str,
    detail: &str,
    start: Instant,
) {
    error!(stage = "post", %trace_id, error = detail, "{what}");
    counter!("webhook_events_total", "outcome" => "failed").increment(1);
    emit_stage(
        state,
        trace_id,
        StageKind::Post,
        event.redacted(),
        json!({ "error": what }),
        StageMetadata {
            message: Some(what.to_string()),
            latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
            ..StageMetadata::default()
        },
    );
}

fn authorize(settings: &ReplySettings, key: Option<&str>, secret: &[u8]) -> bool {
    if !settings.replies_via_email_enabled {
        return false;
    }
    if settings.active_handler != HANDLER_IDENTIFIER {
        return false;
    }
    let Some(provided) = key.map(str::trim).filter(|key| !key.is_empty()) else {
        return false;
    };
    let Some(expected) = derive_webhook_key(secret) else {
        return false;
    };
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Derives the per-install webhook key: the hex HMAC-SHA256 signature of
/// the component identifier under the install secret.
pub(crate) fn derive_webhook_key(secret: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
    mac.update(COMPONENT_IDENTIFIER.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn ack(start: Instant) -> Response {
    histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from("ok"))
        .unwrap()
}

fn stage_meta(start: Instant) -> StageMetadata {
    StageMetadata {
        latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
        ..StageMetadata::default()
    }
}

fn emit_stage(
    state: &AppState,
    trace_id: &str,
    stage: StageKind,
    r#in: Value,
    out: Value,
    meta: StageMetadata,
) {
    let event = StageEvent {
        ts: state.now(),
        stage,
        trace_id: Some(trace_id.to_string()),
        meta,
        r#in: StagePayload {
            redacted: true,
            payload: r#in,
        },
        out: StagePayload {
            redacted: true,
            payload: out,
        },
    };
    state.tap().publish(event);
}

/// Keeps only the non-sensitive signal fields of a raw event for tap output.
fn sanitize_event(value: &Value) -> Value {
    let mut sanitized = serde_json::Map::new();
    if let Some(ts) = value.get("ts").and_then(Value::as_i64) {
        sanitized.insert("ts".to_string(), Value::from(ts));
    }
    if let Some(event_type) = value.get("event").and_then(Value::as_str) {
        sanitized.insert("event".to_string(), Value::String(event_type.to_string()));
    }
    if let Some(score) = value.pointer("/msg/spam_report/score") {
        sanitized.insert("spam_score".to_string(), score.clone());
    }
    if let Some(spf) = value.pointer("/msg/spf/result") {
        sanitized.insert("spf_result".to_string(), spf.clone());
    }
    if let Some(dkim) = value.pointer("/msg/dkim") {
        sanitized.insert("dkim".to_string(), dkim.clone());
    }
    Value::Object(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Method, Request};
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use reqwest::Client;
    use std::sync::Arc;
    use tower::ServiceExt;
    use url::Url;

    use crate::router::{app_router, AppState};
    use crate::tap::TapHub;
    use crate::telemetry;
    use reply_gate_wp::BridgeClient;

    const FIXED_NOW: &str = "2024-06-01T00:00:00Z";
    const SECRET: &[u8] = b"test-secret";

    struct TestContext {
        state: AppState,
        server: MockServer,
        now: DateTime<Utc>,
    }

    async fn setup_context() -> TestContext {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let tap = TapHub::new();
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/wp-json/reply-gate/v1/")).expect("url");
        let bridge = BridgeClient::new(
            base,
            "bridge-token",
            Client::builder().build().expect("client"),
        );

        let now = DateTime::parse_from_rfc3339(FIXED_NOW)
            .expect("fixed time")
            .with_timezone(&Utc);
        let secret: Arc<[u8]> = Arc::from(SECRET.to_vec().into_boxed_slice());
        let fixed_now = now;
        let state = AppState::new(metrics, tap, bridge, secret)
            .with_clock(Arc::new(move || fixed_now));

        TestContext { state, server, now }
    }

    async fn mock_settings<'a>(
        server: &'a MockServer,
        enabled: bool,
        handler: &str,
    ) -> httpmock::Mock<'a> {
        let body = serde_json::json!({
            "replies_via_email_enabled": enabled,
            "active_handler": handler,
            "policy": {
                "max_spam_score": 5.0,
                "spf_check_level": 1,
                "dkim_check_level": 1
            }
        });
        server
            .mock_async(move |when, then| {
                when.method(GET).path("/wp-json/reply-gate/v1/settings");
                then.status(200).json_body(body.clone());
            })
            .await
    }

    async fn mock_resolve(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/wp-json/reply-gate/v1/subscriptions/resolve");
                then.status(200).json_body(serde_json::json!({
                    "sub_key": "abc123",
                    "post_id": 42,
                    "comment_parent_id": 7
                }));
            })
            .await
    }

    fn webhook_key() -> String {
        derive_webhook_key(SECRET).expect("key")
    }

    fn inbound_event(ts: i64) -> Value {
        json!({
            "ts": ts,
            "event": "inbound",
            "msg": {
                "email": "r+abc123@reply.example.com",
                "from_name": "Jane Reader",
                "from_email": "jane@example.net",
                "subject": "Re: New comment",
                "text": "Thanks!",
                "html": "",
                "spam_report": { "score": 1.2 },
                "spf": { "result": "pass" },
                "dkim": { "signed": true, "valid": true }
            }
        })
    }

    fn form_body(events: &[Value]) -> String {
        let encoded = serde_json::to_string(events).expect("events json");
        serde_urlencoded::to_string([("events", encoded)]).expect("form body")
    }

    async fn call_webhook(state: AppState, key: &str, body: String) -> Response {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(format!("/webhook/inbound-reply?key={key}"))
            .body(Body::from(body))
            .expect("request");
        request.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let app = app_router(state);
        app.oneshot(request).await.expect("response")
    }

    async fn response_text(response: Response) -> String {
        let collected = response.into_body().collect().await.expect("body");
        String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8")
    }

    #[tokio::test]
    async fn clean_reply_is_posted_with_default_status() {
        let ctx = setup_context().await;
        let settings = mock_settings(&ctx.server, true, "mandrill").await;
        let resolve = mock_resolve(&ctx.server).await;
        let create = ctx
            .server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/wp-json/reply-gate/v1/comments")
                    .json_body(serde_json::json!({
                        "post_id": 42,
                        "comment_parent_id": 7,
                        "author_name": "Jane Reader",
                        "author_email": "jane@example.net",
                        "subject": "Re: New comment",
                        "body": "Thanks!"
                    }));
                then.status(201).json_body(serde_json::json!({ "comment_id": 99 }));
            })
            .await;

        let body = form_body(&[inbound_event(ctx.now.timestamp() - 3600)]);
        let response = call_webhook(ctx.state.clone(), &webhook_key(), body).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "ok");
        settings.assert_async().await;
        resolve.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn high_spam_score_is_posted_as_spam() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        mock_resolve(&ctx.server).await;
        let create = ctx
            .server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/wp-json/reply-gate/v1/comments")
                    .json_body_partial(r#"{ "status": "spam" }"#);
                then.status(201).json_body(serde_json::json!({ "comment_id": 100 }));
            })
            .await;

        let mut event = inbound_event(ctx.now.timestamp() - 3600);
        event["msg"]["spam_report"]["score"] = json!(6.0);
        let response = call_webhook(ctx.state.clone(), &webhook_key(), form_body(&[event])).await;

        assert_eq!(response.status(), StatusCode::OK);
        create.assert_async().await;
    }

    #[tokio::test]
    async fn spf_fail_at_default_level_is_posted_as_spam() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        mock_resolve(&ctx.server).await;
        let create = ctx
            .server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/wp-json/reply-gate/v1/comments")
                    .json_body_partial(r#"{ "status": "spam" }"#);
                then.status(201).json_body(serde_json::json!({ "comment_id": 101 }));
            })
            .await;

        let mut event = inbound_event(ctx.now.timestamp() - 3600);
        event["msg"]["spf"]["result"] = json!("fail");
        event["msg"]["dkim"] = json!({ "signed": false, "valid": false });
        let response = call_webhook(ctx.state.clone(), &webhook_key(), form_body(&[event])).await;

        assert_eq!(response.status(), StatusCode::OK);
        create.assert_async().await;
    }

    #[tokio::test]
    async fn missing_events_parameter_is_acknowledged() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        let create = ctx
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/wp-json/reply-gate/v1/comments");
                then.status(201).json_body(serde_json::json!({ "comment_id": 1 }));
            })
            .await;

        let response = call_webhook(ctx.state.clone(), &webhook_key(), String::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "ok");
        create.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn malformed_batch_is_acknowledged_as_no_op() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        let create = ctx
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/wp-json/reply-gate/v1/comments");
                then.status(201).json_body(serde_json::json!({ "comment_id": 1 }));
            })
            .await;

        let body =
            serde_urlencoded::to_string([("events", "{not valid json")]).expect("form body");
        let response = call_webhook(ctx.state.clone(), &webhook_key(), body).await;

        assert_eq!(response.status(), StatusCode::OK);
        create.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn wrong_key_is_acknowledged_without_side_effects() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        let resolve = mock_resolve(&ctx.server).await;

        let body = form_body(&[inbound_event(ctx.now.timestamp() - 3600)]);
        let response = call_webhook(ctx.state.clone(), "0000deadbeef", body).await;

        // Indistinguishable from a successful no-op call.
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "ok");
        resolve.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn disabled_feature_is_acknowledged_without_processing() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, false, "mandrill").await;
        let resolve = mock_resolve(&ctx.server).await;

        let body = form_body(&[inbound_event(ctx.now.timestamp() - 3600)]);
        let response = call_webhook(ctx.state.clone(), &webhook_key(), body).await;

        assert_eq!(response.status(), StatusCode::OK);
        resolve.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn wrong_handler_is_acknowledged_without_processing() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "sendgrid").await;
        let resolve = mock_resolve(&ctx.server).await;

        let body = form_body(&[inbound_event(ctx.now.timestamp() - 3600)]);
        let response = call_webhook(ctx.state.clone(), &webhook_key(), body).await;

        assert_eq!(response.status(), StatusCode::OK);
        resolve.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn stale_and_foreign_events_are_skipped_without_aborting_the_batch() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        mock_resolve(&ctx.server).await;
        let create = ctx
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/wp-json/reply-gate/v1/comments");
                then.status(201).json_body(serde_json::json!({ "comment_id": 102 }));
            })
            .await;

        let stale = inbound_event(ctx.now.timestamp() - 8 * 24 * 3600);
        let mut foreign = inbound_event(ctx.now.timestamp() - 3600);
        foreign["event"] = json!("send");
        let valid = inbound_event(ctx.now.timestamp() - 3600);

        let body = form_body(&[stale, foreign, valid]);
        let response = call_webhook(ctx.state.clone(), &webhook_key(), body).await;

        assert_eq!(response.status(), StatusCode::OK);
        create.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn empty_bodies_never_reach_comment_creation() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        let resolve = mock_resolve(&ctx.server).await;

        let mut event = inbound_event(ctx.now.timestamp() - 3600);
        event["msg"]["text"] = json!("");
        event["msg"]["html"] = json!("<div>   </div>");
        let response = call_webhook(ctx.state.clone(), &webhook_key(), form_body(&[event])).await;

        assert_eq!(response.status(), StatusCode::OK);
        resolve.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn downstream_failure_does_not_abort_the_batch() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        mock_resolve(&ctx.server).await;
        let create = ctx
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/wp-json/reply-gate/v1/comments");
                then.status(500).body("database gone away");
            })
            .await;

        let first = inbound_event(ctx.now.timestamp() - 3600);
        let second = inbound_event(ctx.now.timestamp() - 1800);
        let response = call_webhook(ctx.state.clone(), &webhook_key(), form_body(&[first, second])).await;

        // Both events were attempted and the provider still saw success.
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "ok");
        create.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn unresolved_reply_address_is_skipped() {
        let ctx = setup_context().await;
        mock_settings(&ctx.server, true, "mandrill").await;
        ctx.server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/wp-json/reply-gate/v1/subscriptions/resolve");
                then.status(404).body("no subscription");
            })
            .await;
        let create = ctx
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/wp-json/reply-gate/v1/comments");
                then.status(201).json_body(serde_json::json!({ "comment_id": 1 }));
            })
            .await;

        let body = form_body(&[inbound_event(ctx.now.timestamp() - 3600)]);
        let response = call_webhook(ctx.state.clone(), &webhook_key(), body).await;

        assert_eq!(response.status(), StatusCode::OK);
        create.assert_hits_async(0).await;
    }

    #[test]
    fn webhook_key_is_a_stable_hex_signature() {
        let first = derive_webhook_key(SECRET).expect("key");
        let second = derive_webhook_key(SECRET).expect("key");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let other = derive_webhook_key(b"other-secret").expect("key");
        assert_ne!(first, other);
    }
}
