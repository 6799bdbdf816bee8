use serde_json::Value;

/// Decodes the provider's `events` parameter into a batch of raw events.
///
/// The provider posts a JSON-encoded array of event objects as one form
/// field. A missing parameter, undecodable JSON, or a non-array value all
/// yield an empty batch so the webhook call degrades to a no-op instead of
/// surfacing an error to the provider.
pub fn decode_event_batch(raw: Option<&str>) -> Vec<Value> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Array(events)) => events,
        _ => Vec::new(),
    }
}
