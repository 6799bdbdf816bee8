//! Reply body normalization.
//!
//! Provider-supplied HTML is richer than the plain-text part but cannot be
//! trusted for display: it is sanitized down to a small inline markup
//! subset. The plain-text part is the fallback when the HTML strips to
//! nothing. Both conversions are fixed points on their own output, so a
//! normalized body can safely be normalized again.

/// Inline tags that survive rich-text sanitization. Attributes never do.
const INLINE_TAGS: &[&str] = &["b", "strong", "i", "em", "u", "s", "code", "q"];

/// Tags whose entire content is dropped, not just the markup.
const DROP_CONTENT_TAGS: &[&str] = &["script", "style", "head"];

/// Tags that terminate a line of text.
const BREAK_TAGS: &[&str] = &["br", "p", "div", "li", "blockquote", "tr", "h1", "h2", "h3", "h4", "h5", "h6"];

/// Collapses text/HTML reply bodies into one displayable comment body.
pub struct ContentNormalizer;

impl ContentNormalizer {
    /// Selects and normalizes the final reply body.
    ///
    /// The html-derived rich text wins when it survives sanitization;
    /// otherwise the plain text is used. Returns `None` when both collapse
    /// to nothing, in which case the event must be discarded.
    pub fn reply_body(text_body: &str, html_body: &str) -> Option<String> {
        let rich = Self::normalize_rich_text(html_body);
        let body = if rich.is_empty() {
            Self::normalize_text(text_body)
        } else {
            rich
        };
        (!body.is_empty()).then_some(body)
    }

    /// Converts a body to normalized plain text: entities decoded, all
    /// markup stripped, whitespace collapsed.
    ///
    /// Decoding happens before stripping so entity-encoded markup is
    /// stripped like any other tag instead of surviving as live markup.
    pub fn normalize_text(input: &str) -> String {
        collapse_whitespace(&strip_markup(&decode_entities(input), false))
    }

    /// Sanitizes a body to normalized rich text: inline markup subset kept
    /// in canonical form, everything else stripped, whitespace collapsed.
    ///
    /// Entities are intentionally left encoded so sanitized output can
    /// never re-acquire markup on a later pass.
    pub fn normalize_rich_text(input: &str) -> String {
        collapse_whitespace(&strip_markup(input, true))
    }
}

/// One-pass tag scanner shared by both normalization modes.
fn strip_markup(input: &str, keep_inline: bool) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('<') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after_comment) = tail.strip_prefix("<!--") {
            rest = match after_comment.find("-->") {
                Some(end) => &after_comment[end + 3..],
                None => "",
            };
            continue;
        }

        let Some(end) = tail.find('>') else {
            // Unterminated tag swallows the remainder.
            rest = "";
            break;
        };
        let inner = tail[1..end].trim();
        let closing = inner.starts_with('/');
        let name: String = inner
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        rest = &tail[end + 1..];

        if !closing && DROP_CONTENT_TAGS.contains(&name.as_str()) {
            let close = format!("</{name}");
            rest = match rest.to_ascii_lowercase().find(&close) {
                Some(start) => match rest[start..].find('>') {
                    Some(close_end) => &rest[start + close_end + 1..],
                    None => "",
                },
                None => "",
            };
            continue;
        }

        if name == "br" || (closing && BREAK_TAGS.contains(&name.as_str())) {
            out.push('\n');
            continue;
        }

        if keep_inline && INLINE_TAGS.contains(&name.as_str()) {
            out.push('<');
            if closing {
                out.push('/');
            }
            out.push_str(&name);
            out.push('>');
        }
    }
    out.push_str(rest);
    out
}

fn decode_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(end) = tail.find(';').filter(|end| *end <= 12) {
            if let Some(decoded) = decode_entity(&tail[1..end]) {
                out.push(decoded);
                rest = &tail[end + 1..];
                continue;
            }
        }
        out.push('&');
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => decode_numeric_entity(entity),
    }
}

fn decode_numeric_entity(entity: &str) -> Option<char> {
    let digits = entity.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code)
}

/// Collapses runs of spaces within lines and runs of blank lines down to a
/// single paragraph break, trimming the edges.
fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_blank = false;

    for line in input.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if pending_blank {
                out.push('\n');
            }
        }
        out.push_str(&line);
        pending_blank = false;
    }
    out
}
