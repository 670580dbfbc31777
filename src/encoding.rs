use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use percent_encoding::percent_decode_str;
use regex::Regex;
use scraper::Html;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::model::EncodingKind;

/// Payload patterns, most explicit first. Matched against the raw text since
/// base64 is case sensitive.
fn payload_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)encoded\s+in\s+base64\s*:?\s*([A-Za-z0-9+/=]+)",
            r"(?i)base64(?:\s+string)?\s*:\s*([A-Za-z0-9+/=]+)",
            r"(?i)encoded\s*:\s*([^\r\n]+)",
            r"(?i)decode\s*:\s*([^\r\n]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

fn base64_run() -> &'static Regex {
    static RUN: OnceLock<Regex> = OnceLock::new();
    RUN.get_or_init(|| Regex::new(r"[A-Za-z0-9+/=]{20,}").expect("static regex"))
}

fn strict_base64() -> &'static Regex {
    static STRICT: OnceLock<Regex> = OnceLock::new();
    STRICT.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").expect("static regex"))
}

fn percent_escape() -> &'static Regex {
    static ESC: OnceLock<Regex> = OnceLock::new();
    ESC.get_or_init(|| Regex::new(r"%[0-9A-Fa-f]{2}").expect("static regex"))
}

/// Finds the encoded substring in a question, if any.
pub fn extract_payload(text: &str) -> Option<String> {
    for re in payload_patterns() {
        if let Some(m) = re.captures(text).and_then(|c| c.get(1)) {
            let payload = m
                .as_str()
                .trim()
                .trim_matches(|c: char| matches!(c, '"' | '\'' | '`'))
                .trim_end_matches(|c: char| matches!(c, '?' | '!' | '.' | ','))
                .trim();
            if !payload.is_empty() {
                debug!(payload, "encoded payload found");
                return Some(payload.to_string());
            }
        }
    }
    base64_run()
        .find_iter(text)
        .map(|m| m.as_str())
        .max_by_key(|s| s.len())
        .map(str::to_string)
}

fn readable(s: &str) -> bool {
    !s.trim().is_empty() && s.chars().all(|c| !c.is_control() || c.is_whitespace())
}

fn try_base64(s: &str) -> Option<String> {
    if s.len() % 4 != 0 || !strict_base64().is_match(s) {
        return None;
    }
    let bytes = B64.decode(s).ok()?;
    String::from_utf8(bytes).ok().filter(|d| readable(d))
}

fn try_url(s: &str) -> Option<String> {
    if !percent_escape().is_match(s) {
        return None;
    }
    let decoded = percent_decode_str(s).decode_utf8().ok()?;
    (decoded != s).then(|| decoded.into_owned())
}

fn try_html(s: &str) -> Option<String> {
    if !(s.contains('&') && s.contains(';')) {
        return None;
    }
    let decoded = decode_html_entities(s);
    (decoded != s).then_some(decoded)
}

fn try_hex(s: &str) -> Option<String> {
    let clean: String = s.chars().filter(|c| *c != ' ' && *c != '-').collect();
    if clean.len() % 2 != 0 || clean.len() < 4 {
        return None;
    }
    let bytes = hex::decode(&clean).ok()?;
    String::from_utf8(bytes).ok().filter(|d| readable(d))
}

fn try_rot13(s: &str) -> Option<String> {
    let letters = s.chars().filter(|c| c.is_ascii_alphabetic()).count();
    if letters == 0 || !s.chars().all(|c| c.is_ascii_alphabetic() || c.is_whitespace()) {
        return None;
    }
    let decoded: String = s
        .chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A') + 13) % 26 + b'A') as char,
            _ => c,
        })
        .collect();
    (decoded != s).then_some(decoded)
}

/// Runs the decoders in priority order; the first that applies wins.
pub fn decode_payload(payload: &str) -> Option<(String, EncodingKind)> {
    let payload = payload.trim();
    let decoders: [(EncodingKind, fn(&str) -> Option<String>); 5] = [
        (EncodingKind::Base64, try_base64),
        (EncodingKind::Url, try_url),
        (EncodingKind::Html, try_html),
        (EncodingKind::Hex, try_hex),
        (EncodingKind::Rot13, try_rot13),
    ];
    decoders
        .iter()
        .find_map(|(kind, f)| f(payload).map(|d| (d, *kind)))
}

/// Extracts and decodes the obfuscated part of `text`. `None` leaves the
/// question as it was.
pub fn resolve(text: &str) -> Option<(String, EncodingKind)> {
    let payload = extract_payload(text)?;
    let (decoded, kind) = decode_payload(&payload)?;
    info!(encoding = %kind, decoded = %decoded, "payload decoded");
    Some((decoded, kind))
}

/// Decodes numeric and named character references through the HTML5 parser.
/// Literal `<` is kept as text; unknown references stay as they are.
pub fn decode_html_entities(s: &str) -> String {
    let fragment = Html::parse_fragment(&s.replace('<', "&lt;"));
    fragment.root_element().text().collect()
}
