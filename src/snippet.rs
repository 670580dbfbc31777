use anyhow::{bail, Result};
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::model::Question;

/// Snippets must be longer than this to be attached.
const MIN_SNIPPET_CHARS: usize = 10;
const MAX_SNIPPET_CHARS: usize = 8000;
/// Wide enough that html2text does not wrap code lines.
const PAGE_TEXT_WIDTH: usize = 400;
const CODE_HINTS: &[&str] = &["function", "def ", "class ", "import ", "include", "var ", "let ", "const ", "{", "}", ";"];

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).expect("static regex"))
}

pub fn find_urls(text: &str) -> Vec<String> {
    url_re()
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')', '?', '!']).to_string())
        .collect()
}

/// Rewrites hosted-code page URLs to endpoints that serve the raw content.
pub fn raw_url(raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let segs: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    match url.host_str().unwrap_or_default() {
        "github.com" | "www.github.com" if segs.len() > 3 && segs[2] == "blob" => format!(
            "https://raw.githubusercontent.com/{}/{}/{}",
            segs[0],
            segs[1],
            segs[3..].join("/")
        ),
        "gist.github.com" if segs.len() >= 2 && !segs.contains(&"raw") => {
            format!("https://gist.githubusercontent.com/{}/{}/raw", segs[0], segs[1])
        }
        "pastebin.com" | "www.pastebin.com" if segs.len() == 1 => {
            format!("https://pastebin.com/raw/{}", segs[0])
        }
        "drive.google.com" => {
            let id = match segs.as_slice() {
                ["file", "d", id, ..] => Some(id.to_string()),
                _ => url.query_pairs().find(|(k, _)| k == "id").map(|(_, v)| v.into_owned()),
            };
            match id {
                Some(id) => format!("https://drive.google.com/uc?export=download&id={}", id),
                None => raw.to_string(),
            }
        }
        _ => raw.to_string(),
    }
}

/// First `<pre>` block, then first `<code>` block, longer than the minimum.
fn code_blocks(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    ["pre", "code"].iter().find_map(|tag| {
        let selector = Selector::parse(tag).ok()?;
        document
            .select(&selector)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .find(|s| s.chars().count() > MIN_SNIPPET_CHARS)
    })
}

/// Pulls code out of a fetched body: `<pre>` then `<code>` blocks for HTML,
/// the page text when it looks like code, plain text as is.
pub fn extract_code(body: &str, is_html: bool) -> Option<String> {
    let snippet = if is_html {
        match code_blocks(body) {
            Some(s) => s,
            None => {
                let text = html2text::from_read(body.as_bytes(), PAGE_TEXT_WIDTH);
                let text = text.trim();
                if !CODE_HINTS.iter().any(|h| text.contains(h)) {
                    return None;
                }
                text.to_string()
            }
        }
    } else {
        body.trim().to_string()
    };
    if snippet.chars().count() <= MIN_SNIPPET_CHARS {
        return None;
    }
    Some(snippet.chars().take(MAX_SNIPPET_CHARS).collect())
}

/// Fetches code linked from coding questions.
#[derive(Clone)]
pub struct SnippetFetcher {
    http: Client,
}

impl SnippetFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    pub async fn fetch(&self, url: &str) -> Result<Option<String>> {
        let target = raw_url(url);
        debug!(url, target = %target, "fetching linked code");
        let resp = self.http.get(&target).send().await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("fetch {} failed with {}", target, status);
        }
        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(false);
        let body = resp.text().await?;
        let is_html = is_html || body.trim_start().starts_with('<');
        Ok(extract_code(&body, is_html))
    }

    /// Attaches the first usable snippet from the links in the question.
    /// Failures are logged and skipped.
    pub async fn enrich(&self, question: &mut Question) {
        if question.attachment.is_some() {
            return;
        }
        for url in find_urls(&question.raw_text) {
            match self.fetch(&url).await {
                Ok(Some(code)) => {
                    info!(url = %url, chars = code.len(), "linked code attached");
                    question.attachment = Some(code);
                    return;
                }
                Ok(None) => debug!(url = %url, "no code found at link"),
                Err(e) => warn!(url = %url, error = %e, "linked code fetch failed"),
            }
        }
    }
}
