use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::browser::{Browser, BrowserConfig};
use crate::model::{tolerate, QuizError};

// ========================= Locators =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Locator {
    Css { selector: String },
    XPath { expr: String },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css { selector: selector.into() }
    }

    pub fn xpath(expr: impl Into<String>) -> Self {
        Locator::XPath { expr: expr.into() }
    }

    /// `//...` is XPath, anything else CSS.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("//") {
            Self::xpath(raw)
        } else {
            Self::css(raw)
        }
    }

    /// Locator for a `data-functional-selector` attribute value.
    pub fn functional(name: &str) -> Self {
        Self::css(format!("[data-functional-selector='{}']", name))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Locator::Css { selector } => selector,
            Locator::XPath { expr } => expr,
        }
    }
}

/// Snapshot of a located element. `(locator, index, depth)` addresses it
/// again; `depth` counts parent hops from the matched node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub locator: Locator,
    pub index: usize,
    #[serde(default)]
    pub depth: u8,
    pub text: String,
    pub visible: bool,
    pub width: f64,
    pub height: f64,
    pub functional_selector: Option<String>,
}

impl Element {
    pub fn larger_than(&self, min_px: f64) -> bool {
        self.visible && self.width > min_px && self.height > min_px
    }
}

/// One named way of finding text on the page.
#[derive(Clone, Debug, PartialEq)]
pub struct LocatorStrategy {
    pub locator: Locator,
    /// Minimum trimmed character count for the text to count as found.
    pub min_chars: usize,
    pub visible_only: bool,
}

impl LocatorStrategy {
    pub fn new(raw: &str) -> Self {
        Self { locator: Locator::parse(raw), min_chars: 1, visible_only: false }
    }

    pub fn min_chars(mut self, n: usize) -> Self {
        self.min_chars = n.max(1);
        self
    }

    pub fn visible_only(mut self) -> Self {
        self.visible_only = true;
        self
    }

    fn accepts(&self, el: &Element) -> bool {
        (el.visible || !self.visible_only) && el.text.trim().chars().count() >= self.min_chars
    }
}

pub fn chain(raws: &[&str]) -> Vec<LocatorStrategy> {
    raws.iter().map(|r| LocatorStrategy::new(r)).collect()
}

/// Walks `strategies` in order and returns the first element whose trimmed
/// text qualifies. Later strategies are not tried once one succeeds; driver
/// failures count as "not found".
pub async fn first_text(
    driver: &dyn Driver,
    strategies: &[LocatorStrategy],
) -> Result<Option<(Element, String)>, QuizError> {
    for strategy in strategies {
        let found = tolerate(driver.locate_all(&strategy.locator).await, Vec::new(), "locate")?;
        if let Some(el) = found.into_iter().find(|el| strategy.accepts(el)) {
            debug!(locator = strategy.locator.as_str(), "text located");
            let text = el.text.trim().to_string();
            return Ok(Some((el, text)));
        }
    }
    Ok(None)
}

/// First element of the first locator that yields a visible match.
pub async fn first_visible(driver: &dyn Driver, locators: &[Locator]) -> Result<Option<Element>, QuizError> {
    for locator in locators {
        let found = tolerate(driver.locate_all(locator).await, Vec::new(), "locate")?;
        if let Some(el) = found.into_iter().find(|el| el.visible) {
            return Ok(Some(el));
        }
    }
    Ok(None)
}

// ========================= Driver Seam =========================

#[async_trait]
pub trait Driver: Send + Sync {
    async fn locate(&self, locator: &Locator) -> Result<Option<Element>, QuizError> {
        Ok(self.locate_all(locator).await?.into_iter().next())
    }
    async fn locate_all(&self, locator: &Locator) -> Result<Vec<Element>, QuizError>;
    async fn current_url(&self) -> Result<String, QuizError>;
    async fn page_text(&self) -> Result<String, QuizError>;
    async fn click(&self, element: &Element) -> Result<(), QuizError>;
    async fn parent(&self, element: &Element) -> Result<Option<Element>, QuizError>;
    async fn type_text(&self, element: &Element, text: &str) -> Result<(), QuizError>;
    async fn press_enter(&self, element: &Element) -> Result<(), QuizError>;
    async fn goto(&self, url: &str) -> Result<(), QuizError>;
    async fn screenshot(&self) -> Result<Vec<u8>, QuizError>;
}

// ========================= Chromium Adapter =========================

const LOST_CONNECTION_HINTS: [&str; 6] = [
    "receiver is gone",
    "channel closed",
    "websocket",
    "connection closed",
    "connection reset",
    "broken pipe",
];

fn driver_err(e: anyhow::Error) -> QuizError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if LOST_CONNECTION_HINTS.iter().any(|h| lower.contains(h)) {
        QuizError::Disconnected(msg)
    } else {
        QuizError::Driver(msg)
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// JS expression evaluating to an array of the locator's matches.
fn query_js(locator: &Locator) -> String {
    match locator {
        Locator::Css { selector } => {
            format!("Array.from(document.querySelectorAll({}))", js_string(selector))
        }
        Locator::XPath { expr } => format!(
            r#"(() => {{
                const r = document.evaluate({}, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
                const out = [];
                for (let i = 0; i < r.snapshotLength; i++) out.push(r.snapshotItem(i));
                return out;
            }})()"#,
            js_string(expr)
        ),
    }
}

/// JS expression evaluating to the element addressed by `el`, or null.
fn resolve_js(el: &Element) -> String {
    format!(
        r#"(() => {{
            let el = ({})[{}];
            for (let i = 0; i < {} && el; i++) el = el.parentElement;
            return el || null;
        }})()"#,
        query_js(&el.locator),
        el.index,
        el.depth
    )
}

const DESCRIBE_FN: &str = r#"(el) => {
    const r = el.getBoundingClientRect();
    const s = window.getComputedStyle(el);
    return {
        text: (el.innerText || el.textContent || '').trim(),
        visible: r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none',
        width: r.width,
        height: r.height,
        functional_selector: el.getAttribute('data-functional-selector'),
    };
}"#;

#[derive(Deserialize)]
struct Probe {
    text: String,
    visible: bool,
    width: f64,
    height: f64,
    functional_selector: Option<String>,
}

#[derive(Deserialize)]
struct Center {
    x: f64,
    y: f64,
}

pub struct ChromiumDriver {
    browser: Browser,
}

impl ChromiumDriver {
    pub async fn start(cfg: BrowserConfig) -> Result<Self, QuizError> {
        let browser = Browser::start(cfg).await.map_err(driver_err)?;
        Ok(Self { browser })
    }

    pub async fn shutdown(&mut self) -> Result<(), QuizError> {
        self.browser.close().await.map_err(driver_err)
    }

    fn element(locator: &Locator, index: usize, depth: u8, p: Probe) -> Element {
        Element {
            locator: locator.clone(),
            index,
            depth,
            text: p.text,
            visible: p.visible,
            width: p.width,
            height: p.height,
            functional_selector: p.functional_selector,
        }
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    async fn locate_all(&self, locator: &Locator) -> Result<Vec<Element>, QuizError> {
        let js = format!("({}).map({})", query_js(locator), DESCRIBE_FN);
        let probes: Vec<Probe> = self.browser.eval(js).await.map_err(driver_err)?;
        Ok(probes
            .into_iter()
            .enumerate()
            .map(|(i, p)| Self::element(locator, i, 0, p))
            .collect())
    }

    async fn current_url(&self) -> Result<String, QuizError> {
        self.browser.url().await.map_err(driver_err)
    }

    async fn page_text(&self) -> Result<String, QuizError> {
        self.browser
            .eval("document.body ? document.body.innerText : ''")
            .await
            .map_err(driver_err)
    }

    async fn click(&self, element: &Element) -> Result<(), QuizError> {
        let js = format!(
            r#"(() => {{
                const el = {};
                if (!el) return null;
                el.scrollIntoView({{ block: 'center' }});
                const r = el.getBoundingClientRect();
                if (r.width === 0 || r.height === 0) return null;
                return {{ x: r.left + r.width / 2, y: r.top + r.height / 2 }};
            }})()"#,
            resolve_js(element)
        );
        let center: Option<Center> = self.browser.eval(js).await.map_err(driver_err)?;
        let center = center.ok_or_else(|| {
            QuizError::Driver(format!("element not interactable: {}", element.locator.as_str()))
        })?;
        self.browser.click(center.x, center.y).await.map_err(driver_err)
    }

    async fn parent(&self, element: &Element) -> Result<Option<Element>, QuizError> {
        let mut up = element.clone();
        up.depth = element.depth.saturating_add(1);
        let js = format!(
            "(() => {{ const el = {}; return el ? ({})(el) : null; }})()",
            resolve_js(&up),
            DESCRIBE_FN
        );
        let probe: Option<Probe> = self.browser.eval(js).await.map_err(driver_err)?;
        Ok(probe.map(|p| Self::element(&up.locator, up.index, up.depth, p)))
    }

    async fn type_text(&self, element: &Element, text: &str) -> Result<(), QuizError> {
        let js = format!(
            "(() => {{ const el = {}; if (!el) return false; el.focus(); if ('value' in el) el.value = ''; return true; }})()",
            resolve_js(element)
        );
        let focused: bool = self.browser.eval(js).await.map_err(driver_err)?;
        if !focused {
            return Err(QuizError::Driver(format!("cannot focus {}", element.locator.as_str())));
        }
        self.browser.type_text(text).await.map_err(driver_err)
    }

    async fn press_enter(&self, element: &Element) -> Result<(), QuizError> {
        let js = format!(
            "(() => {{ const el = {}; if (el) el.focus(); return !!el; }})()",
            resolve_js(element)
        );
        let _: bool = self.browser.eval(js).await.map_err(driver_err)?;
        self.browser.press_enter().await.map_err(driver_err)
    }

    async fn goto(&self, url: &str) -> Result<(), QuizError> {
        self.browser.goto(url).await.map_err(driver_err)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, QuizError> {
        self.browser.screenshot_png().await.map_err(driver_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDriver, FakeElement};

    #[test]
    fn parse_picks_xpath_for_double_slash() {
        assert_eq!(Locator::parse("//h1"), Locator::xpath("//h1"));
        assert_eq!(Locator::parse("h1"), Locator::css("h1"));
        assert_eq!(
            Locator::functional("answer-2").as_str(),
            "[data-functional-selector='answer-2']"
        );
    }

    #[test]
    fn lost_connection_maps_to_disconnected() {
        let e = driver_err(anyhow::anyhow!("send failed because receiver is gone"));
        assert!(e.is_fatal());
        let e = driver_err(anyhow::anyhow!("no node found for given selector"));
        assert_eq!(e, QuizError::Driver("no node found for given selector".into()));
    }

    #[test]
    fn query_js_escapes_selectors() {
        let js = query_js(&Locator::css("[data-functional-selector='answer-0']"));
        assert_eq!(
            js,
            "Array.from(document.querySelectorAll(\"[data-functional-selector='answer-0']\"))"
        );
        assert!(query_js(&Locator::xpath("//h1")).contains("ORDERED_NODE_SNAPSHOT_TYPE"));
    }

    #[tokio::test]
    async fn first_text_stops_at_first_success() {
        let driver = FakeDriver::new("https://kahoot.it/gameblock");
        driver.put("h1", vec![FakeElement::text("   ")]);
        driver.put(".question-title", vec![FakeElement::text("Which planet is red?")]);
        driver.put(".block-title", vec![FakeElement::text("Never reached")]);
        let strategies = chain(&["h1", ".question-title", ".block-title"]);
        let (el, text) = first_text(&driver, &strategies).await.unwrap().unwrap();
        assert_eq!(text, "Which planet is red?");
        assert_eq!(el.locator, Locator::css(".question-title"));
        assert_eq!(
            driver.queried(),
            vec!["h1".to_string(), ".question-title".to_string()]
        );
    }

    #[tokio::test]
    async fn first_text_honours_min_chars_and_visibility() {
        let driver = FakeDriver::new("about:blank");
        driver.put("h1", vec![FakeElement::text("Hi"), FakeElement::text("Hidden title").hidden()]);
        driver.put("h2", vec![FakeElement::text("Visible title")]);
        let strategies = vec![
            LocatorStrategy::new("h1").min_chars(6).visible_only(),
            LocatorStrategy::new("h2").min_chars(6).visible_only(),
        ];
        let (_, text) = first_text(&driver, &strategies).await.unwrap().unwrap();
        assert_eq!(text, "Visible title");
    }

    #[tokio::test]
    async fn driver_errors_count_as_not_found_but_disconnect_escapes() {
        let driver = FakeDriver::new("about:blank");
        driver.fail_on("h1", QuizError::Driver("boom".into()));
        driver.put("h2", vec![FakeElement::text("Fallback")]);
        let found = first_text(&driver, &chain(&["h1", "h2"])).await.unwrap();
        assert_eq!(found.map(|(_, t)| t), Some("Fallback".to_string()));

        driver.fail_on("h2", QuizError::Disconnected("gone".into()));
        let err = first_text(&driver, &chain(&["h1", "h2"])).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
