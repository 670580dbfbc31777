use anyhow::Result;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    /// Attach to an already running browser instead of launching one.
    pub ws_url: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: std::env::var("HEADLESS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            user_agent: None,
            ws_url: std::env::var("CHROME_WS_URL").ok().filter(|s| !s.trim().is_empty()),
        }
    }
}

pub struct Browser {
    page: Page,
    browser: OxideBrowser,
}

impl Browser {
    pub async fn start(cfg: BrowserConfig) -> Result<Self> {
        match cfg.ws_url.clone() {
            Some(ws) => Self::connect(&ws).await,
            None => Self::launch(cfg).await,
        }
    }

    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique profile per run, otherwise a quick restart trips the profile lock.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("quiz-hands-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-dev-shm-usage");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let this = Self { page, browser };
        // A zero-sized viewport breaks screenshots and bounding boxes.
        let _ = this.set_viewport().await;
        Ok(this)
    }

    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });
        // Let the target list settle before asking for pages.
        sleep(Duration::from_millis(300)).await;
        let page = match browser.pages().await?.into_iter().next() {
            Some(p) => p,
            None => browser.new_page("about:blank").await?,
        };
        debug!(ws_url, "attached to running browser");
        Ok(Self { page, browser })
    }

    async fn set_viewport(&self) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(1280)
            .height(800)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    /// Evaluates a JS expression and deserializes its value.
    pub async fn eval<T: DeserializeOwned>(&self, js: impl Into<String>) -> Result<T> {
        let result = self.page.evaluate(js.into()).await?;
        Ok(result.into_value()?)
    }

    pub async fn click(&self, x: f64, y: f64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1);
        let pressed = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        let released = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.move_mouse(Point { x, y }).await?.execute(pressed).await?;
        self.page.execute(released).await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        Ok(())
    }

    pub async fn press_enter(&self) -> Result<()> {
        for (kind, down) in [
            (DispatchKeyEventType::KeyDown, true),
            (DispatchKeyEventType::KeyUp, false),
        ] {
            let mut cmd = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key("Enter")
                .code("Enter")
                .windows_virtual_key_code(13);
            if down {
                cmd = cmd.text("\r");
            }
            let cmd = cmd.build().map_err(|e| anyhow::anyhow!(e))?;
            self.page.execute(cmd).await?;
        }
        Ok(())
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(true).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = format!("{}", e);
                if msg.contains("0 width") || msg.contains("0 height") {
                    let _ = self.set_viewport().await;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow::anyhow!(e))
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.browser.close().await?;
        Ok(())
    }
}
