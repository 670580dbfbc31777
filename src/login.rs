use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::driver::{first_visible, Driver, Element, Locator};
use crate::model::{tolerate, QuizError};
use crate::session::SessionConfig;

const PIN_INPUTS: &[&str] = &[
    "input[data-functional-selector='game-id-input']",
    "input[placeholder*='PIN']",
    "input[placeholder*='Game PIN']",
    "#game-input",
    "input[type='text']",
];

const PIN_BUTTONS: &[&str] = &[
    "button[data-functional-selector='join-game-pin']",
    "button[type='submit']",
    "//button[contains(text(), 'Enter')]",
    "//button[contains(@class, 'enter')]",
    "//button[contains(@class, 'submit')]",
];

const NICKNAME_INPUTS: &[&str] = &[
    "input[data-functional-selector='nickname-input']",
    "input[placeholder*='nickname']",
    "input[placeholder*='Nickname']",
    "#nickname",
    "input[type='text']",
];

const NICKNAME_BUTTONS: &[&str] = &[
    "button[data-functional-selector='join-game-nickname']",
    "//button[contains(text(), 'OK')]",
    "//button[contains(text(), 'Go')]",
    "//button[contains(text(), 'Join')]",
    "//button[contains(@class, 'ok')]",
    "//button[contains(@class, 'join')]",
    "button[type='submit']",
];

/// URL fragments that show the join went through.
const JOINED_URL: &[&str] = &["getready", "game", "question", "lobby", "gameblock"];

fn locators(raws: &[&str]) -> Vec<Locator> {
    raws.iter().map(|r| Locator::parse(r)).collect()
}

/// Types `value` into the first input found and confirms it with a button,
/// or with Enter when no button takes the click.
async fn fill_and_confirm(
    driver: &dyn Driver,
    inputs: &[&str],
    buttons: &[&str],
    value: &str,
    field: &str,
) -> Result<Element, QuizError> {
    let input = first_visible(driver, &locators(inputs))
        .await?
        .ok_or_else(|| QuizError::Driver(format!("{} input not found", field)))?;
    driver.type_text(&input, value).await?;

    let clicked = match first_visible(driver, &locators(buttons)).await? {
        Some(button) => tolerate(driver.click(&button).await.map(|_| true), false, "confirm click")?,
        None => false,
    };
    if !clicked {
        info!(field, "no confirm button, pressing enter");
        driver.press_enter(&input).await?;
    }
    Ok(input)
}

/// Polls the URL until it shows a joined game or `timeout` runs out.
async fn wait_for_join(driver: &dyn Driver, timeout: Duration, poll: Duration) -> Result<bool, QuizError> {
    let deadline = Instant::now() + timeout;
    loop {
        let url = tolerate(driver.current_url().await, String::new(), "url")?;
        if JOINED_URL.iter().any(|k| url.contains(k)) {
            info!(url = %url, "joined game");
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(poll).await;
    }
}

async fn attempt(driver: &dyn Driver, cfg: &SessionConfig) -> Result<(), QuizError> {
    driver.goto(&cfg.join_url).await?;
    sleep(cfg.settle_delay).await;
    fill_and_confirm(driver, PIN_INPUTS, PIN_BUTTONS, &cfg.pin, "pin").await?;
    sleep(cfg.settle_delay).await;
    fill_and_confirm(driver, NICKNAME_INPUTS, NICKNAME_BUTTONS, &cfg.nickname, "nickname").await?;
    if !wait_for_join(driver, cfg.login_timeout, cfg.result_poll_interval).await? {
        warn!(
            timeout_s = cfg.login_timeout.as_secs(),
            "game did not confirm the join in time, continuing anyway"
        );
    }
    Ok(())
}

/// Joins the game with the configured PIN and nickname, retrying the whole
/// flow on failure.
pub async fn login(driver: &dyn Driver, cfg: &SessionConfig) -> Result<(), QuizError> {
    let attempts = cfg.login_attempts.max(1);
    let mut last = QuizError::Driver("login never attempted".into());
    for n in 1..=attempts {
        match attempt(driver, cfg).await {
            Ok(()) => {
                info!(attempt = n, nickname = %cfg.nickname, "login complete");
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(attempt = n, error = %e, "login attempt failed");
                last = e;
                if n < attempts {
                    sleep(cfg.login_retry_pause).await;
                }
            }
        }
    }
    Err(last)
}
