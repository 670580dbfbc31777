use tracing::debug;

use crate::driver::{first_visible, Driver, Locator};
use crate::extract::answer_button_locator;
use crate::model::{tolerate, QuizError, SessionPhase, MAX_CHOICES};

const FINISHED_URL: &[&str] = &["/ranking", "podium"];
const RESULT_URL: &[&str] = &["answer/result", "/result"];
const GET_READY_TEXT: &[&str] = &[
    "get ready",
    "question countdown",
    "countdown",
    "loading question",
    "ready",
    "up next",
];
const LOBBY_TEXT: &[&str] = &[
    "you're in",
    "see your nickname",
    "waiting for",
    "get ready",
    "starting soon",
    "lobby",
];
const LOBBY_URL: &[&str] = &["lobby", "getready", "waiting"];

fn answer_locators() -> Vec<Locator> {
    let mut locators: Vec<Locator> = (0..MAX_CHOICES).map(answer_button_locator).collect();
    locators.extend(
        [
            "button[data-functional-selector^='answer-']",
            "button[class*='answer']",
            ".answer-button",
        ]
        .iter()
        .map(|s| Locator::css(*s)),
    );
    locators
}

pub async fn answer_buttons_visible(driver: &dyn Driver) -> Result<bool, QuizError> {
    Ok(first_visible(driver, &answer_locators()).await?.is_some())
}

fn any_in(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Derives the phase from what is on screen right now. First match wins:
/// finished, result, active question, get ready, lobby. Driver failures
/// read as `Unknown`; only a lost connection is returned as an error.
pub async fn classify_phase(driver: &dyn Driver) -> Result<SessionPhase, QuizError> {
    let url = tolerate(driver.current_url().await, String::new(), "url")?.to_lowercase();
    if any_in(&url, FINISHED_URL) {
        return Ok(SessionPhase::Finished);
    }
    if any_in(&url, RESULT_URL) {
        return Ok(SessionPhase::ResultInterstitial);
    }
    if answer_buttons_visible(driver).await? {
        return Ok(SessionPhase::ActiveQuestion);
    }
    let text = tolerate(driver.page_text().await, String::new(), "page text")?.to_lowercase();
    let phase = if any_in(&text, GET_READY_TEXT) {
        SessionPhase::GetReady
    } else if any_in(&text, LOBBY_TEXT) || any_in(&url, LOBBY_URL) {
        SessionPhase::Lobby
    } else {
        SessionPhase::Unknown
    };
    debug!(%phase, url = %url, "phase observed");
    Ok(phase)
}
