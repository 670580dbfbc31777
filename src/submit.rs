use tracing::{debug, info, warn};

use crate::driver::{first_visible, Driver, Element, Locator};
use crate::extract::{answer_button_locator, choice_text_locator, multi_select_locators};
use crate::model::{Choice, Question, QuizError, MAX_CHOICES};
use crate::session::Context;

/// Parent hops tried when a choice text is not clickable itself.
const MAX_ANCESTOR_HOPS: usize = 5;

/// Index of the choice whose text is the token. A bare number also matches a
/// choice that contains it as a whitespace-separated word.
pub fn text_match_position(token: &str, choices: &[Choice]) -> Option<usize> {
    let token = token.trim().to_lowercase();
    if token.is_empty() {
        return None;
    }
    if let Some(pos) = choices.iter().position(|c| c.text.trim() == token) {
        return Some(pos);
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        return choices
            .iter()
            .position(|c| c.text.split_whitespace().any(|w| w == token));
    }
    None
}

/// `Ok(false)` when the click failed for any reason short of a lost connection.
async fn try_click(driver: &dyn Driver, element: &Element, strategy: &str) -> Result<bool, QuizError> {
    match driver.click(element).await {
        Ok(()) => {
            info!(strategy, locator = element.locator.as_str(), depth = element.depth, "choice clicked");
            Ok(true)
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            debug!(strategy, error = %e, "click strategy failed");
            Ok(false)
        }
    }
}

async fn try_locator(driver: &dyn Driver, locator: &Locator, strategy: &str) -> Result<bool, QuizError> {
    match driver.locate(locator).await {
        Ok(Some(el)) => try_click(driver, &el, strategy).await,
        Ok(None) => Ok(false),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            debug!(strategy, error = %e, "locate failed");
            Ok(false)
        }
    }
}

async fn click_position(driver: &dyn Driver, question: &Question, pos: usize) -> Result<bool, QuizError> {
    if let Some(el) = question.choices.get(pos).and_then(|c| c.element.as_ref()) {
        if try_click(driver, el, "text match").await? {
            return Ok(true);
        }
    }
    try_locator(driver, &answer_button_locator(pos), "text match").await
}

/// Clicks the choice text for `index`, or the nearest ancestor that accepts the click.
async fn click_text_or_ancestor(driver: &dyn Driver, index: usize) -> Result<bool, QuizError> {
    let mut current = match driver.locate(&choice_text_locator(index)).await {
        Ok(Some(el)) => el,
        Ok(None) => return Ok(false),
        Err(e) if e.is_fatal() => return Err(e),
        Err(_) => return Ok(false),
    };
    if try_click(driver, &current, "choice text").await? {
        return Ok(true);
    }
    for _ in 0..MAX_ANCESTOR_HOPS {
        current = match driver.parent(&current).await {
            Ok(Some(up)) => up,
            Ok(None) => return Ok(false),
            Err(e) if e.is_fatal() => return Err(e),
            Err(_) => return Ok(false),
        };
        if try_click(driver, &current, "choice ancestor").await? {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn click_index(driver: &dyn Driver, question: &Question, index: usize) -> Result<bool, QuizError> {
    if let Some(el) = question.choices.get(index).and_then(|c| c.element.as_ref()) {
        if try_click(driver, el, "captured element").await? {
            return Ok(true);
        }
    }
    if try_locator(driver, &answer_button_locator(index), "indexed button").await? {
        return Ok(true);
    }
    click_text_or_ancestor(driver, index).await
}

/// Runs the cascade for one token.
async fn submit_token(driver: &dyn Driver, question: &Question, token: &str) -> Result<bool, QuizError> {
    if let Some(pos) = text_match_position(token, &question.choices) {
        debug!(token, pos, "token matches choice text");
        if click_position(driver, question, pos).await? {
            return Ok(true);
        }
    }
    match token.trim().parse::<usize>() {
        Ok(index) if index < MAX_CHOICES => click_index(driver, question, index).await,
        _ => Ok(false),
    }
}

/// Clicks the answer for `question`. Returns whether anything was submitted;
/// only a lost connection is an error.
pub async fn submit(ctx: &Context<'_>, question: &Question) -> Result<bool, QuizError> {
    let driver = ctx.driver;
    let mut submitted = false;
    for token in &question.answer {
        if submit_token(driver, question, token).await? {
            submitted = true;
            if !question.multiple_choice {
                break;
            }
        } else {
            warn!(token = %token, "no strategy could click this token");
        }
    }

    if !submitted {
        warn!(error = %QuizError::Submission(question.answer.clone()), "round abandoned");
        return Ok(false);
    }

    if question.multiple_choice {
        match first_visible(driver, &multi_select_locators()).await? {
            Some(button) => {
                try_click(driver, &button, "multi-select submit").await?;
            }
            None => warn!("multi-select submit control not found"),
        }
    }
    Ok(true)
}
