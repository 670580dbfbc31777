use tracing::{debug, info, warn};

use crate::driver::{chain, first_text, first_visible, Driver, Locator, LocatorStrategy};
use crate::model::{tolerate, Choice, Question, QuizError, MAX_CHOICES};
use crate::session::Context;

/// Images at least this wide and tall mark an image question.
pub const IMAGE_MIN_PX: f64 = 100.0;

const QUESTION_CSS: &[&str] = &[
    "[data-functional-selector='block-title']",
    "[data-functional-selector='question-title']",
    "h1",
    ".question-title",
    ".block-title",
    "[class*='question']",
    "[class*='title']",
];

const QUESTION_XPATH: &[&str] = &[
    "//h1",
    "//div[contains(@class, 'question')]//span",
    "//div[contains(@class, 'title')]",
    "//*[contains(text(), '?')]",
];

const GENERIC_CHOICES: &[&str] = &[
    "button[data-functional-selector^='answer-']",
    "button[class*='answer']",
    ".answer-button",
    ".choice-container",
    "[class*='choice']",
    "button[aria-label*='Answer']",
    "//button[contains(@class, 'answer')]",
    "//div[contains(@class, 'choice')]",
];

const TITLE_CHAIN: &[&str] = &[
    "h1",
    "h2",
    ".title",
    "[class*='title']",
    "[class*='question']",
    "[data-functional-selector*='title']",
];

const DUMP_SELECTORS: &[&str] = &[
    "h1",
    "h2",
    "button",
    "[data-functional-selector]",
    "[class*='question']",
    "[class*='answer']",
    "img",
];

/// Question text strategies: purpose-built CSS first, then XPath requiring
/// more than five characters.
pub fn question_strategies() -> Vec<LocatorStrategy> {
    let mut strategies = chain(QUESTION_CSS);
    strategies.extend(QUESTION_XPATH.iter().map(|x| LocatorStrategy::new(x).min_chars(6)));
    strategies
}

pub fn choice_text_locator(index: usize) -> Locator {
    Locator::functional(&format!("question-choice-text-{}", index))
}

pub fn answer_button_locator(index: usize) -> Locator {
    Locator::functional(&format!("answer-{}", index))
}

pub fn multi_select_locators() -> Vec<Locator> {
    vec![
        Locator::functional("multi-select-submit-button"),
        Locator::css("button[data-functional-selector*='submit']"),
    ]
}

/// Indexed choice texts, each paired with its answer button when present.
/// Stops at the first missing or blank text so positions stay aligned with
/// the `answer-{i}` buttons.
async fn primary_choices(driver: &dyn Driver) -> Result<Vec<Choice>, QuizError> {
    let mut choices = Vec::new();
    for i in 0..MAX_CHOICES {
        let found = tolerate(driver.locate(&choice_text_locator(i)).await, None, "choice text")?;
        let Some(text_el) = found.filter(|el| !el.text.trim().is_empty()) else {
            break;
        };
        let button = tolerate(driver.locate(&answer_button_locator(i)).await, None, "answer button")?;
        let text = text_el.text.trim().to_string();
        choices.push(Choice::new(text, Some(button.unwrap_or(text_el))));
    }
    Ok(choices)
}

/// Broader patterns; the first that matches anything wins.
async fn generic_choices(driver: &dyn Driver) -> Result<Vec<Choice>, QuizError> {
    for raw in GENERIC_CHOICES {
        let locator = Locator::parse(raw);
        let found = tolerate(driver.locate_all(&locator).await, Vec::new(), "choice chain")?;
        if found.is_empty() {
            continue;
        }
        debug!(locator = raw, count = found.len(), "generic choices located");
        return Ok(found
            .into_iter()
            .take(MAX_CHOICES)
            .enumerate()
            .map(|(i, el)| {
                let text = if el.text.trim().is_empty() {
                    format!("option {}", i + 1)
                } else {
                    el.text.clone()
                };
                Choice::new(text, Some(el))
            })
            .collect());
    }
    Ok(Vec::new())
}

pub async fn extract_choices(driver: &dyn Driver) -> Result<Vec<Choice>, QuizError> {
    let primary = primary_choices(driver).await?;
    if !primary.is_empty() {
        return Ok(primary);
    }
    generic_choices(driver).await
}

pub async fn has_large_image(driver: &dyn Driver) -> Result<bool, QuizError> {
    let imgs = tolerate(driver.locate_all(&Locator::css("img")).await, Vec::new(), "image probe")?;
    Ok(imgs.iter().any(|img| img.larger_than(IMAGE_MIN_PX)))
}

pub async fn multi_select_visible(driver: &dyn Driver) -> Result<bool, QuizError> {
    Ok(first_visible(driver, &multi_select_locators()).await?.is_some())
}

/// Reads the active question: text, up to four choices, the multi-select
/// flag and, when a large image is on screen, a full-page screenshot.
pub async fn extract_question(ctx: &Context<'_>) -> Result<Question, QuizError> {
    let driver = ctx.driver;
    let Some((_, text)) = first_text(driver, &question_strategies()).await? else {
        dump_page_state(driver).await?;
        return Err(QuizError::Extraction);
    };

    let choices = extract_choices(driver).await?;
    let mut question = Question::new(text, choices);
    question.multiple_choice = multi_select_visible(driver).await?;

    if has_large_image(driver).await? {
        match driver.screenshot().await {
            Ok(png) => question.image = Some(png),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "screenshot failed, continuing without image"),
        }
    }

    info!(
        text = %question.text.chars().take(50).collect::<String>(),
        choices = question.choices.len(),
        multiple = question.multiple_choice,
        image = question.image.is_some(),
        "question extracted"
    );
    Ok(question)
}

/// Title shown before the choices appear, if one longer than five characters is visible.
pub async fn extract_title(driver: &dyn Driver) -> Result<Option<String>, QuizError> {
    let strategies: Vec<LocatorStrategy> = TITLE_CHAIN
        .iter()
        .map(|raw| LocatorStrategy::new(raw).min_chars(6).visible_only())
        .collect();
    Ok(first_text(driver, &strategies).await?.map(|(_, text)| text))
}

/// Logs what common selectors see, to diagnose extraction misses.
pub async fn dump_page_state(driver: &dyn Driver) -> Result<(), QuizError> {
    let url = tolerate(driver.current_url().await, String::new(), "url")?;
    debug!(url = %url, "page state");
    for raw in DUMP_SELECTORS {
        let found = tolerate(driver.locate_all(&Locator::parse(raw)).await, Vec::new(), "dump")?;
        let first: String = found
            .iter()
            .find(|e| !e.text.trim().is_empty())
            .map(|e| e.text.trim().chars().take(60).collect())
            .unwrap_or_default();
        debug!(selector = raw, count = found.len(), first = %first, "page state");
    }
    Ok(())
}
