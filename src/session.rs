use nanoid::nanoid;
use std::env;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::answer::answer;
use crate::classify::classify;
use crate::driver::Driver;
use crate::extract::{extract_question, extract_title};
use crate::login::login;
use crate::model::{Category, GameSession, Question, QuizError, SessionPhase, SpeculativeAnswer};
use crate::phase::{answer_buttons_visible, classify_phase};
use crate::reasoning::Reasoner;
use crate::snippet::SnippetFetcher;
use crate::submit::submit;

// ========================= Config =========================

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub join_url: String,
    pub pin: String,
    pub nickname: String,
    pub poll_interval: Duration,
    pub result_poll_interval: Duration,
    pub lobby_backoff: Duration,
    /// Soft bound on waiting for the next question; expiry is only logged.
    pub question_timeout: Duration,
    pub login_timeout: Duration,
    pub login_attempts: usize,
    pub login_retry_pause: Duration,
    /// Pause after navigation and form steps while the page renders.
    pub settle_delay: Duration,
    pub post_submit_pause: Duration,
    pub speculation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_url: env::var("QUIZ_JOIN_URL").unwrap_or_else(|_| "https://kahoot.it/".into()),
            pin: env::var("QUIZ_PIN").unwrap_or_default(),
            nickname: env::var("QUIZ_NICKNAME").unwrap_or_else(|_| "AI_Player".into()),
            poll_interval: Duration::from_secs(1),
            result_poll_interval: Duration::from_secs(2),
            lobby_backoff: Duration::from_secs(3),
            question_timeout: Duration::from_secs(120),
            login_timeout: Duration::from_secs(30),
            login_attempts: 3,
            login_retry_pause: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
            post_submit_pause: Duration::from_secs(2),
            speculation: true,
        }
    }
}

impl SessionConfig {
    #[cfg(test)]
    pub(crate) fn fast(pin: &str, nickname: &str) -> Self {
        let ms = Duration::from_millis(1);
        Self {
            join_url: "https://kahoot.it/".into(),
            pin: pin.into(),
            nickname: nickname.into(),
            poll_interval: ms,
            result_poll_interval: ms,
            lobby_backoff: ms,
            question_timeout: Duration::from_millis(50),
            login_timeout: Duration::from_millis(5),
            login_attempts: 3,
            login_retry_pause: ms,
            settle_delay: Duration::ZERO,
            post_submit_pause: ms,
            speculation: true,
        }
    }
}

// ========================= Context =========================

/// Handles every component works through. Owned by the caller for the whole
/// session.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub driver: &'a dyn Driver,
    pub reasoner: &'a dyn Reasoner,
    pub snippets: Option<&'a SnippetFetcher>,
}

impl<'a> Context<'a> {
    pub fn new(driver: &'a dyn Driver, reasoner: &'a dyn Reasoner) -> Self {
        Self { driver, reasoner, snippets: None }
    }

    pub fn with_snippets(mut self, fetcher: &'a SnippetFetcher) -> Self {
        self.snippets = Some(fetcher);
        self
    }
}

// ========================= Loop =========================

pub struct Session<'a> {
    ctx: Context<'a>,
    cfg: SessionConfig,
    game: GameSession,
    speculative: Option<SpeculativeAnswer>,
    /// Set once the visible question has been handled; cleared when the phase moves on.
    answered: bool,
}

impl<'a> Session<'a> {
    pub fn new(ctx: Context<'a>, cfg: SessionConfig) -> Self {
        let game = GameSession::new(nanoid!(), cfg.pin.clone(), cfg.nickname.clone());
        Self { ctx, cfg, game, speculative: None, answered: false }
    }

    pub fn game(&self) -> &GameSession {
        &self.game
    }

    pub async fn join(&self) -> Result<(), QuizError> {
        login(self.ctx.driver, &self.cfg).await
    }

    /// Polls until the game reports finished. Returns early only when the
    /// browser connection is lost.
    pub async fn run(&mut self) -> Result<(), QuizError> {
        info!(session = %self.game.id, pin = %self.game.pin, player = %self.game.player, "session started");
        match self.poll_loop().await {
            Ok(()) => {
                info!(session = %self.game.id, rounds = self.game.total_questions(), "game finished");
                Ok(())
            }
            Err(e) => {
                error!(session = %self.game.id, error = %e, "session aborted");
                Err(e)
            }
        }
    }

    async fn poll_loop(&mut self) -> Result<(), QuizError> {
        let mut last = SessionPhase::Unknown;
        let mut waiting_since = Instant::now();
        loop {
            let phase = classify_phase(self.ctx.driver).await?;
            if phase != last {
                info!(%phase, from = %last, "phase changed");
            }
            if phase != SessionPhase::ActiveQuestion {
                self.answered = false;
            }

            let pause = match phase {
                SessionPhase::Finished => return Ok(()),
                SessionPhase::ActiveQuestion if !self.answered => {
                    waiting_since = Instant::now();
                    if self.play_round().await? {
                        self.answered = true;
                        self.cfg.post_submit_pause
                    } else {
                        self.cfg.poll_interval
                    }
                }
                SessionPhase::ActiveQuestion => {
                    waiting_since = Instant::now();
                    self.cfg.poll_interval
                }
                SessionPhase::GetReady => {
                    if self.cfg.speculation {
                        self.speculate().await?;
                    }
                    self.cfg.poll_interval
                }
                SessionPhase::ResultInterstitial => self.cfg.result_poll_interval,
                SessionPhase::Lobby => self.cfg.lobby_backoff,
                SessionPhase::Unknown => self.cfg.poll_interval,
            };

            if waiting_since.elapsed() > self.cfg.question_timeout {
                warn!(
                    waited_s = waiting_since.elapsed().as_secs(),
                    %phase,
                    "no question appeared in time, still waiting"
                );
                waiting_since = Instant::now();
            }
            last = phase;
            sleep(pause).await;
        }
    }

    /// Pre-computes an answer from the get-ready title while no choices are shown.
    async fn speculate(&mut self) -> Result<(), QuizError> {
        let ctx = self.ctx;
        if self.speculative.is_some() || answer_buttons_visible(ctx.driver).await? {
            return Ok(());
        }
        let Some(title) = extract_title(ctx.driver).await? else {
            return Ok(());
        };
        let mut provisional = Question::provisional(&title);
        let category = classify(&ctx, &mut provisional).await?;
        let result = answer(&ctx, &provisional).await?;
        info!(title = %title, %category, tokens = ?result.tokens, "speculative answer cached");
        let decoded = provisional.decoded_text.clone().zip(provisional.encoding);
        self.speculative = Some(SpeculativeAnswer {
            title,
            category,
            decoded,
            answer: result,
            created_at: Instant::now(),
        });
        Ok(())
    }

    /// Handles the visible question. `Ok(false)` means nothing could be read
    /// and the next poll should try again.
    async fn play_round(&mut self) -> Result<bool, QuizError> {
        let ctx = self.ctx;
        let round = self.game.total_questions() + 1;
        let cached = self.speculative.take();

        let mut question = match extract_question(&ctx).await {
            Ok(q) => q,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(round, error = %e, "question skipped, retrying on next poll");
                self.speculative = cached;
                return Ok(false);
            }
        };

        let reusable = match cached {
            Some(_) if question.image.is_some() => {
                info!(round, "speculative answer discarded, question shows an image");
                None
            }
            Some(spec) if spec.matches(&question) => Some(spec),
            Some(spec) => {
                info!(round, title = %spec.title, "speculative answer discarded, title changed");
                None
            }
            None => None,
        };

        let mut tokens = None;
        match reusable {
            Some(spec) => {
                info!(
                    round,
                    age_ms = spec.created_at.elapsed().as_millis() as u64,
                    "reusing speculative answer"
                );
                question.category = spec.category;
                if let Some((decoded, kind)) = spec.decoded {
                    question.set_decoded(decoded, kind);
                }
                tokens = Some(spec.answer.tokens);
            }
            None => {
                classify(&ctx, &mut question).await?;
            }
        }

        if question.category == Category::Coding {
            if let Some(fetcher) = ctx.snippets {
                fetcher.enrich(&mut question).await;
                // the cached answer never saw the linked code
                if question.attachment.is_some() {
                    tokens = None;
                }
            }
        }
        question.answer = match tokens {
            Some(t) => t,
            None => answer(&ctx, &question).await?.tokens,
        };

        let submitted = submit(&ctx, &question).await?;
        info!(round, category = %question.category, answer = ?question.answer, submitted, "round complete");
        self.game.record(question, submitted);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Locator;
    use crate::testing::{FakeDriver, FakeElement, FakeReasoner, Screen};

    fn functional(name: &str) -> String {
        Locator::functional(name).as_str().to_string()
    }

    fn question_screen(title: &str, choices: &[&str]) -> Screen {
        let mut s = Screen::new("https://kahoot.it/gameblock")
            .with(&functional("block-title"), vec![FakeElement::text(title)]);
        for (i, c) in choices.iter().enumerate() {
            s = s
                .with(&functional(&format!("question-choice-text-{i}")), vec![FakeElement::text(c)])
                .with(&functional(&format!("answer-{i}")), vec![FakeElement::button(&format!("answer-{i}"))]);
        }
        s
    }

    fn get_ready(title: &str) -> Screen {
        Screen::new("https://kahoot.it/getready")
            .text("Get ready!")
            .with("h1", vec![FakeElement::text(title)])
    }

    fn result_screen() -> Screen {
        Screen::new("https://kahoot.it/answer/result").reads(1)
    }

    fn finished() -> Screen {
        Screen::new("https://kahoot.it/ranking")
    }

    fn by_topic() -> FakeReasoner {
        FakeReasoner::new(|req| {
            if req.schema.is_none() {
                return Ok("logic".into());
            }
            let tok = if req.prompt.contains("ocean") { "pacific" } else { "paris" };
            Ok(format!(r#"{{"correct_options": ["{tok}"], "steps": []}}"#))
        })
    }

    #[tokio::test]
    async fn plays_a_round_from_speculation() {
        let driver = FakeDriver::scripted(vec![
            Screen::new("https://kahoot.it/lobby").text("You're in!").reads(1),
            get_ready("Capital of France?").reads(2),
            question_screen("What is the Capital of France?", &["Rome", "Paris", "Lima", "Oslo"]).until_click("*"),
            result_screen(),
            finished(),
        ]);
        let reasoner = by_topic();
        let ctx = Context::new(&driver, &reasoner);
        let mut session = Session::new(ctx, SessionConfig::fast("123", "Bot"));
        session.run().await.unwrap();

        // one classification and one answer, both during get-ready
        assert_eq!(reasoner.count(), 2);
        let game = session.game();
        assert_eq!(game.total_questions(), 1);
        let round = &game.rounds()[0];
        assert!(round.submitted);
        assert_eq!(round.question.answer, vec!["paris".to_string()]);
        assert_eq!(driver.clicked_selectors(), vec![functional("answer-1")]);
    }

    #[tokio::test]
    async fn speculation_is_single_use() {
        let driver = FakeDriver::scripted(vec![
            get_ready("Capital of France?").reads(1),
            question_screen("What is the capital of France?", &["Paris", "Rome"]).until_click("*"),
            result_screen(),
            question_screen("Largest ocean?", &["Atlantic", "Pacific"]).until_click("*"),
            result_screen(),
            finished(),
        ]);
        let reasoner = by_topic();
        let ctx = Context::new(&driver, &reasoner);
        let mut session = Session::new(ctx, SessionConfig::fast("123", "Bot"));
        session.run().await.unwrap();

        let game = session.game();
        assert_eq!(game.total_questions(), 2);
        assert_eq!(game.question(1).unwrap().answer, vec!["pacific".to_string()]);
        // speculation (2) + a fresh classify/answer for round two (2)
        assert_eq!(reasoner.count(), 4);
        assert!(reasoner.calls()[2].schema.is_none());
    }

    #[tokio::test]
    async fn mismatched_title_discards_speculation() {
        let driver = FakeDriver::scripted(vec![
            get_ready("Capital of Peru?").reads(1),
            question_screen("Largest ocean?", &["Atlantic", "Pacific"]).until_click("*"),
            finished(),
        ]);
        let reasoner = by_topic();
        let ctx = Context::new(&driver, &reasoner);
        let mut session = Session::new(ctx, SessionConfig::fast("123", "Bot"));
        session.run().await.unwrap();

        assert_eq!(reasoner.count(), 4);
        assert_eq!(session.game().question(0).unwrap().answer, vec!["pacific".to_string()]);
        assert_eq!(driver.clicked_selectors(), vec![functional("answer-1")]);
    }

    #[tokio::test]
    async fn image_on_the_question_overrides_speculation() {
        let driver = FakeDriver::scripted(vec![
            get_ready("What animal is this?").reads(1),
            question_screen("What animal is this?", &["Cat", "Dog"])
                .with("img", vec![FakeElement::image(400.0, 300.0)])
                .until_click("*"),
            finished(),
        ]);
        let reasoner = FakeReasoner::scripted("logic", r#"{"correct_options": ["dog"], "steps": []}"#);
        let ctx = Context::new(&driver, &reasoner);
        let mut session = Session::new(ctx, SessionConfig::fast("123", "Bot"));
        session.run().await.unwrap();

        let round = &session.game().rounds()[0];
        assert_eq!(round.question.category, Category::Image);
        // speculation (2) + one vision answer; the image decides the category alone
        assert_eq!(reasoner.count(), 3);
        assert!(reasoner.calls()[2].image.is_some());
        assert_eq!(driver.clicked_selectors(), vec![functional("answer-1")]);
    }

    #[tokio::test]
    async fn reused_speculation_keeps_the_decoded_payload() {
        let driver = FakeDriver::scripted(vec![
            get_ready("decode: uryyb jbeyq").reads(1),
            question_screen("decode: uryyb jbeyq", &["hello world", "goodbye"]).until_click("*"),
            finished(),
        ]);
        let reasoner =
            FakeReasoner::scripted("encoded", r#"{"correct_options": ["hello world"], "steps": []}"#);
        let ctx = Context::new(&driver, &reasoner);
        let mut session = Session::new(ctx, SessionConfig::fast("123", "Bot"));
        session.run().await.unwrap();

        assert_eq!(reasoner.count(), 2);
        let q = session.game().question(0).unwrap();
        assert_eq!(q.category, Category::Encoded);
        assert_eq!(q.decoded_text.as_deref(), Some("hello world"));
        assert_eq!(q.encoding, Some(crate::model::EncodingKind::Rot13));
        assert_eq!(driver.clicked_selectors(), vec![functional("answer-0")]);
    }

    #[tokio::test]
    async fn answers_each_question_once() {
        let driver = FakeDriver::scripted(vec![
            question_screen("Largest ocean?", &["Atlantic", "Pacific"]).reads(4),
            finished(),
        ]);
        let reasoner = by_topic();
        let ctx = Context::new(&driver, &reasoner);
        let mut session = Session::new(ctx, SessionConfig::fast("123", "Bot"));
        session.run().await.unwrap();

        assert_eq!(session.game().total_questions(), 1);
        assert_eq!(driver.clicks().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_question_is_retried_not_recorded() {
        let driver = FakeDriver::scripted(vec![
            Screen::new("https://kahoot.it/gameblock")
                .with(&functional("answer-0"), vec![FakeElement::button("answer-0")])
                .reads(3),
            finished(),
        ]);
        let reasoner = by_topic();
        let ctx = Context::new(&driver, &reasoner);
        let mut session = Session::new(ctx, SessionConfig::fast("123", "Bot"));
        session.run().await.unwrap();

        assert_eq!(session.game().total_questions(), 0);
        assert_eq!(reasoner.count(), 0);
    }

    #[tokio::test]
    async fn lost_connection_ends_the_session() {
        let driver = FakeDriver::new("https://kahoot.it/lobby");
        driver.fail_on("url", QuizError::Disconnected("websocket closed".into()));
        let reasoner = by_topic();
        let ctx = Context::new(&driver, &reasoner);
        let mut session = Session::new(ctx, SessionConfig::fast("123", "Bot"));
        assert!(session.run().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn speculation_can_be_disabled() {
        let driver = FakeDriver::scripted(vec![get_ready("Capital of France?").reads(2), finished()]);
        let reasoner = by_topic();
        let ctx = Context::new(&driver, &reasoner);
        let mut cfg = SessionConfig::fast("123", "Bot");
        cfg.speculation = false;
        let mut session = Session::new(ctx, cfg);
        session.run().await.unwrap();
        assert_eq!(reasoner.count(), 0);
    }
}
