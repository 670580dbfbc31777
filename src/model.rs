use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;

use crate::driver::Element;

/// Upper bound on the number of answer choices a question can carry.
pub const MAX_CHOICES: usize = 4;

// ========================= Errors =========================

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq)]
pub enum QuizError {
    #[error("driver error: {0}")]
    Driver(String),
    #[error("browser connection lost: {0}")]
    Disconnected(String),
    #[error("reasoner error: {0}")]
    Reasoner(String),
    #[error("no locator yielded question text")]
    Extraction,
    #[error("unrecognized category label: {0:?}")]
    ClassificationAmbiguous(String),
    #[error("no decoder matched the encoded payload")]
    Decode,
    #[error("answer did not match the expected schema: {0}")]
    AnswerParse(String),
    #[error("evaluation error: {0}")]
    Evaluation(String),
    #[error("no click strategy succeeded for {0:?}")]
    Submission(Vec<String>),
    #[error("config error: {0}")]
    Config(String),
}

impl QuizError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, QuizError::Disconnected(_))
    }
}

/// Keeps a fatal error, converts anything else into `fallback` after logging it.
pub(crate) fn tolerate<T>(res: Result<T, QuizError>, fallback: T, what: &str) -> Result<T, QuizError> {
    match res {
        Ok(v) => Ok(v),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::debug!(error = %e, "{} failed", what);
            Ok(fallback)
        }
    }
}

// ========================= Categories =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    PromptInjection,
    Coding,
    Math,
    RecentEvents,
    Image,
    InternalDoc,
    Logic,
    Encoded,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::PromptInjection,
        Category::Coding,
        Category::Math,
        Category::RecentEvents,
        Category::Image,
        Category::InternalDoc,
        Category::Logic,
        Category::Encoded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::PromptInjection => "prompt_injection",
            Category::Coding => "coding",
            Category::Math => "math",
            Category::RecentEvents => "recent_events",
            Category::Image => "image",
            Category::InternalDoc => "internal_doc",
            Category::Logic => "logic",
            Category::Encoded => "encoded",
        }
    }

    /// Parses a label as returned by the model. Surrounding quotes, backticks
    /// and trailing punctuation are ignored; anything else must match exactly.
    pub fn from_label(label: &str) -> Option<Category> {
        let cleaned = label
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.')
            .trim()
            .to_lowercase();
        Category::ALL.into_iter().find(|c| c.as_str() == cleaned)
    }

    pub fn title(&self) -> String {
        self.as_str()
            .split('_')
            .map(|w| {
                let mut cs = w.chars();
                match cs.next() {
                    Some(f) => f.to_uppercase().collect::<String>() + cs.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    Base64,
    Url,
    Html,
    Hex,
    Rot13,
}

impl EncodingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingKind::Base64 => "base64",
            EncodingKind::Url => "url",
            EncodingKind::Html => "html",
            EncodingKind::Hex => "hex",
            EncodingKind::Rot13 => "rot13",
        }
    }
}

impl fmt::Display for EncodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ========================= Questions =========================

/// One answer choice as seen on screen, paired with the element that located it.
#[derive(Clone, Debug, PartialEq)]
pub struct Choice {
    pub text: String,
    pub element: Option<Element>,
}

impl Choice {
    pub fn new(text: impl Into<String>, element: Option<Element>) -> Self {
        Self { text: text.into().trim().to_lowercase(), element }
    }

    pub fn placeholder(index: usize) -> Self {
        Self { text: format!("[unknown option {}]", index + 1), element: None }
    }
}

#[derive(Clone, Debug)]
pub struct Question {
    /// Canonical lowercase question text.
    pub text: String,
    /// Text exactly as read from the page; encoded payloads are case sensitive.
    pub raw_text: String,
    pub decoded_text: Option<String>,
    pub encoding: Option<EncodingKind>,
    pub choices: Vec<Choice>,
    pub category: Category,
    pub multiple_choice: bool,
    pub image: Option<Vec<u8>>,
    /// Code or document fetched from a link in the question.
    pub attachment: Option<String>,
    pub answer: Vec<String>,
}

impl Question {
    pub fn new(raw_text: impl Into<String>, mut choices: Vec<Choice>) -> Self {
        let raw_text = raw_text.into().trim().to_string();
        choices.truncate(MAX_CHOICES);
        Self {
            text: raw_text.to_lowercase(),
            raw_text,
            decoded_text: None,
            encoding: None,
            choices,
            category: Category::Logic,
            multiple_choice: false,
            image: None,
            attachment: None,
            answer: Vec::new(),
        }
    }

    /// Provisional question built from a get-ready title, with placeholder choices.
    pub fn provisional(title: &str) -> Self {
        let choices = (0..MAX_CHOICES).map(Choice::placeholder).collect();
        let mut q = Self::new(title, choices);
        q.multiple_choice = false;
        q
    }

    /// Text the model should reason about: the decoded payload when there is one.
    pub fn working_text(&self) -> &str {
        self.decoded_text.as_deref().unwrap_or(&self.text)
    }

    pub fn has_choices(&self) -> bool {
        !self.choices.is_empty()
    }

    /// Records the decoded payload. Only the first successful decode is kept.
    pub fn set_decoded(&mut self, decoded: String, kind: EncodingKind) {
        if self.decoded_text.is_none() {
            self.decoded_text = Some(decoded.to_lowercase());
            self.encoding = Some(kind);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub tokens: Vec<String>,
    pub steps: Vec<String>,
}

impl AnswerResult {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens, steps: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// ========================= Session State =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Lobby,
    GetReady,
    ActiveQuestion,
    ResultInterstitial,
    Finished,
    Unknown,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Lobby => "lobby",
            SessionPhase::GetReady => "get_ready",
            SessionPhase::ActiveQuestion => "active_question",
            SessionPhase::ResultInterstitial => "result",
            SessionPhase::Finished => "finished",
            SessionPhase::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct SpeculativeAnswer {
    pub title: String,
    pub category: Category,
    /// Payload decoded while classifying the title, if it was encoded.
    pub decoded: Option<(String, EncodingKind)>,
    pub answer: AnswerResult,
    pub created_at: Instant,
}

impl SpeculativeAnswer {
    /// Whether the speculative title still describes `question`. The get-ready
    /// title and the question title are the same string on screen, but either
    /// side may be truncated or carry extra decoration.
    pub fn matches(&self, question: &Question) -> bool {
        let title = self.title.trim().to_lowercase();
        let text = question.text.trim();
        !title.is_empty() && (text.contains(&title) || title.contains(text))
    }
}

#[derive(Clone, Debug)]
pub struct RoundRecord {
    pub question: Question,
    pub submitted: bool,
}

#[derive(Clone, Debug)]
pub struct GameSession {
    pub id: String,
    pub pin: String,
    pub player: String,
    history: Vec<RoundRecord>,
}

impl GameSession {
    pub fn new(id: impl Into<String>, pin: impl Into<String>, player: impl Into<String>) -> Self {
        Self { id: id.into(), pin: pin.into(), player: player.into(), history: Vec::new() }
    }

    pub fn record(&mut self, question: Question, submitted: bool) {
        self.history.push(RoundRecord { question, submitted });
    }

    pub fn question(&self, index: usize) -> Option<&Question> {
        self.history.get(index).map(|r| &r.question)
    }

    pub fn rounds(&self) -> &[RoundRecord] {
        &self.history
    }

    pub fn total_questions(&self) -> usize {
        self.history.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "Game PIN: {} | Player: {} | Total Questions: {}",
            self.pin,
            self.player,
            self.history.len()
        )
    }

    pub fn report_lines(&self) -> Vec<String> {
        self.history
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let preview: String = r.question.text.chars().take(50).collect();
                format!(
                    "Q{} [{}] {}... -> {:?}{}",
                    i + 1,
                    r.question.category,
                    preview,
                    r.question.answer,
                    if r.submitted { "" } else { " (not submitted)" }
                )
            })
            .collect()
    }
}
