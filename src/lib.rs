pub mod answer;
pub mod arith;
pub mod browser;
pub mod classify;
pub mod driver;
pub mod encoding;
pub mod extract;
pub mod login;
pub mod model;
pub mod phase;
pub mod reasoning;
pub mod session;
pub mod snippet;
pub mod submit;

#[cfg(test)]
pub(crate) mod testing;

pub use browser::{Browser, BrowserConfig};
pub use driver::{ChromiumDriver, Driver, Element, Locator};
pub use model::{Category, GameSession, Question, QuizError, SessionPhase};
pub use reasoning::{Reasoner, ReasonerConfig, ResponsesReasoner};
pub use session::{Context, Session, SessionConfig};
pub use snippet::SnippetFetcher;
