use anyhow::{Context as _, Result};
use quiz_hands::{
    BrowserConfig, ChromiumDriver, Context, ReasonerConfig, ResponsesReasoner, Session, SessionConfig,
    SnippetFetcher,
};
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn prompt_pin() -> Result<String> {
    print!("Enter game PIN: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cfg = SessionConfig::default();
    if cfg.pin.trim().is_empty() {
        cfg.pin = prompt_pin()?;
    }
    anyhow::ensure!(!cfg.pin.is_empty(), "a game PIN is required (QUIZ_PIN or stdin)");

    let reasoner = ResponsesReasoner::new(ReasonerConfig::default())?;
    let snippets = SnippetFetcher::new(Duration::from_secs(10))?;
    let mut driver = ChromiumDriver::start(BrowserConfig::default())
        .await
        .context("starting browser")?;

    let outcome = {
        let ctx = Context::new(&driver, &reasoner).with_snippets(&snippets);
        let mut session = Session::new(ctx, cfg);
        let played = match session.join().await {
            Ok(()) => session.run().await,
            Err(e) => Err(e),
        };
        let game = session.game();
        info!("{}", game.summary());
        for line in game.report_lines() {
            info!("{}", line);
        }
        played
    };

    if let Err(e) = driver.shutdown().await {
        error!(error = %e, "browser shutdown failed");
    }
    outcome?;
    Ok(())
}
