//! Quiz Royale Server
//!
//! Binary entry point: logging, configuration, corpus loading and the
//! WebSocket accept loop.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quiz_royale::{QuestionCorpus, QuizServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();

    info!("Quiz Royale Server v{}", VERSION);
    info!(capacity = config.default_capacity, "default session capacity");

    let corpus = QuestionCorpus::load(&config.corpus_path).with_context(|| {
        format!("loading question corpus from {}", config.corpus_path.display())
    })?;
    info!(
        questions = corpus.questions.len(),
        answers = corpus.answers.len(),
        "question corpus loaded"
    );

    let server = QuizServer::new(config, Arc::new(corpus));

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            server.shutdown();
        }
    }

    Ok(())
}
