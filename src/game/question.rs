//! Question Corpus
//!
//! Supplies one question plus a decoy-heavy set of answer choices per round.
//! The corpus is a JSON document of the shape
//! `{"questions": [{"question", "real_answer"}], "answers": [..]}`; bulk
//! acquisition and curation of that document happens outside this crate.

use std::path::Path;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

/// Answer choices drawn per question unless the pool is smaller.
pub const DEFAULT_ANSWER_COUNT: usize = 3;

/// One corpus question. The genuine answer is kept for tooling; drawing
/// intentionally samples from the shared decoy pool instead.
#[derive(Debug, Clone, Deserialize)]
pub struct CorpusEntry {
    /// Question text.
    pub question: String,
    /// The genuine answer string.
    pub real_answer: String,
}

/// The loaded question corpus.
#[derive(Debug, Clone, Deserialize)]
pub struct QuestionCorpus {
    /// All playable questions.
    pub questions: Vec<CorpusEntry>,
    /// Shared pool of answer strings used as choices.
    pub answers: Vec<String>,
}

/// A question drawn for one round.
#[derive(Debug, Clone)]
pub struct DrawnQuestion {
    /// Question text.
    pub text: String,
    /// Answer choices; their order fixes the answer indices for the round.
    pub answers: Vec<String>,
}

/// Corpus loading errors.
#[derive(Debug, Error)]
pub enum CorpusError {
    /// Could not read the corpus file.
    #[error("failed to read corpus file: {0}")]
    Io(#[from] std::io::Error),

    /// Corpus file is not valid JSON of the expected shape.
    #[error("failed to parse corpus: {0}")]
    Parse(#[from] serde_json::Error),

    /// Corpus carries no questions.
    #[error("corpus contains no questions")]
    NoQuestions,

    /// Corpus carries no answer strings.
    #[error("corpus contains no answer choices")]
    NoAnswers,
}

impl QuestionCorpus {
    /// Load and validate a corpus from a JSON file.
    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate a corpus from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, CorpusError> {
        let corpus: QuestionCorpus = serde_json::from_str(content)?;
        corpus.validate()
    }

    /// Build a corpus from already-loaded parts.
    pub fn from_parts(questions: Vec<CorpusEntry>, answers: Vec<String>) -> Result<Self, CorpusError> {
        QuestionCorpus { questions, answers }.validate()
    }

    fn validate(self) -> Result<Self, CorpusError> {
        if self.questions.is_empty() {
            return Err(CorpusError::NoQuestions);
        }
        if self.answers.is_empty() {
            return Err(CorpusError::NoAnswers);
        }
        Ok(self)
    }

    /// Draw a random question with the default number of answer choices.
    pub fn draw(&self) -> DrawnQuestion {
        self.draw_with(DEFAULT_ANSWER_COUNT)
    }

    /// Draw a random question with up to `count` distinct answer choices,
    /// capped by the size of the answer pool.
    pub fn draw_with(&self, count: usize) -> DrawnQuestion {
        let mut rng = rand::thread_rng();

        // Both collections are non-empty by construction.
        let entry = &self.questions[rng.gen_range(0..self.questions.len())];

        let mut answers: Vec<String> = Vec::new();
        while answers.len() < count && answers.len() < self.answers.len() {
            let candidate = &self.answers[rng.gen_range(0..self.answers.len())];
            if !answers.iter().any(|a| a == candidate) {
                answers.push(candidate.clone());
            }
        }

        DrawnQuestion {
            text: entry.question.clone(),
            answers,
        }
    }
}
