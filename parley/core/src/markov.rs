//! Markov Language Model
//!
//! An order-N word-level Markov chain trained on everything people say
//! through the service, used by the bot to improvise replies.
//!
//! # Structure
//!
//! ```text
//!   Prefix (N words)            successors (duplicates kept)
//!   ["",    ""     ]  ──────►  ["the", "hello", "the"]
//!   ["",    "the"  ]  ──────►  ["quick", "quick"]
//!   ["the", "quick"]  ──────►  ["brown", "red"]
//! ```
//!
//! Every stream starts from the all-empty prefix so the chain also learns how
//! messages begin. Duplicated successors make frequent continuations more
//! likely; selection itself is uniform over the recorded list.
//!
//! # Sharing
//!
//! [`LanguageModel`] is a cheap-clone handle over a single
//! `parking_lot::Mutex`. Ingestion from any number of concurrent sessions and
//! generation for any number of bots are serialized by that lock. The lock is
//! only taken for in-memory table updates and is never held across an await.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::tee::TextSink;

/// Longest trailing word held back waiting for the rest of a UTF-8 character
pub const MAX_WORD_BYTES: usize = 1024;

/// How generation picks its first prefix
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    /// Continue from the prefix that most recently gained a successor
    #[default]
    MostRecent,
    /// Uniformly random among all distinct prefixes seen
    Random,
}

impl FromStr for StartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "most_recent" | "recent" => Ok(Self::MostRecent),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown start policy: {other}")),
        }
    }
}

/// N consecutive words used as a lookup key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Prefix(Vec<String>);

impl Prefix {
    /// The start-of-stream prefix: N empty words
    #[must_use]
    pub fn start(order: usize) -> Self {
        Self(vec![String::new(); order])
    }

    /// Build a prefix from explicit words
    #[must_use]
    pub fn from_words(words: &[&str]) -> Self {
        Self(words.iter().map(|w| (*w).to_owned()).collect())
    }

    /// Drop the oldest word and append `word`
    pub fn shift(&mut self, word: &str) {
        if self.0.is_empty() {
            return;
        }
        self.0.remove(0);
        self.0.push(word.to_owned());
    }

    /// Words of this prefix, oldest first
    #[must_use]
    pub fn words(&self) -> &[String] {
        &self.0
    }
}

struct Entry {
    prefix: Prefix,
    successors: Vec<String>,
}

/// Prefix table of an order-N Markov chain
///
/// Plain data; see [`LanguageModel`] for the shared, synchronized handle.
pub struct MarkovChain {
    order: usize,
    /// Distinct prefixes in first-seen order
    entries: Vec<Entry>,
    index: HashMap<Prefix, usize>,
    /// Entry that most recently gained a successor
    last: Option<usize>,
    transitions: usize,
}

impl MarkovChain {
    /// Create an empty chain with N-word prefixes
    #[must_use]
    pub fn new(order: usize) -> Self {
        Self {
            order,
            entries: Vec::new(),
            index: HashMap::new(),
            last: None,
            transitions: 0,
        }
    }

    /// Prefix length N
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Record `word` as a successor of `prefix`
    pub fn record(&mut self, prefix: &Prefix, word: &str) {
        let idx = match self.index.get(prefix) {
            Some(&idx) => idx,
            None => {
                let idx = self.entries.len();
                self.entries.push(Entry {
                    prefix: prefix.clone(),
                    successors: Vec::new(),
                });
                self.index.insert(prefix.clone(), idx);
                idx
            }
        };
        self.entries[idx].successors.push(word.to_owned());
        self.last = Some(idx);
        self.transitions += 1;
    }

    /// Record a run of words, sliding `prefix` forward past each one
    pub fn ingest_words<'a, I>(&mut self, prefix: &mut Prefix, words: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for word in words {
            self.record(prefix, word);
            prefix.shift(word);
        }
    }

    /// Pick a successor of `prefix` uniformly among the recorded ones
    pub fn sample_successor<R: Rng + ?Sized>(&self, prefix: &Prefix, rng: &mut R) -> Option<&str> {
        let idx = *self.index.get(prefix)?;
        self.entries[idx]
            .successors
            .choose(rng)
            .map(String::as_str)
    }

    /// Generate at most `max_words` words
    ///
    /// Returns an empty string when the chain has no data.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        max_words: usize,
        policy: StartPolicy,
        rng: &mut R,
    ) -> String {
        if max_words == 0 || self.entries.is_empty() {
            return String::new();
        }

        let start = match (policy, self.last) {
            (StartPolicy::MostRecent, Some(idx)) => idx,
            _ => rng.gen_range(0..self.entries.len()),
        };
        let mut prefix = self.entries[start].prefix.clone();

        let mut words: Vec<&str> = Vec::with_capacity(max_words);
        while words.len() < max_words {
            let Some(next) = self.sample_successor(&prefix, rng) else {
                break;
            };
            words.push(next);
            prefix.shift(next);
        }
        words.join(" ")
    }

    /// Table size counters
    #[must_use]
    pub fn stats(&self) -> ModelStats {
        ModelStats {
            prefixes: self.entries.len(),
            transitions: self.transitions,
        }
    }
}

/// Size of the prefix table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelStats {
    /// Distinct prefixes seen
    pub prefixes: usize,
    /// Total recorded (prefix, successor) observations
    pub transitions: usize,
}

struct ModelState {
    chain: MarkovChain,
    rng: StdRng,
    policy: StartPolicy,
}

/// Process-wide shared language model
///
/// Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct LanguageModel {
    inner: Arc<Mutex<ModelState>>,
}

impl LanguageModel {
    /// Create an empty model seeded from OS entropy
    #[must_use]
    pub fn new(config: &ModelConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create an empty model with a fixed random seed
    #[must_use]
    pub fn with_seed(config: &ModelConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ModelConfig, rng: StdRng) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ModelState {
                chain: MarkovChain::new(config.order),
                rng,
                policy: config.start_policy,
            })),
        }
    }

    /// Prefix length N
    #[must_use]
    pub fn order(&self) -> usize {
        self.inner.lock().chain.order()
    }

    /// Learn a complete piece of text as its own stream
    pub fn ingest(&self, text: &str) {
        let mut ingestor = self.ingestor();
        ingestor.feed(text.as_bytes());
        ingestor.finish();
    }

    /// Start a new ingestion stream with its own rolling prefix
    #[must_use]
    pub fn ingestor(&self) -> Ingestor {
        Ingestor {
            prefix: Prefix::start(self.order()),
            model: self.clone(),
            partial: Vec::new(),
        }
    }

    /// Generate at most `max_words` space-separated words
    ///
    /// An empty model yields an empty string.
    #[must_use]
    pub fn generate(&self, max_words: usize) -> String {
        let mut state = self.inner.lock();
        let ModelState { chain, rng, policy } = &mut *state;
        chain.generate(max_words, *policy, rng)
    }

    /// Pick one successor of `prefix`, if any were recorded
    #[must_use]
    pub fn sample_successor(&self, prefix: &[&str]) -> Option<String> {
        let prefix = Prefix::from_words(prefix);
        let mut state = self.inner.lock();
        let ModelState { chain, rng, .. } = &mut *state;
        chain.sample_successor(&prefix, rng).map(str::to_owned)
    }

    /// Table size counters
    #[must_use]
    pub fn stats(&self) -> ModelStats {
        self.inner.lock().chain.stats()
    }

    fn learn(&self, prefix: &mut Prefix, words: &[String]) {
        if words.is_empty() {
            return;
        }
        let mut state = self.inner.lock();
        state
            .chain
            .ingest_words(prefix, words.iter().map(String::as_str));
    }
}

/// Per-stream ingestion state
///
/// Keeps the rolling prefix across chunks so that a conversation split over
/// many reads links up. Every chunk is learned as soon as it arrives; only a
/// word cut inside a multi-byte UTF-8 character is held back until the next
/// chunk (or [`TextSink::finish`]) completes it.
pub struct Ingestor {
    model: LanguageModel,
    prefix: Prefix,
    partial: Vec<u8>,
}

impl Ingestor {
    /// Feed raw bytes from the stream
    pub fn feed(&mut self, bytes: &[u8]) {
        let mut data = std::mem::take(&mut self.partial);
        data.extend_from_slice(bytes);

        if let Some(cut) = incomplete_word_start(&data) {
            if data.len() - cut <= MAX_WORD_BYTES {
                self.partial = data.split_off(cut);
            }
        }
        self.learn_bytes(&data);
    }

    /// Flush the held-back word; the stream has ended
    pub fn finish(&mut self) {
        let rest = std::mem::take(&mut self.partial);
        self.learn_bytes(&rest);
    }

    fn learn_bytes(&mut self, bytes: &[u8]) {
        let words: Vec<String> = bytes
            .split(u8::is_ascii_whitespace)
            .filter(|token| !token.is_empty())
            .map(|token| String::from_utf8_lossy(token).into_owned())
            .collect();
        self.model.learn(&mut self.prefix, &words);
    }
}

/// Start of the trailing word when `data` ends inside a UTF-8 sequence
fn incomplete_word_start(data: &[u8]) -> Option<usize> {
    match std::str::from_utf8(data) {
        Err(e) if e.error_len().is_none() => {
            let word_start = data[..e.valid_up_to()]
                .iter()
                .rposition(u8::is_ascii_whitespace)
                .map_or(0, |pos| pos + 1);
            Some(word_start)
        }
        _ => None,
    }
}

impl TextSink for Ingestor {
    fn observe(&mut self, bytes: &[u8]) {
        self.feed(bytes);
    }

    fn finish(&mut self) {
        Ingestor::finish(self);
    }
}
