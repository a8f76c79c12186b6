//! Phrase table and phrase selection
//!
//! The table is a line-oriented `category|phrase` file loaded once at
//! startup. Selection matches the latest analysis text against an ordered
//! list of keyword rules; the first rule with phrases wins.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::feedback::LatestFeedback;
use crate::{Error, Result};

/// Phrase table shipped with the binary
pub const BUNDLED_PHRASES: &str = include_str!("../assets/phrases.txt");

/// Category used when analysis text matches no rule
pub const FALLBACK_CATEGORY: &str = "sassy";

/// A keyword rule mapping analysis text to a phrase category
#[derive(Debug, Clone, Copy)]
pub struct CategoryRule {
    /// Category name in the phrase table
    pub category: &'static str,
    /// Lower-case keywords; each must start at a word boundary
    pub keywords: &'static [&'static str],
}

impl CategoryRule {
    /// Whether any keyword occurs in `lowered`
    #[must_use]
    pub fn matches(&self, lowered: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| contains_at_word_start(lowered, keyword))
    }
}

/// Rules in priority order
pub const CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        category: "phone",
        keywords: &[
            "phone",
            "scroll",
            "social media",
            "instagram",
            "tiktok",
            "snapchat",
            "twitter",
            "texting",
        ],
    },
    CategoryRule {
        category: "gaming",
        keywords: &[
            "gaming",
            "game",
            "video game",
            "controller",
            "console",
            "playstation",
            "xbox",
            "nintendo",
        ],
    },
    CategoryRule {
        category: "sleeping",
        keywords: &[
            "sleep",
            "asleep",
            "napping",
            "dozing",
            "in bed",
            "eyes closed",
        ],
    },
    CategoryRule {
        category: "productive",
        keywords: &[
            "productive",
            "typing",
            "working",
            "writing",
            "studying",
            "reading",
            "coding",
            "laptop",
            "homework",
            "cleaning",
            "cooking",
        ],
    },
];

/// `keyword` occurs in `text` not preceded by an alphanumeric character.
///
/// Keeps "unproductive" from matching "productive" while still letting
/// "scrolling" match "scroll".
fn contains_at_word_start(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(i, _)| {
        text[..i]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric())
    })
}

/// Immutable mapping from category to candidate phrases
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhraseTable {
    categories: HashMap<String, Vec<String>>,
}

impl PhraseTable {
    /// Parse the `category|phrase` format.
    ///
    /// Blank lines, `#` comments and lines without a separator or phrase are
    /// skipped. Categories are lower-cased; unknown ones are kept as-is.
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let mut categories: HashMap<String, Vec<String>> = HashMap::new();

        for (number, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((category, phrase)) = line.split_once('|') else {
                tracing::debug!(line = number + 1, "phrase line without separator");
                continue;
            };

            let category = category.trim().to_lowercase();
            let phrase = phrase.trim();
            if category.is_empty() || phrase.is_empty() {
                tracing::debug!(line = number + 1, "phrase line missing category or text");
                continue;
            }

            categories
                .entry(category)
                .or_default()
                .push(phrase.to_string());
        }

        Self { categories }
    }

    /// The table compiled into the binary
    #[must_use]
    pub fn bundled() -> Self {
        Self::parse(BUNDLED_PHRASES)
    }

    /// Load a table from disk
    ///
    /// # Errors
    ///
    /// Returns `Error::Phrases` if the file cannot be read
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Phrases(format!("{}: {e}", path.display())))?;
        let table = Self::parse(&source);
        tracing::info!(
            path = %path.display(),
            categories = table.categories.len(),
            "loaded phrase table"
        );
        Ok(table)
    }

    /// Phrases for a category; empty if the category is unknown
    #[must_use]
    pub fn phrases(&self, category: &str) -> &[String] {
        self.categories.get(category).map_or(&[], Vec::as_slice)
    }

    /// Category names with phrase counts, sorted by name
    #[must_use]
    pub fn categories(&self) -> Vec<(&str, usize)> {
        let mut list: Vec<_> = self
            .categories
            .iter()
            .map(|(name, phrases)| (name.as_str(), phrases.len()))
            .collect();
        list.sort_unstable();
        list
    }

    /// Whether the table holds no phrases at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.values().all(Vec::is_empty)
    }
}

/// Pick an utterance.
///
/// With non-empty analysis text: the first matching rule that has phrases,
/// then the fallback category. Otherwise, or when the table has nothing to
/// offer, the literal feedback text. `None` when all of these are empty.
pub fn select_phrase<R: Rng + ?Sized>(
    table: &PhraseTable,
    analysis: Option<&str>,
    feedback: Option<&str>,
    rng: &mut R,
) -> Option<String> {
    if let Some(analysis) = analysis.map(str::trim).filter(|a| !a.is_empty()) {
        let lowered = analysis.to_lowercase();

        let matched = CATEGORY_RULES
            .iter()
            .filter(|rule| rule.matches(&lowered))
            .find_map(|rule| table.phrases(rule.category).choose(rng).cloned());
        if matched.is_some() {
            return matched;
        }

        if let Some(phrase) = table.phrases(FALLBACK_CATEGORY).choose(rng) {
            return Some(phrase.clone());
        }
    }

    feedback
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(ToString::to_string)
}

/// Chooses phrases from the latest feedback state
#[derive(Debug, Clone)]
pub struct PhraseSelector {
    table: Arc<PhraseTable>,
    latest: LatestFeedback,
}

impl PhraseSelector {
    /// Create a selector over `table` reading `latest`
    #[must_use]
    pub const fn new(table: Arc<PhraseTable>, latest: LatestFeedback) -> Self {
        Self { table, latest }
    }

    /// Phrase for the current feedback, if any
    #[must_use]
    pub fn choose_phrase(&self) -> Option<String> {
        self.choose_with(&mut rand::thread_rng())
    }

    /// Same as [`choose_phrase`](Self::choose_phrase) with a caller-supplied RNG
    pub fn choose_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<String> {
        let current = self.latest.current()?;
        select_phrase(
            &self.table,
            current.source_analysis.as_deref(),
            Some(&current.text),
            rng,
        )
    }

    /// The loaded table
    #[must_use]
    pub fn table(&self) -> &PhraseTable {
        &self.table
    }
}
