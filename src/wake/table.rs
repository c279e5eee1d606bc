//! Wake phrase and termination phrase tables

use crate::config::WakeConfig;

/// Built-in wake phrases with commonly misheard variants
const BUILTIN_WAKE_PHRASES: &[(&str, &[&str])] = &[
    (
        "hey bartender",
        &[
            "hey bar tender",
            "hay bartender",
            "a bartender",
            "hey bartend",
            "hey bartenders",
        ],
    ),
    (
        "hey barkeep",
        &["hey bar keep", "hey barkeeper", "hay barkeep", "hey bar keeper"],
    ),
    ("okay venue", &["ok venue", "o k venue", "okay venu"]),
];

/// Smallest share of a variant (numerator, denominator) a truncated transcript must cover
const TRUNCATION_SHARE: (usize, usize) = (3, 5);

/// Built-in phrases that end a live conversation
const BUILTIN_TERMINATION_PHRASES: &[&str] = &[
    "that's all",
    "that is all",
    "goodbye",
    "good bye",
    "bye for now",
    "thanks that's it",
    "stop listening",
    "we're done",
];

/// Lowercase, strip punctuation, collapse whitespace
#[must_use]
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical wake phrase plus its aliases, all normalized
#[derive(Debug, Clone, PartialEq, Eq)]
struct WakeEntry {
    canonical: String,
    variants: Vec<String>,
}

/// A transcript matched a wake phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeMatch {
    /// Canonical phrase of the matched entry
    pub canonical: String,
    /// Variant (canonical or alias) that matched
    pub variant: String,
}

/// Read-only mapping from canonical wake phrases to accepted variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeWordTable {
    entries: Vec<WakeEntry>,
}

impl WakeWordTable {
    /// Build a table from `(canonical, aliases)` pairs
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<S>)>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .filter_map(|(canonical, aliases)| {
                let canonical = normalize(canonical.as_ref());
                if canonical.is_empty() {
                    return None;
                }
                let mut variants = vec![canonical.clone()];
                for alias in aliases {
                    let alias = normalize(alias.as_ref());
                    if !alias.is_empty() && !variants.contains(&alias) {
                        variants.push(alias);
                    }
                }
                Some(WakeEntry {
                    canonical,
                    variants,
                })
            })
            .collect();

        Self { entries }
    }

    /// The built-in table
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_WAKE_PHRASES
                .iter()
                .map(|(canonical, aliases)| (*canonical, aliases.to_vec())),
        )
    }

    /// Built-in table extended (or replaced) by configured phrases
    #[must_use]
    pub fn from_config(config: &WakeConfig) -> Self {
        let configured = config
            .phrases
            .iter()
            .map(|p| (p.phrase.clone(), p.aliases.clone()));

        if config.replace_defaults {
            return Self::new(configured);
        }

        let builtin = BUILTIN_WAKE_PHRASES.iter().map(|(canonical, aliases)| {
            (
                (*canonical).to_string(),
                aliases.iter().map(|a| (*a).to_string()).collect(),
            )
        });
        Self::new(builtin.chain(configured))
    }

    /// Find the first entry matching `transcript`
    ///
    /// A variant matches when the transcript contains it (wake phrase
    /// merged into a longer utterance) or it contains the transcript
    /// (transcript truncated mid-phrase). A truncated transcript must cover
    /// most of the variant and span as many words as it, up to two, so a
    /// lone "okay" or "hey" does not activate.
    #[must_use]
    pub fn find_match(&self, transcript: &str) -> Option<WakeMatch> {
        let heard = normalize(transcript);
        if heard.is_empty() {
            return None;
        }

        self.entries.iter().find_map(|entry| {
            entry
                .variants
                .iter()
                .find(|v| heard.contains(v.as_str()) || is_truncation_of(&heard, v))
                .map(|variant| WakeMatch {
                    canonical: entry.canonical.clone(),
                    variant: variant.clone(),
                })
        })
    }

    /// Canonical phrases in table order
    pub fn canonical_phrases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.canonical.as_str())
    }

    /// Number of canonical phrases
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table has no phrases
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether `heard` is a cut-short rendering of `variant`
fn is_truncation_of(heard: &str, variant: &str) -> bool {
    let words = |text: &str| text.split(' ').count();
    variant.contains(heard)
        && heard.len() * TRUNCATION_SHARE.1 >= variant.len() * TRUNCATION_SHARE.0
        && words(heard) >= words(variant).min(2)
}

/// Phrases that end the live conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationPhrases {
    phrases: Vec<String>,
}

impl TerminationPhrases {
    /// Build from raw phrases
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for phrase in phrases {
            let p = normalize(phrase.as_ref());
            if !p.is_empty() && !normalized.contains(&p) {
                normalized.push(p);
            }
        }
        Self { phrases: normalized }
    }

    /// Built-in phrases plus configured extras
    #[must_use]
    pub fn from_config(config: &WakeConfig) -> Self {
        Self::new(
            BUILTIN_TERMINATION_PHRASES
                .iter()
                .map(|p| (*p).to_string())
                .chain(config.termination_phrases.iter().cloned()),
        )
    }

    /// Return the phrase contained in a final transcript, if any
    #[must_use]
    pub fn find(&self, transcript: &str) -> Option<&str> {
        let heard = normalize(transcript);
        if heard.is_empty() {
            return None;
        }
        self.phrases
            .iter()
            .find(|p| heard.contains(p.as_str()))
            .map(String::as_str)
    }
}

impl Default for TerminationPhrases {
    fn default() -> Self {
        Self::new(BUILTIN_TERMINATION_PHRASES.iter().copied())
    }
}
