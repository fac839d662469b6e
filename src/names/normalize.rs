//! Name normalization and closeness scoring for team/league names.
//!
//! Two forms are derived from a raw name:
//! - the **key** (`normalize_key`): case, whitespace and punctuation folded,
//!   used for exact alias lookup.
//! - the **core** (`core_form`): the key with common abbreviations expanded
//!   and club affixes dropped, used for fuzzy comparison.
//!
//! "Man City", "Manchester City FC" and "manchester city" share the core
//! `manchester city`.

use strsim::{jaro_winkler, normalized_levenshtein};

/// Score given when one name is the initialism of the other ("PSG").
const ACRONYM_SCORE: f64 = 0.95;

/// Single-token abbreviations expanded before comparison.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("utd", "united"),
    ("man", "manchester"),
    ("st", "saint"),
    ("intl", "international"),
    ("int", "international"),
    ("ath", "athletic"),
    ("atl", "atletico"),
    ("dep", "deportivo"),
    ("spt", "sporting"),
    ("wolves", "wolverhampton"),
];

/// Tokens that decorate a club name without identifying it.
const AFFIXES: &[&str] = &[
    "fc", "afc", "cf", "sc", "ac", "fk", "sk", "bk", "if", "cd", "sd", "ud", "club", "the",
    "football", "calcio", "de",
];

/// Lowercase, punctuation → space, whitespace collapsed.
/// "Man. City  F.C." → "man city f c"
pub fn normalize_key(raw: &str) -> String {
    raw.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized key with abbreviations expanded and affixes removed.
pub fn core_form(raw: &str) -> String {
    // Dotted initials ("F.C.") split into single letters; glue runs of
    // single-letter tokens back together before looking at affixes.
    let key = normalize_key(raw);
    let mut tokens: Vec<String> = Vec::new();
    let mut run = String::new();
    for tok in key.split(' ').filter(|t| !t.is_empty()) {
        if tok.chars().count() == 1 && tok.chars().all(char::is_alphabetic) {
            run.push_str(tok);
            continue;
        }
        if !run.is_empty() {
            tokens.push(std::mem::take(&mut run));
        }
        tokens.push(tok.to_string());
    }
    if !run.is_empty() {
        tokens.push(run);
    }

    let expanded: Vec<&str> = tokens
        .iter()
        .map(|t| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == t.as_str())
                .map(|(_, full)| *full)
                .unwrap_or(t.as_str())
        })
        .collect();

    let stripped: Vec<&str> = expanded
        .iter()
        .copied()
        .filter(|t| !AFFIXES.contains(t))
        .collect();

    if stripped.is_empty() {
        expanded.join(" ")
    } else {
        stripped.join(" ")
    }
}

fn initials(tokens: &[&str]) -> String {
    tokens.iter().filter_map(|t| t.chars().next()).collect()
}

/// Closeness of two core forms in `[0, 1]`.
///
/// - identical → 1.0
/// - one is the initialism of the other's tokens (≥ 2 tokens) → 0.95
/// - same token count → weakest positional Jaro-Winkler, so "manchester
///   city" vs "manchester united" is judged on "city"/"united"
/// - otherwise → normalized Levenshtein over the whole string
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let ta: Vec<&str> = a.split(' ').filter(|t| !t.is_empty()).collect();
    let tb: Vec<&str> = b.split(' ').filter(|t| !t.is_empty()).collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    if is_acronym_of(&ta, &tb) || is_acronym_of(&tb, &ta) {
        return ACRONYM_SCORE;
    }

    if ta.len() == tb.len() {
        return ta
            .iter()
            .zip(&tb)
            .map(|(x, y)| jaro_winkler(x, y))
            .fold(1.0, f64::min);
    }

    normalized_levenshtein(a, b)
}

fn is_acronym_of(short: &[&str], long: &[&str]) -> bool {
    short.len() == 1 && long.len() >= 2 && short[0].len() == long.len() && short[0] == initials(long)
}

/// Bucketing keys for a core form. Two cores that `similarity` could rate
/// highly share at least one key in the common cases (same leading letters,
/// or acronym ↔ full name).
pub fn blocking_keys(core: &str) -> Vec<String> {
    let tokens: Vec<&str> = core.split(' ').filter(|t| !t.is_empty()).collect();
    let Some(first) = tokens.first() else {
        return Vec::new();
    };

    let prefix: String = first.chars().take(2).collect();
    let mut keys = vec![format!("p:{prefix}")];
    if tokens.len() >= 2 {
        keys.push(format!("i:{}", initials(&tokens)));
    } else if (2..=5).contains(&first.len()) {
        keys.push(format!("i:{first}"));
    }
    keys
}
