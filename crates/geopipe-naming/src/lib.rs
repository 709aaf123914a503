//! Deterministic, collision-free naming for staged files and identifiers.
//!
//! Two sanitization modes share the same core fold-and-collapse pipeline:
//! [`sanitize_file`] produces a file-safe slug; [`sanitize_identifier`]
//! additionally restricts the alphabet to `[A-Za-z0-9_]` and guarantees the
//! result never starts with a digit, for use as a database-style identifier.
//! Both are idempotent and bounded to 64 codepoints.

use std::collections::HashSet;

const MAX_LEN: usize = 64;

/// Fold the Swedish Latin extensions to their ASCII equivalents.
fn fold_swedish(c: char) -> char {
    match c {
        'å' | 'ä' => 'a',
        'ö' => 'o',
        'Å' | 'Ä' => 'A',
        'Ö' => 'O',
        other => other,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// File-mode sanitization: fold Swedish characters, lowercase, collapse
/// runs of non-word characters to a single `_`, trim, truncate to 64
/// codepoints. Returns `unnamed` if the result would be empty.
pub fn sanitize_file(input: &str) -> String {
    let folded: String = input.chars().map(fold_swedish).collect();
    let lowered = folded.to_lowercase();

    let mut collapsed = String::with_capacity(lowered.len());
    let mut last_was_sep = false;
    for c in lowered.chars() {
        if is_word_char(c) {
            collapsed.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            collapsed.push('_');
            last_was_sep = true;
        }
    }

    let trimmed = collapsed.trim_matches('_');
    let truncated: String = trimmed.chars().take(MAX_LEN).collect();
    let truncated = truncated.trim_end_matches('_');

    if truncated.is_empty() {
        "unnamed".to_string()
    } else {
        truncated.to_string()
    }
}

/// Identifier-mode sanitization: as [`sanitize_file`], then restrict to
/// `[A-Za-z0-9_]`, collapse repeated underscores, and prefix `_` if the
/// first character would otherwise be a digit.
pub fn sanitize_identifier(input: &str) -> String {
    let base = sanitize_file(input);

    let mut collapsed = String::with_capacity(base.len());
    let mut last_was_sep = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            collapsed.push(c);
            last_was_sep = c == '_';
        } else if !last_was_sep {
            collapsed.push('_');
            last_was_sep = true;
        }
    }

    let needs_prefix = collapsed
        .chars()
        .next()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);

    let budget = if needs_prefix { MAX_LEN - 1 } else { MAX_LEN };
    let truncated: String = collapsed.chars().take(budget).collect();

    let result = if needs_prefix {
        format!("_{truncated}")
    } else {
        truncated
    };

    if result.is_empty() || result == "_" {
        "unnamed".to_string()
    } else {
        result
    }
}

/// Resolve a naming collision against a set of already-used identifiers.
///
/// Returns `candidate` unchanged if it is not already in `used`, otherwise
/// the smallest `candidate_N` (`N` starting at 1) not already in `used`.
/// The numeric suffix is appended after truncating the base so the 64
/// codepoint bound is never exceeded.
pub fn resolve_collision(candidate: &str, used: &HashSet<String>) -> String {
    if !used.contains(candidate) {
        return candidate.to_string();
    }

    let mut n: u32 = 1;
    loop {
        let suffix = format!("_{n}");
        let budget = MAX_LEN.saturating_sub(suffix.len());
        let base: String = candidate.chars().take(budget).collect();
        let attempt = format!("{base}{suffix}");
        if !used.contains(&attempt) {
            return attempt;
        }
        n += 1;
    }
}

/// Build a canonical staged name: `sanitize_identifier(authority_logicalName)`
/// resolved against `used`.
pub fn canonical_name(authority: &str, logical_name: &str, used: &HashSet<String>) -> String {
    let candidate = sanitize_identifier(&format!("{authority}_{logical_name}"));
    resolve_collision(&candidate, used)
}
