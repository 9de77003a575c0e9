use std::collections::HashSet;

use ulid::Ulid;

use crate::error::MigrationError;

const MAX_ATTEMPTS: usize = 10;

/// Short random identifier used for rule UIDs and dedup suffixes.
#[must_use]
pub fn generate_short_uid() -> String {
    Ulid::new().to_string().to_lowercase()
}

/// Prefix of `value` holding at most `max_chars` characters.
pub(crate) fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

pub(crate) fn char_len(value: &str) -> usize {
    value.chars().count()
}

/// Scoped uniqueness tracker for generated identifiers and titles.
///
/// With `case_insensitive`, membership is decided on the lower-cased value.
/// With a non-zero `max_len`, candidates are compared on their first `max_len`
/// characters and [`Deduplicator::deduplicate`] never returns anything longer.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
    case_insensitive: bool,
    max_len: usize,
}

impl Deduplicator {
    #[must_use]
    pub fn new(case_insensitive: bool, max_len: usize) -> Self {
        Self { seen: HashSet::new(), case_insensitive, max_len }
    }

    fn normalize(&self, value: &str) -> String {
        let folded = if self.case_insensitive { value.to_lowercase() } else { value.to_string() };
        if self.max_len > 0 {
            truncate_chars(&folded, self.max_len).to_string()
        } else {
            folded
        }
    }

    #[must_use]
    pub fn contains(&self, candidate: &str) -> bool {
        self.seen.contains(&self.normalize(candidate))
    }

    pub fn add(&mut self, value: &str) {
        let normalized = self.normalize(value);
        self.seen.insert(normalized);
    }

    /// Derive an unseen value from `candidate` by appending `_<short uid>`,
    /// truncating the candidate first when the result would exceed `max_len`.
    /// The returned value is not recorded; call [`Deduplicator::add`].
    ///
    /// # Errors
    /// Returns [`MigrationError::DeduplicationExhausted`] when every generated
    /// suffix collides.
    pub fn deduplicate(&self, candidate: &str) -> Result<String, MigrationError> {
        for _ in 0..MAX_ATTEMPTS {
            let uid = generate_short_uid();
            let mut base = candidate;
            if self.max_len > 0 && char_len(candidate) + 1 + uid.len() > self.max_len {
                base = truncate_chars(candidate, self.max_len.saturating_sub(1 + uid.len()));
            }
            let value = format!("{base}_{uid}");
            if !self.contains(&value) {
                return Ok(value);
            }
        }
        Err(MigrationError::DeduplicationExhausted { candidate: candidate.to_string() })
    }
}
