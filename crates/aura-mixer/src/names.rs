//! Display names
//!
//! The mixer owns session display names: incoming names are scrubbed, run
//! through a replaceable censor table, and uniquified with a `_<n>` suffix
//! on collision. The registry is a multiset of base names with a high-water
//! counter and a refcount per entry.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Fallback for names that scrub down to nothing.
pub const ANONYMOUS_NAME: &str = "anonymous";

/// Replaceable censor table.
///
/// Matching is case-insensitive and scans left to right; at each position
/// the first matching entry is replaced with `*` and scanning resumes after
/// the replacement, so matches never overlap. Replace rather than remove,
/// so readers still get a clue about the original.
#[derive(Clone, Debug)]
pub struct Censor {
    entries: Vec<String>,
}

impl Censor {
    pub fn new(entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Censor {
            entries: entries
                .into_iter()
                .map(|e| e.into().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Empty table; nothing is censored.
    pub fn none() -> Self {
        Censor {
            entries: Vec::new(),
        }
    }

    pub fn apply(&self, input: &str) -> String {
        if self.entries.is_empty() {
            return input.to_string();
        }

        // ASCII lowercasing keeps byte offsets aligned with the input, and
        // the table entries are ASCII, so a match can only span ASCII bytes
        let lower = input.to_ascii_lowercase();
        let mut output = String::with_capacity(input.len());
        let mut index = 0;

        'outer: while index < input.len() {
            for entry in &self.entries {
                if lower[index..].starts_with(entry.as_str()) {
                    output.push('*');
                    index += entry.len();
                    continue 'outer;
                }
            }
            // advance one char, copying it through
            let ch = input[index..].chars().next().unwrap();
            output.push(ch);
            index += ch.len_utf8();
        }

        output
    }
}

impl Default for Censor {
    fn default() -> Self {
        // small proof-of-concept list; deployments substitute their own
        Censor::new(["fuck", "shit", "damn", "cock", "cunt"])
    }
}

/// Scrub a raw display name into a base name:
/// trim, censor, drop anything from the first newline on, strip a trailing
/// `_<digits>` suffix, and fall back to `anonymous` if nothing is left.
pub fn scrub_display_name(raw: &str, censor: &Censor) -> String {
    let trimmed = raw.trim();
    let censored = censor.apply(trimmed);

    let mut base: &str = &censored;
    if let Some(newline) = base.find('\n') {
        base = &base[..newline];
    }
    base = base.trim_end();

    // strip one trailing _<digits> suffix
    if let Some(underscore) = base.rfind('_') {
        let suffix = &base[underscore + 1..];
        if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            base = base[..underscore].trim_end();
        }
    }

    if base.is_empty() {
        ANONYMOUS_NAME.to_string()
    } else {
        base.to_string()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct NameEntry {
    high_water: u32,
    ref_count: u32,
}

/// Process-wide display-name multiset.
///
/// Mutated only by the single-threaded identity sweep and the kill
/// handler; the mutex serializes those two.
pub struct DisplayNameRegistry {
    names: Mutex<HashMap<String, NameEntry>>,
}

impl DisplayNameRegistry {
    pub fn new() -> Self {
        DisplayNameRegistry {
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Claim `base`, returning the unique session display name.
    pub fn assign(&self, base: &str) -> String {
        let mut names = self.names.lock();
        let entry = names.entry(base.to_string()).or_default();

        let session = if entry.high_water > 0 {
            format!("{}_{}", base, entry.high_water)
        } else {
            base.to_string()
        };
        entry.high_water += 1;
        entry.ref_count += 1;
        session
    }

    /// Release one reference to `base`; the entry disappears when the last
    /// reference goes.
    pub fn release(&self, base: &str) {
        let mut names = self.names.lock();
        if let Some(entry) = names.get_mut(base) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                names.remove(base);
            }
        }
    }

    pub fn ref_count(&self, base: &str) -> u32 {
        self.names.lock().get(base).map(|e| e.ref_count).unwrap_or(0)
    }

    pub fn high_water(&self, base: &str) -> u32 {
        self.names
            .lock()
            .get(base)
            .map(|e| e.high_water)
            .unwrap_or(0)
    }

    /// Total refcount across all entries; equals the number of named
    /// clients at any quiescent point.
    pub fn total_refs(&self) -> u32 {
        self.names.lock().values().map(|e| e.ref_count).sum()
    }
}

impl Default for DisplayNameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_plain_name_passes_through() {
        let censor = Censor::default();
        assert_eq!(scrub_display_name("  alice  ", &censor), "alice");
    }

    #[test]
    fn test_scrub_profanity_and_trailing_digits() {
        let censor = Censor::default();
        assert_eq!(scrub_display_name("  fucker_42\nspam  ", &censor), "*er");
    }

    #[test]
    fn test_scrub_is_case_insensitive() {
        let censor = Censor::default();
        assert_eq!(scrub_display_name("ShItLord", &censor), "*Lord");
    }

    #[test]
    fn test_scrub_empty_becomes_anonymous() {
        let censor = Censor::default();
        assert_eq!(scrub_display_name("   ", &censor), ANONYMOUS_NAME);
        assert_eq!(scrub_display_name("_99", &censor), ANONYMOUS_NAME);
    }

    #[test]
    fn test_scrub_keeps_interior_underscores() {
        let censor = Censor::default();
        assert_eq!(scrub_display_name("mr_roboto", &censor), "mr_roboto");
        assert_eq!(scrub_display_name("mr_roboto_7", &censor), "mr_roboto");
    }

    #[test]
    fn test_replaceable_table() {
        let censor = Censor::new(["spam"]);
        assert_eq!(scrub_display_name("spammer", &censor), "*mer");
        assert_eq!(scrub_display_name("fucker", &censor), "fucker");
    }

    #[test]
    fn test_assign_first_claim_is_unsuffixed() {
        let names = DisplayNameRegistry::new();
        assert_eq!(names.assign("alice"), "alice");
        assert_eq!(names.ref_count("alice"), 1);
        assert_eq!(names.high_water("alice"), 1);
    }

    #[test]
    fn test_assign_collision_suffixes_with_high_water() {
        let names = DisplayNameRegistry::new();
        assert_eq!(names.assign("alice"), "alice");
        assert_eq!(names.assign("alice"), "alice_1");
        assert_eq!(names.assign("alice"), "alice_2");
        assert_eq!(names.ref_count("alice"), 3);
    }

    #[test]
    fn test_release_drops_entry_at_zero() {
        let names = DisplayNameRegistry::new();
        names.assign("bob");
        names.assign("bob");
        names.release("bob");
        assert_eq!(names.ref_count("bob"), 1);
        names.release("bob");
        assert_eq!(names.ref_count("bob"), 0);
        // a fresh claim starts over without a suffix
        assert_eq!(names.assign("bob"), "bob");
    }

    #[test]
    fn test_release_unknown_name_is_harmless() {
        let names = DisplayNameRegistry::new();
        names.release("ghost");
        assert_eq!(names.total_refs(), 0);
    }

    #[test]
    fn test_high_water_does_not_reset_while_referenced() {
        let names = DisplayNameRegistry::new();
        names.assign("carol");
        names.assign("carol");
        names.release("carol");
        // one reference remains, so the counter keeps climbing
        assert_eq!(names.assign("carol"), "carol_2");
    }
}
