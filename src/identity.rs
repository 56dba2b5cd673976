//! Peer identifier derivation.
//!
//! Identifiers are derived once at startup from the device name and stay
//! fixed for the process lifetime. Derivation is deterministic: the same
//! raw name yields the same identifier across restarts. Two devices whose
//! names sanitize to the same string therefore collide; callers that care
//! can opt into a random suffix via
//! [`EngineConfig::disambiguate_identity`](crate::config::EngineConfig).

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::EngineConfig;
use crate::peer::PeerId;

/// Maximum identifier length, imposed by the transport identifier limits.
pub const MAX_IDENTITY_LEN: usize = 10;

/// Separator substituted for whitespace runs in raw names.
pub const SEPARATOR: char = '_';

const SUFFIX_LEN: usize = 3;

/// Derives a peer identifier from a raw device name.
///
/// Folds Latin-1 diacritics to their ASCII base letter, collapses
/// whitespace runs into a single `_`, drops every other non-alphanumeric
/// character and truncates to [`MAX_IDENTITY_LEN`]. Never fails: an input
/// that sanitizes to nothing gets a generated placeholder name instead.
pub fn derive_identity(raw: &str) -> PeerId {
    let sanitized = sanitize(raw);
    if sanitized.is_empty() {
        let placeholder = names::Generator::default()
            .next()
            .unwrap_or_else(|| "peer".to_string());
        // Generated names look like "rusty-nail"; they go through the same
        // sanitizer so the output obeys the identifier rules.
        let fallback = sanitize(&placeholder.replace('-', " "));
        tracing::debug!(raw, %fallback, "raw name sanitized to nothing, using placeholder");
        return PeerId::from_sanitized(fallback);
    }
    PeerId::from_sanitized(sanitized)
}

/// Derives this process's identity from the configuration: the configured
/// display name if set, otherwise the OS hostname.
pub fn local_identity(config: &EngineConfig) -> PeerId {
    let raw = match &config.display_name {
        Some(name) => name.clone(),
        None => hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    let id = derive_identity(&raw);
    if config.disambiguate_identity {
        disambiguate(id)
    } else {
        id
    }
}

/// Appends a short random suffix, truncating the base first so the result
/// still fits [`MAX_IDENTITY_LEN`]. Trades restart determinism for
/// collision resistance.
fn disambiguate(id: PeerId) -> PeerId {
    let mut base = id.as_str().to_string();
    base.truncate(MAX_IDENTITY_LEN - SUFFIX_LEN);
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect();
    base.push_str(&suffix);
    PeerId::from_sanitized(base)
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(MAX_IDENTITY_LEN);
    let mut pending_separator = false;
    for c in raw.chars().map(fold_diacritic) {
        if c.is_whitespace() {
            pending_separator = !out.is_empty();
        } else if c.is_ascii_alphanumeric() {
            if pending_separator {
                out.push(SEPARATOR);
                pending_separator = false;
            }
            out.push(c);
        }
        // Every other character is dropped.
        if out.len() >= MAX_IDENTITY_LEN {
            break;
        }
    }
    out.truncate(MAX_IDENTITY_LEN);
    while out.ends_with(SEPARATOR) {
        out.pop();
    }
    out
}

/// Maps Latin-1 accented letters onto their ASCII base. Anything outside
/// that range passes through and gets filtered by the alphanumeric check.
fn fold_diacritic(c: char) -> char {
    match c {
        'À'..='Å' => 'A',
        'à'..='å' => 'a',
        'Ç' => 'C',
        'ç' => 'c',
        'È'..='Ë' => 'E',
        'è'..='ë' => 'e',
        'Ì'..='Ï' => 'I',
        'ì'..='ï' => 'i',
        'Ñ' => 'N',
        'ñ' => 'n',
        'Ò'..='Ö' | 'Ø' => 'O',
        'ò'..='ö' | 'ø' => 'o',
        'Ù'..='Ü' => 'U',
        'ù'..='ü' => 'u',
        'Ý' => 'Y',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid(id: &PeerId) {
        assert!(!id.as_str().is_empty());
        assert!(id.as_str().len() <= MAX_IDENTITY_LEN);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == SEPARATOR));
    }

    #[test]
    fn sanitizes_punctuation_and_whitespace() {
        let id = derive_identity("My Phone!");
        assert_eq!(id.as_str(), "My_Phone");
        assert_valid(&id);
    }

    #[test]
    fn folds_diacritics() {
        let id = derive_identity("Café Über");
        assert_eq!(id.as_str(), "Cafe_Uber");
        assert_valid(&id);
    }

    #[test]
    fn truncates_long_names() {
        let id = derive_identity("ExtremelyLongDeviceName");
        assert_eq!(id.as_str(), "ExtremelyL");
        assert_valid(&id);
    }

    #[test]
    fn collapses_whitespace_runs() {
        let id = derive_identity("  a   b  ");
        assert_eq!(id.as_str(), "a_b");
    }

    #[test]
    fn no_trailing_separator_after_truncation() {
        // Ten chars land exactly on the separator position.
        let id = derive_identity("NineChars belongs");
        assert_valid(&id);
        assert!(!id.as_str().ends_with(SEPARATOR));
    }

    #[test]
    fn empty_input_gets_placeholder() {
        let id = derive_identity("");
        assert_valid(&id);
        let symbols = derive_identity("!!! ???");
        assert_valid(&symbols);
    }

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(derive_identity("My Phone!"), derive_identity("My Phone!"));
    }

    #[test]
    fn disambiguation_keeps_length_bound() {
        let id = disambiguate(derive_identity("ExtremelyLongDeviceName"));
        assert_valid(&id);
        assert_eq!(id.as_str().len(), MAX_IDENTITY_LEN);
    }
}
