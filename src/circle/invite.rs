//! Invite codes and invite links.
//!
//! A circle's invite code is its storage key: 6 characters drawn from a
//! 32-symbol alphabet without the easily confused `0`, `O`, `1` and `I`.
//! Codes are not checked for uniqueness before use; with 32^6 (about 1.07e9)
//! possible codes a collision is unlikely but possible, and creation
//! overwrites whatever circle record sits at that key.

use rand::Rng;

use crate::validation;

/// Symbols used in invite codes.
pub const INVITE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of an invite code.
pub const INVITE_CODE_LENGTH: usize = validation::INVITE_CODE_LENGTH;

/// Path of the join page, relative to the app origin.
pub const JOIN_PATH: &str = "/join";

/// Source of new invite codes.
pub trait CodeGenerator: Send + Sync {
    /// Produces a new code.
    fn generate(&self) -> String;
}

/// Generates codes from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> String {
        generate_invite_code(&mut rand::thread_rng())
    }
}

/// Draws a code from `rng`.
#[must_use]
pub fn generate_invite_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..INVITE_CODE_LENGTH)
        .map(|_| char::from(INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())]))
        .collect()
}

/// Normalises user input to the stored form of a code.
///
/// Lookups are case-insensitive because codes are upper-cased before any read.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Builds the shareable join link for a circle.
///
/// ```
/// use safe_circle_core::circle::invite_link;
///
/// let link = invite_link("https://safe.example/", "AB3K7Q");
/// assert_eq!(link, "https://safe.example/join?code=AB3K7Q");
/// ```
#[must_use]
pub fn invite_link(origin: &str, code: &str) -> String {
    format!(
        "{}{JOIN_PATH}?code={}",
        origin.trim_end_matches('/'),
        percent_encode(code)
    )
}

/// Extracts the invite code from a join link.
///
/// Returns the normalised code, or `None` when the link has no `code`
/// parameter or the value is not a well-formed code.
///
/// ```
/// use safe_circle_core::circle::parse_invite_link;
///
/// assert_eq!(
///     parse_invite_link("https://safe.example/join?code=ab3k7q").as_deref(),
///     Some("AB3K7Q")
/// );
/// assert_eq!(parse_invite_link("https://safe.example/join"), None);
/// ```
#[must_use]
pub fn parse_invite_link(link: &str) -> Option<String> {
    let (_, query) = link.split_once('?')?;
    let query = query.split('#').next().unwrap_or_default();
    let raw = query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "code").then_some(value)
    })?;

    let code = normalize_code(&percent_decode(raw)?);
    validation::validate_invite_code(&code).ok()?;
    Some(code)
}

fn percent_encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                char::from(b).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}

fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = value.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// Hands out a fixed list of codes in order, then repeats the last one.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct SequenceCodeGenerator {
    codes: Vec<String>,
    next: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl SequenceCodeGenerator {
    /// Creates a generator that yields `codes` in order.
    #[must_use]
    pub fn new(codes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl CodeGenerator for SequenceCodeGenerator {
    fn generate(&self) -> String {
        let i = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.codes
            .get(i)
            .or_else(|| self.codes.last())
            .cloned()
            .unwrap_or_else(|| RandomCodeGenerator.generate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn alphabet_has_no_ambiguous_symbols() {
        for c in [b'0', b'O', b'1', b'I'] {
            assert!(!INVITE_ALPHABET.contains(&c));
        }
        let mut sorted = INVITE_ALPHABET.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 32);
    }

    #[test]
    fn generated_codes_are_well_formed() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let code = generate_invite_code(&mut rng);
            assert_eq!(code.len(), INVITE_CODE_LENGTH);
            assert!(code.bytes().all(|b| INVITE_ALPHABET.contains(&b)));
            assert!(validation::validate_invite_code(&code).is_ok());
        }
    }

    #[test]
    fn random_generator_varies() {
        let generator = RandomCodeGenerator;
        let codes: std::collections::HashSet<_> = (0..50).map(|_| generator.generate()).collect();
        assert!(codes.len() > 1);
    }

    #[test]
    fn normalize_uppercases_and_trims() {
        assert_eq!(normalize_code(" ab3k7q\n"), "AB3K7Q");
    }

    #[test]
    fn link_roundtrip() {
        let link = invite_link("https://safe.example", "AB3K7Q");
        assert_eq!(link, "https://safe.example/join?code=AB3K7Q");
        assert_eq!(parse_invite_link(&link).as_deref(), Some("AB3K7Q"));
    }

    #[test]
    fn parse_handles_extra_params_and_fragment() {
        assert_eq!(
            parse_invite_link("https://x.example/join?ref=sms&code=ab3k7q#top").as_deref(),
            Some("AB3K7Q")
        );
        assert_eq!(
            parse_invite_link("https://x.example/join?code=%41B3K7Q").as_deref(),
            Some("AB3K7Q")
        );
    }

    #[test]
    fn parse_rejects_malformed_codes() {
        assert_eq!(parse_invite_link("https://x.example/join?code=ABC"), None);
        assert_eq!(parse_invite_link("https://x.example/join?code=AB%ZZ7Q"), None);
        assert_eq!(parse_invite_link("https://x.example/join?other=AB3K7Q"), None);
    }

    #[test]
    fn sequence_generator_repeats_last() {
        let generator = SequenceCodeGenerator::new(["AB3K7Q", "ZZZZZZ"]);
        assert_eq!(generator.generate(), "AB3K7Q");
        assert_eq!(generator.generate(), "ZZZZZZ");
        assert_eq!(generator.generate(), "ZZZZZZ");
    }
}
