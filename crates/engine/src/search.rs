//! Search token derivation for approximate search over encrypted fields.
//!
//! Tokens are never stored or indexed in plaintext. The token set is joined,
//! salted per clinic and encrypted like any other field; a search decrypts the
//! set (an authorized operation) and matches in memory.

use std::collections::{BTreeSet, HashSet};

use phi_common::{protocol::SEARCH_TOKENS_FIELD_TYPE, EncryptedField, EncryptionContext, EngineError};
use tracing::{debug, instrument};

use crate::field::FieldCipher;
use crate::hash::{DeterministicHasher, SaltPurpose};

/// Shortest word that yields prefix tokens.
pub const MIN_PREFIX_LEN: usize = 3;

/// Longest prefix token emitted for a word.
pub const MAX_PREFIX_LEN: usize = 8;

/// Fewest digits a run needs to count as a phone number.
pub const MIN_PHONE_DIGITS: usize = 10;

/// Separates the token list from the clinic salt in the encrypted plaintext.
/// Never produced by normalization, so it cannot appear inside a token.
const SALT_SEPARATOR: char = '#';

const KEPT_PUNCTUATION: [char; 3] = ['@', '.', '-'];
const PHONE_SEPARATORS: [char; 6] = [' ', '(', ')', '.', '-', '+'];

/// Digit group lengths that read as one phone number, longest first.
const PHONE_LAYOUTS: [&[usize]; 4] = [&[1, 3, 3, 4], &[3, 3, 4], &[1, 10], &[3, 7]];

/// Derives and encrypts search token sets.
#[derive(Clone)]
pub struct SearchTokenizer {
    cipher: FieldCipher,
    hasher: DeterministicHasher,
}

impl SearchTokenizer {
    pub fn new(cipher: FieldCipher, hasher: DeterministicHasher) -> Self {
        Self { cipher, hasher }
    }

    /// Derive the token vocabulary for `text`.
    ///
    /// - every normalized word
    /// - prefixes of length 3..=8 of alphabetic words of length >= 3
    /// - phone numbers as bare digit strings, plus 3/3/4 splits of 10-digit ones
    /// - local part and domain of embedded email addresses
    pub fn tokenize(text: &str) -> BTreeSet<String> {
        let mut tokens = BTreeSet::new();
        let normalized = normalize(text);

        for raw in normalized.split_whitespace() {
            let word = raw.trim_matches(|c: char| c == '.' || c == '-');
            if word.is_empty() {
                continue;
            }
            tokens.insert(word.to_owned());

            let len = word.chars().count();
            if len >= MIN_PREFIX_LEN && word.chars().all(char::is_alphabetic) {
                for n in MIN_PREFIX_LEN..=len.min(MAX_PREFIX_LEN) {
                    tokens.insert(word.chars().take(n).collect());
                }
            }

            if let Some((local, domain)) = split_email(word) {
                tokens.insert(local.to_owned());
                tokens.insert(domain.to_owned());
            }
        }

        for digits in phone_runs(&text.to_lowercase()) {
            if digits.len() == MIN_PHONE_DIGITS {
                tokens.insert(digits[..3].to_owned());
                tokens.insert(digits[3..6].to_owned());
                tokens.insert(digits[6..].to_owned());
            }
            tokens.insert(digits);
        }

        tokens
    }

    /// Tokenize `text`, salt it for `clinic_id`, and encrypt the result as a
    /// `search_tokens` field.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if `text` yields no tokens, and
    /// propagates any [`FieldCipher::encrypt_field`] error.
    #[instrument(skip_all, fields(clinic_id = %clinic_id))]
    pub async fn generate_search_tokens(
        &self,
        text: &str,
        clinic_id: &str,
    ) -> Result<EncryptedField, EngineError> {
        let tokens = Self::tokenize(text);
        if tokens.is_empty() {
            return Err(EngineError::InvalidInput("text produced no search tokens".into()));
        }
        let salt = self
            .hasher
            .salt(SaltPurpose::SearchTokens, clinic_id, SEARCH_TOKENS_FIELD_TYPE)?;

        let joined = tokens.into_iter().collect::<Vec<_>>().join(" ");
        let combined = format!("{joined}{SALT_SEPARATOR}{}", hex::encode(salt));

        let context = EncryptionContext::new(clinic_id, SEARCH_TOKENS_FIELD_TYPE, self.cipher.environment());
        let field = self.cipher.encrypt_field(&combined, &context).await?;
        debug!("search tokens encrypted");
        Ok(field)
    }

    /// Match `query` against a decrypted token set.
    ///
    /// Every normalized query term must be a stored token, or, when longer
    /// than [`MAX_PREFIX_LEN`], a prefix of one. An empty query matches nothing.
    pub fn matches(token_plaintext: &str, query: &str) -> bool {
        let token_part = token_plaintext
            .rsplit_once(SALT_SEPARATOR)
            .map_or(token_plaintext, |(tokens, _salt)| tokens);
        let stored: HashSet<&str> = token_part.split(' ').filter(|t| !t.is_empty()).collect();

        let normalized = normalize(query);
        let mut terms = normalized
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| c == '.' || c == '-'))
            .filter(|t| !t.is_empty())
            .peekable();
        if terms.peek().is_none() {
            return false;
        }
        terms.all(|term| {
            stored.contains(term)
                || (term.chars().count() > MAX_PREFIX_LEN && stored.iter().any(|t| t.starts_with(term)))
        })
    }

    /// Decrypt a stored token set and match `query` against it.
    ///
    /// # Errors
    ///
    /// Propagates [`FieldCipher::decrypt_field`] errors.
    pub async fn search(&self, field: &EncryptedField, query: &str) -> Result<bool, EngineError> {
        let plaintext = self.cipher.decrypt_field(field).await?;
        Ok(Self::matches(&plaintext, query))
    }
}

/// Lowercase, drop punctuation other than `@ . -`, and collapse whitespace.
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || KEPT_PUNCTUATION.contains(c))
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn split_email(word: &str) -> Option<(&str, &str)> {
    let (local, domain) = word.split_once('@')?;
    let valid = !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.');
    valid.then_some((local, domain))
}

/// Phone numbers in `text`, as bare digit strings.
///
/// A single digit group of at least [`MIN_PHONE_DIGITS`] digits is taken as
/// is. Shorter groups only join when consecutive groups follow one of
/// [`PHONE_LAYOUTS`], so neighbouring numbers never merge into one run.
fn phone_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    for cluster in digit_clusters(text) {
        let mut i = 0;
        while i < cluster.len() {
            if cluster[i].len() >= MIN_PHONE_DIGITS {
                runs.push(cluster[i].clone());
                i += 1;
                continue;
            }
            let rest = &cluster[i..];
            let layout = PHONE_LAYOUTS.iter().find(|layout| {
                rest.len() >= layout.len()
                    && rest.iter().zip(layout.iter()).all(|(group, &n)| group.len() == n)
            });
            match layout {
                Some(layout) => {
                    runs.push(rest[..layout.len()].concat());
                    i += layout.len();
                }
                None => i += 1,
            }
        }
    }
    runs
}

/// Digit groups split on phone separators. Any other non-digit character
/// closes the current cluster.
fn digit_clusters(text: &str) -> Vec<Vec<String>> {
    let mut clusters = Vec::new();
    let mut cluster: Vec<String> = Vec::new();
    let mut group = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            group.push(c);
            continue;
        }
        if !group.is_empty() {
            cluster.push(std::mem::take(&mut group));
        }
        if !PHONE_SEPARATORS.contains(&c) && !cluster.is_empty() {
            clusters.push(std::mem::take(&mut cluster));
        }
    }
    if !group.is_empty() {
        cluster.push(group);
    }
    if !cluster.is_empty() {
        clusters.push(cluster);
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::crypto::Compressor;
    use crate::hash::HashKey;
    use crate::keys::KeyProvider;
    use crate::kms::LocalKms;

    fn tokenizer() -> SearchTokenizer {
        let keys = KeyProvider::new(Arc::new(LocalKms::new()), "phi");
        let cipher = FieldCipher::new(Arc::new(keys), Compressor::default(), "development");
        let hasher = DeterministicHasher::new(HashKey::new(vec![7u8; 32]).unwrap(), "development");
        SearchTokenizer::new(cipher, hasher)
    }

    #[test]
    fn tokenization_coverage() {
        let tokens = SearchTokenizer::tokenize("Jane Smith (555) 123-4567 jane@x.com");
        for expected in [
            "jane", "smi", "smit", "smith", "5551234567", "555", "123", "4567", "x.com",
        ] {
            assert!(tokens.contains(expected), "missing token {expected:?} in {tokens:?}");
        }
    }

    #[test]
    fn prefixes_capped_at_eight() {
        let tokens = SearchTokenizer::tokenize("Christopher");
        assert!(tokens.contains("chr"));
        assert!(tokens.contains("christop"));
        assert!(!tokens.contains("christoph"));
        assert!(tokens.contains("christopher"));
    }

    #[test]
    fn short_words_get_no_prefixes() {
        let tokens = SearchTokenizer::tokenize("Al Li");
        assert_eq!(tokens.into_iter().collect::<Vec<_>>(), vec!["al", "li"]);
    }

    #[test]
    fn non_alphabetic_words_get_no_prefixes() {
        let tokens = SearchTokenizer::tokenize("abc123");
        assert!(tokens.contains("abc123"));
        assert!(!tokens.contains("abc"));
    }

    #[test]
    fn punctuation_stripped_except_email_chars() {
        let tokens = SearchTokenizer::tokenize("O'Brien, Mary-Ann!");
        assert!(tokens.contains("obrien"));
        assert!(tokens.contains("mary-ann"));
        assert!(!tokens.iter().any(|t| t.contains(',') || t.contains('!')));
    }

    #[test]
    fn email_parts_extracted() {
        let tokens = SearchTokenizer::tokenize("contact: j.doe@clinic.example.org.");
        assert!(tokens.contains("j.doe@clinic.example.org"));
        assert!(tokens.contains("j.doe"));
        assert!(tokens.contains("clinic.example.org"));
    }

    #[test]
    fn short_digit_runs_are_not_phones() {
        let tokens = SearchTokenizer::tokenize("room 123-456");
        assert!(!tokens.contains("123456"));
    }

    #[test]
    fn eleven_digit_phone_has_no_splits() {
        let tokens = SearchTokenizer::tokenize("+1 555 123 4567");
        assert!(tokens.contains("15551234567"));
        assert!(!tokens.contains("155"));
    }

    #[test]
    fn ssn_followed_by_phone_keeps_phone_intact() {
        let tokens = SearchTokenizer::tokenize("SSN 123-45-6789 (555) 123-4567");
        assert!(tokens.contains("5551234567"), "{tokens:?}");
        assert!(tokens.contains("123-45-6789"));
        assert!(!tokens.iter().any(|t| t.len() > 10 && t.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn adjacent_phones_stay_separate() {
        let tokens = SearchTokenizer::tokenize("555 123 4567 555 987 6543");
        assert!(tokens.contains("5551234567"));
        assert!(tokens.contains("5559876543"));
        assert!(!tokens.contains("55512345675559876543"));
    }

    #[test]
    fn long_unbroken_digit_run_is_kept() {
        let tokens = SearchTokenizer::tokenize("MRN 123456789012");
        assert!(tokens.contains("123456789012"));
    }

    #[test]
    fn empty_text_has_no_tokens() {
        assert!(SearchTokenizer::tokenize("  ...  ").is_empty());
    }

    #[test]
    fn matches_prefix_and_whole_terms() {
        let stored = "jane jan smi smit smith 5551234567#deadbeef";
        assert!(SearchTokenizer::matches(stored, "Jan Smi"));
        assert!(SearchTokenizer::matches(stored, "smith"));
        assert!(SearchTokenizer::matches(stored, "5551234567"));
        assert!(!SearchTokenizer::matches(stored, "jones"));
        assert!(!SearchTokenizer::matches(stored, ""));
    }

    #[test]
    fn salt_is_never_matched() {
        let stored = "jane#deadbeef";
        assert!(!SearchTokenizer::matches(stored, "deadbeef"));
    }

    #[test]
    fn long_query_terms_match_by_prefix() {
        let stored = SearchTokenizer::tokenize("Christopherson")
            .into_iter()
            .collect::<Vec<_>>()
            .join(" ");
        assert!(SearchTokenizer::matches(&stored, "christophe"));
    }

    #[tokio::test]
    async fn generated_tokens_are_encrypted_and_searchable() {
        let t = tokenizer();
        let field = t
            .generate_search_tokens("Jane Smith (555) 123-4567", "clinic-1")
            .await
            .unwrap();
        assert!(!field.encrypted.contains("smith"));
        assert!(field.context.contains("search_tokens"));
        assert!(t.search(&field, "smi").await.unwrap());
        assert!(t.search(&field, "4567").await.unwrap());
        assert!(!t.search(&field, "doe").await.unwrap());
    }

    #[tokio::test]
    async fn salt_differs_per_clinic() {
        let t = tokenizer();
        let a = t.generate_search_tokens("Jane", "clinic-1").await.unwrap();
        let b = t.generate_search_tokens("Jane", "clinic-2").await.unwrap();
        let pa = t.cipher.decrypt_field(&a).await.unwrap();
        let pb = t.cipher.decrypt_field(&b).await.unwrap();
        assert_ne!(pa, pb);
        assert!(pa.starts_with("jan jane#"));
    }

    #[tokio::test]
    async fn text_without_tokens_rejected() {
        let t = tokenizer();
        assert!(matches!(
            t.generate_search_tokens("!!!", "clinic-1").await,
            Err(EngineError::InvalidInput(_))
        ));
    }
}
