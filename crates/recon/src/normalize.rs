//! Plate canonicalization.
//!
//! Raw plates arrive with Arabic and Latin letters, Arabic-Indic digits,
//! and arbitrary spacing or punctuation. [`Normalizer::normalize`] folds
//! them into an upper-case ASCII comparison key. Whitespace and punctuation
//! runs split the plate into segments; the key is the segments joined with
//! no separator, so `"أ ب ج-123"` and `"ABJ123"` share the key `"ABJ123"`.
//!
//! Normalization never fails. Input with nothing usable yields an empty key,
//! which the matcher treats as "no match".

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Serialize;

use crate::config::NormalizerConfig;

/// Built-in Arabic plate letter transliteration.
const ARABIC_LETTERS: &[(char, &str)] = &[
    ('ا', "A"),
    ('أ', "A"),
    ('إ', "A"),
    ('آ', "A"),
    ('ب', "B"),
    ('ج', "J"),
    ('ح', "J"),
    ('د', "D"),
    ('ر', "R"),
    ('س', "S"),
    ('ص', "X"),
    ('ط', "T"),
    ('ع', "E"),
    ('ق', "G"),
    ('ك', "K"),
    ('ک', "K"),
    ('ل', "L"),
    ('م', "Z"),
    ('ن', "N"),
    ('ه', "H"),
    ('ة', "H"),
    ('و', "U"),
    ('ى', "V"),
    ('ي', "V"),
    ('ی', "V"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedPlate {
    pub value: String,
    pub source_plate: String,
    #[serde(skip)]
    segments: Vec<String>,
}

impl NormalizedPlate {
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The key with leading and trailing regional segments removed.
    ///
    /// At least one segment is always kept, so a plate made only of region
    /// tokens keeps its last one.
    pub fn core_value(&self, region_tokens: &[String]) -> String {
        let is_region = |s: &String| region_tokens.iter().any(|t| t == s);
        let mut start = 0;
        let mut end = self.segments.len();
        while end - start > 1 && is_region(&self.segments[start]) {
            start += 1;
        }
        while end - start > 1 && is_region(&self.segments[end - 1]) {
            end -= 1;
        }
        self.segments[start..end].concat()
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    letters: HashMap<char, String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            letters: ARABIC_LETTERS
                .iter()
                .map(|(c, latin)| (*c, (*latin).to_string()))
                .collect(),
        }
    }
}

impl Normalizer {
    /// Built-in table extended (and overridden) by `config.letters`.
    pub fn from_config(config: &NormalizerConfig) -> Self {
        let mut normalizer = Self::default();
        for (from, to) in &config.letters {
            if let Some(c) = from.chars().next() {
                normalizer.letters.insert(c, to.to_ascii_uppercase());
            }
        }
        normalizer
    }

    pub fn normalize(&self, raw: &str) -> NormalizedPlate {
        let mut segments: Vec<String> = Vec::new();
        let mut current = String::new();

        for c in raw.trim().chars() {
            if c.is_ascii_alphanumeric() {
                current.push(c.to_ascii_uppercase());
            } else if let Some(d) = arabic_indic_digit(c) {
                current.push(d);
            } else if let Some(latin) = self.letters.get(&c) {
                current.push_str(latin);
            } else if is_ignorable_mark(c) || c.is_alphanumeric() {
                // diacritics, tatweel and letters outside the table are dropped in place
            } else if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            segments.push(current);
        }

        NormalizedPlate {
            value: segments.concat(),
            source_plate: raw.to_string(),
            segments,
        }
    }
}

/// Normalize with the built-in tables.
pub fn normalize(raw: &str) -> NormalizedPlate {
    static DEFAULT: OnceLock<Normalizer> = OnceLock::new();
    DEFAULT.get_or_init(Normalizer::default).normalize(raw)
}

fn arabic_indic_digit(c: char) -> Option<char> {
    let offset = match c {
        '\u{0660}'..='\u{0669}' => c as u32 - 0x0660,
        '\u{06F0}'..='\u{06F9}' => c as u32 - 0x06F0,
        _ => return None,
    };
    char::from_digit(offset, 10)
}

fn is_ignorable_mark(c: char) -> bool {
    matches!(c, '\u{0640}' | '\u{064B}'..='\u{065F}' | '\u{0670}' | '\u{200C}'..='\u{200F}')
}
