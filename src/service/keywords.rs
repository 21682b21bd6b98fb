//! Keyword gender heuristics over model text output

use std::sync::LazyLock;

use regex::Regex;

use crate::engine::Gender;

const MALE_WORDS: &[&str] = &["male", "man"];
const FEMALE_WORDS: &[&str] = &["female", "woman"];

/// `SEX: M`, `Gender / Female`, `sex\nF` and similar labelled fields
static SEX_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sex|gender)\b\s*[:/.\-]?\s*(female|male|f|m)\b").expect("valid regex")
});

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn mentions_any(text: &str, vocabulary: &[&str]) -> bool {
    words(text).any(|w| vocabulary.contains(&w.as_str()))
}

fn contains_any(text: &str, vocabulary: &[&str]) -> bool {
    vocabulary.iter().any(|w| text.contains(w))
}

/// Guess a gender from a free-text caption.
///
/// Plain substring checks on the lowercased caption, male words first, so
/// `mannequin` and `businessman` count as male. Female words are blanked out
/// before the male check, otherwise `woman` and `female` would always match it.
pub fn gender_from_caption(caption: &str) -> Option<Gender> {
    let caption = caption.to_lowercase();
    let without_female = FEMALE_WORDS
        .iter()
        .fold(caption.clone(), |text, word| text.replace(word, " "));

    if contains_any(&without_female, MALE_WORDS) {
        Some(Gender::Male)
    } else if contains_any(&caption, FEMALE_WORDS) {
        Some(Gender::Female)
    } else {
        None
    }
}

/// Parse the sex field of OCR'd document text.
///
/// A labelled `sex`/`gender` field wins; otherwise a standalone `male` or
/// `female` word anywhere in the text is used.
pub fn sex_from_text(text: &str) -> Option<Gender> {
    if let Some(value) = SEX_FIELD.captures(text).and_then(|c| c.get(1)) {
        return match value.as_str().to_lowercase().as_str() {
            "m" | "male" => Some(Gender::Male),
            _ => Some(Gender::Female),
        };
    }

    if mentions_any(text, &["male"]) {
        Some(Gender::Male)
    } else if mentions_any(text, &["female"]) {
        Some(Gender::Female)
    } else {
        None
    }
}
