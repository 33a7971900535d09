//! Lexicon-based sentiment for free text that arrives without a label.

use std::sync::LazyLock;

use opinion_core::{strip_diacritics, SentimentLabel};
use regex::Regex;

const NEGATIVE_PHRASES: &[&str] = &[
    "no funciona",
    "no cumple",
    "no lo recomiendo",
    "no recomiendo",
    "no recomendable",
    "muy mala calidad",
    "mala calidad",
    "pesima atencion",
    "se rompio",
    "se rompio rapido",
    "no cumple con lo anunciado",
    "insatisfecho",
    "decepcionado",
    "defectuoso",
    "no funciona como esperaba",
];

const NEGATIVE_WORDS: &[&str] = &[
    "malo",
    "mala",
    "pesimo",
    "pesima",
    "terrible",
    "horrible",
    "deficiente",
    "defectuoso",
    "insatisfecho",
    "decepcionado",
    "no cumple",
];

const POSITIVE_WORDS: &[&str] = &[
    "excelente",
    "bueno",
    "genial",
    "recomiendo",
    "perfecto",
    "increible",
    "agradable",
    "satisfecho",
    "muy satisfecho",
    "calidad superior",
    "me encanta",
    "lo recomiendo",
    "muy contento",
    "cumple su funcion",
    "llego rapido",
    "funciona perfecto",
    "gran relacion calidad",
];

fn whole_word(word: &str) -> Regex {
    Regex::new(&format!(r"\b{}\b", regex::escape(word))).expect("lexicon entries are literal")
}

static NEGATIVE_WORD_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| NEGATIVE_WORDS.iter().map(|w| whole_word(w)).collect());

static POSITIVE_WORD_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| POSITIVE_WORDS.iter().map(|w| whole_word(w)).collect());

/// "no" directly followed by a recommending or praising word.
static NEGATED_PRAISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bno\b\s+\b(recomiendo|recomendable|recomendado|buen|bueno|excelente|perfecto)\b")
        .expect("negation pattern is valid")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentimentScore {
    pub positive: u32,
    pub negative: u32,
}

impl SentimentScore {
    pub fn label(self) -> SentimentLabel {
        if self.positive > self.negative {
            SentimentLabel::Positive
        } else if self.negative > self.positive {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }
}

/// Deterministic scorer. Negative phrases weigh 3, single words 1, and a
/// negated praise adds 2 more to the negative side. Ties are neutral.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentimentClassifier;

impl SentimentClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, text: &str) -> SentimentScore {
        let mut score = SentimentScore::default();
        if text.trim().is_empty() {
            return score;
        }
        let text = strip_diacritics(text).to_lowercase();

        for phrase in NEGATIVE_PHRASES {
            if text.contains(phrase) {
                score.negative += 3;
            }
        }
        score.negative += NEGATIVE_WORD_PATTERNS
            .iter()
            .filter(|re| re.is_match(&text))
            .count() as u32;
        score.positive += POSITIVE_WORD_PATTERNS
            .iter()
            .filter(|re| re.is_match(&text))
            .count() as u32;
        if NEGATED_PRAISE.is_match(&text) {
            score.negative += 2;
        }
        score
    }

    pub fn classify(&self, text: &str) -> SentimentLabel {
        self.score(text).label()
    }
}

/// Substring check used when rebuilding facts from social comments. Cheaper
/// and coarser than [`SentimentClassifier`]; any "no" substring counts.
pub fn keyword_label(text: &str) -> SentimentLabel {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return SentimentLabel::Neutral;
    }
    let has = |needle: &str| text.contains(needle);
    if has("no") && (has("recomiendo") || has("malo") || has("mal")) {
        SentimentLabel::Negative
    } else if has("excelente") || has("recomiendo") || has("me encanta") || has("bueno") {
        SentimentLabel::Positive
    } else {
        SentimentLabel::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negated_recommendation_is_negative() {
        let classifier = SentimentClassifier::new();
        assert_eq!(
            classifier.classify("no lo recomiendo, pesima calidad"),
            SentimentLabel::Negative
        );
        assert_eq!(classifier.classify("No recomiendo este producto"), SentimentLabel::Negative);
    }

    #[test]
    fn praise_is_positive() {
        let classifier = SentimentClassifier::new();
        assert_eq!(
            classifier.classify("excelente, lo recomiendo totalmente"),
            SentimentLabel::Positive
        );
        assert_eq!(classifier.classify("¡Me encanta! Llegó rápido"), SentimentLabel::Positive);
    }

    #[test]
    fn no_keywords_or_blank_is_neutral() {
        let classifier = SentimentClassifier::new();
        assert_eq!(classifier.classify("llegó el producto"), SentimentLabel::Neutral);
        assert_eq!(classifier.classify("   "), SentimentLabel::Neutral);
        assert_eq!(classifier.classify(""), SentimentLabel::Neutral);
    }

    #[test]
    fn balanced_scores_tie_to_neutral() {
        let classifier = SentimentClassifier::new();
        let score = classifier.score("bueno pero terrible");
        assert_eq!(score, SentimentScore { positive: 1, negative: 1 });
        assert_eq!(score.label(), SentimentLabel::Neutral);
    }

    #[test]
    fn words_only_match_whole() {
        let classifier = SentimentClassifier::new();
        // "malos" is not "malo"; "buenos" is not "bueno".
        assert_eq!(classifier.score("malos y buenos"), SentimentScore::default());
    }

    #[test]
    fn negation_penalty_applies_to_praise_words() {
        let classifier = SentimentClassifier::new();
        let score = classifier.score("no bueno");
        assert_eq!(score.positive, 1);
        assert_eq!(score.negative, 2);
        assert_eq!(score.label(), SentimentLabel::Negative);
    }

    #[test]
    fn keyword_label_uses_substrings() {
        assert_eq!(keyword_label("No lo recomiendo"), SentimentLabel::Negative);
        assert_eq!(keyword_label("Excelente servicio"), SentimentLabel::Positive);
        assert_eq!(keyword_label("me encanta"), SentimentLabel::Positive);
        assert_eq!(keyword_label("llegó el lunes"), SentimentLabel::Neutral);
        // "bueno" contains "no", so a trailing "mal" flips it.
        assert_eq!(keyword_label("bueno pero mal empaque"), SentimentLabel::Negative);
    }
}
