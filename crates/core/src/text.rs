//! Smart text scoring
//!
//! Token-weighted length measure used to boost multi-term keyword queries.
//! A CJK character or an English word counts 1.0, a run of digits 0.8,
//! punctuation 0.2, whitespace 0.1, anything else 0.5. The total score of a
//! string is the sum of its token scores; an empty string scores 0.

use serde::{Deserialize, Serialize};

/// Token class recognized by the scorer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// One Chinese / Japanese / Korean character
    CjkChar,
    /// A maximal run of ASCII letters
    EnglishWord,
    /// A maximal run of ASCII digits
    ContinuousNumber,
    /// A single punctuation character (ASCII or CJK)
    Punctuation,
    /// A maximal run of whitespace
    Whitespace,
    /// Anything else, one maximal run
    Other,
}

/// Per-class weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenWeights {
    pub cjk_char: f32,
    pub english_word: f32,
    pub continuous_number: f32,
    pub punctuation: f32,
    pub whitespace: f32,
    pub other: f32,
}

impl Default for TokenWeights {
    fn default() -> Self {
        Self {
            cjk_char: 1.0,
            english_word: 1.0,
            continuous_number: 0.8,
            punctuation: 0.2,
            whitespace: 0.1,
            other: 0.5,
        }
    }
}

impl TokenWeights {
    fn weight(&self, kind: TokenKind) -> f32 {
        match kind {
            TokenKind::CjkChar => self.cjk_char,
            TokenKind::EnglishWord => self.english_word,
            TokenKind::ContinuousNumber => self.continuous_number,
            TokenKind::Punctuation => self.punctuation,
            TokenKind::Whitespace => self.whitespace,
            TokenKind::Other => self.other,
        }
    }
}

/// One parsed token with its score
#[derive(Debug, Clone, PartialEq)]
pub struct TextToken {
    pub kind: TokenKind,
    pub content: String,
    pub score: f32,
}

/// Tokenizer + scorer over mixed CJK / Latin text
#[derive(Debug, Clone, Default)]
pub struct SmartTextScorer {
    weights: TokenWeights,
}

impl SmartTextScorer {
    pub fn new(weights: TokenWeights) -> Self {
        Self { weights }
    }

    /// Split text into scored tokens
    pub fn tokenize(&self, text: &str) -> Vec<TextToken> {
        let mut tokens = Vec::new();
        let mut chars = text.chars().peekable();

        while let Some(&c) = chars.peek() {
            if is_cjk(c) {
                chars.next();
                tokens.push(self.token(TokenKind::CjkChar, c.to_string()));
            } else if c.is_ascii_alphabetic() {
                let word = take_run(&mut chars, |c| c.is_ascii_alphabetic());
                tokens.push(self.token(TokenKind::EnglishWord, word));
            } else if c.is_ascii_digit() {
                let number = take_run(&mut chars, |c| c.is_ascii_digit());
                tokens.push(self.token(TokenKind::ContinuousNumber, number));
            } else if is_punctuation(c) {
                chars.next();
                tokens.push(self.token(TokenKind::Punctuation, c.to_string()));
            } else if c.is_whitespace() {
                let ws = take_run(&mut chars, char::is_whitespace);
                tokens.push(self.token(TokenKind::Whitespace, ws));
            } else {
                let other = take_run(&mut chars, |c| {
                    !is_cjk(c)
                        && !c.is_ascii_alphanumeric()
                        && !is_punctuation(c)
                        && !c.is_whitespace()
                });
                tokens.push(self.token(TokenKind::Other, other));
            }
        }

        tokens
    }

    /// Total smart score of a string
    pub fn score(&self, text: &str) -> f32 {
        self.tokenize(text).iter().map(|t| t.score).sum()
    }

    fn token(&self, kind: TokenKind, content: String) -> TextToken {
        TextToken {
            kind,
            content,
            score: self.weights.weight(kind),
        }
    }
}

fn take_run<F>(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, pred: F) -> String
where
    F: Fn(char) -> bool,
{
    let mut run = String::new();
    while let Some(&c) = chars.peek() {
        if !pred(c) {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

/// CJK unified ideographs, kana, and hangul ranges
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'   // CJK unified ideographs
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{F900}'..='\u{FAFF}' // CJK compatibility ideographs
        | '\u{3040}'..='\u{309F}' // hiragana
        | '\u{30A0}'..='\u{30FF}' // katakana
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
        | '\u{1100}'..='\u{11FF}' // hangul jamo
    )
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(c,
            '\u{3000}'..='\u{303F}'   // CJK symbols and punctuation
            | '\u{FF01}'..='\u{FF0F}' // fullwidth forms (punctuation slices)
            | '\u{FF1A}'..='\u{FF20}'
            | '\u{FF3B}'..='\u{FF40}'
            | '\u{FF5B}'..='\u{FF65}'
            | '\u{2018}'..='\u{201F}' // curly quotes
            | '\u{2026}'              // ellipsis
        )
}
