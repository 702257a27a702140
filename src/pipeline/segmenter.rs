//! Incremental sentence segmentation of streamed text

use std::sync::LazyLock;

use regex::Regex;

/// Sentence boundary: terminal punctuation followed by whitespace or end of input
static BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?](?:\s+|$)").expect("valid regex"));

/// One speakable unit cut from the text stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceUnit {
    /// Exact substring consumed from the input, trailing whitespace included
    pub raw: String,
    /// Speakable text (`raw` trimmed)
    pub text: String,
}

impl SentenceUnit {
    fn from_raw(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            text: raw.trim().to_string(),
        }
    }
}

/// Splits an incrementally arriving text stream into sentence units
///
/// Concatenating the `raw` span of every emitted unit with [`remainder`]
/// always reproduces the text fed so far.
///
/// [`remainder`]: Segmenter::remainder
#[derive(Debug, Default)]
pub struct Segmenter {
    buffer: String,
}

impl Segmenter {
    /// Create an empty segmenter
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Append a text delta and return every complete unit, left to right
    pub fn feed(&mut self, delta: &str) -> Vec<SentenceUnit> {
        self.buffer.push_str(delta);

        let mut units = Vec::new();
        let mut consumed = 0;
        for m in BOUNDARY.find_iter(&self.buffer) {
            units.push(SentenceUnit::from_raw(&self.buffer[consumed..m.end()]));
            consumed = m.end();
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        units
    }

    /// Text buffered after the last boundary
    #[must_use]
    pub fn remainder(&self) -> &str {
        &self.buffer
    }

    /// Whether the buffered remainder has nothing speakable
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    /// End of stream: emit the remainder as a final unit if it has any text
    pub fn finish(&mut self) -> Option<SentenceUnit> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Some(SentenceUnit::from_raw(&rest))
        }
    }
}

/// Split a complete text into units in one pass
#[must_use]
pub fn split_sentences(text: &str) -> Vec<SentenceUnit> {
    let mut segmenter = Segmenter::new();
    let mut units = segmenter.feed(text);
    units.extend(segmenter.finish());
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(units: &[SentenceUnit]) -> Vec<&str> {
        units.iter().map(|u| u.text.as_str()).collect()
    }

    #[test]
    fn single_delta_with_three_sentences() {
        let mut seg = Segmenter::new();
        let units = seg.feed("Hello there. How are you? I'm fine!");

        assert_eq!(texts(&units), ["Hello there.", "How are you?", "I'm fine!"]);
        assert_eq!(seg.remainder(), "");
    }

    #[test]
    fn sentence_split_across_deltas() {
        let mut seg = Segmenter::new();

        assert!(seg.feed("Hello the").is_empty());
        assert_eq!(seg.remainder(), "Hello the");

        let units = seg.feed("re. How are you?");
        assert_eq!(texts(&units), ["Hello there.", "How are you?"]);
        assert_eq!(seg.remainder(), "");
    }

    #[test]
    fn decimal_point_is_not_a_boundary() {
        let mut seg = Segmenter::new();
        assert!(seg.feed("Pi is 3.14 roughly").is_empty());
        let units = seg.feed(". Next");
        assert_eq!(texts(&units), ["Pi is 3.14 roughly."]);
        assert_eq!(seg.remainder(), "Next");
    }

    #[test]
    fn trailing_whitespace_belongs_to_unit() {
        let mut seg = Segmenter::new();
        let units = seg.feed("One.  \n Two");
        assert_eq!(units[0].raw, "One.  \n ");
        assert_eq!(units[0].text, "One.");
        assert_eq!(seg.remainder(), "Two");
    }

    #[test]
    fn finish_emits_unterminated_remainder() {
        let mut seg = Segmenter::new();
        seg.feed("Done. and then some");
        let last = seg.finish().unwrap();
        assert_eq!(last.text, "and then some");
        assert!(seg.finish().is_none());
    }

    #[test]
    fn finish_skips_blank_remainder() {
        let mut seg = Segmenter::new();
        seg.feed("All good.");
        seg.feed("   ");
        assert!(seg.is_blank());
        assert!(seg.finish().is_none());
    }

    #[test]
    fn segmentation_is_lossless() {
        let deltas = [
            "Well", ", this is", " a test... ", "Really?!", " Yes", ".\n\nNew para",
            "graph here", "! ", "", "end without stop",
        ];

        let mut seg = Segmenter::new();
        let mut fed = String::new();
        let mut emitted = String::new();

        for delta in deltas {
            fed.push_str(delta);
            for unit in seg.feed(delta) {
                assert!(!unit.text.is_empty());
                emitted.push_str(&unit.raw);
            }
            assert_eq!(format!("{emitted}{}", seg.remainder()), fed);
        }
    }

    #[test]
    fn split_sentences_handles_whole_text() {
        let units = split_sentences("First. Second! Third");
        assert_eq!(texts(&units), ["First.", "Second!", "Third"]);
    }
}
