// SPDX-License-Identifier: MIT OR Apache-2.0

//! Character-based position handling for subject tokens.
//!
//! Relation operators read the hidden state on the *last token of the
//! subject* inside a rendered prompt. Tokenizers disagree about how a
//! subject such as `"New Zealand"` is split, so the position is found by
//! character offsets instead of token heuristics:
//!
//! 1. locate the subject's byte range in the prompt text,
//! 2. tokenize the prompt with offset mapping,
//! 3. take the last token overlapping that byte range.

/// Encoding result with tokens and their character offsets.
///
/// Produced by [`LreTokenizer::encode_with_offsets`](crate::LreTokenizer::encode_with_offsets).
///
/// # Example
///
/// ```
/// use candle_lre::util::positioning::EncodingWithOffsets;
///
/// // "capital of New Zealand is"
/// let encoding = EncodingWithOffsets::new(
///     vec![1, 2, 3, 4, 5],
///     vec!["capital".into(), "of".into(), "New".into(), "Zealand".into(), "is".into()],
///     vec![(0, 7), (8, 10), (11, 14), (15, 22), (23, 25)],
/// );
///
/// assert_eq!(encoding.char_range_to_tokens(11, 22), vec![2, 3]);
/// assert_eq!(encoding.subject_last_token("capital of New Zealand is", "New Zealand"), Some(3));
/// ```
#[derive(Debug, Clone)]
pub struct EncodingWithOffsets {
    /// Token IDs.
    pub ids: Vec<u32>,
    /// Token strings.
    pub tokens: Vec<String>,
    /// Character offset for each token: `(start, end)`.
    pub offsets: Vec<(usize, usize)>,
}

impl EncodingWithOffsets {
    /// Create a new encoding with offsets.
    #[must_use]
    pub const fn new(ids: Vec<u32>, tokens: Vec<String>, offsets: Vec<(usize, usize)>) -> Self {
        Self {
            ids,
            tokens,
            offsets,
        }
    }

    /// Find all token indices that overlap with the given character range.
    #[must_use]
    pub fn char_range_to_tokens(&self, start_char: usize, end_char: usize) -> Vec<usize> {
        self.offsets
            .iter()
            .enumerate()
            .filter_map(|(idx, (start, end))| {
                if *end > start_char && *start < end_char {
                    Some(idx)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Index of the last token of the *last* occurrence of `subject` in
    /// `text`, where `text` is the string this encoding was produced from.
    ///
    /// The last occurrence is used because few-shot prompts may mention
    /// the same subject in a demonstration before the query line.
    ///
    /// Returns `None` if the subject does not occur or no token overlaps it.
    #[must_use]
    pub fn subject_last_token(&self, text: &str, subject: &str) -> Option<usize> {
        let (start, end) = find_last_char_range(text, subject)?;
        self.char_range_to_tokens(start, end).last().copied()
    }

    /// Index of the final token, or `None` for an empty encoding.
    #[must_use]
    pub const fn last_index(&self) -> Option<usize> {
        self.ids.len().checked_sub(1)
    }

    /// Number of tokens.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the encoding is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Byte range `(start, end)` of the last occurrence of `needle` in `text`.
///
/// Leading and trailing whitespace in `needle` is ignored. Returns `None`
/// for an empty needle or when there is no match.
#[must_use]
pub fn find_last_char_range(text: &str, needle: &str) -> Option<(usize, usize)> {
    let needle = needle.trim();
    if needle.is_empty() {
        return None;
    }
    text.rfind(needle).map(|start| (start, start + needle.len()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Word-level encoding of `"Paris is in France\nLyon is in"`.
    fn sample_encoding() -> (String, EncodingWithOffsets) {
        let text = "Paris is in France\nLyon is in".to_string();
        let encoding = EncodingWithOffsets::new(
            vec![1, 2, 3, 4, 5, 2, 3],
            vec![
                "Paris".into(),
                "is".into(),
                "in".into(),
                "France".into(),
                "Lyon".into(),
                "is".into(),
                "in".into(),
            ],
            vec![(0, 5), (6, 8), (9, 11), (12, 18), (19, 23), (24, 26), (27, 29)],
        );
        (text, encoding)
    }

    #[test]
    fn char_range_overlap_is_half_open() {
        let (_, encoding) = sample_encoding();
        assert_eq!(encoding.char_range_to_tokens(0, 5), vec![0]);
        assert_eq!(encoding.char_range_to_tokens(4, 7), vec![0, 1]);
        assert!(encoding.char_range_to_tokens(5, 6).is_empty());
        assert!(encoding.char_range_to_tokens(100, 120).is_empty());
    }

    #[test]
    fn subject_position_uses_last_occurrence() {
        let (text, encoding) = sample_encoding();
        assert_eq!(encoding.subject_last_token(&text, "Lyon"), Some(4));
        // "is" occurs twice; the query-line occurrence wins.
        assert_eq!(encoding.subject_last_token(&text, "is"), Some(5));
        assert_eq!(encoding.subject_last_token(&text, "Berlin"), None);
    }

    #[test]
    fn multi_token_subject_takes_final_piece() {
        let (text, encoding) = sample_encoding();
        assert_eq!(encoding.subject_last_token(&text, "in France"), Some(3));
    }

    #[test]
    fn whitespace_only_needle_is_not_found() {
        assert_eq!(find_last_char_range("a b", "  "), None);
        assert_eq!(find_last_char_range("a b", " b "), Some((2, 3)));
    }

    #[test]
    fn encoding_len_and_last_index() {
        let (_, encoding) = sample_encoding();
        assert_eq!(encoding.len(), 7);
        assert_eq!(encoding.last_index(), Some(6));

        let empty = EncodingWithOffsets::new(vec![], vec![], vec![]);
        assert!(empty.is_empty());
        assert_eq!(empty.last_index(), None);
    }
}
