use regex::Regex;
use std::sync::LazyLock;

/// A numeric clause label at the start of a line: `N(.N)*` followed by `.`, `:`, a dash or whitespace.
static CLAUSE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*\d+(?:\.\d+)*(?:[.:\-\u{2013}\u{2014}]|\s)").expect("static regex")
});

static CLAUSE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+(?:\.\d+)*(?:[.:\-\u{2013}\u{2014}]|\s|$)").expect("static regex")
});

/// Segmentation rule used by the clause chunker.
pub trait BoundaryDetector: Send + Sync {
    /// Ascending byte offsets where a new segment begins. Offset 0 is implied.
    fn find_boundaries(&self, text: &str) -> Vec<usize>;
}

/// Splits before every line that opens with a numeric clause label.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClauseLabelBoundaries;

impl BoundaryDetector for ClauseLabelBoundaries {
    fn find_boundaries(&self, text: &str) -> Vec<usize> {
        CLAUSE_LINE.find_iter(text).map(|m| m.start()).collect()
    }
}

/// True when `line` opens with a clause label such as `3.`, `4.1 ` or `2.3.5:`.
pub fn starts_with_clause_label(line: &str) -> bool {
    CLAUSE_PREFIX.is_match(line)
}

/// Cut `text` at the detector's boundaries; segments are trimmed and empty ones dropped.
pub fn split_segments<'a>(text: &'a str, detector: &dyn BoundaryDetector) -> Vec<&'a str> {
    let mut cuts = vec![0usize];
    cuts.extend(
        detector
            .find_boundaries(text)
            .into_iter()
            .filter(|&b| b > 0 && b < text.len() && text.is_char_boundary(b)),
    );
    cuts.push(text.len());
    cuts.dedup();

    cuts.windows(2)
        .map(|w| text[w[0]..w[1]].trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_at_labelled_lines() {
        let text = "Preamble text\n1. First\n1.2 Second\n  2.3.5: Third\nnot 4. a label";
        let offsets = ClauseLabelBoundaries.find_boundaries(text);
        assert_eq!(offsets.len(), 3);
        assert_eq!(&text[offsets[0]..offsets[0] + 2], "1.");
        assert!(text[offsets[2]..].trim_start().starts_with("2.3.5:"));
    }

    #[test]
    fn test_dash_and_en_dash_separators() {
        let text = "intro\n7- Dash clause\n8\u{2013}En dash clause";
        let segments = split_segments(text, &ClauseLabelBoundaries);
        assert_eq!(segments, vec!["intro", "7- Dash clause", "8\u{2013}En dash clause"]);
    }

    #[test]
    fn test_label_without_separator_is_not_boundary() {
        let text = "intro\n12abc not a clause";
        assert!(ClauseLabelBoundaries.find_boundaries(text).is_empty());
    }

    #[test]
    fn test_split_discards_empty_segments() {
        let text = "\n\n1. A\n\n\n2. B\n";
        let segments = split_segments(text, &ClauseLabelBoundaries);
        assert_eq!(segments, vec!["1. A", "2. B"]);
    }

    #[test]
    fn test_unlabelled_text_is_single_segment() {
        let text = "No numbering here.\nStill none.";
        let segments = split_segments(text, &ClauseLabelBoundaries);
        assert_eq!(segments, vec!["No numbering here.\nStill none."]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_segments("", &ClauseLabelBoundaries).is_empty());
        assert!(split_segments("   \n ", &ClauseLabelBoundaries).is_empty());
    }

    #[test]
    fn test_custom_detector() {
        struct Blank;
        impl BoundaryDetector for Blank {
            fn find_boundaries(&self, text: &str) -> Vec<usize> {
                text.match_indices("\n\n").map(|(i, _)| i).collect()
            }
        }
        let segments = split_segments("a\n\nb\n\nc", &Blank);
        assert_eq!(segments, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_starts_with_clause_label() {
        assert!(starts_with_clause_label("3. EXCLUSIONS"));
        assert!(starts_with_clause_label("4.1 WAITING PERIOD"));
        assert!(starts_with_clause_label("12"));
        assert!(!starts_with_clause_label("SCHEDULE OF BENEFITS"));
        assert!(!starts_with_clause_label("1a. Not numeric"));
    }
}
