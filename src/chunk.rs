//! Paragraph-boundary text fragmenter.
//!
//! Splits document body text into [`Fragment`]s that respect a configurable
//! `max_chars` limit. Splitting occurs on paragraph boundaries (`\n\n`) to
//! preserve semantic coherence within each fragment.
//!
//! Fragment ids are deterministic — `{document_id}-{position}` — so
//! re-ingesting the same document replaces its fragments in place.

use crate::models::Fragment;

/// Split text into fragments on paragraph boundaries, respecting max_chars.
/// Returns fragments with contiguous positions starting at 0; always at
/// least one fragment for non-empty input.
pub fn split_fragments(
    document_id: &str,
    text: &str,
    max_chars: usize,
    created_at: i64,
) -> Vec<Fragment> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if text.len() <= max_chars {
        return vec![make_fragment(document_id, 0, text, created_at)];
    }

    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut fragments = Vec::new();
    let mut current_buf = String::new();
    let mut position: i64 = 0;

    for para in paragraphs {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len() // +2 for \n\n separator
        };

        if would_be > max_chars && !current_buf.is_empty() {
            fragments.push(make_fragment(document_id, position, &current_buf, created_at));
            position += 1;
            current_buf.clear();
        }

        // If a single paragraph exceeds max, hard-split it at word boundaries
        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                fragments.push(make_fragment(document_id, position, &current_buf, created_at));
                position += 1;
                current_buf.clear();
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let mut split_at = floor_char_boundary(remaining, remaining.len().min(max_chars));
                // Take at least one full character so the loop always
                // advances, even when max_chars is smaller than the
                // character's UTF-8 width
                if split_at == 0 {
                    split_at = remaining
                        .chars()
                        .next()
                        .map(|c| c.len_utf8())
                        .unwrap_or(remaining.len());
                }
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    fragments.push(make_fragment(document_id, position, piece, created_at));
                    position += 1;
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    // Flush remaining
    if !current_buf.is_empty() {
        fragments.push(make_fragment(document_id, position, &current_buf, created_at));
    }

    // Guarantee at least one fragment
    if fragments.is_empty() {
        fragments.push(make_fragment(document_id, 0, text, created_at));
    }

    fragments
}

fn make_fragment(document_id: &str, position: i64, text: &str, created_at: i64) -> Fragment {
    Fragment {
        id: format!("{}-{}", document_id, position),
        document_id: document_id.to_string(),
        position,
        text: text.to_string(),
        created_at,
    }
}

/// Largest byte index `<= at` that lands on a UTF-8 character boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut at = at.min(s.len());
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_fragment() {
        let fragments = split_fragments("doc1", "Hello, world!", 512, 0);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].position, 0);
        assert_eq!(fragments[0].id, "doc1-0");
        assert_eq!(fragments[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(split_fragments("doc1", "", 512, 0).is_empty());
        assert!(split_fragments("doc1", "   \n\n  ", 512, 0).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let fragments = split_fragments("doc1", text, 512, 0);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].text.contains("First paragraph."));
        assert!(fragments[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_positions_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let fragments = split_fragments("doc1", &text, 40, 0);
        assert!(fragments.len() > 1);
        for (i, f) in fragments.iter().enumerate() {
            assert_eq!(f.position, i as i64, "Position mismatch at {}", i);
            assert_eq!(f.id, format!("doc1-{}", i));
        }
    }

    #[test]
    fn test_oversized_paragraph_hard_split() {
        let text = "word ".repeat(200);
        let fragments = split_fragments("doc1", &text, 50, 0);
        assert!(fragments.len() > 1);
        for f in &fragments {
            assert!(f.text.len() <= 50, "fragment exceeds max: {}", f.text.len());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = split_fragments("doc1", text, 12, 7);
        let b = split_fragments("doc1", text, 12, 7);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.text, y.text);
        }
    }

    #[test]
    fn test_hard_split_advances_when_max_chars_below_char_width() {
        // 4-byte chars with max_chars = 2: each fragment carries one
        // whole character instead of looping forever
        let fragments = split_fragments("doc1", &"😀".repeat(3), 2, 0);
        assert_eq!(fragments.len(), 3);
        for f in &fragments {
            assert_eq!(f.text, "😀");
        }
    }

    #[test]
    fn test_multibyte_boundary_split() {
        let text = "é".repeat(100);
        let fragments = split_fragments("doc1", &text, 30, 0);
        assert!(!fragments.is_empty());
        // Every fragment must be valid UTF-8 slices re-joined without panic
        for f in &fragments {
            assert!(!f.text.is_empty());
        }
    }
}
