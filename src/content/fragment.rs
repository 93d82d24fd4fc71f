//! Splitting theory text into slide fragments.
//!
//! Fragments are always trimmed slices of the input, so each one is a literal
//! substring of the theory it came from.

use regex::Regex;
use std::sync::LazyLock;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("paragraph regex is a valid static pattern"));

/// Group blank-line separated paragraphs into contiguous fragments of at most
/// `max_chars` characters. A paragraph longer than the limit stays whole.
pub fn split_theory(theory: &str, max_chars: usize) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut last = 0;
    for m in PARAGRAPH_BREAK.find_iter(theory) {
        push_trimmed_span(theory, last, m.start(), &mut paragraphs);
        last = m.end();
    }
    push_trimmed_span(theory, last, theory.len(), &mut paragraphs);

    let mut fragments = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (start, end) in paragraphs {
        current = match current {
            None => Some((start, end)),
            Some((cur_start, _)) if theory[cur_start..end].chars().count() <= max_chars => {
                Some((cur_start, end))
            }
            Some((cur_start, cur_end)) => {
                fragments.push(&theory[cur_start..cur_end]);
                Some((start, end))
            }
        };
    }
    if let Some((start, end)) = current {
        fragments.push(&theory[start..end]);
    }
    fragments
}

fn push_trimmed_span(text: &str, start: usize, end: usize, out: &mut Vec<(usize, usize)>) {
    let slice = &text[start..end];
    let trimmed_start = start + (slice.len() - slice.trim_start().len());
    let trimmed_end = start + slice.trim_end().len();
    if trimmed_start < trimmed_end {
        out.push((trimmed_start, trimmed_end));
    }
}
