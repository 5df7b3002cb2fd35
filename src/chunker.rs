//! Markdown-structure-aware chunker. Pure function of its input: given text
//! and an injected token counter, produces an ordered sequence of chunks.
//!
//! Four priority levels, each preserving the atomic units of the prior level:
//! atomic regions (fenced code / tables) -> header segmentation -> progressive
//! subdivision (paragraph/sentence/word) -> small-chunk merging.

use crate::tokenizer::TokenCounter;
use std::ops::Range;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RawChunk {
    pub text: String,
    pub header_context: String,
    pub token_count: usize,
    /// Set when this chunk is a single atomic region (fenced code/table)
    /// that itself exceeds `max`. Such chunks must stand alone: the merge
    /// pass never folds another chunk into or out of one (P7).
    pub is_atomic_overflow: bool,
}

/// Splits `text` into structure-aware chunks. `target`/`max`/`min` are token
/// thresholds (defaults 1000/2000/100, see chunk size policy).
pub fn chunk_text(
    text: &str,
    counter: &dyn TokenCounter,
    target: usize,
    max: usize,
    min: usize,
) -> Vec<RawChunk> {
    let (body, _frontmatter_yaml) = strip_frontmatter(text);
    if body.trim().is_empty() {
        return Vec::new();
    }

    let atomic = detect_atomic_regions(&body);
    let segments = segment_by_headers(&body, &atomic);

    let mut raw = Vec::new();
    for (ctx, range) in segments {
        let seg_text = &body[range.clone()];
        if seg_text.trim().is_empty() {
            continue;
        }
        for (text, is_atomic_overflow) in chunk_segment(seg_text, range.start, &atomic, counter, max) {
            let token_count = counter.count(&text);
            raw.push(RawChunk {
                text,
                header_context: ctx.clone(),
                token_count,
                is_atomic_overflow,
            });
        }
    }

    merge_pass(raw, counter, target, min)
}

/// Strips a leading `---`-fenced YAML frontmatter block. Returns the body
/// with the block removed, plus the raw YAML (if any) for the metadata
/// extractor to parse separately.
pub fn strip_frontmatter(text: &str) -> (String, Option<String>) {
    let stripped_bom = text.trim_start_matches('\u{feff}');
    let Some(rest) = stripped_bom
        .strip_prefix("---\r\n")
        .or_else(|| stripped_bom.strip_prefix("---\n"))
    else {
        return (text.to_string(), None);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed == "---" || trimmed == "..." {
            let yaml = rest[..offset].to_string();
            let body = rest[offset + line.len()..].to_string();
            return (body, Some(yaml));
        }
        offset += line.len();
    }
    // Unterminated frontmatter fence: treat the whole thing as body.
    (text.to_string(), None)
}

/// Byte ranges of fenced code blocks and tables: regions the chunker must
/// never cut through.
pub fn detect_atomic_regions(body: &str) -> Vec<Range<usize>> {
    use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

    let mut regions = Vec::new();
    let mut code_start: Option<usize> = None;
    let mut table_start: Option<usize> = None;

    let parser = Parser::new_ext(body, Options::ENABLE_TABLES).into_offset_iter();
    for (event, range) in parser {
        match event {
            Event::Start(Tag::CodeBlock(_)) => code_start = Some(range.start),
            Event::End(TagEnd::CodeBlock) => {
                if let Some(start) = code_start.take() {
                    regions.push(start..range.end);
                }
            }
            Event::Start(Tag::Table(_)) => table_start = Some(range.start),
            Event::End(TagEnd::Table) => {
                if let Some(start) = table_start.take() {
                    regions.push(start..range.end);
                }
            }
            _ => {}
        }
    }
    regions.sort_by_key(|r| r.start);
    regions
}

fn in_any_region(offset: usize, regions: &[Range<usize>]) -> bool {
    regions.iter().any(|r| r.contains(&offset))
}

/// Splits `body` into contiguous segments at ATX header boundaries, each
/// carrying its ancestor-header `header_context`. Headers found inside an
/// atomic region (e.g. a `#` comment in a fenced shell block) don't count.
fn segment_by_headers(body: &str, atomic: &[Range<usize>]) -> Vec<(String, Range<usize>)> {
    let mut boundaries: Vec<(usize, usize, String)> = Vec::new();
    let mut offset = 0usize;
    for line in body.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if !in_any_region(offset, atomic) {
            if let Some((level, title)) = parse_atx_header(trimmed) {
                boundaries.push((offset, level, title));
            }
        }
        offset += line.len();
    }

    let mut segments = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut prev_start = 0usize;
    let mut prev_ctx = String::new();

    for (start, level, title) in boundaries {
        if start > prev_start {
            segments.push((prev_ctx.clone(), prev_start..start));
        }
        while let Some((l, _)) = stack.last() {
            if *l >= level {
                stack.pop();
            } else {
                break;
            }
        }
        stack.push((level, title));
        prev_ctx = render_header_context(&stack);
        prev_start = start;
    }
    segments.push((prev_ctx, prev_start..body.len()));
    segments.retain(|(_, r)| r.start < r.end);
    segments
}

fn parse_atx_header(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t')) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim().to_string();
    Some((hashes, title))
}

fn render_header_context(stack: &[(usize, String)]) -> String {
    stack
        .iter()
        .map(|(level, title)| format!("{} {}", "#".repeat(*level), title))
        .collect::<Vec<_>>()
        .join(" / ")
}

enum Piece {
    Atomic(String),
    Text(String),
}

/// Decomposes one segment into an ordered list of atomic (never-split) and
/// plain-text pieces, using the subset of `atomic` that overlaps the segment.
fn split_into_pieces(seg_text: &str, seg_start: usize, atomic: &[Range<usize>]) -> Vec<Piece> {
    let seg_end = seg_start + seg_text.len();
    let mut relevant: Vec<Range<usize>> = atomic
        .iter()
        .filter_map(|r| {
            let start = r.start.max(seg_start);
            let end = r.end.min(seg_end);
            (start < end).then(|| (start - seg_start)..(end - seg_start))
        })
        .collect();
    relevant.sort_by_key(|r| r.start);

    let mut pieces = Vec::new();
    let mut cursor = 0;
    for r in relevant {
        if r.start > cursor {
            pieces.push(Piece::Text(seg_text[cursor..r.start].to_string()));
        }
        pieces.push(Piece::Atomic(seg_text[r.start..r.end].to_string()));
        cursor = r.end;
    }
    if cursor < seg_text.len() {
        pieces.push(Piece::Text(seg_text[cursor..].to_string()));
    }
    pieces
}

fn chunk_segment(
    seg_text: &str,
    seg_start: usize,
    atomic: &[Range<usize>],
    counter: &dyn TokenCounter,
    max: usize,
) -> Vec<(String, bool)> {
    let pieces = split_into_pieces(seg_text, seg_start, atomic);
    let mut units: Vec<(bool, String)> = Vec::new();
    for piece in pieces {
        match piece {
            Piece::Atomic(s) => units.push((true, s)),
            Piece::Text(s) => {
                if s.trim().is_empty() {
                    continue;
                }
                if counter.count(&s) > max {
                    for sub in split_unit(&s, counter, max) {
                        if !sub.trim().is_empty() {
                            units.push((false, sub));
                        }
                    }
                } else {
                    units.push((false, s));
                }
            }
        }
    }
    if units.is_empty() {
        return Vec::new();
    }
    pack_units(units, counter, max)
}

/// Progressive subdivision: paragraphs, then sentences, then words. Recurses
/// only as far as needed to get each piece under `max`.
fn split_unit(text: &str, counter: &dyn TokenCounter, max: usize) -> Vec<String> {
    if counter.count(text) <= max {
        return vec![text.to_string()];
    }

    let paragraphs = split_paragraphs(text);
    if paragraphs.len() > 1 {
        return paragraphs
            .into_iter()
            .flat_map(|p| split_unit(&p, counter, max))
            .collect();
    }

    let sentences = split_sentences(text);
    if sentences.len() > 1 {
        return sentences
            .into_iter()
            .flat_map(|s| split_unit(&s, counter, max))
            .collect();
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() > 1 {
        return group_words(&words, counter, max);
    }

    // A single unsplittable token (e.g. one enormous word): nothing more we
    // can do without cutting inside it.
    vec![text.to_string()]
}

fn split_paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut blank_run = 0;
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            blank_run += 1;
        } else {
            if blank_run > 0 && !buf.trim().is_empty() {
                out.push(std::mem::take(&mut buf));
            }
            blank_run = 0;
        }
        buf.push_str(line);
    }
    if !buf.trim().is_empty() {
        out.push(buf);
    }
    if out.is_empty() {
        out.push(text.to_string());
    }
    out
}

/// Splits on `.`/`?`/`!` followed by whitespace, skipping a short list of
/// common abbreviations so "e.g. " doesn't get treated as a sentence end.
fn split_sentences(text: &str) -> Vec<String> {
    const ABBREVIATIONS: &[&str] = &[
        "e.g.", "i.e.", "etc.", "vs.", "Mr.", "Mrs.", "Dr.", "Ms.", "Fig.", "cf.",
    ];

    let mut out = Vec::new();
    let mut buf = String::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        buf.push(c);
        if matches!(c, '.' | '?' | '!') {
            let followed_by_space = chars.get(i + 1).is_some_and(|n| n.is_whitespace());
            let is_abbreviation = ABBREVIATIONS.iter().any(|a| buf.ends_with(a));
            if followed_by_space && !is_abbreviation {
                out.push(std::mem::take(&mut buf));
            }
        }
        i += 1;
    }
    if !buf.trim().is_empty() {
        out.push(buf);
    }
    if out.is_empty() {
        out.push(text.to_string());
    }
    out
}

fn group_words(words: &[&str], counter: &dyn TokenCounter, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    for word in words {
        let candidate = if buf.is_empty() {
            word.to_string()
        } else {
            format!("{buf} {word}")
        };
        if !buf.is_empty() && counter.count(&candidate) > max {
            out.push(std::mem::take(&mut buf));
            buf = word.to_string();
        } else {
            buf = candidate;
        }
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

/// Greedy bin-packing of ordered units into chunks no larger than `max`.
/// Atomic units larger than `max` are emitted standalone with a warning and
/// flagged `is_atomic_overflow` so the merge pass never folds anything
/// into or out of them.
fn pack_units(units: Vec<(bool, String)>, counter: &dyn TokenCounter, max: usize) -> Vec<(String, bool)> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_tokens = 0usize;

    for (is_atomic, unit) in units {
        let unit_tokens = counter.count(&unit);

        if is_atomic && unit_tokens > max {
            if !buf.is_empty() {
                chunks.push((std::mem::take(&mut buf), false));
                buf_tokens = 0;
            }
            warn!(
                tokens = unit_tokens,
                max, "atomic region exceeds max chunk size; emitting as oversized chunk"
            );
            chunks.push((unit, true));
            continue;
        }

        if !buf.is_empty() && buf_tokens + unit_tokens > max {
            chunks.push((std::mem::take(&mut buf), false));
            buf_tokens = 0;
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(&unit);
        buf_tokens = counter.count(&buf);
    }
    if !buf.is_empty() {
        chunks.push((buf, false));
    }
    chunks
}

/// Merges adjacent same-context chunks under `target`, then folds
/// below-`min` chunks into a same-context sibling (merge invariant, P8).
fn merge_pass(
    raw: Vec<RawChunk>,
    counter: &dyn TokenCounter,
    target: usize,
    min: usize,
) -> Vec<RawChunk> {
    if raw.is_empty() {
        return raw;
    }

    let mut merged: Vec<RawChunk> = Vec::new();
    for chunk in raw {
        if let Some(last) = merged.last_mut() {
            if last.header_context == chunk.header_context
                && !last.is_atomic_overflow
                && !chunk.is_atomic_overflow
            {
                let combined = format!("{}\n\n{}", last.text, chunk.text);
                let combined_tokens = counter.count(&combined);
                if combined_tokens <= target {
                    last.text = combined;
                    last.token_count = combined_tokens;
                    continue;
                }
            }
        }
        merged.push(chunk);
    }

    if merged.len() == 1 {
        return merged;
    }

    let mut result: Vec<RawChunk> = Vec::new();
    let mut i = 0;
    while i < merged.len() {
        let chunk = merged[i].clone();
        // An oversized atomic region must stand alone (P7): never fold it
        // into, or fold something else into it, regardless of size.
        if chunk.token_count < min && !chunk.is_atomic_overflow {
            if let Some(prev) = result
                .last_mut()
                .filter(|p| p.header_context == chunk.header_context && !p.is_atomic_overflow)
            {
                prev.text = format!("{}\n\n{}", prev.text, chunk.text);
                prev.token_count = counter.count(&prev.text);
                i += 1;
                continue;
            }
            if i + 1 < merged.len()
                && merged[i + 1].header_context == chunk.header_context
                && !merged[i + 1].is_atomic_overflow
            {
                merged[i + 1].text = format!("{}\n\n{}", chunk.text, merged[i + 1].text);
                merged[i + 1].token_count = counter.count(&merged[i + 1].text);
                i += 1;
                continue;
            }
        }
        result.push(chunk);
        i += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::WhitespaceCounter;

    fn counter() -> WhitespaceCounter {
        WhitespaceCounter
    }

    #[test]
    fn deterministic_output() {
        let text = "# A\n\nsome prose here\n\n## B\n\nmore prose";
        let c = counter();
        let a = chunk_text(text, &c, 10, 2000, 1);
        let b = chunk_text(text, &c, 10, 2000, 1);
        assert_eq!(
            a.iter().map(|c| c.text.clone()).collect::<Vec<_>>(),
            b.iter().map(|c| c.text.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn header_context_tracks_ancestors() {
        let text = "# A\n\nintro\n\n## B\n\nbody";
        let c = counter();
        let chunks = chunk_text(text, &c, 1000, 2000, 0);
        assert_eq!(chunks[0].header_context, "# A");
        assert_eq!(chunks[1].header_context, "# A / ## B");
    }

    #[test]
    fn never_cuts_fenced_code_block() {
        let code = "```rust\n".to_string() + &"line\n".repeat(400) + "```";
        let text = format!("# Heading\n\n{code}\n");
        let c = counter();
        // `min=50` exceeds the ~2-token heading chunk, so this exercises the
        // below-min merge branch: it must not fold the heading into the
        // oversized code chunk (the code chunk's text must stay verbatim).
        let chunks = chunk_text(&text, &c, 50, 50, 50);
        let code_chunk = chunks.iter().find(|c| c.text.contains("```rust")).unwrap();
        assert!(code_chunk.text.trim_end().ends_with("```"));
        assert!(code_chunk.text.contains(&"line\n".repeat(400)));
        assert!(!code_chunk.text.contains("# Heading"));
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn empty_file_yields_no_chunks() {
        let c = counter();
        assert!(chunk_text("", &c, 1000, 2000, 100).is_empty());
        assert!(chunk_text("   \n\n  ", &c, 1000, 2000, 100).is_empty());
    }

    #[test]
    fn frontmatter_is_stripped_before_chunking() {
        let text = "---\ntags: [a, b]\n---\n# Title\n\nbody text";
        let c = counter();
        let chunks = chunk_text(text, &c, 1000, 2000, 0);
        assert!(!chunks.iter().any(|c| c.text.contains("tags:")));
    }

    #[test]
    fn small_adjacent_same_context_chunks_merge() {
        let text = "# A\n\nfirst\n\nsecond\n\nthird";
        let c = counter();
        let chunks = chunk_text(text, &c, 1000, 2000, 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].header_context, "# A");
    }
}
