//! Pulls frontmatter tags, inline hashtags, and outbound wiki-links out of a
//! note's raw text. Tags are case-preserving and deduplicated (I6); links are
//! used both for chunk metadata and link-graph analytics.

use crate::chunker::{detect_atomic_regions, strip_frontmatter};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static HASHTAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:^|\s)#([\w/-]+)").unwrap());
static WIKILINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]|#]+)(?:[|#][^\]]+)?\]\]").unwrap());

#[derive(Debug, Clone, Default)]
pub struct ExtractedMetadata {
    pub tags: Vec<String>,
    pub outbound_links: Vec<String>,
}

/// Extracts tags and outbound links from a note's full on-disk text
/// (frontmatter included).
pub fn extract(text: &str) -> ExtractedMetadata {
    let (body, frontmatter_yaml) = strip_frontmatter(text);
    let mut tags = frontmatter_tags(frontmatter_yaml.as_deref());
    tags.extend(inline_hashtags(&body));
    dedup_preserve_order(&mut tags);

    let mut links: Vec<String> = WIKILINK_RE
        .captures_iter(&body)
        .map(|cap| cap[1].trim().to_string())
        .collect();
    dedup_preserve_order(&mut links);

    ExtractedMetadata {
        tags,
        outbound_links: links,
    }
}

fn frontmatter_tags(yaml: Option<&str>) -> Vec<String> {
    let Some(yaml) = yaml else {
        return Vec::new();
    };
    let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(yaml) else {
        return Vec::new();
    };
    let Some(tags_value) = value.get("tags") else {
        return Vec::new();
    };
    match tags_value {
        serde_yaml::Value::Sequence(seq) => seq
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        serde_yaml::Value::String(s) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Inline `#tag` occurrences, excluding matches inside fenced code blocks or
/// tables (the chunker's atomic regions).
fn inline_hashtags(body: &str) -> Vec<String> {
    let atomic = detect_atomic_regions(body);
    HASHTAG_RE
        .captures_iter(body)
        .filter_map(|cap| {
            let m = cap.get(1)?;
            if atomic.iter().any(|r| r.contains(&m.start())) {
                return None;
            }
            Some(m.as_str().to_string())
        })
        .collect()
}

fn dedup_preserve_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|t| seen.insert(t.clone()));
}

/// `note_title` addressing metadata: the file stem without extension.
pub fn note_title(relative_path: &str) -> String {
    Path::new(relative_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| relative_path.to_string())
}

/// `folder` addressing metadata: the parent directory, "/"-joined, or "" at
/// the source root.
pub fn folder(relative_path: &str) -> String {
    Path::new(relative_path)
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .filter(|s| !s.is_empty() && s != ".")
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_and_inline_tags_union_dedup() {
        let text = "---\ntags: [work, Project]\n---\nnotes about #work and #personal";
        let meta = extract(text);
        assert_eq!(meta.tags, vec!["work", "Project", "personal"]);
    }

    #[test]
    fn hashtag_inside_code_block_excluded() {
        let text = "intro #real\n\n```\n# not a tag #fake\n```\n";
        let meta = extract(text);
        assert_eq!(meta.tags, vec!["real"]);
    }

    #[test]
    fn wikilinks_strip_alias_and_anchor() {
        let text = "see [[Target Note|display text]] and [[Other#section]]";
        let meta = extract(text);
        assert_eq!(meta.outbound_links, vec!["Target Note", "Other"]);
    }

    #[test]
    fn note_title_and_folder_from_path() {
        assert_eq!(note_title("projects/alpha.md"), "alpha");
        assert_eq!(folder("projects/alpha.md"), "projects");
        assert_eq!(folder("alpha.md"), "");
    }
}
