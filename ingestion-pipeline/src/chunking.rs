//! Chunking: heading split, late chunking over embedder windows with heading
//! attachment by interval overlap, contextual-section fallback, oversize
//! sub-splitting, and the deterministic chunk-role classifier.

use text_splitter::TextSplitter;

use common::{
    error::AppError,
    storage::types::content_chunk::ChunkRole,
    utils::embedding::EmbeddingProvider,
};

/// Chunk produced by a strategy, ready for persistence.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub chunk_role: ChunkRole,
    pub heading_path: Vec<String>,
    pub section_ref: Option<String>,
    pub clause_id: Option<String>,
}

/// One markdown section with its byte interval in the source text.
#[derive(Debug, Clone)]
pub struct Section {
    pub heading_path: Vec<String>,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
}

/// Split markdown text by headings, tracking the heading breadcrumb and the
/// byte interval each section covers.
pub fn split_by_headings(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut breadcrumb: Vec<(usize, String)> = Vec::new();
    let mut current_start = 0usize;
    let mut current_body = String::new();
    let mut current_path: Vec<String> = Vec::new();
    let mut offset = 0usize;

    let mut flush =
        |sections: &mut Vec<Section>, start: usize, end: usize, body: &str, path: &[String]| {
            if !body.trim().is_empty() {
                sections.push(Section {
                    heading_path: path.to_vec(),
                    text: body.trim_end().to_owned(),
                    char_start: start,
                    char_end: end,
                });
            }
        };

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let trimmed = line.trim_end();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        let is_heading = hashes >= 1 && hashes <= 6 && trimmed.chars().nth(hashes) == Some(' ');

        if is_heading {
            flush(
                &mut sections,
                current_start,
                line_start,
                &current_body,
                &current_path,
            );
            let title = trimmed[hashes + 1..].trim().to_owned();
            breadcrumb.retain(|(level, _)| *level < hashes);
            breadcrumb.push((hashes, title));
            current_path = breadcrumb.iter().map(|(_, title)| title.clone()).collect();
            current_body = String::new();
            current_start = offset;
        } else {
            current_body.push_str(line);
        }
    }
    flush(
        &mut sections,
        current_start,
        offset,
        &current_body,
        &current_path,
    );

    if sections.is_empty() && !text.trim().is_empty() {
        sections.push(Section {
            heading_path: Vec::new(),
            text: text.trim().to_owned(),
            char_start: 0,
            char_end: text.len(),
        });
    }

    sections
}

const FRONTMATTER_PHRASES: [&str; 8] = [
    "all rights reserved",
    "copyright",
    "publicado por",
    "published by",
    "foreword",
    "prólogo",
    "prefacio",
    "isbn",
];

/// Deterministic text heuristic: dot-leader lines, clause-reference density,
/// and known frontmatter phrases decide the structural role.
pub fn classify_chunk_role(text: &str) -> ChunkRole {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    if lines.is_empty() {
        return ChunkRole::NormativeBody;
    }

    let dot_leader_lines = lines
        .iter()
        .filter(|line| {
            let has_leader = line.contains("....") || line.contains(". . . .");
            let ends_with_page = line
                .trim_end()
                .rsplit(|c: char| !c.is_ascii_digit())
                .next()
                .map(|digits| !digits.is_empty() && digits.len() <= 4)
                .unwrap_or(false);
            has_leader && ends_with_page
        })
        .count();
    if dot_leader_lines * 2 >= lines.len() && dot_leader_lines >= 2 {
        return ChunkRole::Toc;
    }

    // Short clause-reference lines ("4.1 Understanding the organization ... 9")
    // without body prose also read as a table of contents.
    let clause_index_lines = lines
        .iter()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.len() < 80
                && trimmed
                    .split_whitespace()
                    .next()
                    .map(|first| {
                        first.chars().all(|c| c.is_ascii_digit() || c == '.')
                            && first.contains('.')
                    })
                    .unwrap_or(false)
                && trimmed
                    .trim_end()
                    .chars()
                    .last()
                    .map(|c| c.is_ascii_digit())
                    .unwrap_or(false)
        })
        .count();
    if clause_index_lines * 2 >= lines.len() && clause_index_lines >= 3 {
        return ChunkRole::Toc;
    }

    let lowered = text.to_lowercase();
    let phrase_hits = FRONTMATTER_PHRASES
        .iter()
        .filter(|phrase| lowered.contains(*phrase))
        .count();
    if phrase_hits >= 2 || (phrase_hits >= 1 && lines.len() <= 6) {
        return ChunkRole::Frontmatter;
    }

    ChunkRole::NormativeBody
}

/// Late chunking: embed fixed windows over the whole text in one pass, then
/// attach heading paths by interval overlap against the heading split.
pub async fn late_chunk_document(
    embedder: &EmbeddingProvider,
    text: &str,
    sections: &[Section],
) -> Result<Vec<PreparedChunk>, AppError> {
    let windows = embedder.late_chunk(text).await?;

    Ok(windows
        .into_iter()
        .map(|window| {
            let heading_path = heading_for_interval(sections, window.char_start, window.char_end);
            let role = classify_chunk_role(&window.content);
            PreparedChunk {
                clause_id: leading_clause_id(&heading_path),
                section_ref: heading_path.last().cloned(),
                embedding: if role == ChunkRole::NormativeBody {
                    Some(window.embedding)
                } else {
                    None
                },
                content: window.content,
                chunk_role: role,
                heading_path,
            }
        })
        .collect())
}

/// Heading path of the section with the largest overlap against the window.
fn heading_for_interval(sections: &[Section], start: usize, end: usize) -> Vec<String> {
    let mut best: (usize, &[String]) = (0, &[]);
    for section in sections {
        let overlap_start = start.max(section.char_start);
        let overlap_end = end.min(section.char_end);
        let overlap = overlap_end.saturating_sub(overlap_start);
        if overlap > best.0 {
            best = (overlap, &section.heading_path);
        }
    }
    best.1.to_vec()
}

const PARENT_CONTEXT_EXCERPT_CHARS: usize = 240;

/// Contextual section chunking, the fallback when late chunking fails: each
/// section gets a short parent-context block (global breadcrumb + excerpt +
/// section path) injected before its text, then is embedded independently.
pub async fn contextual_section_chunks(
    embedder: &EmbeddingProvider,
    full_text: &str,
    sections: &[Section],
    max_block_chars: usize,
) -> Result<Vec<PreparedChunk>, AppError> {
    let document_excerpt: String = full_text
        .trim()
        .chars()
        .take(PARENT_CONTEXT_EXCERPT_CHARS)
        .collect();

    let mut prepared: Vec<PreparedChunk> = Vec::new();
    for section in sections {
        for piece in sub_split(&section.text, max_block_chars)? {
            let role = classify_chunk_role(&piece);
            let content = if role == ChunkRole::NormativeBody {
                let breadcrumb = section.heading_path.join(" > ");
                format!(
                    "[context] {breadcrumb}\n{document_excerpt}\n[section] {breadcrumb}\n\n{piece}"
                )
            } else {
                piece.clone()
            };

            let embedding = if role == ChunkRole::NormativeBody {
                Some(embedder.embed(&content).await?)
            } else {
                None
            };

            prepared.push(PreparedChunk {
                clause_id: leading_clause_id(&section.heading_path),
                section_ref: section.heading_path.last().cloned(),
                content,
                embedding,
                chunk_role: role,
                heading_path: section.heading_path.clone(),
            });
        }
    }

    Ok(prepared)
}

/// Sub-split an oversized section at paragraph boundaries.
fn sub_split(text: &str, max_block_chars: usize) -> Result<Vec<String>, AppError> {
    if text.len() <= max_block_chars {
        return Ok(vec![text.to_owned()]);
    }
    let splitter = TextSplitter::new(max_block_chars.max(1));
    Ok(splitter
        .chunks(text)
        .map(str::to_owned)
        .filter(|piece| !piece.trim().is_empty())
        .collect())
}

/// A heading like `"8.5.1 Control of production"` yields clause id `8.5.1`.
fn leading_clause_id(heading_path: &[String]) -> Option<String> {
    let leaf = heading_path.last()?;
    let first = leaf.split_whitespace().next()?;
    let candidate = first.trim_end_matches('.');
    let is_clause = candidate.contains('.')
        && candidate
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.');
    if is_clause {
        Some(candidate.to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# 8 Operation\n\nIntro paragraph for operation.\n\n## 8.5.1 Control of production\n\nProduction shall be carried out under controlled conditions with monitoring.\n\n## 8.5.2 Identification\n\nOutputs shall be identified by suitable means through production.\n";

    #[test]
    fn heading_split_tracks_breadcrumbs_and_intervals() {
        let sections = split_by_headings(DOC);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].heading_path, vec!["8 Operation"]);
        assert_eq!(
            sections[1].heading_path,
            vec!["8 Operation", "8.5.1 Control of production"]
        );
        assert!(sections[1].char_start > sections[0].char_end - 1);
        assert!(DOC[sections[1].char_start..sections[1].char_end].contains("controlled conditions"));
    }

    #[test]
    fn headingless_text_becomes_one_section() {
        let sections = split_by_headings("plain paragraph without headings");
        assert_eq!(sections.len(), 1);
        assert!(sections[0].heading_path.is_empty());
    }

    #[test]
    fn toc_pages_are_classified() {
        let toc = "1 Scope .......... 1\n2 Normative references .......... 2\n3 Terms .......... 3\n4 Context .......... 7\n";
        assert_eq!(classify_chunk_role(toc), ChunkRole::Toc);

        let clause_index = "4.1 Understanding the organization 9\n4.2 Needs of interested parties 10\n4.3 Scope determination 11\n4.4 Management system 12";
        assert_eq!(classify_chunk_role(clause_index), ChunkRole::Toc);
    }

    #[test]
    fn frontmatter_is_classified() {
        let frontmatter =
            "Copyright 2024 Example Org\nAll rights reserved.\nISBN 978-0-0000-0000-0";
        assert_eq!(classify_chunk_role(frontmatter), ChunkRole::Frontmatter);
    }

    #[test]
    fn body_text_is_normative() {
        let body = "The organization shall plan, implement and control the processes needed to meet requirements.";
        assert_eq!(classify_chunk_role(body), ChunkRole::NormativeBody);
    }

    #[tokio::test]
    async fn late_chunking_attaches_headings_by_overlap() {
        let embedder = EmbeddingProvider::new_hashed(16).expect("embedder");
        let sections = split_by_headings(DOC);
        let chunks = late_chunk_document(&embedder, DOC, &sections)
            .await
            .expect("late chunks");

        assert!(!chunks.is_empty());
        for chunk in &chunks {
            if chunk.chunk_role == ChunkRole::NormativeBody {
                assert!(chunk.embedding.is_some(), "eligible chunks carry vectors");
            }
        }
        // The document is short enough for one window; it must resolve to the
        // heading with the largest overlap.
        assert!(!chunks[0].heading_path.is_empty());
    }

    #[tokio::test]
    async fn contextual_chunks_inject_parent_context() {
        let embedder = EmbeddingProvider::new_hashed(16).expect("embedder");
        let sections = split_by_headings(DOC);
        let chunks = contextual_section_chunks(&embedder, DOC, &sections, 30_000)
            .await
            .expect("contextual chunks");

        assert_eq!(chunks.len(), 3);
        let clause_chunk = chunks
            .iter()
            .find(|chunk| chunk.clause_id.as_deref() == Some("8.5.1"))
            .expect("clause chunk");
        assert!(clause_chunk.content.starts_with("[context] "));
        assert!(clause_chunk.content.contains("[section] "));
        assert!(clause_chunk.content.contains("controlled conditions"));
        assert_eq!(
            clause_chunk.section_ref.as_deref(),
            Some("8.5.1 Control of production")
        );
    }

    #[tokio::test]
    async fn oversized_sections_are_sub_split() {
        let embedder = EmbeddingProvider::new_hashed(8).expect("embedder");
        let long_paragraphs = "A sentence about controls.\n\n".repeat(40);
        let text = format!("# Long\n\n{long_paragraphs}");
        let sections = split_by_headings(&text);

        let chunks = contextual_section_chunks(&embedder, &text, &sections, 300)
            .await
            .expect("chunks");
        assert!(chunks.len() > 1, "long section must split into several blocks");
    }

    #[test]
    fn clause_id_extraction_from_headings() {
        assert_eq!(
            leading_clause_id(&["8 Operation".into(), "8.5.1 Control".into()]),
            Some("8.5.1".to_owned())
        );
        assert_eq!(leading_clause_id(&["Introduction".into()]), None);
        assert_eq!(leading_clause_id(&[]), None);
    }
}
