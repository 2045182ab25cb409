use crate::error::IngestError;
use crate::extractor::PageText;
use crate::models::{DocumentId, TextChunk};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Window size and overlap, both counted in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, IngestError> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::Configuration(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::Configuration(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    pub fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

/// Drops control characters other than newlines and tabs.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|ch| *ch == '\n' || *ch == '\t' || !ch.is_control())
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct PageSpan {
    number: u32,
    offset: usize,
    len: usize,
}

impl PageSpan {
    fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Windows the concatenated page text of one document.
///
/// Windows advance by `chunk_size - overlap` characters and may run across a
/// page break; the chunk is then attributed to the page holding its first
/// character. Empty pages produce nothing and leave no gap in the indices.
pub fn chunk_pages(
    document_id: DocumentId,
    pages: &[PageText],
    config: ChunkingConfig,
) -> Result<Vec<TextChunk>, IngestError> {
    config.validate()?;

    let mut chars = Vec::new();
    let mut spans = Vec::new();
    for page in pages {
        let before = chars.len();
        chars.extend(page.text.chars());
        let len = chars.len() - before;
        if len > 0 {
            spans.push(PageSpan {
                number: page.number,
                offset: before,
                len,
            });
        }
    }

    let total = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total {
        let end = (start + config.chunk_size).min(total);
        let first = locate(&spans, start);
        let last = locate(&spans, end - 1);

        chunks.push(TextChunk {
            document_id,
            chunk_index: chunks.len() as u32,
            page_number: first.number,
            page_end: last.number,
            char_start: start - first.offset,
            char_end: end - last.offset,
            text: chars[start..end].iter().collect(),
        });

        if end == total {
            break;
        }
        start += config.stride();
    }

    Ok(chunks)
}

fn locate(spans: &[PageSpan], position: usize) -> PageSpan {
    let index = spans.partition_point(|span| span.end() <= position);
    spans[index.min(spans.len() - 1)]
}
