use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use crate::retrieval::Retriever;
use crate::{RagError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub filename: String,
    pub text: String,
}

impl Document {
    pub fn new(filename: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            text: text.into(),
        }
    }
}

/// A span of a document. `start`/`end` are character offsets, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub document: String,
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
    pub text: String,
}

/// Fixed-size character chunker: chunk `i` starts at `i * (size - overlap)`.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::InvalidConfiguration(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::InvalidConfiguration(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    /// Lazily yields the chunks of `document`. The iterator is `Clone`, so
    /// the sequence can be restarted from any point.
    pub fn chunks<'a>(&self, document: &'a Document) -> ChunkIter<'a> {
        let boundaries: Vec<usize> = document
            .text
            .char_indices()
            .map(|(offset, _)| offset)
            .chain(std::iter::once(document.text.len()))
            .collect();

        ChunkIter {
            document,
            boundaries: Arc::new(boundaries),
            chunk_size: self.chunk_size,
            step: self.chunk_size - self.chunk_overlap,
            chunk_overlap: self.chunk_overlap,
            next_index: 0,
            done: document.text.is_empty(),
        }
    }

    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        self.chunks(document).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkIter<'a> {
    document: &'a Document,
    // byte offset of every char, plus the text length
    boundaries: Arc<Vec<usize>>,
    chunk_size: usize,
    step: usize,
    chunk_overlap: usize,
    next_index: usize,
    done: bool,
}

impl Iterator for ChunkIter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }

        let char_len = self.boundaries.len() - 1;
        let start = self.next_index * self.step;
        let end = (start + self.chunk_size).min(char_len);
        let index = self.next_index;

        self.next_index += 1;
        if end == char_len {
            self.done = true;
        }

        Some(Chunk {
            document: self.document.filename.clone(),
            index,
            start,
            end,
            overlap: if index == 0 { 0 } else { self.chunk_overlap },
            text: self.document.text[self.boundaries[start]..self.boundaries[end]].to_string(),
        })
    }
}

pub struct IngestionPipeline {
    chunker: Chunker,
    retriever: Arc<Retriever>,
    supported_formats: Vec<String>,
}

impl IngestionPipeline {
    pub fn new(chunker: Chunker, retriever: Arc<Retriever>) -> Self {
        Self {
            chunker,
            retriever,
            supported_formats: vec!["txt".to_string(), "md".to_string()],
        }
    }

    pub fn with_supported_formats(mut self, formats: Vec<String>) -> Self {
        self.supported_formats = formats;
        self
    }

    pub fn is_supported(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.supported_formats
                    .iter()
                    .any(|format| format.eq_ignore_ascii_case(ext))
            })
    }

    /// Chunks the document and indexes the chunks, replacing whatever was
    /// indexed before under the same filename. Returns the chunk count.
    pub async fn ingest(&self, document: &Document) -> Result<usize> {
        let chunks = self.chunker.chunk(document);
        if chunks.is_empty() {
            warn!(filename = %document.filename, "No chunks created from document");
            return Ok(0);
        }

        let indexed = self.retriever.index(&document.filename, &chunks).await?;
        info!(filename = %document.filename, chunks = indexed, "Indexed document");
        Ok(indexed)
    }

    pub async fn process_directory(&self, dir_path: &Path) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        let mut entries = tokio::fs::read_dir(dir_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !self.is_supported(filename) {
                continue;
            }

            match tokio::fs::read_to_string(&path).await {
                Ok(text) => documents.push(Document::new(filename, text)),
                Err(e) => warn!("Failed to read file {:?}: {}", path, e),
            }
        }

        documents.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(documents)
    }

    /// Seeds the index from a directory. Per-file failures are logged and
    /// skipped; the total number of chunks indexed is returned.
    pub async fn ingest_directory(&self, dir_path: &Path) -> Result<usize> {
        let documents = self.process_directory(dir_path).await?;
        let mut total_chunks = 0;

        for document in &documents {
            match self.ingest(document).await {
                Ok(count) => total_chunks += count,
                Err(e) => warn!(filename = %document.filename, error = %e, "Failed to index document"),
            }
        }

        info!(directory = ?dir_path, documents = documents.len(), total_chunks, "Loaded documents from directory");
        Ok(total_chunks)
    }
}
