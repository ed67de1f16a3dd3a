use std::path::Path;

use text_splitter::{ChunkConfig, TextSplitter};
use thiserror::Error;

use crate::document::Chunk;

/// Extensions the text parser will accept. Binary formats (pdf, docx) need a
/// dedicated parser implementing [`DocumentParser`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "csv"];

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unsupported file format: .{0}")]
    UnsupportedFormat(String),
    #[error("File not found: {0}")]
    Missing(String),
    #[error("Invalid chunking parameters: {0}")]
    Chunking(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits a document into ordered chunks.
///
/// Implementations must be deterministic: identical file content yields an
/// identical chunk sequence, since persisted embeddings are re-associated
/// with chunks by ordinal after a restart.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Vec<Chunk>, ParseError>;

    fn supports(&self, extension: &str) -> bool;

    fn validate(&self, path: &Path) -> Result<(), ParseError> {
        if !path.is_file() {
            return Err(ParseError::Missing(path.display().to_string()));
        }
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if self.supports(&extension) {
            Ok(())
        } else {
            Err(ParseError::UnsupportedFormat(extension))
        }
    }
}

/// Character-budget splitter for plain-text formats.
pub struct TextDocumentParser {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextDocumentParser {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }
}

impl DocumentParser for TextDocumentParser {
    fn parse(&self, path: &Path) -> Result<Vec<Chunk>, ParseError> {
        self.validate(path)?;

        let document_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_owned)
            .ok_or_else(|| ParseError::Missing(path.display().to_string()))?;

        let text = std::fs::read_to_string(path)?;

        let chunk_config = ChunkConfig::new(self.chunk_size)
            .with_overlap(self.chunk_overlap)
            .map_err(|e| ParseError::Chunking(e.to_string()))?;
        let splitter = TextSplitter::new(chunk_config);

        Ok(splitter
            .chunks(&text)
            .enumerate()
            .map(|(ordinal, piece)| Chunk::new(piece.to_owned(), document_name.clone(), ordinal))
            .collect())
    }

    fn supports(&self, extension: &str) -> bool {
        SUPPORTED_EXTENSIONS.contains(&extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("Failed to create fixture file");
        file.write_all(content.as_bytes())
            .expect("Failed to write fixture file");
        path
    }

    #[test]
    fn test_parse_is_deterministic() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let content = "alpha beta gamma. ".repeat(200);
        let path = write_fixture(&dir, "notes.txt", &content);

        let parser = TextDocumentParser::new(100, 20);
        let first = parser.parse(&path).expect("Failed to parse fixture");
        let second = parser.parse(&path).expect("Failed to parse fixture again");

        assert!(first.len() > 1, "Expected the fixture to split");
        assert_eq!(first, second);
        for (i, chunk) in first.iter().enumerate() {
            assert_eq!(chunk.metadata.ordinal, i);
            assert_eq!(chunk.metadata.source_document, "notes.txt");
        }
    }

    #[test]
    fn test_unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_fixture(&dir, "slides.pptx", "unused");

        let parser = TextDocumentParser::new(600, 150);
        match parser.parse(&path) {
            Err(ParseError::UnsupportedFormat(ext)) => assert_eq!(ext, "pptx"),
            other => panic!("Expected UnsupportedFormat error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let parser = TextDocumentParser::new(600, 150);
        match parser.parse(Path::new("/nonexistent/notes.txt")) {
            Err(ParseError::Missing(_)) => {}
            other => panic!("Expected Missing error, got {other:?}"),
        }
    }
}
