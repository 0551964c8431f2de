use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// A contiguous span of a source document's text, produced at indexing time.
///
/// `chunk_index` is zero-based and globally sequential across all pages of a
/// document; `total_chunks` carries the same value on every chunk of that
/// document. Character offsets are approximate (token re-joining loses the
/// original whitespace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub token_count: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub page_number: Option<usize>,
    pub document_id: String,
    pub document_title: String,
}

/// Identity attached to every chunk of one document.
#[derive(Debug, Clone, Default)]
pub struct DocumentMeta {
    pub document_id: String,
    pub document_title: String,
}

/// A page of extracted text, as delivered by the extraction collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageText {
    pub page_number: usize,
    pub text: String,
}

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("chunk_overlap ({overlap}) must be less than chunk_size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },

    #[error("chunk_size must be greater than zero")]
    ZeroChunkSize,
}

/// Splits text into overlapping, token-bounded chunks.
///
/// Token counts come from [`estimate_tokens`], a word/punctuation split that
/// approximates a real tokenizer; downstream size limits tolerate roughly
/// ±20% error, so the approximation is acceptable.
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

fn token_regex() -> &'static Regex {
    static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();
    TOKEN_REGEX.get_or_init(|| Regex::new(r"\b\w+\b|[^\w\s]").expect("valid token regex"))
}

fn sentence_regex() -> &'static Regex {
    static SENTENCE_REGEX: OnceLock<Regex> = OnceLock::new();
    SENTENCE_REGEX.get_or_init(|| Regex::new(r"[.!?]\s+").expect("valid sentence regex"))
}

/// Estimate the number of tokens in `text`.
///
/// Splits on word boundaries and punctuation. This is an approximation, not
/// a real tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    token_regex().find_iter(text).count()
}

fn tokenize(text: &str) -> Vec<&str> {
    token_regex().find_iter(text).map(|m| m.as_str()).collect()
}

impl TextChunker {
    /// Create a chunker. Fails if `chunk_overlap >= chunk_size`: the sliding
    /// window advances by `chunk_size - chunk_overlap` each step, so a larger
    /// overlap could never make forward progress.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ChunkerError> {
        if chunk_size == 0 {
            return Err(ChunkerError::ZeroChunkSize);
        }
        if chunk_overlap >= chunk_size {
            return Err(ChunkerError::OverlapTooLarge {
                size: chunk_size,
                overlap: chunk_overlap,
            });
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split `text` into chunks carrying `meta` and an optional page number.
    ///
    /// Empty or whitespace-only input produces zero chunks, not an error.
    pub fn chunk(&self, text: &str, meta: &DocumentMeta, page_number: Option<usize>) -> Vec<Chunk> {
        if text.trim().is_empty() {
            tracing::debug!("Empty text provided for chunking");
            return Vec::new();
        }

        let mut chunks = if self.chunk_overlap > 0 {
            self.sliding_window_chunks(text, meta, page_number)
        } else {
            self.sentence_chunks(text, meta, page_number)
        };

        let total = chunks.len();
        for chunk in &mut chunks {
            chunk.total_chunks = total;
        }

        tracing::debug!(
            "Created {} chunks (size={}, overlap={})",
            total,
            self.chunk_size,
            self.chunk_overlap
        );
        chunks
    }

    /// Chunk a document page by page, then renumber `chunk_index` and
    /// `total_chunks` globally across the whole document. A raw chunk never
    /// spans two pages.
    pub fn chunk_pages(&self, pages: &[PageText], meta: &DocumentMeta) -> Vec<Chunk> {
        let mut all_chunks = Vec::new();

        for page in pages {
            if page.text.trim().is_empty() {
                continue;
            }
            all_chunks.extend(self.chunk(&page.text, meta, Some(page.page_number)));
        }

        let total = all_chunks.len();
        for (i, chunk) in all_chunks.iter_mut().enumerate() {
            chunk.chunk_index = i;
            chunk.total_chunks = total;
        }

        tracing::info!("Created {} chunks from {} pages", total, pages.len());
        all_chunks
    }

    /// Sliding window over the token stream: each chunk covers
    /// `[start, min(start + chunk_size, total))`, the start advancing by
    /// `chunk_size - chunk_overlap` (minimum 1) per iteration.
    fn sliding_window_chunks(
        &self,
        text: &str,
        meta: &DocumentMeta,
        page_number: Option<usize>,
    ) -> Vec<Chunk> {
        let tokens = tokenize(text);
        let total_tokens = tokens.len();
        if total_tokens == 0 {
            return Vec::new();
        }

        let step = (self.chunk_size - self.chunk_overlap).max(1);

        let mut chunks = Vec::new();
        let mut chunk_index = 0;
        let mut start_token = 0;

        while start_token < total_tokens {
            let end_token = (start_token + self.chunk_size).min(total_tokens);
            let chunk_tokens = &tokens[start_token..end_token];
            let chunk_text = chunk_tokens.join(" ");

            // Approximate character offsets: tokens re-joined with single
            // spaces, so the prefix length stands in for the true offset.
            let start_char = if start_token > 0 {
                tokens[..start_token].join(" ").len() + 1
            } else {
                0
            };
            let end_char = start_char + chunk_text.len();

            chunks.push(Chunk {
                token_count: chunk_tokens.len(),
                text: chunk_text,
                chunk_index,
                total_chunks: 0,
                start_char,
                end_char,
                page_number,
                document_id: meta.document_id.clone(),
                document_title: meta.document_title.clone(),
            });
            chunk_index += 1;

            if end_token >= total_tokens {
                break;
            }
            start_token += step;
        }

        chunks
    }

    /// Non-overlapping mode: accumulate whole sentences up to the token
    /// budget. A single sentence longer than `chunk_size` tokens is split by
    /// individual words rather than emitted oversized.
    fn sentence_chunks(
        &self,
        text: &str,
        meta: &DocumentMeta,
        page_number: Option<usize>,
    ) -> Vec<Chunk> {
        let segments = self.split_text_by_tokens(text);

        let mut chunks = Vec::new();
        let mut char_position = 0;

        for (i, segment) in segments.into_iter().enumerate() {
            let mut probe_len = segment.len().min(50);
            while probe_len > 0 && !segment.is_char_boundary(probe_len) {
                probe_len -= 1;
            }
            let start_char = text[char_position..]
                .find(&segment[..probe_len])
                .map(|offset| char_position + offset)
                .unwrap_or(char_position);
            let end_char = start_char + segment.len();

            chunks.push(Chunk {
                token_count: estimate_tokens(&segment),
                text: segment,
                chunk_index: i,
                total_chunks: 0,
                start_char,
                end_char,
                page_number,
                document_id: meta.document_id.clone(),
                document_title: meta.document_title.clone(),
            });
            char_position = end_char.min(text.len());
        }

        chunks
    }

    fn split_text_by_tokens(&self, text: &str) -> Vec<String> {
        // Sentence boundaries: keep the terminator with the sentence.
        let mut sentences: Vec<&str> = Vec::new();
        let mut last = 0;
        for m in sentence_regex().find_iter(text) {
            sentences.push(text[last..m.start() + 1].trim());
            last = m.end();
        }
        if last < text.len() {
            sentences.push(text[last..].trim());
        }
        sentences.retain(|s| !s.is_empty());

        let mut segments = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0;

        for sentence in sentences {
            let sentence_tokens = estimate_tokens(sentence);

            if sentence_tokens > self.chunk_size {
                if !current.is_empty() {
                    segments.push(current.join(" "));
                    current.clear();
                    current_tokens = 0;
                }
                // Oversized sentence: fall back to splitting by words.
                let mut words: Vec<&str> = Vec::new();
                let mut word_tokens = 0;
                for word in sentence.split_whitespace() {
                    let count = estimate_tokens(word);
                    if word_tokens + count > self.chunk_size && !words.is_empty() {
                        segments.push(words.join(" "));
                        words.clear();
                        word_tokens = 0;
                    }
                    words.push(word);
                    word_tokens += count;
                }
                if !words.is_empty() {
                    segments.push(words.join(" "));
                }
            } else if current_tokens + sentence_tokens > self.chunk_size {
                if !current.is_empty() {
                    segments.push(current.join(" "));
                }
                current = vec![sentence];
                current_tokens = sentence_tokens;
            } else {
                current.push(sentence);
                current_tokens += sentence_tokens;
            }
        }

        if !current.is_empty() {
            segments.push(current.join(" "));
        }

        segments
    }
}
