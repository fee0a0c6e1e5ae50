//! Word-window chunking over parsed pages.
//!
//! The text encoder has a 77-token budget, so chunks are kept to ~25 words
//! with ~12 words of overlap; the average word-to-token ratio leaves a
//! comfortable margin. Pages chunk independently and in parallel.

use rayon::prelude::*;
use regex::Regex;
use std::sync::LazyLock;

use crate::types::ContentType;

/// Heading lines and blank-line separated paragraphs delimit units.
static UNIT_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#+\s.*$|\n{2,}").expect("unit split regex is valid"));

/// Output of the parsing stage, one per page.
#[derive(Debug, Clone, Default)]
pub struct PageItem {
    pub page: i32,
    pub text: String,
    /// Paths of images extracted from the page, already written to the
    /// ingestion scratch directory by the extractor.
    pub image_paths: Vec<String>,
    pub captions: Vec<String>,
    pub is_ocr: bool,
}

/// One chunk ready for embedding and storage.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub text: String,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub is_ocr: bool,
    pub is_figure: bool,
    pub content_type: ContentType,
    pub image_path: Option<String>,
}

pub struct Chunker {
    max_words: usize,
    overlap_words: usize,
}

impl Chunker {
    pub fn new(max_words: usize, overlap_words: usize) -> Self {
        Self {
            max_words,
            overlap_words,
        }
    }

    /// Chunk all pages. Page order is preserved in the output.
    pub fn chunk_pages(&self, pages: &[PageItem]) -> Vec<ChunkDraft> {
        pages
            .par_iter()
            .map(|page| self.chunk_page(page))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    }

    fn chunk_page(&self, page: &PageItem) -> Vec<ChunkDraft> {
        let mut chunks = Vec::new();

        let text_content_type = if page.text.is_empty() {
            ContentType::Text
        } else {
            ContentType::PdfText
        };

        // Text windows. A page with images turns its text chunks
        // multimodal, paired with the first page image.
        let page_image = page.image_paths.first();
        let windows = self.window_units(&page.text);
        for window in windows {
            let (content_type, image_path) = match page_image {
                Some(path) => (ContentType::Multimodal, Some(path.clone())),
                None => (text_content_type, None),
            };
            chunks.push(ChunkDraft {
                text: window,
                page_start: Some(page.page),
                page_end: Some(page.page),
                is_ocr: page.is_ocr,
                is_figure: false,
                content_type,
                image_path,
            });
        }

        // Standalone image chunks when the page has several images or no
        // text at all.
        if page.image_paths.len() > 1 || page.text.trim().is_empty() {
            for (idx, path) in page.image_paths.iter().enumerate() {
                let caption = page
                    .captions
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| format!("[Image {} from page {}]", idx + 1, page.page));
                chunks.push(ChunkDraft {
                    text: caption,
                    page_start: Some(page.page),
                    page_end: Some(page.page),
                    is_ocr: page.is_ocr,
                    is_figure: true,
                    content_type: ContentType::PdfImage,
                    image_path: Some(path.clone()),
                });
            }
        }

        // Figure captions index as their own text chunks.
        for caption in &page.captions {
            if caption.trim().is_empty() {
                continue;
            }
            chunks.push(ChunkDraft {
                text: caption.clone(),
                page_start: Some(page.page),
                page_end: Some(page.page),
                is_ocr: page.is_ocr,
                is_figure: true,
                content_type: ContentType::Text,
                image_path: None,
            });
        }

        chunks
    }

    /// Split the page text into heading/paragraph units and pack them into
    /// overlapping word windows.
    fn window_units(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let units: Vec<&str> = UNIT_SPLIT_RE
            .split(text)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .collect();

        let mut windows = Vec::new();
        let mut buf: Vec<String> = Vec::new();
        let mut count = 0usize;

        for unit in units {
            let words = unit.split_whitespace().count();
            if count + words > self.max_words && !buf.is_empty() {
                let window = buf.join(" ");
                let overlap: Vec<&str> = window
                    .split_whitespace()
                    .rev()
                    .take(self.overlap_words)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                let overlap_text = overlap.join(" ");
                windows.push(window);
                count = overlap_text.split_whitespace().count() + words;
                buf = vec![overlap_text, unit.to_string()];
            } else {
                buf.push(unit.to_string());
                count += words;
            }
        }

        if !buf.is_empty() {
            let window = buf.join(" ");
            if !window.trim().is_empty() {
                windows.push(window);
            }
        }

        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_short_text_single_window() {
        let chunker = Chunker::new(25, 12);
        let windows = chunker.window_units("a handful of words only");
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0], "a handful of words only");
    }

    #[test]
    fn test_long_text_splits_with_overlap() {
        let chunker = Chunker::new(25, 12);
        // Two paragraphs of 20 words exceed the 25-word budget together.
        let text = format!("{}\n\n{}", words(20), words(20));
        let windows = chunker.window_units(&text);
        assert_eq!(windows.len(), 2);
        // Second window starts with the 12-word overlap tail of the first.
        let first_tail: Vec<&str> = windows[0].split_whitespace().rev().take(12).collect();
        let second_head: Vec<&str> = windows[1].split_whitespace().take(12).collect();
        let mut first_tail_fwd = first_tail.clone();
        first_tail_fwd.reverse();
        assert_eq!(first_tail_fwd, second_head);
    }

    #[test]
    fn test_windows_respect_word_budget_per_unit_packing() {
        let chunker = Chunker::new(25, 12);
        let text = format!("{}\n\n{}\n\n{}", words(10), words(10), words(10));
        let windows = chunker.window_units(&text);
        // First two units pack into one window (20 words <= 25), the third
        // spills over.
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].split_whitespace().count(), 20);
    }

    #[test]
    fn test_page_with_image_produces_multimodal_chunks() {
        let chunker = Chunker::new(25, 12);
        let page = PageItem {
            page: 3,
            text: "diagram of the cooling system".to_string(),
            image_paths: vec!["/tmp/p3_img0.png".to_string()],
            captions: vec![],
            is_ocr: false,
        };
        let chunks = chunker.chunk_pages(&[page]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content_type, ContentType::Multimodal);
        assert_eq!(chunks[0].image_path.as_deref(), Some("/tmp/p3_img0.png"));
        assert_eq!(chunks[0].page_start, Some(3));
    }

    #[test]
    fn test_image_only_page_produces_figure_chunk() {
        let chunker = Chunker::new(25, 12);
        let page = PageItem {
            page: 7,
            text: String::new(),
            image_paths: vec!["/tmp/p7.png".to_string()],
            captions: vec!["Figure 2: throughput".to_string()],
            is_ocr: false,
        };
        let chunks = chunker.chunk_pages(&[page]);
        // One pdf_image chunk plus the caption text chunk.
        assert_eq!(chunks.len(), 2);
        let figure = chunks.iter().find(|c| c.content_type == ContentType::PdfImage).unwrap();
        assert!(figure.is_figure);
        assert_eq!(figure.text, "Figure 2: throughput");
        assert!(chunks.iter().any(|c| c.content_type == ContentType::Text && c.is_figure));
    }

    #[test]
    fn test_ocr_flag_propagates() {
        let chunker = Chunker::new(25, 12);
        let page = PageItem {
            page: 1,
            text: "scanned text recovered by ocr".to_string(),
            image_paths: vec![],
            captions: vec![],
            is_ocr: true,
        };
        let chunks = chunker.chunk_pages(&[page]);
        assert!(chunks.iter().all(|c| c.is_ocr));
        assert_eq!(chunks[0].content_type, ContentType::PdfText);
    }

    #[test]
    fn test_heading_acts_as_unit_boundary() {
        let chunker = Chunker::new(10, 4);
        // A heading line separates two 8-word paragraphs that would
        // otherwise pack together.
        let text = format!("{}\n# Heading\n{}", words(8), words(8));
        let windows = chunker.window_units(&text);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].split_whitespace().count(), 8);
    }
}
