//! File-type dispatch and page extraction for ingestion.
//!
//! PDF text comes out per page via lopdf with a whole-document
//! pdf-extract fallback. OCR and embedded-image extraction are external
//! collaborators behind trait hooks; when absent, low-text pages simply
//! stay low-text and pages carry no images.

use std::path::Path;

use lopdf::Document as PdfDocument;

use super::chunker::PageItem;
use crate::error::{RagError, Result};

/// Pages with fewer extracted characters than this are offered to OCR.
const OCR_TEXT_THRESHOLD: usize = 20;

/// External OCR hook. Receives the source file and the page number,
/// returns recognized text.
pub trait OcrEngine: Send + Sync {
    fn ocr_page(&self, path: &Path, page: i32) -> Result<String>;
}

/// External image-extraction hook. Returns (image paths, captions) for a
/// page, with images already written beneath `scratch_dir`.
pub trait ImageExtractor: Send + Sync {
    fn extract_page_images(
        &self,
        path: &Path,
        page: i32,
        scratch_dir: &Path,
    ) -> Result<(Vec<String>, Vec<String>)>;
}

/// Supported file classes, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Text,
    Image,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(Self::Pdf),
            "txt" | "text" | "md" | "markdown" => Ok(Self::Text),
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "tiff" | "webp" => Ok(Self::Image),
            other => Err(RagError::UnsupportedInput(format!(
                "unsupported file type '.{}' (supported: pdf, txt, md, png, jpg, jpeg, gif, bmp, tiff, webp)",
                other
            ))),
        }
    }
}

#[derive(Default)]
pub struct DocumentParser {
    ocr: Option<Box<dyn OcrEngine>>,
    image_extractor: Option<Box<dyn ImageExtractor>>,
}

impl DocumentParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ocr(mut self, ocr: Box<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_image_extractor(mut self, extractor: Box<dyn ImageExtractor>) -> Self {
        self.image_extractor = Some(extractor);
        self
    }

    /// Parse a file into page items. `scratch_dir` receives extracted
    /// images and is owned by the calling ingestion task.
    pub fn parse(&self, path: &Path, scratch_dir: &Path) -> Result<Vec<PageItem>> {
        if !path.exists() {
            return Err(RagError::Ingestion(format!(
                "file not found: {}",
                path.display()
            )));
        }
        match FileKind::from_path(path)? {
            FileKind::Pdf => self.parse_pdf(path, scratch_dir),
            FileKind::Text => self.parse_text(path),
            FileKind::Image => self.parse_image(path),
        }
    }

    fn parse_pdf(&self, path: &Path, scratch_dir: &Path) -> Result<Vec<PageItem>> {
        let doc = PdfDocument::load(path)
            .map_err(|e| RagError::Ingestion(format!("failed to load PDF: {}", e)))?;

        let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
        let mut pages = Vec::with_capacity(page_numbers.len());

        for page_number in page_numbers {
            let text = doc.extract_text(&[page_number]).unwrap_or_default();
            let mut text = text.trim().to_string();
            let mut is_ocr = false;

            // Near-empty pages are usually scans; hand them to OCR when a
            // hook is present.
            if text.len() < OCR_TEXT_THRESHOLD {
                if let Some(ocr) = &self.ocr {
                    match ocr.ocr_page(path, page_number as i32) {
                        Ok(recognized) if !recognized.trim().is_empty() => {
                            text = recognized.trim().to_string();
                            is_ocr = true;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(page = page_number, error = %e, "OCR failed for page");
                        }
                    }
                }
            }

            let (image_paths, captions) = match &self.image_extractor {
                Some(extractor) => extractor
                    .extract_page_images(path, page_number as i32, scratch_dir)
                    .unwrap_or_else(|e| {
                        tracing::warn!(page = page_number, error = %e, "image extraction failed");
                        (Vec::new(), Vec::new())
                    }),
                None => (Vec::new(), Vec::new()),
            };

            pages.push(PageItem {
                page: page_number as i32,
                text,
                image_paths,
                captions,
                is_ocr,
            });
        }

        if pages.iter().all(|p| p.text.is_empty() && p.image_paths.is_empty()) {
            // lopdf occasionally extracts nothing from well-formed files;
            // fall back to whole-document extraction as a single page.
            if let Ok(full_text) = pdf_extract::extract_text(path) {
                let trimmed = full_text.trim();
                if !trimmed.is_empty() {
                    tracing::warn!(
                        path = %path.display(),
                        "per-page extraction empty; using whole-document fallback"
                    );
                    return Ok(vec![PageItem {
                        page: 1,
                        text: trimmed.to_string(),
                        ..PageItem::default()
                    }]);
                }
            }
        }

        Ok(pages)
    }

    fn parse_text(&self, path: &Path) -> Result<Vec<PageItem>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RagError::Ingestion(format!("failed to read text file: {}", e)))?;
        if content.trim().is_empty() {
            return Err(RagError::Ingestion(format!(
                "text file is empty: {}",
                path.display()
            )));
        }
        Ok(vec![PageItem {
            page: 1,
            text: content,
            ..PageItem::default()
        }])
    }

    fn parse_image(&self, path: &Path) -> Result<Vec<PageItem>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string();

        // OCR text, when a hook is present, becomes the chunk text and the
        // chunk embeds multimodally; otherwise the caption stands in.
        let mut text = String::new();
        let mut is_ocr = false;
        if let Some(ocr) = &self.ocr {
            match ocr.ocr_page(path, 1) {
                Ok(recognized) if !recognized.trim().is_empty() => {
                    text = recognized.trim().to_string();
                    is_ocr = true;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "OCR failed for image"),
            }
        }

        Ok(vec![PageItem {
            page: 1,
            text,
            image_paths: vec![path.display().to_string()],
            captions: vec![format!("[Image: {}]", file_name)],
            is_ocr,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_file_kind_dispatch() {
        assert_eq!(FileKind::from_path(Path::new("a.pdf")).unwrap(), FileKind::Pdf);
        assert_eq!(FileKind::from_path(Path::new("a.txt")).unwrap(), FileKind::Text);
        assert_eq!(FileKind::from_path(Path::new("a.md")).unwrap(), FileKind::Text);
        assert_eq!(FileKind::from_path(Path::new("a.PNG")).unwrap(), FileKind::Image);
        assert_eq!(FileKind::from_path(Path::new("a.jpeg")).unwrap(), FileKind::Image);
    }

    #[test]
    fn test_unsupported_extension_is_an_error() {
        let err = FileKind::from_path(Path::new("slides.pptx")).unwrap_err();
        assert!(matches!(err, RagError::UnsupportedInput(_)));
        assert!(err.to_string().contains("pptx"));
    }

    #[test]
    fn test_parse_text_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "line one\nline two").unwrap();

        let parser = DocumentParser::new();
        let pages = parser.parse(&file, dir.path()).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page, 1);
        assert!(pages[0].text.contains("line one"));
    }

    #[test]
    fn test_parse_missing_file_is_an_error() {
        let parser = DocumentParser::new();
        let err = parser
            .parse(&PathBuf::from("/nonexistent/file.txt"), Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, RagError::Ingestion(_)));
    }

    #[test]
    fn test_parse_empty_text_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("empty.txt");
        std::fs::write(&file, "   \n").unwrap();
        let parser = DocumentParser::new();
        assert!(parser.parse(&file, dir.path()).is_err());
    }

    #[test]
    fn test_parse_image_without_ocr_uses_caption() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("photo.png");
        std::fs::write(&file, b"notapng").unwrap();

        let parser = DocumentParser::new();
        let pages = parser.parse(&file, dir.path()).unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].text.is_empty());
        assert_eq!(pages[0].image_paths.len(), 1);
        assert_eq!(pages[0].captions[0], "[Image: photo.png]");
    }

    #[test]
    fn test_parse_image_with_ocr_hook() {
        struct FixedOcr;
        impl OcrEngine for FixedOcr {
            fn ocr_page(&self, _path: &Path, _page: i32) -> Result<String> {
                Ok("recognized words".to_string())
            }
        }

        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("scan.jpg");
        std::fs::write(&file, b"notajpg").unwrap();

        let parser = DocumentParser::new().with_ocr(Box::new(FixedOcr));
        let pages = parser.parse(&file, dir.path()).unwrap();
        assert_eq!(pages[0].text, "recognized words");
        assert!(pages[0].is_ocr);
    }
}
