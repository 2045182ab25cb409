use crate::chunking::clean_text;
use crate::error::IngestError;
use lopdf::Document;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait TextExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl TextExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;
            let text = clean_text(&text);

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Plain text files, one page per form-feed separated section.
#[derive(Default)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(split_form_feed_pages(&raw))
    }
}

pub(crate) fn split_form_feed_pages(raw: &str) -> Vec<PageText> {
    raw.split('\u{000c}')
        .enumerate()
        .filter_map(|(index, section)| {
            let text = clean_text(section);
            if text.trim().is_empty() {
                None
            } else {
                Some(PageText {
                    number: (index + 1) as u32,
                    text,
                })
            }
        })
        .collect()
}

/// Picks an extractor from the file extension.
pub fn extract_page_texts(path: &Path) -> Result<Vec<PageText>, IngestError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("pdf") => LopdfExtractor.extract_pages(path),
        Some("txt") | Some("md") => PlainTextExtractor.extract_pages(path),
        _ => Err(IngestError::UnsupportedSource(format!(
            "no extractor for {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn form_feeds_split_pages_and_keep_numbering() {
        let pages = split_form_feed_pages("First page\n\u{000c}  \u{000c}Third\u{0}page\n");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 1);
        assert_eq!(pages[0].text, "First page\n");
        assert_eq!(pages[1].number, 3);
        assert_eq!(pages[1].text, "Thirdpage\n");
    }

    #[test]
    fn text_files_are_read_by_extension() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.TXT");
        fs::write(&path, "Entropy always increases.")?;

        let pages = extract_page_texts(&path)?;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "Entropy always increases.");
        Ok(())
    }

    #[test]
    fn unknown_extensions_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("slides.pptx");
        fs::write(&path, b"binary")?;

        assert!(matches!(
            extract_page_texts(&path),
            Err(IngestError::UnsupportedSource(_))
        ));
        Ok(())
    }

    #[test]
    fn broken_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        assert!(matches!(
            extract_page_texts(&path),
            Err(IngestError::PdfParse(_))
        ));
        Ok(())
    }
}
