//! Raw text recovery from uploaded bid files.
//!
//! Every parser is synchronous and CPU-bound. Callers on the async runtime
//! go through [`extract_blocking`].

mod docx;
mod legacy_doc;
mod pdf;
mod spreadsheet;

use thiserror::Error;

use crate::model::PositionMap;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextExtractionError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("source file unavailable: {0}")]
    SourceUnavailable(String),
    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Xlsx,
    Xls,
    Docx,
    Doc,
}

impl DocumentFormat {
    fn from_token(token: &str) -> Option<Self> {
        match token.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" | "application/pdf" => Some(DocumentFormat::Pdf),
            "xlsx" | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                Some(DocumentFormat::Xlsx)
            }
            "xls" | "application/vnd.ms-excel" => Some(DocumentFormat::Xls),
            "docx" | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(DocumentFormat::Docx)
            }
            "doc" | "application/msword" => Some(DocumentFormat::Doc),
            _ => None,
        }
    }

    /// Resolve from the declared file type (extension or MIME type), then
    /// from the extension of the stored reference.
    pub fn detect(file_type: &str, file_ref: &str) -> Result<Self, TextExtractionError> {
        if let Some(format) = Self::from_token(file_type) {
            return Ok(format);
        }
        file_ref
            .rsplit_once('.')
            .and_then(|(_, ext)| Self::from_token(ext))
            .ok_or_else(|| {
                let declared = if file_type.trim().is_empty() {
                    file_ref
                } else {
                    file_type
                };
                TextExtractionError::UnsupportedFormat(declared.to_string())
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    /// Present for PDFs only.
    pub positions: Option<PositionMap>,
}

pub fn extract(format: DocumentFormat, bytes: &[u8]) -> Result<ExtractedText, TextExtractionError> {
    match format {
        DocumentFormat::Pdf => pdf::extract(bytes),
        DocumentFormat::Xlsx | DocumentFormat::Xls => plain(spreadsheet::extract(bytes)),
        DocumentFormat::Docx => plain(docx::extract(bytes)),
        DocumentFormat::Doc => plain(legacy_doc::extract(bytes)),
    }
}

/// Run [`extract`] on the blocking pool.
pub async fn extract_blocking(
    format: DocumentFormat,
    bytes: Vec<u8>,
) -> Result<ExtractedText, TextExtractionError> {
    tokio::task::spawn_blocking(move || extract(format, &bytes))
        .await
        .map_err(|err| TextExtractionError::ExtractionFailed(format!("parser task failed: {err}")))?
}

fn plain(text: Result<String, TextExtractionError>) -> Result<ExtractedText, TextExtractionError> {
    text.map(|text| ExtractedText {
        text,
        positions: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_prefers_declared_type_and_falls_back_to_extension() {
        assert_eq!(
            DocumentFormat::detect("application/pdf", "x.bin").unwrap(),
            DocumentFormat::Pdf
        );
        assert_eq!(
            DocumentFormat::detect("", "bids/acme.XLSX").unwrap(),
            DocumentFormat::Xlsx
        );
        assert_eq!(
            DocumentFormat::detect("application/octet-stream", "bids/acme.doc").unwrap(),
            DocumentFormat::Doc
        );
    }

    #[test]
    fn detect_rejects_unknown_formats() {
        let err = DocumentFormat::detect("txt", "notes.txt").unwrap_err();
        assert_eq!(err, TextExtractionError::UnsupportedFormat("txt".into()));

        let err = DocumentFormat::detect("", "archive").unwrap_err();
        assert_eq!(err, TextExtractionError::UnsupportedFormat("archive".into()));
    }

    #[test]
    fn corrupt_content_is_an_extraction_failure() {
        for format in [
            DocumentFormat::Pdf,
            DocumentFormat::Xlsx,
            DocumentFormat::Docx,
            DocumentFormat::Doc,
        ] {
            let err = extract(format, b"definitely not a document").unwrap_err();
            assert!(
                matches!(err, TextExtractionError::ExtractionFailed(_)),
                "{format:?} gave {err:?}"
            );
        }
    }
}
