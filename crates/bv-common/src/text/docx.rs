use std::io::{Cursor, Read};

use quick_xml::Reader;
use quick_xml::events::Event;
use zip::ZipArchive;

use super::TextExtractionError;

const DOCUMENT_PART: &str = "word/document.xml";

fn failed(message: impl Into<String>) -> TextExtractionError {
    TextExtractionError::ExtractionFailed(message.into())
}

/// Paragraphs become lines, table cells and tabs become `\t`.
pub(super) fn extract(bytes: &[u8]) -> Result<String, TextExtractionError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| failed(format!("invalid docx: {err}")))?;
    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .map_err(|err| failed(format!("{DOCUMENT_PART} missing: {err}")))?
        .read_to_string(&mut xml)
        .map_err(|err| failed(format!("{DOCUMENT_PART} unreadable: {err}")))?;

    document_text(&xml)
}

fn document_text(xml: &str) -> Result<String, TextExtractionError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text = false;
    let mut cell_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:t" => in_text = true,
                b"w:tc" => cell_depth += 1,
                b"w:tab" => out.push('\t'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => out.push('\t'),
                b"w:br" | b"w:cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) if in_text => {
                let text = e
                    .unescape()
                    .map_err(|err| failed(format!("bad text run: {err}")))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:tc" => {
                    cell_depth = cell_depth.saturating_sub(1);
                    while out.ends_with(' ') || out.ends_with('\n') {
                        out.pop();
                    }
                    out.push('\t');
                }
                // Paragraphs inside a cell stay on the row's line.
                b"w:p" if cell_depth > 0 => out.push(' '),
                b"w:p" => out.push('\n'),
                b"w:tr" => {
                    while out.ends_with('\t') || out.ends_with('\n') {
                        out.pop();
                    }
                    out.push('\n');
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(failed(format!(
                    "malformed document xml at {}: {err}",
                    reader.buffer_position()
                )));
            }
        }
    }

    Ok(out
        .lines()
        .map(|line| line.trim_end_matches('\t').trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string())
}
