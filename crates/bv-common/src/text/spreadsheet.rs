use std::io::Cursor;

use calamine::{Data, Reader, open_workbook_auto_from_rs};
use tracing::warn;

use super::TextExtractionError;

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR:{e:?}"),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
    }
}

/// One `## <sheet>` section per worksheet, one tab-joined line per non-empty row.
pub(super) fn extract(bytes: &[u8]) -> Result<String, TextExtractionError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|err| TextExtractionError::ExtractionFailed(format!("invalid workbook: {err}")))?;

    let mut out = String::new();
    for sheet_name in workbook.sheet_names().to_vec() {
        let range = match workbook.worksheet_range(&sheet_name) {
            Ok(range) => range,
            Err(err) => {
                warn!(sheet = %sheet_name, error = %err, "worksheet unreadable; skipped");
                continue;
            }
        };

        out.push_str(&format!("## {sheet_name}\n"));
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            if cells.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            // Trailing empty cells carry no information.
            let used = cells
                .iter()
                .rposition(|cell| !cell.is_empty())
                .map_or(0, |last| last + 1);
            out.push_str(&cells[..used].join("\t"));
            out.push('\n');
        }
        out.push('\n');
    }

    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_render_as_plain_text() {
        assert_eq!(cell_text(&Data::Empty), "");
        assert_eq!(cell_text(&Data::String("  Demo  ".into())), "Demo");
        assert_eq!(cell_text(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_text(&Data::Int(500)), "500");
        assert_eq!(cell_text(&Data::Bool(true)), "true");
    }

    #[test]
    fn zip_without_workbook_parts_is_rejected() {
        let err = extract(b"PK\x03\x04 truncated").unwrap_err();
        assert!(matches!(err, TextExtractionError::ExtractionFailed(_)));
    }
}
