//! Best-effort text recovery for Word 97-2003 `.doc` files.
//!
//! The compound-file container is not parsed. After checking the OLE2
//! signature, printable runs are pulled out of the raw bytes, both as 8-bit
//! text and as UTF-16LE, which covers the piece tables Word writes in
//! practice. Formatting noise is dropped by requiring letters or digits.

use super::TextExtractionError;

const OLE2_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const MIN_RUN_CHARS: usize = 4;
// Header sector, never text.
const HEADER_LEN: usize = 512;

fn printable(c: char) -> bool {
    c == '\t' || (!c.is_control() && c != '\u{FFFD}')
}

fn flush(run: &mut String, out: &mut Vec<String>) {
    let trimmed = run.trim();
    if trimmed.chars().count() >= MIN_RUN_CHARS
        && trimmed.chars().any(|c| c.is_alphanumeric())
        && out.last().map(String::as_str) != Some(trimmed)
    {
        out.push(trimmed.to_string());
    }
    run.clear();
}

fn ascii_runs(bytes: &[u8], out: &mut Vec<String>) {
    let mut run = String::new();
    for &b in bytes {
        let c = b as char;
        if b.is_ascii() && printable(c) {
            run.push(c);
        } else {
            flush(&mut run, out);
        }
    }
    flush(&mut run, out);
}

/// Code units Word text realistically contains. Pairs of 8-bit ASCII bytes
/// read as UTF-16 land in CJK ranges and are rejected here.
fn utf16_text_unit(unit: u16) -> Option<char> {
    let accepted = matches!(
        unit,
        0x09 | 0x20..=0x7E | 0xA0..=0x17F | 0x2013..=0x2026 | 0x20AC
    );
    if accepted {
        char::from_u32(u32::from(unit))
    } else {
        None
    }
}

fn utf16_runs(bytes: &[u8], out: &mut Vec<String>) {
    for offset in 0..2 {
        let mut run = String::new();
        for pair in bytes[offset.min(bytes.len())..].chunks_exact(2) {
            match utf16_text_unit(u16::from_le_bytes([pair[0], pair[1]])) {
                Some(c) => run.push(c),
                None => flush(&mut run, out),
            }
        }
        flush(&mut run, out);
    }
}

pub(super) fn extract(bytes: &[u8]) -> Result<String, TextExtractionError> {
    if bytes.len() < OLE2_SIGNATURE.len() || bytes[..OLE2_SIGNATURE.len()] != OLE2_SIGNATURE {
        return Err(TextExtractionError::ExtractionFailed(
            "not an OLE2 compound document".into(),
        ));
    }
    let body = &bytes[HEADER_LEN.min(bytes.len())..];

    let mut lines = Vec::new();
    ascii_runs(body, &mut lines);
    utf16_runs(body, &mut lines);
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(body: &[u8]) -> Vec<u8> {
        let mut bytes = OLE2_SIGNATURE.to_vec();
        bytes.resize(HEADER_LEN, 0);
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn recovers_eight_bit_runs_and_drops_noise() {
        let mut body = b"\x01\x02Demo existing flooring\r500 SF\x00\x00".to_vec();
        body.extend_from_slice(b"\xff\xfe--==\x00Excludes permits\x00");
        let text = extract(&container(&body)).unwrap();
        assert_eq!(text, "Demo existing flooring\n500 SF\nExcludes permits");
    }

    #[test]
    fn recovers_utf16_runs() {
        let body: Vec<u8> = "Außenputz 120 m²"
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        let text = extract(&container(&body)).unwrap();
        assert_eq!(text, "Außenputz 120 m²");
    }

    #[test]
    fn rejects_files_without_signature() {
        assert!(matches!(
            extract(b"PK\x03\x04"),
            Err(TextExtractionError::ExtractionFailed(_))
        ));
    }
}
