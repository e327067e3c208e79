use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, warn};

use super::{ExtractedText, TextExtractionError};
use crate::model::{PageSpan, PositionMap, TextBlock};

// US Letter, used when no MediaBox is reachable.
const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);
const MAX_PARENT_HOPS: usize = 16;
// TJ kerning below this (thousandths of an em) reads as a word gap.
const TJ_SPACE_THRESHOLD: f32 = -200.0;

pub(super) fn extract(bytes: &[u8]) -> Result<ExtractedText, TextExtractionError> {
    let doc = Document::load_mem(bytes)
        .map_err(|err| TextExtractionError::ExtractionFailed(format!("invalid pdf: {err}")))?;

    let mut text = String::new();
    let mut char_count = 0usize;
    let mut positions = PositionMap::default();

    for (page_number, page_id) in doc.get_pages() {
        let page_text = match doc.extract_text(&[page_number]) {
            Ok(page_text) => page_text,
            Err(err) => {
                warn!(page = page_number, error = %err, "pdf page text unreadable");
                String::new()
            }
        };
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
            char_count += 1;
        }
        let start = char_count;
        char_count += page_text.chars().count();
        text.push_str(&page_text);

        let (width, height) = media_box(&doc, page_id).unwrap_or(DEFAULT_PAGE_SIZE);
        positions.pages.push(PageSpan {
            page: page_number,
            char_start: start,
            char_end: char_count,
            width,
            height,
        });

        match doc.get_page_content(page_id) {
            Ok(content) => positions
                .blocks
                .extend(text_blocks(page_number, &content)),
            Err(err) => debug!(page = page_number, error = %err, "pdf page has no content stream"),
        }
    }

    Ok(ExtractedText {
        text,
        positions: Some(positions),
    })
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

fn page_dictionary(doc: &Document, id: ObjectId) -> Option<&Dictionary> {
    doc.get_object(id).ok()?.as_dict().ok()
}

/// Width and height of the page, following `Parent` links for inherited boxes.
fn media_box(doc: &Document, page_id: ObjectId) -> Option<(f32, f32)> {
    let mut current = page_dictionary(doc, page_id)?;
    for _ in 0..MAX_PARENT_HOPS {
        if let Ok(Object::Array(values)) = current.get(b"MediaBox") {
            let coords: Vec<f32> = values.iter().filter_map(number).collect();
            if let [x0, y0, x1, y1] = coords[..] {
                return Some(((x1 - x0).abs(), (y1 - y0).abs()));
            }
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = page_dictionary(doc, parent)?;
    }
    None
}

fn decode_pdf_string(bytes: &[u8]) -> String {
    if let [0xFE, 0xFF, rest @ ..] = bytes {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

#[derive(Default)]
struct BlockState {
    text: String,
    x: f32,
    y: f32,
    font_size: Option<f32>,
    positioned: bool,
}

/// Walk the content stream and emit one block per `BT … ET` section that
/// shows any text.
fn text_blocks(page: u32, content: &[u8]) -> Vec<TextBlock> {
    let operations = match Content::decode(content) {
        Ok(decoded) => decoded.operations,
        Err(err) => {
            debug!(page, error = %err, "pdf content stream not decodable");
            return Vec::new();
        }
    };

    let mut blocks = Vec::new();
    let mut state: Option<BlockState> = None;
    let mut font_size: Option<f32> = None;

    for op in operations {
        match op.operator.as_str() {
            "BT" => state = Some(BlockState { font_size, ..Default::default() }),
            "ET" => {
                if let Some(done) = state.take() {
                    let text = done.text.trim();
                    if !text.is_empty() {
                        blocks.push(TextBlock {
                            page,
                            index: blocks.len() as u32,
                            text: text.to_string(),
                            x: done.x,
                            y: done.y,
                            font_size: done.font_size,
                        });
                    }
                }
            }
            "Tf" => {
                font_size = op.operands.get(1).and_then(number);
                if let Some(block) = state.as_mut() {
                    block.font_size = font_size;
                }
            }
            "Tm" => {
                if let (Some(block), Some(x), Some(y)) = (
                    state.as_mut(),
                    op.operands.get(4).and_then(number),
                    op.operands.get(5).and_then(number),
                ) {
                    if !block.positioned || block.text.is_empty() {
                        block.x = x;
                        block.y = y;
                        block.positioned = true;
                    }
                }
            }
            "Td" | "TD" => {
                if let (Some(block), Some(dx), Some(dy)) = (
                    state.as_mut(),
                    op.operands.first().and_then(number),
                    op.operands.get(1).and_then(number),
                ) {
                    if block.text.is_empty() {
                        block.x += dx;
                        block.y += dy;
                        block.positioned = true;
                    } else {
                        block.text.push('\n');
                    }
                }
            }
            "T*" => {
                if let Some(block) = state.as_mut().filter(|b| !b.text.is_empty()) {
                    block.text.push('\n');
                }
            }
            "Tj" | "'" | "\"" => {
                if let (Some(block), Some(Object::String(bytes, _))) =
                    (state.as_mut(), op.operands.last())
                {
                    if op.operator != "Tj" && !block.text.is_empty() {
                        block.text.push('\n');
                    }
                    block.text.push_str(&decode_pdf_string(bytes));
                }
            }
            "TJ" => {
                if let (Some(block), Some(Object::Array(parts))) =
                    (state.as_mut(), op.operands.first())
                {
                    for part in parts {
                        match part {
                            Object::String(bytes, _) => {
                                block.text.push_str(&decode_pdf_string(bytes))
                            }
                            other => {
                                if number(other).is_some_and(|kern| kern < TJ_SPACE_THRESHOLD) {
                                    block.text.push(' ');
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::Operation;
    use lopdf::{Stream, dictionary};

    fn one_page_pdf(media_box_on_pages: bool) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal("Demo existing flooring")]),
                Operation::new("ET", vec![]),
                Operation::new("BT", vec![]),
                Operation::new("Td", vec![72.into(), 680.into()]),
                Operation::new(
                    "TJ",
                    vec![Object::Array(vec![
                        Object::string_literal("Total"),
                        Object::Integer(-400),
                        Object::string_literal("$1,000"),
                    ])],
                ),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        let mut pages = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
        };
        if media_box_on_pages {
            pages.set("MediaBox", vec![0.into(), 0.into(), 595.into(), 842.into()]);
        }
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn blocks_carry_page_position_and_font_size() {
        let extracted = extract(&one_page_pdf(true)).unwrap();
        let positions = extracted.positions.unwrap();

        assert_eq!(positions.pages.len(), 1);
        let page = &positions.pages[0];
        assert_eq!((page.page, page.width, page.height), (1, 595.0, 842.0));
        assert_eq!(page.char_start, 0);
        assert_eq!(page.char_end, extracted.text.chars().count());

        assert_eq!(positions.blocks.len(), 2);
        let first = &positions.blocks[0];
        assert_eq!(first.text, "Demo existing flooring");
        assert_eq!((first.x, first.y), (72.0, 700.0));
        assert_eq!(first.font_size, Some(12.0));
        assert_eq!(positions.blocks[1].text, "Total $1,000");
        assert_eq!(positions.blocks[1].index, 1);
    }

    #[test]
    fn missing_media_box_falls_back_to_letter() {
        let extracted = extract(&one_page_pdf(false)).unwrap();
        let page = &extracted.positions.unwrap().pages[0];
        assert_eq!((page.width, page.height), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn utf16_strings_are_decoded() {
        let bytes = [0xFE, 0xFF, 0x00, 0x53, 0x00, 0x46];
        assert_eq!(decode_pdf_string(&bytes), "SF");
        assert_eq!(decode_pdf_string(b"LF"), "LF");
    }
}
