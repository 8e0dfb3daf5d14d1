use serde::{Deserialize, Serialize};

use crate::{
    entities::{BBox, TextFragment},
    ocr::OcrDetection,
};

pub const NATIVE_ID_PREFIX: &str = "b";
pub const OCR_ID_PREFIX: &str = "ocr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRole {
    #[default]
    Text,
}

/// One recognized unit of text on a page. Native and OCR blocks share this
/// record and only differ by the `id` prefix.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Block {
    pub id: String,
    pub role: BlockRole,
    pub bbox: [i32; 4],
    pub text: String,
    pub confidence: f32,
}

impl Block {
    /// `index` is the fragment's 0-based position in the extractor output.
    pub fn from_fragment(index: usize, fragment: &TextFragment) -> Option<Self> {
        let text = clean_text(&fragment.text)?;
        Some(Self {
            id: format!("{NATIVE_ID_PREFIX}{}", index + 1),
            role: BlockRole::Text,
            bbox: fragment.bbox.to_int(),
            text,
            confidence: 1.0,
        })
    }

    /// `scale` maps raster pixels back into the page's coordinate space.
    pub fn from_detection(index: usize, detection: &OcrDetection, scale: f32) -> Option<Self> {
        if !detection.is_usable() {
            return None;
        }
        let text = detection.text.trim();
        let bbox = BBox::from_points(detection.polygon.iter().copied())?;
        Some(Self {
            id: format!("{OCR_ID_PREFIX}{}", index + 1),
            role: BlockRole::Text,
            bbox: bbox.scale(scale).to_int(),
            text: text.to_owned(),
            confidence: clamp_confidence(detection.confidence),
        })
    }

    pub fn is_native(&self) -> bool {
        self.id.starts_with(NATIVE_ID_PREFIX)
    }
}

pub fn native_blocks(fragments: &[TextFragment]) -> Vec<Block> {
    fragments
        .iter()
        .enumerate()
        .filter_map(|(index, fragment)| Block::from_fragment(index, fragment))
        .collect()
}

pub fn ocr_blocks(detections: &[OcrDetection], scale: f32) -> Vec<Block> {
    detections
        .iter()
        .enumerate()
        .filter_map(|(index, detection)| Block::from_detection(index, detection, scale))
        .collect()
}

fn is_line_boundary(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

/// Trims every line, drops the empty ones and joins the rest with `\n`.
pub(crate) fn clean_text(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw
        .split(is_line_boundary)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}
