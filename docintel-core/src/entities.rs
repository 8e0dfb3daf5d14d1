use plsfix::fix_text;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use pdfium_render::prelude::{PdfFontWeight, PdfPageTextChar, PdfRect};

use crate::blocks::Block;

pub type PageID = usize;

const DOCINTEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub(crate) fn from_pdfrect(
        PdfRect {
            bottom,
            left,
            top,
            right,
        }: PdfRect,
        page_height: f32,
    ) -> Self {
        Self {
            x0: left.value.min(right.value),
            y0: page_height - top.value.max(bottom.value),
            x1: right.value.max(left.value),
            y1: page_height - bottom.value.min(top.value),
        }
    }

    /// Smallest axis-aligned box holding every point, `None` for an empty set.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f32, f32)>,
    {
        let mut points = points.into_iter();
        let (x, y) = points.next()?;
        let mut bbox = Self {
            x0: x,
            y0: y,
            x1: x,
            y1: y,
        };
        for (x, y) in points {
            bbox.x0 = bbox.x0.min(x);
            bbox.y0 = bbox.y0.min(y);
            bbox.x1 = bbox.x1.max(x);
            bbox.y1 = bbox.y1.max(y);
        }
        Some(bbox)
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }
    #[inline(always)]
    pub fn area(&self) -> f32 {
        self.height() * self.width()
    }

    #[inline(always)]
    pub(crate) fn merge(&mut self, other: &Self) {
        self.x0 = self.x0.min(other.x0);
        self.y0 = self.y0.min(other.y0);
        self.x1 = self.x1.max(other.x1);
        self.y1 = self.y1.max(other.y1);
    }
    #[inline(always)]
    pub(crate) fn overlap_x(&self, other: &Self) -> f32 {
        f32::max(
            0f32,
            f32::min(self.x1, other.x1) - f32::max(self.x0, other.x0),
        )
    }

    #[inline(always)]
    pub fn scale(&self, factor: f32) -> Self {
        Self {
            x0: self.x0 * factor,
            y0: self.y0 * factor,
            x1: self.x1 * factor,
            y1: self.y1 * factor,
        }
    }

    /// Integer corners, truncated toward zero.
    #[inline(always)]
    pub fn to_int(&self) -> [i32; 4] {
        [
            self.x0 as i32,
            self.y0 as i32,
            self.x1 as i32,
            self.y1 as i32,
        ]
    }
}

/// Raw text fragment pulled out of a page's text layer, before cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub bbox: BBox,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LayoutPage {
    pub page: PageID,
    pub width: u32,
    pub height: u32,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LayoutDocument {
    pub document_id: String,
    pub filename: String,
    pub num_pages: usize,
    pub pages: Vec<LayoutPage>,
}

impl LayoutDocument {
    pub fn new(document_id: String, filename: String, pages: Vec<LayoutPage>) -> Self {
        Self {
            document_id,
            filename,
            num_pages: pages.len(),
            pages,
        }
    }
}

/// Where the blocks of a page came from.
#[derive(Debug, Clone, PartialEq)]
pub enum PageSource {
    Native,
    Ocr { engine: String },
    /// No native text and the OCR chain found nothing.
    Blank,
    OcrDisabled,
    /// No engine in the chain could be constructed.
    OcrUnavailable,
    OcrFailed { reasons: Vec<String> },
}

impl PageSource {
    /// Pages that ended up empty because something broke, not because they are blank.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::OcrUnavailable | Self::OcrFailed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageReport {
    pub page: PageID,
    pub source: PageSource,
    pub num_blocks: usize,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct ProcessedDocument {
    pub layout: LayoutDocument,
    pub reports: Vec<PageReport>,
    pub duration: Duration,
    pub docintel_version: &'static str,
}

impl ProcessedDocument {
    pub fn new(layout: LayoutDocument, reports: Vec<PageReport>, duration: Duration) -> Self {
        Self {
            layout,
            reports,
            duration,
            docintel_version: DOCINTEL_VERSION,
        }
    }

    pub fn degraded_pages(&self) -> impl Iterator<Item = &PageReport> {
        self.reports.iter().filter(|r| r.source.is_degraded())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.layout)
    }
}

#[derive(Debug)]
pub struct CharSpan {
    pub bbox: BBox,
    pub text: String,
    pub rotation: f32,
    pub font_name: String,
    pub font_size: f32,
    pub font_weight: Option<PdfFontWeight>,
}

impl CharSpan {
    /// Chars pdfium cannot place (generated line breaks, some ligatures) don't start a span.
    pub fn new_from_char(char: &PdfPageTextChar, page_bbox: &BBox) -> Option<Self> {
        let bounds = char.tight_bounds().ok()?;
        Some(Self {
            bbox: BBox::from_pdfrect(bounds, page_bbox.height()),
            text: char.unicode_char().map(String::from).unwrap_or_default(),
            font_name: char.font_name(),
            font_weight: char.font_weight(),
            font_size: char.unscaled_font_size().value,
            rotation: char.get_rotation_clockwise_degrees(),
        })
    }

    pub fn append(&mut self, char: &PdfPageTextChar, page_bbox: &BBox) -> Option<()> {
        let char_rotation = char.get_rotation_clockwise_degrees();
        if char.unscaled_font_size().value != self.font_size
            || char.font_name() != self.font_name
            || char.font_weight() != self.font_weight
            || char_rotation != self.rotation
        {
            None
        } else {
            if let Ok(bounds) = char.tight_bounds() {
                self.bbox
                    .merge(&BBox::from_pdfrect(bounds, page_bbox.height()));
            }
            if let Some(c) = char.unicode_char() {
                self.text.push(c);
            }
            Some(())
        }
    }
}

#[derive(Debug, Default)]
pub struct Line {
    pub text: String,
    pub bbox: BBox,
    pub rotation: f32,
}

impl Line {
    pub fn new_from_span(span: CharSpan) -> Self {
        Self {
            bbox: span.bbox,
            text: span.text,
            rotation: span.rotation,
        }
    }

    /// Hands the span back when it has to start a new line.
    pub fn append(&mut self, span: CharSpan) -> Result<(), CharSpan> {
        if span.rotation != self.rotation
        // pdfium may omit the line break, a span starting below the line also ends it
        || span.bbox.y0 > self.bbox.y1
        || self.text.ends_with('\n') || self.text.ends_with('\x02')
        {
            Err(span)
        } else {
            self.bbox.merge(&span.bbox);
            self.text.push_str(&span.text);
            Ok(())
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.text = fix_text(&self.text, None);
        self
    }
}
