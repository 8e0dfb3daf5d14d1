use std::{
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::Instant,
};

use anyhow::Context;
use image::DynamicImage;
use pdfium_render::prelude::{
    PdfDocument, PdfPage, PdfPageTextChar, PdfRenderConfig, Pdfium, PdfiumError,
};

use crate::entities::{BBox, CharSpan, Line, TextFragment};

/// Max vertical gap between two lines of the same fragment, relative to line height.
const FRAGMENT_LINE_GAP: f32 = 0.75;

/// A document made of pages that carry a text layer and can be rasterized.
pub trait PagedDocument {
    fn page_count(&self) -> usize;
    fn page(&self, index: usize) -> anyhow::Result<Box<dyn DocumentPage + '_>>;
}

pub trait DocumentPage {
    /// Page size in its native units (points for PDFs).
    fn size(&self) -> (f32, f32);
    fn text_fragments(&self) -> anyhow::Result<Vec<TextFragment>>;
    /// Raster of the page, `scale` pixels per native unit.
    fn render(&self, scale: f32) -> anyhow::Result<DynamicImage>;
}

pub(crate) fn parse_text_spans<'a>(
    chars: impl Iterator<Item = PdfPageTextChar<'a>>,
    page_bbox: &BBox,
) -> Vec<CharSpan> {
    let mut spans: Vec<CharSpan> = Vec::new();

    for char in chars {
        let appended = match spans.last_mut() {
            Some(span) => span.append(&char, page_bbox).is_some(),
            None => false,
        };
        if !appended {
            if let Some(span) = CharSpan::new_from_char(&char, page_bbox) {
                spans.push(span);
            }
        }
    }

    spans
}

pub(crate) fn parse_text_lines(spans: Vec<CharSpan>) -> Vec<Line> {
    let mut lines: Vec<Line> = Vec::new();
    for span in spans {
        let rejected = match lines.last_mut() {
            Some(line) => line.append(span).err(),
            None => Some(span),
        };
        if let Some(span) = rejected {
            lines.push(Line::new_from_span(span));
        }
    }

    lines.into_iter().map(Line::finish).collect()
}

struct FragmentBuilder {
    bbox: BBox,
    last_line: BBox,
    rotation: f32,
    text: String,
}

impl FragmentBuilder {
    fn new(line: Line) -> Self {
        Self {
            bbox: line.bbox.clone(),
            last_line: line.bbox,
            rotation: line.rotation,
            text: line.text,
        }
    }

    fn accepts(&self, line: &Line) -> bool {
        let gap = line.bbox.y0 - self.last_line.y1;
        let line_height = self.last_line.height().max(line.bbox.height());
        line.rotation == self.rotation
            && gap >= -0.5 * line_height
            && gap <= FRAGMENT_LINE_GAP * line_height
            && self.bbox.overlap_x(&line.bbox) > 0f32
    }

    fn push(&mut self, line: Line) {
        self.bbox.merge(&line.bbox);
        if !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(&line.text);
        self.last_line = line.bbox;
    }

    fn build(self) -> TextFragment {
        TextFragment {
            bbox: self.bbox,
            text: self.text,
        }
    }
}

/// Stacks consecutive lines into paragraph-like fragments.
pub(crate) fn parse_text_fragments(lines: Vec<Line>) -> Vec<TextFragment> {
    let mut fragments: Vec<FragmentBuilder> = Vec::new();
    for line in lines {
        match fragments.last_mut() {
            Some(fragment) if fragment.accepts(&line) => fragment.push(line),
            _ => fragments.push(FragmentBuilder::new(line)),
        }
    }
    fragments.into_iter().map(FragmentBuilder::build).collect()
}

/// Binds pdfium once and hands out the shared instance.
pub struct PdfiumBackend {
    lib_dir: Option<PathBuf>,
    instance: OnceLock<Pdfium>,
    init: Mutex<()>,
}

impl std::fmt::Debug for PdfiumBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfiumBackend")
            .field("lib_dir", &self.lib_dir)
            .field("bound", &self.instance.get().is_some())
            .finish()
    }
}

impl PdfiumBackend {
    pub fn new(lib_dir: Option<PathBuf>) -> Self {
        Self {
            lib_dir,
            instance: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    /// The library in `lib_dir` when given, the system one otherwise.
    pub fn get(&self) -> Result<&Pdfium, PdfiumError> {
        if let Some(pdfium) = self.instance.get() {
            return Ok(pdfium);
        }
        let _guard = self.init.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pdfium) = self.instance.get() {
            return Ok(pdfium);
        }
        let bindings = match &self.lib_dir {
            Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
                .or_else(|_| Pdfium::bind_to_system_library())?,
            None => Pdfium::bind_to_system_library()?,
        };
        tracing::debug!("pdfium bound");
        Ok(self.instance.get_or_init(|| Pdfium::new(bindings)))
    }
}

pub struct PdfiumDocument<'a> {
    document: PdfDocument<'a>,
}

impl<'a> PdfiumDocument<'a> {
    pub fn open_file(pdfium: &'a Pdfium, path: &Path) -> Result<Self, PdfiumError> {
        let document = pdfium.load_pdf_from_file(path, None)?;
        Ok(Self { document })
    }

    pub fn open_bytes(pdfium: &'a Pdfium, data: &'a [u8]) -> Result<Self, PdfiumError> {
        let document = pdfium.load_pdf_from_byte_slice(data, None)?;
        Ok(Self { document })
    }
}

impl PagedDocument for PdfiumDocument<'_> {
    fn page_count(&self) -> usize {
        self.document.pages().len() as usize
    }

    fn page(&self, index: usize) -> anyhow::Result<Box<dyn DocumentPage + '_>> {
        let page = self
            .document
            .pages()
            .get(index.try_into()?)
            .with_context(|| format!("can't load page {index}"))?;
        Ok(Box::new(PdfiumPage { page }))
    }
}

pub struct PdfiumPage<'a> {
    page: PdfPage<'a>,
}

impl DocumentPage for PdfiumPage<'_> {
    fn size(&self) -> (f32, f32) {
        (self.page.width().value, self.page.height().value)
    }

    fn text_fragments(&self) -> anyhow::Result<Vec<TextFragment>> {
        let start_time = Instant::now();
        let (width, height) = self.size();
        let page_bbox = BBox {
            x0: 0f32,
            y0: 0f32,
            x1: width,
            y1: height,
        };
        let text = self.page.text().context("can't load page text layer")?;
        let chars = text.chars();
        let text_spans = parse_text_spans(chars.iter(), &page_bbox);
        let fragments = parse_text_fragments(parse_text_lines(text_spans));
        tracing::debug!(
            "Parsing text layer using pdfium took {}ms",
            start_time.elapsed().as_millis()
        );
        Ok(fragments)
    }

    fn render(&self, scale: f32) -> anyhow::Result<DynamicImage> {
        let image = self
            .page
            .render_with_config(&PdfRenderConfig::default().scale_page_by_factor(scale))
            .map(|bitmap| bitmap.as_image())?;
        Ok(image)
    }
}
