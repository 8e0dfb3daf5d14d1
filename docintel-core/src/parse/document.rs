use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use image::DynamicImage;
use tracing::instrument;
use uuid::Uuid;

use super::{
    native::{PagedDocument, PdfiumBackend, PdfiumDocument},
    order::sort_reading_order,
    page::{debug_page, ocr_raster, parse_page, PageOptions},
};
use crate::{
    entities::{LayoutDocument, LayoutPage, PageReport, PageSource, ProcessedDocument},
    error::{ProcessingError, Result},
    ocr::{raster::DEFAULT_OCR_DPI, OcrEnginePool},
    utils::sanitize_doc_name,
};

/// Process-wide settings of a [`DocumentProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Resolution used to rasterize PDF pages that need OCR.
    pub ocr_dpi: f32,

    /// Optional directory for debug output. When provided, every page is saved as
    /// `<debug_dir>/<document_id>/page_<n>.png` with its blocks drawn over it.
    pub debug_dir: Option<PathBuf>,

    /// Directory holding the pdfium shared library. Falls back to the system library.
    pub pdfium_lib_dir: Option<PathBuf>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            ocr_dpi: DEFAULT_OCR_DPI,
            debug_dir: None,
            pdfium_lib_dir: None,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Identifier written into the output. Defaults to the filename stem, then a fresh UUID.
    pub document_id: Option<String>,

    /// Run OCR on pages without a native text layer.
    pub enable_ocr: bool,

    /// Language code handed to the OCR engines.
    pub ocr_lang: String,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            document_id: None,
            enable_ocr: true,
            ocr_lang: "en".to_owned(),
        }
    }
}

/// Resolves the output id: explicit id, filename stem, fresh UUID v4.
pub(crate) fn resolve_document_id(document_id: Option<&str>, filename: &str) -> String {
    document_id
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            Path::new(filename)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .filter(|stem| !stem.is_empty())
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Turns PDFs and images into [`LayoutDocument`]s.
///
/// Pages are parsed sequentially: native text layer first, the shared
/// [`OcrEnginePool`] only for pages that have none. The processor is cheap to
/// clone and every clone shares the same pool and pdfium binding.
#[derive(Debug, Clone)]
pub struct DocumentProcessor {
    ocr_pool: Arc<OcrEnginePool>,
    pdfium: Arc<PdfiumBackend>,
    config: ProcessConfig,
}

impl DocumentProcessor {
    /// Creates a processor around an OCR pool built once at start-up.
    ///
    /// pdfium is bound lazily on the first PDF, so a processor that only sees
    /// images never needs the library.
    pub fn new(ocr_pool: Arc<OcrEnginePool>, config: ProcessConfig) -> Self {
        let pdfium = Arc::new(PdfiumBackend::new(config.pdfium_lib_dir.clone()));
        Self {
            ocr_pool,
            pdfium,
            config,
        }
    }

    pub fn ocr_pool(&self) -> &Arc<OcrEnginePool> {
        &self.ocr_pool
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Parses a PDF from disk.
    ///
    /// # Errors
    /// Fails when pdfium can't be bound, the file can't be opened as a PDF or a
    /// page's text layer can't be read. OCR problems only degrade the page.
    pub fn process_pdf_file(&self, path: &Path, options: &ProcessOptions) -> Result<ProcessedDocument> {
        let pdfium = self
            .pdfium
            .get()
            .map_err(|e| ProcessingError::BackendUnavailable(e.to_string()))?;
        let document =
            PdfiumDocument::open_file(pdfium, path).map_err(|e| ProcessingError::open(path, e))?;
        self.process_document(&document, &file_name(path), options)
    }

    /// Parses a PDF held in memory, `filename` is only used for naming.
    pub fn process_pdf_bytes(
        &self,
        data: &[u8],
        filename: &str,
        options: &ProcessOptions,
    ) -> Result<ProcessedDocument> {
        let pdfium = self
            .pdfium
            .get()
            .map_err(|e| ProcessingError::BackendUnavailable(e.to_string()))?;
        let document =
            PdfiumDocument::open_bytes(pdfium, data).map_err(|e| ProcessingError::open(filename, e))?;
        self.process_document(&document, filename, options)
    }

    /// Parses any [`PagedDocument`], page by page.
    #[instrument(skip_all, fields(filename = filename))]
    pub fn process_document(
        &self,
        document: &dyn PagedDocument,
        filename: &str,
        options: &ProcessOptions,
    ) -> Result<ProcessedDocument> {
        let start_time = Instant::now();
        let document_id = resolve_document_id(options.document_id.as_deref(), filename);
        let debug_dir = self.prepare_debug_dir(&document_id);
        let page_options = PageOptions {
            enable_ocr: options.enable_ocr,
            ocr_lang: &options.ocr_lang,
            ocr_dpi: self.config.ocr_dpi,
            debug_dir: debug_dir.as_deref(),
        };

        let page_count = document.page_count();
        let mut pages = Vec::with_capacity(page_count);
        let mut reports = Vec::with_capacity(page_count);
        for index in 0..page_count {
            let page_id = index + 1;
            let (page, report) = document
                .page(index)
                .and_then(|page| parse_page(page.as_ref(), page_id, &page_options, &self.ocr_pool))
                .map_err(|e| {
                    tracing::error!("Error parsing page {page_id} of {filename}: {e:#}");
                    ProcessingError::parse(filename, page_id, &e)
                })?;
            pages.push(page);
            reports.push(report);
        }

        let duration = start_time.elapsed();
        tracing::info!(
            "Parsed {filename} ({page_count} pages) in {}ms",
            duration.as_millis()
        );
        Ok(ProcessedDocument::new(
            LayoutDocument::new(document_id, filename.to_owned(), pages),
            reports,
            duration,
        ))
    }

    /// Decodes an image file and runs it through OCR as a single page.
    pub fn process_image_file(&self, path: &Path, options: &ProcessOptions) -> Result<ProcessedDocument> {
        let image = image::open(path).map_err(|source| ProcessingError::Image {
            path: path.to_owned(),
            source,
        })?;
        self.process_image(image, &file_name(path), options)
    }

    /// Decodes an in-memory image, the format is guessed from its content.
    pub fn process_image_bytes(
        &self,
        data: &[u8],
        filename: &str,
        options: &ProcessOptions,
    ) -> Result<ProcessedDocument> {
        let image = image::load_from_memory(data).map_err(|source| ProcessingError::Image {
            path: PathBuf::from(filename),
            source,
        })?;
        self.process_image(image, filename, options)
    }

    /// Single-page document from an already decoded image. Coordinates are pixels.
    ///
    /// OCR is the only text source for an image: with `options.enable_ocr` off the
    /// page comes back empty and [`PageSource::OcrDisabled`].
    #[instrument(skip_all, fields(filename = filename))]
    pub fn process_image(
        &self,
        image: DynamicImage,
        filename: &str,
        options: &ProcessOptions,
    ) -> Result<ProcessedDocument> {
        let start_time = Instant::now();
        let document_id = resolve_document_id(options.document_id.as_deref(), filename);
        let (width, height) = (image.width(), image.height());
        let debug_image = self.config.debug_dir.as_ref().map(|_| image.clone());

        let (mut blocks, source) = if options.enable_ocr {
            ocr_raster(&self.ocr_pool, image, &options.ocr_lang, 1f32)
        } else {
            tracing::debug!("OCR disabled, {filename} has no text source");
            (Vec::new(), PageSource::OcrDisabled)
        };
        sort_reading_order(&mut blocks);

        if let (Some(dir), Some(debug_image)) = (self.prepare_debug_dir(&document_id), debug_image) {
            if let Err(e) = debug_page(&dir, 1, &debug_image, &blocks) {
                tracing::warn!("can't write debug image for {filename}: {e:#}");
            }
        }

        let duration = start_time.elapsed();
        let report = PageReport {
            page: 1,
            source,
            num_blocks: blocks.len(),
            duration,
        };
        let page = LayoutPage {
            page: 1,
            width,
            height,
            blocks,
        };
        Ok(ProcessedDocument::new(
            LayoutDocument::new(document_id, filename.to_owned(), vec![page]),
            vec![report],
            duration,
        ))
    }

    fn prepare_debug_dir(&self, document_id: &str) -> Option<PathBuf> {
        let root = self.config.debug_dir.as_ref()?;
        let dir = root.join(sanitize_doc_name(document_id));
        match std::fs::create_dir_all(&dir) {
            Ok(()) => Some(dir),
            Err(e) => {
                tracing::warn!("can't create debug dir {}: {e}", dir.display());
                None
            }
        }
    }
}
