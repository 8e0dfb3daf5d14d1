use std::{path::Path, sync::Arc};

pub(crate) mod draw;
pub mod parse;

pub mod blocks;
pub mod entities;
pub mod error;
pub mod ocr;
pub mod utils;

pub use blocks::{Block, BlockRole};
pub use entities::{LayoutDocument, LayoutPage, PageReport, PageSource, ProcessedDocument};
pub use error::ProcessingError;
pub use ocr::{OcrConfig, OcrEngine, OcrEngineFactory, OcrEngineKind, OcrEnginePool};
pub use parse::{
    document::{DocumentProcessor, ProcessConfig, ProcessOptions},
    native::{DocumentPage, PagedDocument},
    order::sort_reading_order,
};
pub use utils::{sanitize_doc_name, save_layout_document};

/// Parses a PDF and returns the layout as pretty-printed JSON.
///
/// `document_id` falls back to the file stem. Pages without native text go
/// through `ocr_pool` when `enable_ocr` is set.
pub fn process_pdf_to_layout_json(
    pdf_path: impl AsRef<Path>,
    document_id: Option<&str>,
    enable_ocr: bool,
    ocr_lang: &str,
    ocr_pool: Arc<OcrEnginePool>,
) -> Result<String, ProcessingError> {
    let processor = DocumentProcessor::new(ocr_pool, ProcessConfig::default());
    let options = ProcessOptions {
        document_id: document_id.map(str::to_owned),
        enable_ocr,
        ocr_lang: ocr_lang.to_owned(),
    };
    let doc = processor.process_pdf_file(pdf_path.as_ref(), &options)?;
    Ok(doc.to_json()?)
}

/// OCRs an image file into a single-page layout, returned as pretty-printed JSON.
pub fn process_image_to_layout_json(
    image_path: impl AsRef<Path>,
    document_id: Option<&str>,
    ocr_lang: &str,
    ocr_pool: Arc<OcrEnginePool>,
) -> Result<String, ProcessingError> {
    let processor = DocumentProcessor::new(ocr_pool, ProcessConfig::default());
    let options = ProcessOptions {
        document_id: document_id.map(str::to_owned),
        enable_ocr: true,
        ocr_lang: ocr_lang.to_owned(),
    };
    let doc = processor.process_image_file(image_path.as_ref(), &options)?;
    Ok(doc.to_json()?)
}
