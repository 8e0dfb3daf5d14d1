use std::{path::Path, time::Instant};

use anyhow::Context;
use image::DynamicImage;
use tracing::instrument;

use crate::{
    blocks::{native_blocks, ocr_blocks, Block},
    draw::draw_blocks,
    entities::{LayoutPage, PageID, PageReport, PageSource},
    ocr::{
        raster::{normalize_color, render_scale},
        OcrEnginePool, OcrOutcome,
    },
};

use super::{native::DocumentPage, order::sort_reading_order};

#[derive(Debug, Clone)]
pub(crate) struct PageOptions<'a> {
    pub enable_ocr: bool,
    pub ocr_lang: &'a str,
    pub ocr_dpi: f32,
    pub debug_dir: Option<&'a Path>,
}

/// Runs the OCR chain on a raster. `to_page` maps raster pixels to page units.
/// Never fails: whatever goes wrong ends up in the returned [`PageSource`].
pub(crate) fn ocr_raster(
    pool: &OcrEnginePool,
    raster: DynamicImage,
    lang: &str,
    to_page: f32,
) -> (Vec<Block>, PageSource) {
    let rgb = normalize_color(raster);
    match pool.recognize(&rgb, lang) {
        OcrOutcome::Recognized { engine, detections } => {
            let blocks = ocr_blocks(&detections, to_page);
            tracing::info!(
                "{engine} recognized {} blocks out of {} regions",
                blocks.len(),
                detections.len()
            );
            (
                blocks,
                PageSource::Ocr {
                    engine: engine.to_owned(),
                },
            )
        }
        OcrOutcome::NoDetections => {
            tracing::warn!("OCR found no text");
            (Vec::new(), PageSource::Blank)
        }
        OcrOutcome::Unavailable => {
            tracing::warn!("no OCR engine available, leaving page empty");
            (Vec::new(), PageSource::OcrUnavailable)
        }
        OcrOutcome::Failed(failures) => {
            let reasons: Vec<String> = failures.iter().map(ToString::to_string).collect();
            tracing::warn!("OCR failed, leaving page empty: {}", reasons.join("; "));
            (Vec::new(), PageSource::OcrFailed { reasons })
        }
    }
}

/// Native text first, OCR only when the text layer gave nothing.
#[instrument(skip_all, fields(page = page_id))]
pub(crate) fn parse_page(
    page: &dyn DocumentPage,
    page_id: PageID,
    options: &PageOptions,
    ocr_pool: &OcrEnginePool,
) -> anyhow::Result<(LayoutPage, PageReport)> {
    let start_time = Instant::now();
    let (width, height) = page.size();

    let fragments = page.text_fragments()?;
    let mut blocks = native_blocks(&fragments);

    let source = if !blocks.is_empty() {
        PageSource::Native
    } else if !options.enable_ocr {
        tracing::debug!("page {page_id} has no native text and OCR is disabled");
        PageSource::OcrDisabled
    } else {
        tracing::info!("page {page_id} has no native text, running OCR");
        let scale = render_scale(options.ocr_dpi);
        match page.render(scale) {
            Ok(raster) => {
                let (ocr, source) = ocr_raster(ocr_pool, raster, options.ocr_lang, 1f32 / scale);
                blocks = ocr;
                source
            }
            Err(e) => {
                tracing::warn!("can't rasterize page {page_id} for OCR: {e:#}");
                PageSource::OcrFailed {
                    reasons: vec![format!("render: {e:#}")],
                }
            }
        }
    };

    sort_reading_order(&mut blocks);

    if let Some(debug_dir) = options.debug_dir {
        let debug = page
            .render(1f32)
            .and_then(|image| debug_page(debug_dir, page_id, &image, &blocks));
        if let Err(e) = debug {
            tracing::warn!("can't write debug image for page {page_id}: {e:#}");
        }
    }

    let duration = start_time.elapsed();
    tracing::debug!(
        "Parsing page {page_id} took {}ms ({source:?})",
        duration.as_millis()
    );
    let report = PageReport {
        page: page_id,
        source,
        num_blocks: blocks.len(),
        duration,
    };
    let layout_page = LayoutPage {
        page: page_id,
        width: width as u32,
        height: height as u32,
        blocks,
    };
    Ok((layout_page, report))
}

pub(crate) fn debug_page(
    debug_dir: &Path,
    page_id: PageID,
    page_image: &DynamicImage,
    blocks: &[Block],
) -> anyhow::Result<()> {
    let output_file = debug_dir.join(format!("page_{}.png", page_id));
    draw_blocks(blocks, page_image)
        .save(&output_file)
        .with_context(|| format!("error saving {}", output_file.display()))
}
