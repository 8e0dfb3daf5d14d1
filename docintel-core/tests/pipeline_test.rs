//! Integration tests for the page pipeline, driven by in-memory documents and mock OCR engines.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use docintel_core::{
    entities::{BBox, TextFragment},
    ocr::OcrDetection,
    process_pdf_to_layout_json, DocumentPage, DocumentProcessor, LayoutDocument, OcrEngine,
    OcrEngineFactory, OcrEnginePool, PageSource, PagedDocument, ProcessConfig, ProcessOptions,
    ProcessingError,
};
use image::{DynamicImage, GrayImage, Luma, RgbImage};

/// Everything the mock engine saw.
#[derive(Default)]
struct Recorder {
    builds: AtomicUsize,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, u32, u32)>>,
}

struct MockEngine {
    lang: String,
    detections: Vec<OcrDetection>,
    fail: bool,
    recorder: Arc<Recorder>,
}

impl OcrEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn recognize(&mut self, image: &RgbImage) -> anyhow::Result<Vec<OcrDetection>> {
        self.recorder.calls.fetch_add(1, Ordering::SeqCst);
        self.recorder
            .seen
            .lock()
            .unwrap()
            .push((self.lang.clone(), image.width(), image.height()));
        if self.fail {
            anyhow::bail!("model crashed");
        }
        Ok(self.detections.clone())
    }
}

struct MockFactory {
    detections: Vec<OcrDetection>,
    fail: bool,
    recorder: Arc<Recorder>,
}

impl OcrEngineFactory for MockFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn build(&self, lang: &str) -> anyhow::Result<Box<dyn OcrEngine>> {
        self.recorder.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            lang: lang.to_owned(),
            detections: self.detections.clone(),
            fail: self.fail,
            recorder: self.recorder.clone(),
        }))
    }
}

fn mock_processor(detections: Vec<OcrDetection>, fail: bool) -> (DocumentProcessor, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let pool = OcrEnginePool::new(vec![Box::new(MockFactory {
        detections,
        fail,
        recorder: recorder.clone(),
    })]);
    (
        DocumentProcessor::new(Arc::new(pool), ProcessConfig::default()),
        recorder,
    )
}

fn detection(polygon: &[(f32, f32)], text: &str, confidence: f32) -> OcrDetection {
    OcrDetection {
        polygon: polygon.to_vec(),
        text: text.to_owned(),
        confidence,
    }
}

fn fragment(bbox: [f32; 4], text: &str) -> TextFragment {
    TextFragment {
        bbox: BBox {
            x0: bbox[0],
            y0: bbox[1],
            x1: bbox[2],
            y1: bbox[3],
        },
        text: text.to_owned(),
    }
}

#[derive(Clone)]
struct FakePage {
    size: (f32, f32),
    fragments: Vec<TextFragment>,
    renderable: bool,
    broken_text_layer: bool,
}

impl FakePage {
    fn native(fragments: Vec<TextFragment>) -> Self {
        Self {
            size: (612.0, 792.0),
            fragments,
            renderable: true,
            broken_text_layer: false,
        }
    }

    fn scanned() -> Self {
        Self::native(Vec::new())
    }
}

impl DocumentPage for FakePage {
    fn size(&self) -> (f32, f32) {
        self.size
    }

    fn text_fragments(&self) -> anyhow::Result<Vec<TextFragment>> {
        if self.broken_text_layer {
            anyhow::bail!("corrupted content stream");
        }
        Ok(self.fragments.clone())
    }

    fn render(&self, scale: f32) -> anyhow::Result<DynamicImage> {
        if !self.renderable {
            anyhow::bail!("render failed");
        }
        let (w, h) = self.size;
        Ok(DynamicImage::ImageLuma8(GrayImage::from_pixel(
            (w * scale).round() as u32,
            (h * scale).round() as u32,
            Luma([255]),
        )))
    }
}

struct FakeDocument {
    pages: Vec<FakePage>,
}

impl PagedDocument for FakeDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page(&self, index: usize) -> anyhow::Result<Box<dyn DocumentPage + '_>> {
        let page = self
            .pages
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("no page {index}"))?;
        Ok(Box::new(page.clone()))
    }
}

fn ocr_on() -> ProcessOptions {
    ProcessOptions::default()
}

fn ocr_off() -> ProcessOptions {
    ProcessOptions {
        enable_ocr: false,
        ..Default::default()
    }
}

#[test]
fn test_native_page_never_runs_ocr() {
    let (processor, recorder) =
        mock_processor(vec![detection(&[(0.0, 0.0), (5.0, 5.0)], "ocr text", 0.9)], false);
    let document = FakeDocument {
        pages: vec![FakePage::native(vec![fragment(
            [10.0, 10.0, 100.0, 30.0],
            "Hello World",
        )])],
    };

    let doc = processor
        .process_document(&document, "hello.pdf", &ocr_on())
        .unwrap();

    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.builds.load(Ordering::SeqCst), 0);
    let page = &doc.layout.pages[0];
    assert_eq!(page.blocks.len(), 1);
    let block = &page.blocks[0];
    assert_eq!(block.id, "b1");
    assert_eq!(block.text, "Hello World");
    assert_eq!(block.confidence, 1.0);
    assert_eq!(block.bbox, [10, 10, 100, 30]);
    assert_eq!(doc.reports[0].source, PageSource::Native);
}

#[test]
fn test_empty_page_without_ocr_stays_empty() {
    let (processor, recorder) =
        mock_processor(vec![detection(&[(0.0, 0.0), (5.0, 5.0)], "text", 0.9)], false);
    let document = FakeDocument {
        pages: vec![FakePage::native(vec![fragment([0.0, 0.0, 1.0, 1.0], " \n\t")])],
    };

    let doc = processor
        .process_document(&document, "blank.pdf", &ocr_off())
        .unwrap();

    assert!(doc.layout.pages[0].blocks.is_empty());
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(doc.reports[0].source, PageSource::OcrDisabled);
}

#[test]
fn test_blank_scan_gives_no_blocks() {
    let (processor, recorder) = mock_processor(Vec::new(), false);
    let document = FakeDocument {
        pages: vec![FakePage::scanned()],
    };

    let doc = processor
        .process_document(&document, "blank_scan.pdf", &ocr_on())
        .unwrap();

    assert!(doc.layout.pages[0].blocks.is_empty());
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(doc.reports[0].source, PageSource::Blank);
    assert_eq!(doc.degraded_pages().count(), 0);
}

#[test]
fn test_ocr_fallback_in_page_points() {
    // Rendered at 300 DPI: 612x792pt page becomes 2550x3300px
    let detections = vec![
        detection(
            &[(1252.0, 1252.0), (2502.0, 1252.0), (2502.0, 1502.0), (1252.0, 1502.0)],
            "second",
            0.8,
        ),
        detection(&[(127.0, 127.0), (1252.0, 127.0), (1252.0, 377.0)], "first", 1.4),
    ];
    let (processor, recorder) = mock_processor(detections, false);
    let document = FakeDocument {
        pages: vec![FakePage::scanned()],
    };

    let doc = processor
        .process_document(&document, "scan.pdf", &ocr_on())
        .unwrap();

    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen.as_slice(), [("en".to_owned(), 2550, 3300)]);

    let page = &doc.layout.pages[0];
    assert_eq!((page.width, page.height), (612, 792));
    let ids: Vec<_> = page.blocks.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, ["ocr2", "ocr1"]);
    assert_eq!(page.blocks[0].bbox, [30, 30, 300, 90]);
    assert_eq!(page.blocks[1].bbox, [300, 300, 600, 360]);
    assert_eq!(page.blocks[0].confidence, 1.0);
    assert_eq!(page.blocks[1].confidence, 0.8);
    assert_eq!(
        doc.reports[0].source,
        PageSource::Ocr {
            engine: "mock".into()
        }
    );
}

#[test]
fn test_render_failure_degrades_only_that_page() {
    let (processor, recorder) = mock_processor(
        vec![detection(&[(0.0, 0.0), (100.0, 50.0)], "scanned", 0.9)],
        false,
    );
    let mut broken = FakePage::scanned();
    broken.renderable = false;
    let document = FakeDocument {
        pages: vec![
            broken,
            FakePage::native(vec![fragment([72.0, 72.0, 200.0, 90.0], "native")]),
            FakePage::scanned(),
        ],
    };

    let doc = processor
        .process_document(&document, "mixed.pdf", &ocr_on())
        .unwrap();

    assert_eq!(doc.layout.num_pages, 3);
    assert!(doc.layout.pages[0].blocks.is_empty());
    assert!(matches!(doc.reports[0].source, PageSource::OcrFailed { .. }));
    assert_eq!(doc.layout.pages[1].blocks[0].text, "native");
    assert_eq!(doc.layout.pages[2].blocks[0].text, "scanned");
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(doc.degraded_pages().count(), 1);
}

#[test]
fn test_erroring_engine_degrades_page() {
    let (processor, _) = mock_processor(Vec::new(), true);
    let document = FakeDocument {
        pages: vec![FakePage::scanned()],
    };

    let doc = processor
        .process_document(&document, "scan.pdf", &ocr_on())
        .unwrap();

    assert!(doc.layout.pages[0].blocks.is_empty());
    match &doc.reports[0].source {
        PageSource::OcrFailed { reasons } => assert_eq!(reasons, &["mock: model crashed"]),
        other => panic!("unexpected source {other:?}"),
    }
}

#[test]
fn test_no_engines_means_unavailable() {
    let processor =
        DocumentProcessor::new(Arc::new(OcrEnginePool::disabled()), ProcessConfig::default());
    let document = FakeDocument {
        pages: vec![FakePage::scanned()],
    };
    let doc = processor
        .process_document(&document, "scan.pdf", &ocr_on())
        .unwrap();
    assert!(doc.layout.pages[0].blocks.is_empty());
    assert_eq!(doc.reports[0].source, PageSource::OcrUnavailable);
}

#[test]
fn test_text_layer_failure_is_fatal() {
    let (processor, _) = mock_processor(Vec::new(), false);
    let mut broken = FakePage::native(Vec::new());
    broken.broken_text_layer = true;
    let document = FakeDocument {
        pages: vec![FakePage::scanned(), broken],
    };

    let err = processor
        .process_document(&document, "broken.pdf", &ocr_on())
        .err()
        .unwrap();
    match err {
        ProcessingError::Parse { page, reason, .. } => {
            assert_eq!(page, 2);
            assert!(reason.contains("corrupted content stream"));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_reading_order_across_native_blocks() {
    let (processor, _) = mock_processor(Vec::new(), false);
    let document = FakeDocument {
        pages: vec![FakePage::native(vec![
            fragment([10.0, 50.0, 100.0, 60.0], "bottom"),
            fragment([200.0, 10.0, 300.0, 20.0], "top right"),
            fragment([10.0, 10.0, 100.0, 20.0], "top left"),
            fragment([10.0, 10.0, 100.0, 20.0], "top left again"),
        ])],
    };

    let doc = processor
        .process_document(&document, "order.pdf", &ocr_off())
        .unwrap();

    let texts: Vec<_> = doc.layout.pages[0]
        .blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect();
    assert_eq!(texts, ["top left", "top left again", "top right", "bottom"]);
}

#[test]
fn test_blocks_are_never_empty_and_confidences_in_range() {
    let (processor, _) = mock_processor(
        vec![
            detection(&[(0.0, 0.0), (10.0, 10.0)], "   ", 0.9),
            detection(&[], "no geometry", 0.9),
            detection(&[(0.0, 20.0), (10.0, 30.0)], "ok", f32::NAN),
            detection(&[(0.0, 40.0), (10.0, 50.0)], "neg", -3.0),
        ],
        false,
    );
    let document = FakeDocument {
        pages: vec![
            FakePage::native(vec![
                fragment([0.0, 0.0, 5.0, 5.0], "  line one \n\n  line two  "),
                fragment([0.0, 10.0, 5.0, 15.0], "\n\n"),
            ]),
            FakePage::scanned(),
        ],
    };

    let doc = processor
        .process_document(&document, "mixed.pdf", &ocr_on())
        .unwrap();

    let native = &doc.layout.pages[0].blocks;
    assert_eq!(native.len(), 1);
    assert_eq!(native[0].text, "line one\nline two");

    for block in doc.layout.pages.iter().flat_map(|p| p.blocks.iter()) {
        assert!(!block.text.trim().is_empty());
        assert!((0.0..=1.0).contains(&block.confidence));
        assert!(block.bbox[0] <= block.bbox[2] && block.bbox[1] <= block.bbox[3]);
        if block.id.starts_with("b") {
            assert_eq!(block.confidence, 1.0);
        }
    }
    let ocr_ids: Vec<_> = doc.layout.pages[1]
        .blocks
        .iter()
        .map(|b| b.id.as_str())
        .collect();
    assert_eq!(ocr_ids, ["ocr3", "ocr4"]);
}

#[test]
fn test_json_round_trip() {
    let (processor, _) = mock_processor(Vec::new(), false);
    let document = FakeDocument {
        pages: vec![
            FakePage::native(vec![fragment([1.0, 2.0, 3.0, 4.0], "one")]),
            FakePage::scanned(),
        ],
    };
    let doc = processor
        .process_document(&document, "reports/annual.pdf", &ocr_on())
        .unwrap();
    let json = doc.to_json().unwrap();

    let parsed: LayoutDocument = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.num_pages, parsed.pages.len());
    assert_eq!(parsed.document_id, "annual");
    assert_eq!(parsed.filename, "reports/annual.pdf");
    assert_eq!(parsed.pages[0].page, 1);
    assert_eq!(parsed.pages[1].page, 2);

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["pages"][0]["blocks"][0]["role"], "text");
}

#[test]
fn test_explicit_document_id_wins() {
    let (processor, _) = mock_processor(Vec::new(), false);
    let document = FakeDocument { pages: vec![] };
    let options = ProcessOptions {
        document_id: Some("batch-42".into()),
        ..Default::default()
    };
    let doc = processor
        .process_document(&document, "file.pdf", &options)
        .unwrap();
    assert_eq!(doc.layout.document_id, "batch-42");
    assert_eq!(doc.layout.num_pages, 0);
}

#[test]
fn test_image_is_single_rgb_page() {
    let (processor, recorder) = mock_processor(
        vec![
            detection(&[(10.0, 80.0), (90.0, 80.0), (90.0, 95.0), (10.0, 95.0)], "Total", 0.97),
            detection(&[(10.0, 10.0), (150.0, 10.0), (150.0, 30.0), (10.0, 30.0)], "Invoice", 0.99),
        ],
        false,
    );
    let image = DynamicImage::ImageLuma8(GrayImage::new(200, 100));

    let doc = processor
        .process_image(image, "receipt.png", &ocr_on())
        .unwrap();

    assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(doc.layout.num_pages, 1);
    assert_eq!(doc.layout.document_id, "receipt");
    let page = &doc.layout.pages[0];
    assert_eq!((page.page, page.width, page.height), (1, 200, 100));
    let texts: Vec<_> = page.blocks.iter().map(|b| b.text.as_str()).collect();
    assert_eq!(texts, ["Invoice", "Total"]);
    assert_eq!(page.blocks[0].bbox, [10, 10, 150, 30]);
}

#[test]
fn test_image_without_ocr_stays_empty() {
    let (processor, recorder) = mock_processor(
        vec![detection(&[(10.0, 10.0), (150.0, 10.0), (150.0, 30.0), (10.0, 30.0)], "Invoice", 0.99)],
        false,
    );
    let image = DynamicImage::ImageRgb8(RgbImage::new(200, 100));

    let doc = processor
        .process_image(image, "receipt.png", &ocr_off())
        .unwrap();

    assert_eq!(recorder.builds.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    let page = &doc.layout.pages[0];
    assert_eq!((page.page, page.width, page.height), (1, 200, 100));
    assert!(page.blocks.is_empty());
    assert_eq!(doc.reports[0].source, PageSource::OcrDisabled);
}

#[test]
fn test_languages_get_their_own_engine() {
    let (processor, recorder) =
        mock_processor(vec![detection(&[(0.0, 0.0), (5.0, 5.0)], "x", 0.9)], false);
    let image = || DynamicImage::ImageRgb8(RgbImage::new(20, 20));

    for lang in ["en", "fr", "en"] {
        let options = ProcessOptions {
            ocr_lang: lang.into(),
            ..Default::default()
        };
        processor.process_image(image(), "a.png", &options).unwrap();
    }

    assert_eq!(recorder.builds.load(Ordering::SeqCst), 2);
    let langs: Vec<_> = recorder
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(lang, _, _)| lang.clone())
        .collect();
    assert_eq!(langs, ["en", "fr", "en"]);
}

#[test]
fn test_image_decode_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not_an_image.png");
    std::fs::write(&path, b"definitely not a png").unwrap();

    let (processor, _) = mock_processor(Vec::new(), false);
    let result = processor.process_image_file(&path, &ocr_on());
    assert!(matches!(result, Err(ProcessingError::Image { .. })));
}

#[test]
fn test_corrupted_pdf_is_fatal_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupted.pdf");
    std::fs::write(&path, b"%PDF-1.4\nthis is not really a pdf").unwrap();

    let result = process_pdf_to_layout_json(
        &path,
        None,
        true,
        "en",
        Arc::new(OcrEnginePool::disabled()),
    );
    assert!(matches!(
        result,
        Err(ProcessingError::Open { .. } | ProcessingError::BackendUnavailable(_))
    ));
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

/// Single page, Helvetica 16pt "Hello World" near the top left corner.
fn hello_world_pdf() -> Vec<u8> {
    let content = "BT /F1 16 Tf 10 770 Td (Hello World) Tj ET";
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_owned(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_owned(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R \
         /Resources << /Font << /F1 5 0 R >> >> >>"
            .to_owned(),
        format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            content.len(),
            content
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_owned(),
    ];

    let mut pdf = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (idx, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", idx + 1, body).as_bytes());
    }
    let xref_offset = pdf.len();
    pdf.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
    for offset in offsets {
        pdf.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_offset
        )
        .as_bytes(),
    );
    pdf
}

#[test]
fn test_pdfium_hello_world() {
    let (processor, recorder) = mock_processor(Vec::new(), false);
    let result = processor.process_pdf_bytes(&hello_world_pdf(), "hello.pdf", &ocr_on());
    let doc = match result {
        Ok(doc) => doc,
        // pdfium shared library not installed on this machine
        Err(ProcessingError::BackendUnavailable(_)) => return,
        Err(e) => panic!("unexpected error {e}"),
    };

    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    let page = &doc.layout.pages[0];
    assert_eq!((page.width, page.height), (612, 792));
    assert_eq!(page.blocks.len(), 1);
    let block = &page.blocks[0];
    assert_eq!(block.id, "b1");
    assert_eq!(block.text, "Hello World");
    assert_eq!(block.confidence, 1.0);
    let [x0, y0, x1, y1] = block.bbox;
    assert!((9..=12).contains(&x0), "x0 = {x0}");
    assert!((5..=14).contains(&y0), "y0 = {y0}");
    assert!((80..=110).contains(&x1), "x1 = {x1}");
    assert!((20..=28).contains(&y1), "y1 = {y1}");
}
