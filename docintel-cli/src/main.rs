use clap::Parser;
use colored::Colorize;

use docintel_core::{
    ocr::{
        default_model_dir,
        session::{ORTConfig, OrtExecutionProvider},
    },
    save_layout_document, DocumentProcessor, OcrConfig, OcrEngineKind, OcrEnginePool,
    ProcessConfig, ProcessOptions,
};
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use memmap2::Mmap;
use serde::Serialize;
use std::{
    collections::HashSet,
    fmt::Write,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Instant,
};
use tokio::fs::File;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "docintel - batch layout extraction for PDF documents",
    long_about = "docintel walks a directory for PDF files and writes one layout JSON per document. Pages with a native text layer are read directly, scanned pages go through OCR."
)]
struct Args {
    /// Directory searched recursively for `*.pdf` files
    input_dir: PathBuf,

    /// Directory receiving `<stem>_<document_id>.json` files, created if missing.
    /// Input subdirectories are mirrored.
    output_dir: PathBuf,

    #[arg(
        long,
        default_value_t = false,
        help = "Reprocess documents that already have an output file"
    )]
    overwrite: bool,

    #[arg(
        long,
        short = 'v',
        default_value_t = false,
        help = "Log every document instead of showing a progress bar"
    )]
    verbose: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Leave pages without native text empty instead of running OCR"
    )]
    no_ocr: bool,

    #[arg(
        long,
        env = "DOCINTEL_OCR_LANG",
        default_value = "en",
        help = "Language code handed to the OCR engines"
    )]
    ocr_lang: String,

    /// OCR engines tried in order until one finds text
    #[arg(
        long,
        env = "DOCINTEL_OCR_ENGINES",
        value_delimiter = ',',
        default_value = "paddle,tesseract"
    )]
    ocr_engines: Vec<OcrEngineKind>,

    #[arg(
        long,
        env = "DOCINTEL_OCR_DPI",
        default_value_t = 300f32,
        help = "Resolution used to rasterize pages for OCR"
    )]
    ocr_dpi: f32,

    /// Directory holding the PaddleOCR ONNX models and dictionaries.
    ///
    /// Defaults to the user cache directory.
    #[arg(
        long,
        env = "DOCINTEL_MODEL_DIR",
        help = "Directory containing the OCR models"
    )]
    model_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "TESSERACT_CMD",
        default_value = "tesseract",
        help = "Tesseract executable"
    )]
    tesseract_cmd: PathBuf,

    #[arg(
        long,
        env = "PDFIUM_LIB_DIR",
        help = "Directory containing the pdfium shared library"
    )]
    pdfium_lib_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "DOCINTEL_DEBUG_DIR",
        help = "Save every page with its blocks drawn over it to this directory"
    )]
    debug_dir: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = cfg!(target_os = "macos"),
        help = "Enable or disable the use of CoreML for OCR inference"
    )]
    coreml: bool,

    #[arg(
        long,
        default_value_t = true,
        help = "Enable or disable Apple Neural Engine acceleration (only applies when CoreML is enabled)"
    )]
    use_ane: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Enable or disable the use of TensorRT for OCR inference"
    )]
    trt: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Enable or disable the use of CUDA for OCR inference"
    )]
    cuda: bool,

    #[arg(
        long,
        help = "CUDA device ID to use (0 for first GPU)",
        default_value_t = 0
    )]
    device_id: i32,

    #[arg(
        long,
        help = "Number of threads to use for parallel processing within operations",
        default_value = "4"
    )]
    intra_threads: usize,

    #[arg(
        long,
        help = "Number of threads to use for executing operations in parallel",
        default_value = "1"
    )]
    inter_threads: usize,

    #[arg(long, short = 'O', help = "Ort graph optimization level")]
    graph_opt_level: Option<u8>,
}

/// One line per document, success on stdout and errors on stderr.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
enum DocumentStatus {
    Success {
        input: String,
        output: String,
        document_id: String,
        pages: usize,
    },
    Error {
        input: String,
        error: String,
    },
}

#[derive(Debug, Default)]
struct BatchSummary {
    succeeded: usize,
    skipped: usize,
    failed: usize,
}

/// Degraded pages and missing engines stay visible above the progress bar.
fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "docintel_core=info,docintel_cli=info"
    } else {
        "docintel_core=warn,docintel_cli=warn"
    }
}

fn init_tracing(verbose: bool) {
    let env_filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_ep_args(args: &Args) -> Vec<OrtExecutionProvider> {
    let mut providers = Vec::new();
    if args.trt {
        providers.push(OrtExecutionProvider::Trt(args.device_id));
    }
    if args.cuda {
        providers.push(OrtExecutionProvider::CUDA(args.device_id));
    }

    if args.coreml {
        providers.push(OrtExecutionProvider::CoreML {
            ane_only: args.use_ane,
        });
    }
    providers.push(OrtExecutionProvider::CPU);
    providers
}

fn ocr_config(args: &Args) -> OcrConfig {
    OcrConfig {
        engines: if args.no_ocr {
            Vec::new()
        } else {
            args.ocr_engines.clone()
        },
        model_dir: args.model_dir.clone().unwrap_or_else(default_model_dir),
        tesseract_cmd: args.tesseract_cmd.clone(),
        ort_config: ORTConfig {
            execution_providers: parse_ep_args(args),
            intra_threads: args.intra_threads,
            inter_threads: args.inter_threads,
            opt_level: args.graph_opt_level,
        },
    }
}

/// All `*.pdf` files under `dir`, sorted by path.
fn collect_pdfs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut pdfs = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() && is_pdf(&path) {
                pdfs.push(path);
            }
        }
    }
    pdfs.sort();
    Ok(pdfs)
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

fn doc_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
}

fn output_file_name(stem: &str, document_id: &str) -> String {
    format!("{stem}_{document_id}.json")
}

/// Where a document's JSON goes: its subdirectory under the input dir is
/// mirrored under the output dir, so `a/report.pdf` and `b/report.pdf` never share outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputTarget {
    dir: PathBuf,
    stem: String,
}

impl OutputTarget {
    fn new(input_dir: &Path, output_dir: &Path, pdf_path: &Path) -> Self {
        let relative_dir = pdf_path
            .strip_prefix(input_dir)
            .ok()
            .and_then(Path::parent)
            .unwrap_or(Path::new(""));
        Self {
            dir: output_dir.join(relative_dir),
            stem: doc_stem(pdf_path),
        }
    }

    fn file_name(&self, document_id: &str) -> String {
        output_file_name(&self.stem, document_id)
    }

    /// Outputs left by earlier runs. Files written during this run belong to
    /// another input with the same target and are never reused.
    fn previous_outputs(&self, written: &HashSet<PathBuf>) -> anyhow::Result<Vec<PathBuf>> {
        let mut outputs = existing_outputs(&self.dir, &self.stem)?;
        outputs.retain(|path| !written.contains(path));
        Ok(outputs)
    }
}

/// Output files previously written for `stem`: `<stem>_<32 hex>.json`.
fn existing_outputs(output_dir: &Path, stem: &str) -> anyhow::Result<Vec<PathBuf>> {
    let prefix = format!("{stem}_");
    let mut outputs = Vec::new();
    let entries = match std::fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(outputs),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_output = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
            .is_some_and(|id| id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit()));
        if is_output {
            outputs.push(path);
        }
    }
    outputs.sort();
    Ok(outputs)
}

fn setup_progress_bar(length: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(length as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )?
        .with_key("eta", |state: &ProgressState, w: &mut dyn Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("#>-"),
    );
    Ok(pb)
}

async fn process_one(
    processor: &DocumentProcessor,
    pdf_path: &Path,
    target: &OutputTarget,
    options: ProcessOptions,
    written: &mut HashSet<PathBuf>,
) -> anyhow::Result<DocumentStatus> {
    let document_id = options
        .document_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let filename = pdf_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let file = File::open(pdf_path).await?;
    // SAFETY: the file is only read for the duration of the call
    let mmap = unsafe { Mmap::map(&file)? };

    let processor = processor.clone();
    let doc = tokio::task::spawn_blocking(move || {
        processor.process_pdf_bytes(&mmap, &filename, &options)
    })
    .await??;

    let previous = target.previous_outputs(written)?;
    let output = save_layout_document(&doc.layout, &target.dir, &target.file_name(&document_id))?;
    written.insert(output.clone());
    for stale in previous.iter().filter(|p| **p != output) {
        if let Err(e) = std::fs::remove_file(stale) {
            tracing::warn!("can't remove previous output {}: {e}", stale.display());
        }
    }

    for report in doc.degraded_pages() {
        tracing::warn!(
            "{}: page {} degraded ({:?})",
            pdf_path.display(),
            report.page,
            report.source
        );
    }

    Ok(DocumentStatus::Success {
        input: pdf_path.display().to_string(),
        output: output.display().to_string(),
        document_id,
        pages: doc.layout.num_pages,
    })
}

async fn run(args: &Args) -> anyhow::Result<BatchSummary> {
    let start = Instant::now();
    std::fs::create_dir_all(&args.output_dir)?;
    let pdfs = collect_pdfs(&args.input_dir)?;
    let mut summary = BatchSummary::default();
    if pdfs.is_empty() {
        eprintln!("No PDF files found in {}", args.input_dir.display());
        return Ok(summary);
    }
    tracing::info!("Found {} PDF files", pdfs.len());

    let ocr_pool = Arc::new(OcrEnginePool::from_config(&ocr_config(args)));
    let processor = DocumentProcessor::new(
        ocr_pool,
        ProcessConfig {
            ocr_dpi: args.ocr_dpi,
            debug_dir: args.debug_dir.clone(),
            pdfium_lib_dir: args.pdfium_lib_dir.clone(),
        },
    );

    let pb = if args.verbose {
        ProgressBar::hidden()
    } else {
        setup_progress_bar(pdfs.len())?
    };

    let mut written = HashSet::new();
    for (idx, pdf_path) in pdfs.iter().enumerate() {
        let target = OutputTarget::new(&args.input_dir, &args.output_dir, pdf_path);
        pb.set_message(target.stem.clone());

        if !args.overwrite && !target.previous_outputs(&written)?.is_empty() {
            tracing::info!(
                "[{}/{}] Skipping {} (already processed)",
                idx + 1,
                pdfs.len(),
                pdf_path.display()
            );
            summary.skipped += 1;
            pb.inc(1);
            continue;
        }

        tracing::info!("[{}/{}] Processing {}", idx + 1, pdfs.len(), pdf_path.display());
        let options = ProcessOptions {
            document_id: Some(Uuid::new_v4().simple().to_string()),
            enable_ocr: !args.no_ocr,
            ocr_lang: args.ocr_lang.clone(),
        };
        match process_one(&processor, pdf_path, &target, options, &mut written).await {
            Ok(status) => {
                summary.succeeded += 1;
                let line = serde_json::to_string(&status)?;
                pb.suspend(|| println!("{line}"));
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!("Error processing {}: {e:#}", pdf_path.display());
                let status = DocumentStatus::Error {
                    input: pdf_path.display().to_string(),
                    error: format!("{e:#}"),
                };
                let line = serde_json::to_string(&status)?;
                pb.suspend(|| eprintln!("{line}"));
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    eprintln!(
        "{} {} processed, {} skipped, {} in {:.1}s",
        "Done:".green().bold(),
        summary.succeeded.to_string().green(),
        summary.skipped.to_string().yellow(),
        if summary.failed > 0 {
            format!("{} failed", summary.failed).red().to_string()
        } else {
            "0 failed".to_string()
        },
        start.elapsed().as_secs_f64()
    );
    Ok(summary)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    if !args.input_dir.is_dir() {
        eprintln!(
            "{} Input directory not found: {}",
            "Error:".red().bold(),
            args.input_dir.display()
        );
        return ExitCode::FAILURE;
    }

    match run(&args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            ExitCode::FAILURE
        }
    }
}
