use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use clap::Parser;
use docintel_api::{
    init_tracing, parse_form_bool, validate_extension, ApiResponse, UploadGuard, IMAGE_EXTENSIONS,
    PDF_EXTENSIONS,
};
use docintel_core::{
    ocr::{
        default_model_dir,
        session::{ORTConfig, OrtExecutionProvider},
    },
    DocumentProcessor, OcrConfig, OcrEngineKind, OcrEnginePool, ProcessConfig, ProcessOptions,
};
use memmap2::Mmap;
use mimalloc::MiMalloc;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs::File, io::AsyncWriteExt, net::TcpListener};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use uuid::Uuid;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const MAX_SIZE_LIMIT: usize = 250 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Uploads are stored here while they are processed
    #[arg(long, env = "UPLOAD_DIR", default_value = "./uploads")]
    upload_dir: PathBuf,

    /// Allowed CORS origins
    #[arg(
        long,
        env = "CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000,http://localhost:8080"
    )]
    cors_origins: Vec<String>,

    /// OpenTelemetry collector endpoint, spans are only exported when set
    #[arg(long, env = "OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// OCR engines tried in order until one finds text
    #[arg(
        long,
        env = "DOCINTEL_OCR_ENGINES",
        value_delimiter = ',',
        default_value = "paddle,tesseract"
    )]
    ocr_engines: Vec<OcrEngineKind>,

    #[arg(long, env = "DOCINTEL_OCR_DPI", default_value_t = 300f32)]
    ocr_dpi: f32,

    #[arg(long, env = "DOCINTEL_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    #[arg(long, env = "TESSERACT_CMD", default_value = "tesseract")]
    tesseract_cmd: PathBuf,

    #[arg(long, env = "PDFIUM_LIB_DIR")]
    pdfium_lib_dir: Option<PathBuf>,

    #[arg(long, env = "DOCINTEL_DEBUG_DIR")]
    debug_dir: Option<PathBuf>,

    #[arg(
            long,
            default_value_t = cfg!(target_os = "macos"),
            help = "Enable or disable the use of CoreML for OCR inference"
        )]
    pub coreml: bool,

    #[arg(
        long,
        default_value_t = true,
        help = "Enable or disable Apple Neural Engine acceleration (only applies when CoreML is enabled)"
    )]
    pub use_ane: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Enable or disable the use of TensorRT for OCR inference"
    )]
    pub trt: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Enable or disable the use of CUDA for OCR inference"
    )]
    pub cuda: bool,

    #[arg(
        long,
        help = "CUDA device ID to use (0 for first GPU)",
        default_value_t = 0
    )]
    pub device_id: i32,

    #[arg(
        long,
        short = 'j',
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

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin {origin:?}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::error(message)))
}

#[derive(Clone)]
struct AppState {
    processor: DocumentProcessor,
    upload_dir: Arc<PathBuf>,
}

/// A file received from a multipart form, with its processing options.
#[derive(Debug)]
struct Upload {
    guard: UploadGuard,
    filename: String,
    document_id: String,
    enable_ocr: bool,
    ocr_lang: String,
}

#[derive(Debug, Clone, Copy)]
enum UploadKind {
    Pdf,
    Image,
}

impl UploadKind {
    fn extensions(&self) -> &'static [&'static str] {
        match self {
            UploadKind::Pdf => PDF_EXTENSIONS,
            UploadKind::Image => IMAGE_EXTENSIONS,
        }
    }

    fn extension_error(&self) -> String {
        match self {
            UploadKind::Pdf => "File must be a PDF".to_owned(),
            UploadKind::Image => format!("File must be an image ({})", IMAGE_EXTENSIONS.join(", ")),
        }
    }

    /// Images can only be read through OCR, whatever the form says.
    fn ocr_enabled(&self, requested: bool) -> bool {
        match self {
            UploadKind::Pdf => requested,
            UploadKind::Image => true,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.otlp_endpoint.as_deref(), "docintel-api".into())?;

    let ocr_config = OcrConfig {
        engines: args.ocr_engines.clone(),
        model_dir: args.model_dir.clone().unwrap_or_else(default_model_dir),
        tesseract_cmd: args.tesseract_cmd.clone(),
        ort_config: ORTConfig {
            execution_providers: parse_ep_args(&args),
            intra_threads: args.intra_threads,
            inter_threads: args.inter_threads,
            opt_level: args.graph_opt_level,
        },
    };
    let ocr_pool = Arc::new(OcrEnginePool::from_config(&ocr_config));
    tracing::info!("OCR engines: {:?}", ocr_pool.engine_names());
    let processor = DocumentProcessor::new(
        ocr_pool,
        ProcessConfig {
            ocr_dpi: args.ocr_dpi,
            debug_dir: args.debug_dir.clone(),
            pdfium_lib_dir: args.pdfium_lib_dir.clone(),
        },
    );

    tokio::fs::create_dir_all(&args.upload_dir).await?;
    let app_state = AppState {
        processor,
        upload_dir: Arc::new(args.upload_dir.clone()),
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/process/pdf", post(process_pdf_handler))
        .route("/process/image", post(process_image_handler))
        .with_state(app_state)
        .layer(OtelAxumLayer::default())
        .layer(cors_layer(&args.cors_origins))
        .layer(DefaultBodyLimit::max(MAX_SIZE_LIMIT));

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    tracing::info!(
        "Starting docintel service listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "docintel",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Document processing API with OCR and layout analysis",
        "endpoints": {
            "health": "/health",
            "pdf": "/process/pdf",
            "image": "/process/image",
        },
    }))
}

#[tracing::instrument(skip_all)]
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Streams the `file` field to `upload_dir/<uuid><ext>` and collects the form options.
async fn receive_upload(
    upload_dir: &Path,
    kind: UploadKind,
    mut multipart: Multipart,
) -> Result<Upload, ApiError> {
    let document_id = Uuid::new_v4().simple().to_string();
    let mut file = None;
    let mut enable_ocr = true;
    let mut ocr_lang = "en".to_owned();

    while let Some(mut field) = multipart.next_field().await.map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Failed to get next field: {e}"),
        )
    })? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("").to_owned();
                let extension = validate_extension(&filename, kind.extensions())
                    .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, kind.extension_error()))?;
                let guard = UploadGuard::new(upload_dir.join(format!("{document_id}{extension}")));

                let mut out = File::create(guard.path()).await.map_err(|e| {
                    api_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Failed to create upload file: {e}"),
                    )
                })?;
                while let Some(chunk) = field.chunk().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("Failed to read chunk: {e}"))
                })? {
                    out.write_all(&chunk).await.map_err(|e| {
                        api_error(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Failed to write upload file: {e}"),
                        )
                    })?;
                }
                out.flush().await.map_err(|e| {
                    api_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Failed to flush upload file: {e}"),
                    )
                })?;
                file = Some((guard, filename));
            }
            "enable_ocr" => {
                let value = field.text().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("Failed to read enable_ocr: {e}"))
                })?;
                enable_ocr = parse_form_bool(&value).ok_or_else(|| {
                    api_error(
                        StatusCode::BAD_REQUEST,
                        format!("Invalid enable_ocr value: {value:?}"),
                    )
                })?;
            }
            "ocr_lang" => {
                let value = field.text().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("Failed to read ocr_lang: {e}"))
                })?;
                if !value.trim().is_empty() {
                    ocr_lang = value.trim().to_owned();
                }
            }
            _ => continue,
        }
    }

    let (guard, filename) =
        file.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Missing file field"))?;
    Ok(Upload {
        guard,
        filename,
        document_id,
        enable_ocr,
        ocr_lang,
    })
}

/// Maps the uploaded file and runs it through the processor on a blocking thread.
async fn process_upload(
    processor: &DocumentProcessor,
    upload: Upload,
    kind: UploadKind,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    tracing::info!(
        "Processing {kind:?}: {} (id: {})",
        upload.filename,
        upload.document_id
    );
    let processor = processor.clone();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        let options = ProcessOptions {
            document_id: Some(upload.document_id.clone()),
            enable_ocr: kind.ocr_enabled(upload.enable_ocr),
            ocr_lang: upload.ocr_lang.clone(),
        };
        let file = std::fs::File::open(upload.guard.path())?;
        // SAFETY: the upload is private to this request and never written again
        let mmap = unsafe { Mmap::map(&file)? };
        let doc = match kind {
            UploadKind::Pdf => processor.process_pdf_bytes(&mmap, &upload.filename, &options)?,
            UploadKind::Image => {
                processor.process_image_bytes(&mmap, &upload.filename, &options)?
            }
        };
        for report in doc.degraded_pages() {
            tracing::warn!("page {} degraded ({:?})", report.page, report.source);
        }
        Ok(doc.to_json()?)
    })
    .await
    .map_err(anyhow::Error::from)
    .and_then(|result| result);

    match result {
        Ok(data) => Ok(Json(ApiResponse::ok(data))),
        Err(e) => {
            tracing::error!("Error processing {kind:?}: {e:#}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Processing error: {e:#}"),
            ))
        }
    }
}

#[tracing::instrument(skip_all)]
async fn process_pdf_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    let upload = receive_upload(&state.upload_dir, UploadKind::Pdf, multipart).await?;
    process_upload(&state.processor, upload, UploadKind::Pdf).await
}

#[tracing::instrument(skip_all)]
async fn process_image_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    let upload = receive_upload(&state.upload_dir, UploadKind::Image, multipart).await?;
    process_upload(&state.processor, upload, UploadKind::Image).await
}
