use std::path::{Path, PathBuf};

use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use serde::Serialize;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const PDF_EXTENSIONS: &[&str] = &[".pdf"];
pub const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".tif"];

/// Installs the fmt subscriber, plus an OTLP exporter when `otlp_endpoint` is set.
pub fn init_tracing(otlp_endpoint: Option<&str>, otlp_service_name: String) -> anyhow::Result<()> {
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let provider = opentelemetry_sdk::trace::TracerProvider::builder()
                .with_batch_exporter(
                    opentelemetry_otlp::SpanExporter::builder()
                        .with_tonic()
                        .with_endpoint(endpoint)
                        .build()?,
                    opentelemetry_sdk::runtime::Tokio,
                )
                .with_resource(Resource::new(vec![KeyValue::new(
                    SERVICE_NAME,
                    otlp_service_name,
                )]))
                .build();
            let tracer = provider.tracer("docintel-api");
            global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
        EnvFilter::new(
            "docintel_api=debug,docintel_core=debug,axum_tracing_opentelemetry=info,otel=debug",
        )
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(tracing_subscriber::fmt::time::uptime());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();
    Ok(())
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Returns the file's extension, leading dot included and case preserved,
/// when it matches one of `allowed` case-insensitively.
pub fn validate_extension(filename: &str, allowed: &[&str]) -> Option<String> {
    allowed.iter().find_map(|ext| {
        let start = filename.len().checked_sub(ext.len())?;
        let suffix = filename.get(start..)?;
        (start > 0 && suffix.eq_ignore_ascii_case(ext)).then(|| suffix.to_owned())
    })
}

/// Form booleans the way HTML forms and curl send them.
pub fn parse_form_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Removes the uploaded file when dropped, whatever the outcome of the request.
#[derive(Debug)]
pub struct UploadGuard {
    path: PathBuf,
}

impl UploadGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("removed upload {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("can't remove upload {}: {e}", self.path.display()),
        }
    }
}
