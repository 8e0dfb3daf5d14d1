use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, sync::Mutex};

use image::RgbImage;

pub mod paddle;
pub mod raster;
pub mod session;
pub mod tesseract;

use paddle::PaddleOcrFactory;
use session::ORTConfig;
use tesseract::TesseractFactory;

/// One recognized region: the polygon is in raster pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrDetection {
    pub polygon: Vec<(f32, f32)>,
    pub text: String,
    pub confidence: f32,
}

impl OcrDetection {
    /// Has text and at least one vertex, so it can become a block.
    pub fn is_usable(&self) -> bool {
        !self.text.trim().is_empty() && !self.polygon.is_empty()
    }
}

pub trait OcrEngine: Send {
    fn name(&self) -> &'static str;
    fn recognize(&mut self, image: &RgbImage) -> anyhow::Result<Vec<OcrDetection>>;
}

/// Builds an engine for a language. Called at most once per language by the pool.
pub trait OcrEngineFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self, lang: &str) -> anyhow::Result<Box<dyn OcrEngine>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcrEngineKind {
    Paddle,
    Tesseract,
}

impl fmt::Display for OcrEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paddle => write!(f, "paddle"),
            Self::Tesseract => write!(f, "tesseract"),
        }
    }
}

impl FromStr for OcrEngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paddle" | "paddleocr" => Ok(Self::Paddle),
            "tesseract" => Ok(Self::Tesseract),
            other => Err(format!(
                "unknown OCR engine '{other}', expected one of: paddle, tesseract"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// Engines in priority order. Empty disables OCR.
    pub engines: Vec<OcrEngineKind>,
    pub model_dir: PathBuf,
    pub tesseract_cmd: PathBuf,
    pub ort_config: ORTConfig,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engines: vec![OcrEngineKind::Paddle, OcrEngineKind::Tesseract],
            model_dir: default_model_dir(),
            tesseract_cmd: PathBuf::from("tesseract"),
            ort_config: ORTConfig::default(),
        }
    }
}

pub fn default_model_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docintel")
        .join("models")
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineFailure {
    pub engine: &'static str,
    pub reason: String,
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.engine, self.reason)
    }
}

#[derive(Debug)]
pub enum OcrOutcome {
    Recognized {
        engine: &'static str,
        detections: Vec<OcrDetection>,
    },
    /// An engine ran cleanly and found nothing.
    NoDetections,
    /// No engine in the chain could be built.
    Unavailable,
    /// Every engine that could be built errored.
    Failed(Vec<EngineFailure>),
}

enum EngineSlot {
    Pending,
    Ready(Box<dyn OcrEngine>),
    Unavailable,
}

impl EngineSlot {
    fn get_or_build(
        &mut self,
        factory: &dyn OcrEngineFactory,
        lang: &str,
    ) -> Option<&mut Box<dyn OcrEngine>> {
        if let EngineSlot::Pending = self {
            *self = match factory.build(lang) {
                Ok(engine) => {
                    tracing::info!("OCR engine {} ready for language '{lang}'", factory.name());
                    EngineSlot::Ready(engine)
                }
                Err(e) => {
                    tracing::warn!(
                        "OCR engine {} unavailable for language '{lang}': {e:#}",
                        factory.name()
                    );
                    EngineSlot::Unavailable
                }
            };
        }
        match self {
            EngineSlot::Ready(engine) => Some(engine),
            _ => None,
        }
    }
}

/// Lazily built OCR engines, one instance per `(engine, language)`.
///
/// The pool is shared by every document processed in the process. Recognition
/// holds the pool's lock, so at most one recognition runs at a time.
pub struct OcrEnginePool {
    factories: Vec<Box<dyn OcrEngineFactory>>,
    engines: Mutex<HashMap<String, Vec<EngineSlot>>>,
}

impl fmt::Debug for OcrEnginePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrEnginePool")
            .field("engines", &self.engine_names())
            .finish()
    }
}

impl OcrEnginePool {
    pub fn new(factories: Vec<Box<dyn OcrEngineFactory>>) -> Self {
        Self {
            factories,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &OcrConfig) -> Self {
        let factories = config
            .engines
            .iter()
            .map(|kind| -> Box<dyn OcrEngineFactory> {
                match kind {
                    OcrEngineKind::Paddle => Box::new(PaddleOcrFactory::new(
                        config.model_dir.clone(),
                        config.ort_config.clone(),
                    )),
                    OcrEngineKind::Tesseract => {
                        Box::new(TesseractFactory::new(config.tesseract_cmd.clone()))
                    }
                }
            })
            .collect();
        Self::new(factories)
    }

    /// A pool without engines: every page needing OCR comes back unavailable.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn engine_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Walks the engine chain until one returns detections.
    #[tracing::instrument(skip_all, fields(lang = lang))]
    pub fn recognize(&self, image: &RgbImage, lang: &str) -> OcrOutcome {
        let mut engines = match self.engines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("OCR engine pool lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let slots = engines
            .entry(lang.to_owned())
            .or_insert_with(|| self.factories.iter().map(|_| EngineSlot::Pending).collect());

        let mut failures = Vec::new();
        let mut ran_clean = false;
        for (factory, slot) in self.factories.iter().zip(slots.iter_mut()) {
            let Some(engine) = slot.get_or_build(factory.as_ref(), lang) else {
                continue;
            };
            let start = std::time::Instant::now();
            match engine.recognize(image) {
                Ok(detections) if detections.iter().any(OcrDetection::is_usable) => {
                    tracing::debug!(
                        "{} found {} regions in {}ms",
                        engine.name(),
                        detections.len(),
                        start.elapsed().as_millis()
                    );
                    return OcrOutcome::Recognized {
                        engine: engine.name(),
                        detections,
                    };
                }
                Ok(detections) => {
                    tracing::debug!(
                        "{} found no text ({} unusable regions), trying next engine",
                        engine.name(),
                        detections.len()
                    );
                    ran_clean = true;
                }
                Err(e) => {
                    tracing::warn!("{} failed: {e:#}", engine.name());
                    failures.push(EngineFailure {
                        engine: engine.name(),
                        reason: format!("{e:#}"),
                    });
                }
            }
        }

        if ran_clean {
            OcrOutcome::NoDetections
        } else if failures.is_empty() {
            OcrOutcome::Unavailable
        } else {
            OcrOutcome::Failed(failures)
        }
    }
}
