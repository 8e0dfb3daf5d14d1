use std::path::Path;

use anyhow::Context;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
        ExecutionProviderDispatch, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};

pub const ORT_INTRATHREAD: usize = 4;
pub const ORT_INTERTHREAD: usize = 1;

#[derive(Debug, Clone)]
pub struct ORTConfig {
    pub execution_providers: Vec<OrtExecutionProvider>,
    pub intra_threads: usize,
    pub inter_threads: usize,
    /// Graph optimization level `0..=3`, ort's highest level when unset.
    pub opt_level: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrtExecutionProvider {
    CPU,
    CoreML { ane_only: bool },
    CUDA(i32),
    Trt(i32),
}

impl Default for ORTConfig {
    fn default() -> Self {
        let mut execution_providers = vec![OrtExecutionProvider::CPU];
        if cfg!(target_os = "macos") {
            execution_providers.push(OrtExecutionProvider::CoreML { ane_only: false });
        }
        Self {
            execution_providers,
            intra_threads: ORT_INTRATHREAD,
            inter_threads: ORT_INTERTHREAD,
            opt_level: None,
        }
    }
}

/// Maps the `0..=3` level used on the command line to ort's enum.
pub fn graph_opt_level(level: u8) -> GraphOptimizationLevel {
    match level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

/// ort tries providers in registration order: accelerators first, CPU last.
fn registration_order(providers: &[OrtExecutionProvider]) -> Vec<OrtExecutionProvider> {
    let mut providers = providers.to_vec();
    providers.sort_by(|a, b| b.cmp(a));
    providers.dedup();
    providers
}

fn build_provider(provider: &OrtExecutionProvider) -> ExecutionProviderDispatch {
    match *provider {
        OrtExecutionProvider::Trt(device_id) => TensorRTExecutionProvider::default()
            .with_device_id(device_id)
            .build(),
        OrtExecutionProvider::CUDA(device_id) => CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build(),
        OrtExecutionProvider::CoreML { ane_only: true } => {
            CoreMLExecutionProvider::default().with_ane_only().build()
        }
        OrtExecutionProvider::CoreML { ane_only: false } => {
            CoreMLExecutionProvider::default().build()
        }
        OrtExecutionProvider::CPU => CPUExecutionProvider::default().build(),
    }
}

/// A loaded model and the name of the output tensor we read back.
#[derive(Debug)]
pub(crate) struct OnnxModel {
    pub session: Session,
    pub output_name: String,
}

impl OnnxModel {
    pub fn load(config: &ORTConfig, model_path: &Path) -> anyhow::Result<Self> {
        let execution_providers: Vec<ExecutionProviderDispatch> = registration_order(
            &config.execution_providers,
        )
        .iter()
        .map(build_provider)
        .collect();

        let opt_level = graph_opt_level(config.opt_level.unwrap_or(3));

        let session = Session::builder()?
            .with_execution_providers(execution_providers)?
            .with_optimization_level(opt_level)?
            .with_intra_threads(config.intra_threads)?
            .with_inter_threads(config.inter_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("can't load onnx model {}", model_path.display()))?;

        let output_name = session
            .outputs
            .first()
            .map(|o| &o.name)
            .context("model has no output")?
            .to_owned();

        Ok(Self {
            session,
            output_name,
        })
    }
}
