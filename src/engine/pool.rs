//! Model Pool Manager
//!
//! Compiles OpenVINO models on first use and unloads them after an idle
//! timeout, so a long-running service only holds the models it is serving.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use openvino::{CompiledModel, Core};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::{InferenceConfig, ModelsConfig};

/// Wrapper for OpenVINO Core that implements Send + Sync
struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

/// Compiled model shared between inference calls.
///
/// The Rust bindings need `&mut CompiledModel` to create a request, so access
/// goes through a mutex held only while the request is created.
#[derive(Clone)]
pub struct SafeCompiledModel(Arc<Mutex<CompiledModel>>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request
    pub fn create_infer_request(&self) -> anyhow::Result<openvino::InferRequest> {
        let mut compiled = self.0.lock();
        compiled.create_infer_request().map_err(|e| e.into())
    }
}

/// A cached model with its last access time
struct CachedModel {
    compiled: SafeCompiledModel,
    last_access: Instant,
}

struct ModelSlot {
    path: PathBuf,
    cache: RwLock<Option<CachedModel>>,
}

/// Model types that can be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    FaceDetector,
    GenderAge,
    TextDetector,
    TextRecognizer,
}

impl ModelType {
    pub const ALL: [ModelType; 4] = [
        ModelType::FaceDetector,
        ModelType::GenderAge,
        ModelType::TextDetector,
        ModelType::TextRecognizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::FaceDetector => "face_detector",
            ModelType::GenderAge => "gender_age",
            ModelType::TextDetector => "text_detector",
            ModelType::TextRecognizer => "text_recognizer",
        }
    }
}

/// Model Pool Manager with lazy loading and auto-unloading
pub struct ModelPool {
    core: Mutex<Option<SafeCore>>,
    device: String,
    idle_timeout: Duration,
    cleanup_interval: Duration,
    slots: HashMap<ModelType, ModelSlot>,
    shutdown: Notify,
}

impl ModelPool {
    /// Create a new model pool. Nothing is loaded until first use.
    pub fn new(config: &InferenceConfig, models: &ModelsConfig) -> Self {
        let paths = [
            (ModelType::FaceDetector, &models.face_detector),
            (ModelType::GenderAge, &models.gender_age),
            (ModelType::TextDetector, &models.text_detector),
            (ModelType::TextRecognizer, &models.text_recognizer),
        ];

        let slots = paths
            .into_iter()
            .map(|(model_type, path)| {
                (
                    model_type,
                    ModelSlot {
                        path: path.clone(),
                        cache: RwLock::new(None),
                    },
                )
            })
            .collect();

        Self {
            core: Mutex::new(None),
            device: config.device.clone(),
            idle_timeout: Duration::from_secs(config.model_idle_timeout),
            cleanup_interval: Duration::from_secs(config.cleanup_interval.max(1)),
            slots,
            shutdown: Notify::new(),
        }
    }

    fn slot(&self, model_type: ModelType) -> &ModelSlot {
        // every ModelType gets a slot in `new`
        &self.slots[&model_type]
    }

    /// Get or load a model
    pub fn get_model(&self, model_type: ModelType) -> anyhow::Result<SafeCompiledModel> {
        let slot = self.slot(model_type);

        {
            let mut guard = slot.cache.write();
            if let Some(ref mut cached) = *guard {
                cached.last_access = Instant::now();
                return Ok(cached.compiled.clone());
            }
        }

        let mut guard = slot.cache.write();

        // Another caller may have loaded it while we waited
        if let Some(ref mut cached) = *guard {
            cached.last_access = Instant::now();
            return Ok(cached.compiled.clone());
        }

        let compiled = self.compile(model_type, &slot.path)?;
        *guard = Some(CachedModel {
            compiled: compiled.clone(),
            last_access: Instant::now(),
        });

        Ok(compiled)
    }

    fn compile(&self, model_type: ModelType, path: &Path) -> anyhow::Result<SafeCompiledModel> {
        if !path.exists() {
            anyhow::bail!(
                "Model file for {} not found: {}",
                model_type.as_str(),
                path.display()
            );
        }
        let path_str = path
            .to_str()
            .with_context(|| format!("Non UTF-8 model path: {}", path.display()))?;

        info!("Loading model: {} from {}", model_type.as_str(), path_str);
        let start = Instant::now();

        let mut core_guard = self.core.lock();
        if core_guard.is_none() {
            let core = Core::new().context("Failed to initialize OpenVINO runtime")?;
            *core_guard = Some(SafeCore(core));
        }
        let core = match core_guard.as_mut() {
            Some(core) => &mut core.0,
            None => anyhow::bail!("OpenVINO core unavailable"),
        };

        let model = core
            .read_model_from_file(path_str, "")
            .with_context(|| format!("Failed to read model {}", path_str))?;
        let compiled = core
            .compile_model(&model, self.device.as_str().into())
            .with_context(|| format!("Failed to compile {} for {}", model_type.as_str(), self.device))?;

        info!("Model {} loaded in {:?}", model_type.as_str(), start.elapsed());
        Ok(SafeCompiledModel(Arc::new(Mutex::new(compiled))))
    }

    /// Check if a model is loaded
    pub fn is_loaded(&self, model_type: ModelType) -> bool {
        self.slot(model_type).cache.read().is_some()
    }

    /// Loaded status of every model
    pub fn get_status(&self) -> Vec<(ModelType, bool)> {
        ModelType::ALL
            .iter()
            .map(|&t| (t, self.is_loaded(t)))
            .collect()
    }

    /// Unload models unused for longer than `idle_timeout`, returns how many
    pub fn cleanup_idle_models(&self) -> usize {
        let now = Instant::now();
        let mut unloaded = 0;

        for model_type in ModelType::ALL {
            let slot = self.slot(model_type);
            let mut guard = slot.cache.write();
            let idle = guard
                .as_ref()
                .map(|cached| now.duration_since(cached.last_access) > self.idle_timeout)
                .unwrap_or(false);

            if idle {
                info!("Unloading idle model: {}", model_type.as_str());
                *guard = None;
                unloaded += 1;
            }
        }

        unloaded
    }

    /// Run the periodic idle check until `shutdown` is called
    pub async fn start_cleanup_task(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cleanup_interval) => {
                    debug!("Running model cleanup check");
                    self.cleanup_idle_models();
                }
                _ = self.shutdown.notified() => {
                    info!("Model pool cleanup task shutting down");
                    break;
                }
            }
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for ModelPool {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(models: ModelsConfig) -> ModelPool {
        ModelPool::new(&InferenceConfig::default(), &models)
    }

    #[test]
    fn test_model_type_as_str() {
        assert_eq!(ModelType::FaceDetector.as_str(), "face_detector");
        assert_eq!(ModelType::TextRecognizer.as_str(), "text_recognizer");
    }

    #[test]
    fn test_nothing_loaded_initially() {
        let pool = test_pool(ModelsConfig::default());
        let status = pool.get_status();
        assert_eq!(status.len(), 4);
        assert!(status.iter().all(|(_, loaded)| !loaded));
        assert_eq!(pool.cleanup_idle_models(), 0);
    }

    #[test]
    fn test_missing_model_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let models = ModelsConfig {
            gender_age: dir.path().join("missing.onnx"),
            ..ModelsConfig::default()
        };
        let pool = test_pool(models);

        let err = pool.get_model(ModelType::GenderAge).err().unwrap();
        assert!(err.to_string().contains("gender_age"));
        assert!(!pool.is_loaded(ModelType::GenderAge));
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_shutdown() {
        let pool = Arc::new(test_pool(ModelsConfig::default()));
        let handle = tokio::spawn(pool.clone().start_cleanup_task());
        pool.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
