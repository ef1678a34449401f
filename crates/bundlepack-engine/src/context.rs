use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bundlepack_core::{BundleManifest, Package, Payload};

use crate::acquire::TransportRegistry;
use crate::condition::{ConditionEvaluator, VariableConditions};
use crate::config::EngineConfig;
use crate::elevation::{ElevationLauncher, ProcessLauncher};
use crate::layout::EngineLayout;
use crate::probe::{RegistryProbe, SystemProbe};
use crate::process::{ProcessRunner, SystemProcessRunner};

/// Everything a run shares across components: the loaded bundle, start-up
/// configuration, the two scope layouts, and the injectable collaborators.
/// Cloning is cheap; the elevated peer builds its own copy from the same
/// manifest and configuration.
#[derive(Clone)]
pub struct EngineContext {
    pub manifest: Arc<BundleManifest>,
    pub config: Arc<EngineConfig>,
    pub user_layout: EngineLayout,
    pub machine_layout: EngineLayout,
    pub manifest_path: PathBuf,
    pub source_dir: PathBuf,
    pub engine_path: PathBuf,
    pub elevated: bool,
    pub runner: Arc<dyn ProcessRunner>,
    pub probe: Arc<dyn SystemProbe>,
    pub conditions: Arc<dyn ConditionEvaluator>,
    pub transports: Arc<TransportRegistry>,
    pub launcher: Arc<dyn ElevationLauncher>,
    pub cancel: Arc<AtomicBool>,
}

impl EngineContext {
    pub fn new(
        manifest: BundleManifest,
        config: EngineConfig,
        manifest_path: &Path,
        engine_path: &Path,
    ) -> Result<Self> {
        let user_root = config
            .resolve_user_root()
            .context("failed to resolve per-user root")?;
        let machine_root = config.resolve_machine_root();
        let source_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner);
        let transports = Arc::new(TransportRegistry::with_defaults(config.download_timeout_secs)?);
        let launcher: Arc<dyn ElevationLauncher> = Arc::new(ProcessLauncher::new(
            engine_path.to_path_buf(),
            manifest_path.to_path_buf(),
            config.elevation_command.clone(),
        ));

        Ok(Self {
            manifest: Arc::new(manifest),
            config: Arc::new(config),
            user_layout: EngineLayout::new(user_root),
            machine_layout: EngineLayout::new(machine_root),
            manifest_path: manifest_path.to_path_buf(),
            source_dir,
            engine_path: engine_path.to_path_buf(),
            elevated: false,
            probe: Arc::new(RegistryProbe::new(runner.clone())),
            runner,
            conditions: Arc::new(VariableConditions),
            transports,
            launcher,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = Arc::new(transports);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ElevationLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn bundle_id(&self) -> &str {
        &self.manifest.bundle.id
    }

    pub fn layout_for(&self, per_machine: bool) -> &EngineLayout {
        if per_machine {
            &self.machine_layout
        } else {
            &self.user_layout
        }
    }

    pub fn registration_layout(&self) -> &EngineLayout {
        self.layout_for(self.manifest.bundle.per_machine)
    }

    /// Work needing machine scope must cross the elevation channel unless
    /// this process already is the elevated peer.
    pub fn needs_elevation(&self, per_machine: bool) -> bool {
        per_machine && !self.elevated
    }

    pub fn package(&self, id: &str) -> Result<&Package> {
        self.manifest
            .packages
            .iter()
            .find(|package| package.id == id)
            .with_context(|| format!("unknown package '{id}'"))
    }

    pub fn payload(&self, key: &str) -> Result<&Payload> {
        self.manifest
            .payload(key)
            .with_context(|| format!("unknown payload '{key}'"))
    }

    /// Resolves an authored relative source path against the manifest's
    /// directory.
    pub fn resolve_source_path(&self, source: &str) -> PathBuf {
        let path = Path::new(source);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.source_dir.join(path)
        }
    }

    /// Where a payload sits once cached for its package's scope.
    pub fn cached_payload_path(&self, package: &Package, payload: &Payload) -> PathBuf {
        self.layout_for(package.per_machine)
            .payload_cache_path(package.cache_id(), &payload.file_path)
    }

    /// Staging path used while a payload is acquired or extracted, always in
    /// the invoking user's scope.
    pub fn working_payload_path(&self, payload_key: &str) -> PathBuf {
        self.user_layout
            .working_payload_path(self.bundle_id(), payload_key)
    }

    pub fn working_container_path(&self, container_id: &str) -> PathBuf {
        self.user_layout
            .working_container_path(self.bundle_id(), container_id)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}
