//! Shared context for controller operations and worker jobs.

use std::path::Path;
use std::sync::Arc;

use quarry_files::StoreLayout;
use quarry_match::{default_normalizers, Matcher, Normalizer, ParserRegistry};
use quarry_protocol::{QuarryConfig, QuarryError, Result, UserDirectory};
use quarry_search::SearchGateway;
use quarry_state::StateStore;

use crate::notify::Notifier;
use crate::scheduler::JobQueue;

/// Adapter for pushing a bundle to the central deployment. The HTTP client
/// behind it is an external collaborator.
pub trait CentralDeployment: Send + Sync {
    fn deployment_id(&self) -> &str;

    fn receive_bundle(&self, bundle: &Path) -> Result<()>;
}

/// Stand-in when no central deployment is configured.
#[derive(Debug, Default)]
pub struct NoCentralDeployment;

impl CentralDeployment for NoCentralDeployment {
    fn deployment_id(&self) -> &str {
        ""
    }

    fn receive_bundle(&self, _bundle: &Path) -> Result<()> {
        Err(QuarryError::bad_request(
            "no central deployment is configured",
        ))
    }
}

/// Everything a worker job or controller operation needs.
pub struct ProcessingContext {
    pub config: QuarryConfig,
    pub store: StateStore,
    pub layout: StoreLayout,
    pub registry: Arc<ParserRegistry>,
    pub matcher: Matcher,
    pub normalizers: Vec<Box<dyn Normalizer>>,
    pub search: Arc<dyn SearchGateway>,
    pub users: Arc<dyn UserDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub central: Arc<dyn CentralDeployment>,
    pub queue: JobQueue,
}

impl ProcessingContext {
    pub fn new(
        config: QuarryConfig,
        search: Arc<dyn SearchGateway>,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
        central: Arc<dyn CentralDeployment>,
    ) -> Result<Self> {
        let store = StateStore::new(state_store_path(&config));
        store.init()?;
        let layout = StoreLayout::new(&config.fs);
        let registry = Arc::new(ParserRegistry::default_registry());
        let matcher = Matcher::new(
            registry.clone(),
            config.process.parser_matching_size,
            config.process.force_raw_file_decoding,
        );
        Ok(Self {
            config,
            store,
            layout,
            registry,
            matcher,
            normalizers: default_normalizers(),
            search,
            users,
            notifier,
            central,
            queue: JobQueue::new(),
        })
    }
}

fn state_store_path(config: &QuarryConfig) -> std::path::PathBuf {
    // The state store lives next to the staging area.
    let parent = config
        .fs
        .staging_root
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| config.fs.staging_root.clone());
    let _ = std::fs::create_dir_all(&parent);
    parent.join("state.sqlite")
}
