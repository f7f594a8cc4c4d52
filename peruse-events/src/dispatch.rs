//! Concurrent fan-out of decoded records to every registered feed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use peruse_core::{Collection, DecodedRecord};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::extract::EntityExtractor;
use crate::registry::FeedRegistry;

/// Default number of records allowed in flight at once.
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 400;

/// A module that failed to ingest a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    pub module: String,
    pub error: String,
}

/// Outcome of dispatching one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub uri: String,
    pub delivered: Vec<String>,
    pub failed: Vec<ModuleFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Routes decoded records to every feed module.
///
/// `dispatch` runs all modules for one record concurrently and waits for them.
/// `submit` does the same in the background, holding one permit per record so
/// that a saturated dispatcher slows the caller down instead of piling up tasks.
pub struct EventDispatcher {
    registry: Arc<FeedRegistry>,
    extractor: Option<Arc<dyn EntityExtractor>>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl EventDispatcher {
    pub fn new(registry: Arc<FeedRegistry>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            registry,
            extractor: None,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    /// Fill in named entities for posts before they reach any module.
    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn registry(&self) -> &Arc<FeedRegistry> {
        &self.registry
    }

    /// Run every module's `on_create` for `record` and collect the results.
    pub async fn dispatch(&self, record: DecodedRecord) -> DispatchReport {
        let record = Arc::new(self.enrich(record).await);
        let mut report = DispatchReport {
            uri: record.uri.to_string(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for module in self.registry.modules() {
            let module = Arc::clone(module);
            let record = Arc::clone(&record);
            tasks.spawn(async move {
                let name = module.name().to_string();
                let outcome = AssertUnwindSafe(module.on_create(&record))
                    .catch_unwind()
                    .await;
                let outcome = match outcome {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err("module panicked".to_string()),
                };
                (name, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (module, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(uri = %report.uri, error = %e, "Dispatch task aborted");
                    continue;
                }
            };
            match outcome {
                Ok(()) => report.delivered.push(module),
                Err(err) => {
                    error!(feed = %module, uri = %report.uri, error = %err, "Feed failed to ingest record");
                    report.failed.push(ModuleFailure { module, error: err });
                }
            }
        }

        debug!(
            uri = %report.uri,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Record dispatched"
        );
        report
    }

    /// Dispatch in the background once a slot is free.
    pub async fn submit(self: &Arc<Self>, record: DecodedRecord) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(uri = %record.uri, "Dispatcher closed, dropping record");
                return;
            }
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch(record).await;
            drop(permit);
        });
    }

    /// Wait until every submitted record has been dispatched.
    pub async fn drain(&self) {
        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = self.permits.acquire_many(permits).await {
            drop(all);
        }
    }

    /// Number of records currently being dispatched in the background.
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    async fn enrich(&self, mut record: DecodedRecord) -> DecodedRecord {
        let Some(extractor) = &self.extractor else {
            return record;
        };
        if record.collection != Collection::Post || record.is_reply() {
            return record;
        }
        let Some(text) = record.text().filter(|t| !t.trim().is_empty()) else {
            return record;
        };
        match extractor.extract(text).await {
            Ok(entities) => record.entities = entities,
            Err(e) => warn!(uri = %record.uri, error = %e, "Entity extraction failed"),
        }
        record
    }
}
