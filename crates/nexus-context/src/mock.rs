//! Mock context provider for deterministic testing.
//!
//! Serves pre-configured records, optionally after a delay or with an error,
//! and counts how often it was asked.

use async_trait::async_trait;
use nexus_core::{ContextProvider, ContextRecord, ContextRequest, NexusError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A mock provider that returns the same records on every fetch.
///
/// # Example
/// ```
/// use nexus_context::mock::MockProvider;
/// use nexus_core::ContextRecord;
/// let provider = MockProvider::new("fs-watcher")
///     .with_record(ContextRecord::new("filesystem", Default::default()));
/// ```
pub struct MockProvider {
    id: String,
    records: Mutex<Vec<ContextRecord>>,
    delay: Option<Duration>,
    error: Option<String>,
    calls: Arc<AtomicU64>,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            records: Mutex::new(Vec::new()),
            delay: None,
            error: None,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_record(self, record: ContextRecord) -> Self {
        self.records.lock().push(record);
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every fetch with this message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Replace the served records.
    pub fn set_records(&self, records: Vec<ContextRecord>) {
        *self.records.lock() = records;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContextProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, _request: &ContextRequest, context_type: &str) -> Result<Vec<ContextRecord>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.error {
            return Err(NexusError::ProviderUnavailable {
                provider: self.id.clone(),
                reason: err.clone(),
            });
        }
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.context_type == context_type)
            .cloned()
            .collect())
    }
}
