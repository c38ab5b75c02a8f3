#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;

use mediafetch::database::models::BindingDbModel;
use mediafetch::database::repositories::{
    SqlxBindingRepository, SqlxDeliveryTaskRepository, SqlxPairingCodeRepository,
    SqlxSourceRepository,
};
use mediafetch::database::{self, DbPool};
use mediafetch::delivery::{
    CircuitBreakerManager, DeliveryPipeline, PipelineConfig, Processed, RateLimiter,
    RateLimiterConfig, RetryConfig,
};
use mediafetch::domain::{ContentItem, ContentKind, Cursor, RecipientId, SourceId};
use mediafetch::monitor::{ContentMonitor, MonitorConfig};
use mediafetch::platform::{
    DeliveryAck, DeliveryMetadata, DeliverySender, FetchError, ItemRef, Payload, PayloadError,
    PayloadFetcher, SendError, SourceFetcher,
};
use mediafetch::registry::{BindingRegistry, RegistryConfig};

pub async fn setup_db() -> (DbPool, TempDir) {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("mediafetch.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = database::init_pool_with_size(&db_url, 8).await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    (pool, dir)
}

/// Returns whatever items were published for a source, regardless of the
/// cursor, so the monitor's own filtering is exercised.
#[derive(Default)]
pub struct ScriptedSourceFetcher {
    items: Mutex<HashMap<SourceId, Vec<ContentItem>>>,
    errors: Mutex<VecDeque<FetchError>>,
    polled: Mutex<Vec<SourceId>>,
    calls: AtomicUsize,
}

impl ScriptedSourceFetcher {
    pub fn publish(&self, item: ContentItem) {
        self.items
            .lock()
            .entry(item.source_id.clone())
            .or_default()
            .push(item);
    }

    pub fn set_items(&self, source: &SourceId, items: Vec<ContentItem>) {
        self.items.lock().insert(source.clone(), items);
    }

    pub fn fail_next(&self, error: FetchError) {
        self.errors.lock().push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn polls_of(&self, source: &SourceId) -> usize {
        self.polled.lock().iter().filter(|s| *s == source).count()
    }
}

#[async_trait]
impl SourceFetcher for ScriptedSourceFetcher {
    async fn fetch_new_items(
        &self,
        source: &SourceId,
        _since: Option<&Cursor>,
    ) -> Result<Vec<ContentItem>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.polled.lock().push(source.clone());
        if let Some(error) = self.errors.lock().pop_front() {
            return Err(error);
        }
        Ok(self.items.lock().get(source).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct ScriptedPayloadFetcher {
    errors: Mutex<VecDeque<PayloadError>>,
    calls: AtomicUsize,
}

impl ScriptedPayloadFetcher {
    pub fn fail_next(&self, error: PayloadError) {
        self.errors.lock().push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayloadFetcher for ScriptedPayloadFetcher {
    async fn fetch_payload(&self, item: &ItemRef) -> Result<Payload, PayloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.errors.lock().pop_front() {
            return Err(error);
        }
        Ok(Payload {
            bytes: Bytes::from(format!("bytes of {}", item.item_id)),
            kind: item.kind,
            content_type: Some("image/jpeg".to_string()),
        })
    }
}

/// Succeeds unless a failure was queued. Records every successful send.
#[derive(Default)]
pub struct ScriptedSender {
    errors: Mutex<VecDeque<SendError>>,
    sent: Mutex<Vec<(RecipientId, DeliveryMetadata)>>,
    calls: AtomicUsize,
}

impl ScriptedSender {
    pub fn fail_next(&self, error: SendError) {
        self.errors.lock().push_back(error);
    }

    pub fn fail_times(&self, times: usize, error: SendError) {
        let mut errors = self.errors.lock();
        for _ in 0..times {
            errors.push_back(error.clone());
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(RecipientId, DeliveryMetadata)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DeliverySender for ScriptedSender {
    async fn send(
        &self,
        recipient: &RecipientId,
        _payload: &Payload,
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, SendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.errors.lock().pop_front() {
            return Err(error);
        }
        self.sent.lock().push((recipient.clone(), metadata.clone()));
        Ok(DeliveryAck {
            message_id: format!("msg-{call}"),
        })
    }
}

/// Retries without waiting.
pub fn fast_pipeline_config(max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        retry: RetryConfig {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            use_jitter: false,
        },
        ..Default::default()
    }
}

pub struct Harness {
    pub pool: DbPool,
    pub registry: BindingRegistry,
    pub pipeline: Arc<DeliveryPipeline>,
    pub monitor: ContentMonitor,
    pub source_fetcher: Arc<ScriptedSourceFetcher>,
    pub payload_fetcher: Arc<ScriptedPayloadFetcher>,
    pub sender: Arc<ScriptedSender>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(pipeline_config: PipelineConfig) -> Self {
        Self::with_rate_limit(
            pipeline_config,
            RateLimiterConfig {
                capacity: 1_000,
                refill_period: Duration::from_secs(3600),
            },
        )
        .await
    }

    pub async fn with_rate_limit(
        pipeline_config: PipelineConfig,
        rate_limit: RateLimiterConfig,
    ) -> Self {
        let (pool, dir) = setup_db().await;
        let bindings = Arc::new(SqlxBindingRepository::new(pool.clone()));

        let source_fetcher = Arc::new(ScriptedSourceFetcher::default());
        let payload_fetcher = Arc::new(ScriptedPayloadFetcher::default());
        let sender = Arc::new(ScriptedSender::default());

        let pipeline = Arc::new(
            DeliveryPipeline::new(
                Arc::new(SqlxDeliveryTaskRepository::new(pool.clone())),
                bindings.clone(),
                payload_fetcher.clone(),
                sender.clone(),
                pipeline_config,
            )
            .with_breakers(Arc::new(CircuitBreakerManager::default()))
            .with_rate_limiter(Arc::new(RateLimiter::new(rate_limit))),
        );

        let monitor = ContentMonitor::new(
            Arc::new(SqlxSourceRepository::new(pool.clone())),
            bindings.clone(),
            source_fetcher.clone(),
            pipeline.clone(),
            MonitorConfig::default(),
        );

        let registry = BindingRegistry::new(
            Arc::new(SqlxPairingCodeRepository::new(pool.clone())),
            bindings,
            RegistryConfig::default(),
        );

        Self {
            pool,
            registry,
            pipeline,
            monitor,
            source_fetcher,
            payload_fetcher,
            sender,
            _dir: dir,
        }
    }

    /// Pair `source` with `recipient` through a freshly issued code.
    pub async fn bind(&self, source: &str, recipient: &str) -> BindingDbModel {
        let code = self
            .registry
            .issue_pairing_code(&RecipientId::new(recipient), None)
            .await
            .unwrap();
        self.registry
            .confirm_binding(&code.code, &SourceId::new(source))
            .await
            .unwrap()
    }

    /// Run due tasks until the queue has nothing left to hand out.
    pub async fn drain(&self) -> Vec<Processed> {
        let mut processed = Vec::new();
        for _ in 0..200 {
            match self.pipeline.process_next().await.unwrap() {
                Some(p) => processed.push(p),
                None => break,
            }
        }
        processed
    }
}

pub fn post(source: &str, item_id: &str, position: i64) -> ContentItem {
    ContentItem::new(
        SourceId::new(source),
        item_id,
        ContentKind::MediaPost,
        position,
        format!("https://cdn.example/{item_id}.jpg"),
    )
    .with_caption(format!("caption for {item_id}"))
}
