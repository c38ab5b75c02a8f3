mod common;

use mediafetch::database::models::NewDeliveryTask;
use mediafetch::delivery::{CircuitState, Dependency, ParkReason, ProcessOutcome, SubmitOutcome};
use mediafetch::domain::{ContentKind, DeliveryState, FailureReason, RecipientId, SourceId};
use mediafetch::platform::{PayloadError, SendError};

use common::{Harness, fast_pipeline_config};

/// A post from s1 for U1, carrying the pipeline's retry budget.
fn task_for(h: &Harness, binding_id: i64, item_id: &str) -> NewDeliveryTask {
    NewDeliveryTask {
        binding_id,
        source_id: SourceId::new("s1"),
        recipient_id: RecipientId::new("U1"),
        item_id: item_id.to_string(),
        kind: ContentKind::MediaPost,
        payload_ref: format!("https://cdn.example/{item_id}.jpg"),
        caption: Some("hello".to_string()),
        permalink: None,
        max_retries: h.pipeline.config().retry.max_retries,
        not_before: 0,
    }
}

#[tokio::test]
async fn send_fails_three_times_then_delivers() {
    let h = Harness::new(fast_pipeline_config(3)).await;
    let binding = h.bind("s1", "U1").await;
    h.sender.fail_times(3, SendError::Unreachable("timeout".into()));

    let id = h
        .pipeline
        .submit(task_for(&h, binding.id, "p1"))
        .await
        .unwrap()
        .task_id()
        .unwrap()
        .to_string();

    let processed = h.drain().await;
    assert_eq!(processed.len(), 4);
    assert!(matches!(
        processed[0].outcome,
        ProcessOutcome::Parked { reason: ParkReason::Backoff, .. }
    ));
    assert!(matches!(processed[3].outcome, ProcessOutcome::Delivered { .. }));

    let task = h.pipeline.get_task(&id).await.unwrap();
    assert_eq!(task.state(), Some(DeliveryState::Delivered));
    assert_eq!(task.send_attempts, 3);
    assert_eq!(task.ack_id.as_deref(), Some("msg-3"));
    assert_eq!(h.sender.calls(), 4);
    assert_eq!(h.sender.sent().len(), 1);
}

#[tokio::test]
async fn retries_are_bounded() {
    let h = Harness::new(fast_pipeline_config(3)).await;
    let binding = h.bind("s1", "U1").await;
    h.sender.fail_times(10, SendError::Unreachable("timeout".into()));

    h.pipeline
        .submit(task_for(&h, binding.id, "p1"))
        .await
        .unwrap();

    let processed = h.drain().await;
    assert_eq!(processed.len(), 4);
    assert_eq!(
        processed[3].outcome,
        ProcessOutcome::Failed(FailureReason::DeliveryExhausted)
    );
    // First attempt plus exactly three retries.
    assert_eq!(h.sender.calls(), 4);

    let task = h.pipeline.get_task(&processed[3].task_id).await.unwrap();
    assert_eq!(task.failure_reason(), Some(FailureReason::DeliveryExhausted));
    assert_eq!(task.send_attempts, 4);
}

#[tokio::test]
async fn fetch_retries_are_bounded() {
    let h = Harness::new(fast_pipeline_config(3)).await;
    let binding = h.bind("s1", "U1").await;
    for _ in 0..10 {
        h.payload_fetcher
            .fail_next(PayloadError::Unreachable("cdn down".into()));
    }

    h.pipeline
        .submit(task_for(&h, binding.id, "p1"))
        .await
        .unwrap();

    let processed = h.drain().await;
    assert_eq!(processed.len(), 4);
    for parked in &processed[..3] {
        assert!(matches!(
            parked.outcome,
            ProcessOutcome::Parked { reason: ParkReason::Backoff, .. }
        ));
    }
    assert_eq!(
        processed[3].outcome,
        ProcessOutcome::Failed(FailureReason::FetchExhausted)
    );
    // First download plus exactly three retries, and nothing is sent.
    assert_eq!(h.payload_fetcher.calls(), 4);
    assert_eq!(h.sender.calls(), 0);

    let task = h.pipeline.get_task(&processed[3].task_id).await.unwrap();
    assert_eq!(task.state(), Some(DeliveryState::Failed));
    assert_eq!(task.failure_reason(), Some(FailureReason::FetchExhausted));
    assert_eq!(task.fetch_attempts, 4);
    assert_eq!(task.send_attempts, 0);
}

#[tokio::test]
async fn fetch_retries_use_their_own_counter() {
    let h = Harness::new(fast_pipeline_config(1)).await;
    let binding = h.bind("s1", "U1").await;
    h.payload_fetcher
        .fail_next(PayloadError::Unreachable("cdn down".into()));
    h.sender.fail_next(SendError::Unreachable("timeout".into()));

    h.pipeline
        .submit(task_for(&h, binding.id, "p1"))
        .await
        .unwrap();
    let processed = h.drain().await;

    // One fetch retry and one send retry both fit in max_retries = 1.
    assert!(matches!(
        processed.last().unwrap().outcome,
        ProcessOutcome::Delivered { .. }
    ));
    let task = h.pipeline.get_task(&processed[0].task_id).await.unwrap();
    assert_eq!(task.fetch_attempts, 1);
    assert_eq!(task.send_attempts, 1);
}

#[tokio::test]
async fn deleted_content_fails_without_retry() {
    let h = Harness::new(fast_pipeline_config(3)).await;
    let binding = h.bind("s1", "U1").await;
    h.payload_fetcher.fail_next(PayloadError::NotFound);

    h.pipeline
        .submit(task_for(&h, binding.id, "p1"))
        .await
        .unwrap();
    let processed = h.drain().await;
    assert_eq!(processed.len(), 1);
    assert_eq!(
        processed[0].outcome,
        ProcessOutcome::Failed(FailureReason::ContentGone)
    );
    assert_eq!(h.sender.calls(), 0);
}

#[tokio::test]
async fn breaker_opens_after_five_failures_and_fails_fast() {
    let h = Harness::new(fast_pipeline_config(20)).await;
    let binding = h.bind("s1", "U1").await;
    h.sender.fail_times(5, SendError::Unreachable("503".into()));

    h.pipeline
        .submit(task_for(&h, binding.id, "p1"))
        .await
        .unwrap();
    for _ in 0..5 {
        let processed = h.pipeline.process_next().await.unwrap().unwrap();
        assert!(matches!(
            processed.outcome,
            ProcessOutcome::Parked { reason: ParkReason::Backoff, .. }
        ));
    }
    assert_eq!(
        h.pipeline
            .breakers()
            .get(Dependency::DestinationPlatform)
            .state(),
        CircuitState::Open
    );

    // The retry and a brand-new task both park without touching the network.
    h.pipeline
        .submit(task_for(&h, binding.id, "p2"))
        .await
        .unwrap();
    let processed = h.drain().await;
    assert_eq!(processed.len(), 2);
    for p in &processed {
        assert!(matches!(
            p.outcome,
            ProcessOutcome::Parked { reason: ParkReason::BreakerOpen, .. }
        ));
    }
    assert_eq!(h.sender.calls(), 5);

    // Breaker parks do not consume attempts.
    let task = h.pipeline.get_task(&processed[0].task_id).await.unwrap();
    assert_eq!(task.state(), Some(DeliveryState::Pending));
    assert!(task.send_attempts <= 5);
}

#[tokio::test]
async fn concurrent_duplicate_submits_leave_one_task() {
    let h = Harness::new(fast_pipeline_config(3)).await;
    let binding = h.bind("s1", "U1").await;
    let pipeline = h.pipeline.clone();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pipeline = pipeline.clone();
        let task = task_for(&h, binding.id, "p1");
        handles.push(tokio::spawn(async move { pipeline.submit(task).await }));
    }

    let mut created = 0;
    for handle in handles {
        if let SubmitOutcome::Created(_) = handle.await.unwrap().unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let processed = h.drain().await;
    assert_eq!(processed.len(), 1);
    assert_eq!(h.sender.calls(), 1);

    // Delivered pairs are never re-queued.
    assert_eq!(
        h.pipeline
            .submit(task_for(&h, binding.id, "p1"))
            .await
            .unwrap(),
        SubmitOutcome::Duplicate
    );
}

#[tokio::test]
async fn cancelled_task_is_not_sent() {
    let h = Harness::new(fast_pipeline_config(3)).await;
    let binding = h.bind("s1", "U1").await;
    let id = h
        .pipeline
        .submit(task_for(&h, binding.id, "p1"))
        .await
        .unwrap()
        .task_id()
        .unwrap()
        .to_string();

    assert!(h.pipeline.cancel(&id).await.unwrap());
    assert!(!h.pipeline.cancel(&id).await.unwrap());
    assert!(h.drain().await.is_empty());

    let task = h.pipeline.get_task(&id).await.unwrap();
    assert_eq!(task.failure_reason(), Some(FailureReason::Cancelled));
    assert_eq!(h.sender.calls(), 0);
}

#[tokio::test]
async fn repeated_recipient_failures_deactivate_binding() {
    let mut config = fast_pipeline_config(0);
    config.binding_failure_threshold = 2;
    let h = Harness::new(config).await;
    let binding = h.bind("s1", "U1").await;
    h.sender
        .fail_times(2, SendError::RecipientInvalid("blocked".into()));

    for item in ["p1", "p2"] {
        h.pipeline
            .submit(task_for(&h, binding.id, item))
            .await
            .unwrap();
    }
    let processed = h.drain().await;
    assert!(processed
        .iter()
        .all(|p| p.outcome == ProcessOutcome::Failed(FailureReason::RecipientInvalid)));

    let binding = h.registry.get_binding(binding.id).await.unwrap();
    assert!(!binding.active);
    assert!(
        h.registry
            .list_active_bindings(&SourceId::new("s1"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn status_counts_track_outcomes() {
    let h = Harness::new(fast_pipeline_config(0)).await;
    let binding = h.bind("s1", "U1").await;
    h.sender
        .fail_next(SendError::PayloadRejected("unsupported".into()));

    for item in ["p1", "p2", "p3"] {
        h.pipeline
            .submit(task_for(&h, binding.id, item))
            .await
            .unwrap();
    }
    h.drain().await;

    let counts = h.pipeline.status_counts().await.unwrap();
    assert_eq!(counts.delivered, 2);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.in_flight(), 0);
    assert_eq!(
        h.pipeline
            .list_tasks_for_binding(binding.id, 10)
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn rate_limited_tasks_download_once() {
    use mediafetch::delivery::RateLimiterConfig;
    use std::time::Duration;

    let h = Harness::with_rate_limit(
        fast_pipeline_config(3),
        RateLimiterConfig {
            capacity: 1,
            refill_period: Duration::from_millis(200),
        },
    )
    .await;
    let binding = h.bind("s1", "U1").await;
    for item in ["p1", "p2", "p3"] {
        h.pipeline
            .submit(task_for(&h, binding.id, item))
            .await
            .unwrap();
    }

    let mut rate_limited = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.pipeline.status_counts().await.unwrap().delivered < 3 {
        assert!(tokio::time::Instant::now() < deadline, "queue did not drain");
        rate_limited += h
            .drain()
            .await
            .iter()
            .filter(|p| matches!(p.outcome, ProcessOutcome::Parked { reason: ParkReason::RateLimited, .. }))
            .count();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Parking for the recipient's budget happens before the download.
    assert!(rate_limited > 0);
    assert_eq!(h.sender.calls(), 3);
    assert_eq!(h.payload_fetcher.calls(), 3);
}

#[tokio::test]
async fn worker_pool_drains_queue() {
    use mediafetch::delivery::{WorkerPool, WorkerPoolConfig};
    use std::time::Duration;

    let h = Harness::new(fast_pipeline_config(3)).await;
    let binding = h.bind("s1", "U1").await;
    let pool = WorkerPool::new(WorkerPoolConfig {
        max_workers: 2,
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    });
    pool.start(h.pipeline.clone());

    for item in ["p1", "p2", "p3"] {
        h.pipeline
            .submit(task_for(&h, binding.id, item))
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.pipeline.status_counts().await.unwrap().delivered < 3 {
        assert!(tokio::time::Instant::now() < deadline, "workers did not drain the queue");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.stop().await;
    assert_eq!(h.sender.calls(), 3);
}
