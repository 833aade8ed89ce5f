use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use studio_worker::Error;
use studio_worker::config::WorkerConfig;
use studio_worker::content::{
    ContentEntity, EntityKind, EntityRef, EntityStatus, MemoryContentStore, OperationStatus,
};
use studio_worker::notification::{BroadcastNotifier, WorkerEvent};
use studio_worker::queue::{Job, JobQueue, JobStatus, JobType, MemoryJobQueue, NewJob};
use studio_worker::worker::{HandlerRegistry, Worker, WorkerState};

/// Claims fail with `QueueUnavailable` until `failures` runs out.
struct FlakyQueue {
    inner: MemoryJobQueue,
    failures: AtomicU32,
    claim_times: Mutex<Vec<Instant>>,
}

impl FlakyQueue {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryJobQueue::new(),
            failures: AtomicU32::new(failures),
            claim_times: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn claim_next_job(&self, job_type: JobType) -> studio_worker::Result<Option<Job>> {
        self.claim_times.lock().push(Instant::now());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::QueueUnavailable("connection refused".into()));
        }
        self.inner.claim_next_job(job_type).await
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> studio_worker::Result<Job> {
        self.inner.update_job_status(id, status, result, error).await
    }

    async fn find_active_job(
        &self,
        job_type: JobType,
        payload_key: &str,
        value: &str,
    ) -> studio_worker::Result<Option<Job>> {
        self.inner.find_active_job(job_type, payload_key, value).await
    }

    async fn get_job(&self, id: &str) -> studio_worker::Result<Job> {
        self.inner.get_job(id).await
    }

    async fn fail_stale_jobs(&self, max_age: Duration) -> studio_worker::Result<Vec<Job>> {
        self.inner.fail_stale_jobs(max_age).await
    }

    async fn enqueue(&self, job: NewJob) -> studio_worker::Result<Job> {
        self.inner.enqueue(job).await
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_backoff_cap(Duration::from_millis(50))
        .with_drain_poll(Duration::from_millis(10))
        .with_drain_timeout(Duration::from_secs(2))
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn enqueue(queue: &dyn JobQueue, job_type: JobType, payload: Value) -> Job {
    queue
        .enqueue(NewJob::new(job_type, "user-1", payload))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_in_flight_jobs_never_exceed_capacity() {
    let queue = Arc::new(MemoryJobQueue::new());
    for _ in 0..5 {
        enqueue(queue.as_ref(), JobType::ProcessUrl, json!({})).await;
    }

    let gate = Arc::new(Semaphore::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    {
        let (gate, peak, running) = (gate.clone(), peak.clone(), running.clone());
        handlers.register_fn(JobType::ProcessUrl, move |_| {
            let (gate, peak, running) = (gate.clone(), peak.clone(), running.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _permit = gate.acquire().await?;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
    }

    let worker = Worker::builder(queue.clone(), Arc::new(MemoryContentStore::new()))
        .handlers(handlers)
        .config(fast_config().with_max_concurrent_jobs(2))
        .build()
        .unwrap();
    worker.start().await;

    wait_until(Duration::from_secs(2), || worker.stats().active_jobs == 2).await;
    // A few more cycles at capacity must not claim anything.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.count_by_status(JobStatus::Processing), 2);
    assert_eq!(queue.count_by_status(JobStatus::Pending), 3);

    gate.add_permits(10);
    wait_until(Duration::from_secs(2), || {
        queue.count_by_status(JobStatus::Completed) == 5
    })
    .await;

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    let report = worker.stop().await;
    assert!(report.drained);
}

#[tokio::test]
async fn test_every_dispatched_job_is_resolved() {
    let queue = Arc::new(MemoryJobQueue::new());
    for mode in ["ok", "fail", "panic", "ok", "fail", "panic"] {
        enqueue(queue.as_ref(), JobType::ProcessUrl, json!({ "mode": mode })).await;
    }

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(JobType::ProcessUrl, |job| async move {
        match job.payload["mode"].as_str() {
            Some("fail") => anyhow::bail!("provider rejected the request"),
            Some("panic") => panic!("handler blew up"),
            _ => Ok(json!({ "ok": true })),
        }
    });

    let completions = Arc::new(AtomicUsize::new(0));
    let counted = completions.clone();
    let worker = Worker::builder(queue.clone(), Arc::new(MemoryContentStore::new()))
        .handlers(handlers)
        .config(fast_config())
        .on_complete(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    worker.start().await;

    wait_until(Duration::from_secs(2), || worker.stats().resolved == 6).await;

    let stats = worker.stats();
    assert_eq!(stats.dispatched, stats.resolved);
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(completions.load(Ordering::SeqCst), 6);
    assert_eq!(queue.count_by_status(JobStatus::Completed), 2);
    assert_eq!(queue.count_by_status(JobStatus::Failed), 4);

    let panicked = queue
        .jobs()
        .into_iter()
        .filter(|j| j.payload["mode"] == "panic")
        .all(|j| j.error.as_deref().is_some_and(|e| e.contains("panicked")));
    assert!(panicked);

    // The poll loop survived the panics.
    assert_eq!(worker.state(), WorkerState::Running);
    worker.stop().await;
}

#[tokio::test]
async fn test_supervisor_recovers_from_transient_faults() {
    let queue = Arc::new(FlakyQueue::new(3));
    let job = enqueue(queue.as_ref(), JobType::ProcessUrl, json!({})).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(JobType::ProcessUrl, |_| async { Ok(Value::Null) });

    // Backoff starts at the poll interval: 100, 200, 400 ms.
    let worker = Worker::builder(queue.clone(), Arc::new(MemoryContentStore::new()))
        .handlers(handlers)
        .config(
            fast_config()
                .with_poll_interval(Duration::from_millis(100))
                .with_backoff_cap(Duration::from_secs(5))
                .with_max_consecutive_errors(10),
        )
        .build()
        .unwrap();
    let started = Instant::now();
    worker.start().await;

    wait_until(Duration::from_secs(5), || {
        queue.inner.count_by_status(JobStatus::Completed) == 1
    })
    .await;
    assert!(started.elapsed() >= Duration::from_millis(700));
    wait_until(Duration::from_secs(1), || {
        worker.stats().consecutive_faults == 0
    })
    .await;

    let times = queue.claim_times.lock().clone();
    assert!(times.len() >= 4, "expected 3 failed claims and a retry");
    let gaps: Vec<Duration> = times.windows(2).take(3).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(100));
    assert!(gaps[1] >= Duration::from_millis(200));
    assert!(gaps[2] >= Duration::from_millis(400));
    assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "backoff must grow: {gaps:?}");

    assert_eq!(
        queue.get_job(&job.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(worker.state(), WorkerState::Running);
    worker.stop().await;
    assert!(worker.wait().await.is_ok());
}

#[tokio::test]
async fn test_supervisor_gives_up_after_max_consecutive_faults() {
    let queue = Arc::new(FlakyQueue::new(u32::MAX));
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(JobType::ProcessUrl, |_| async { Ok(Value::Null) });

    let worker = Worker::builder(queue, Arc::new(MemoryContentStore::new()))
        .handlers(handlers)
        .config(fast_config().with_max_consecutive_errors(2))
        .build()
        .unwrap();
    worker.start().await;

    let result = tokio::time::timeout(Duration::from_secs(2), worker.wait())
        .await
        .unwrap();
    match result {
        Err(Error::PollLoopExhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 2);
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }

    let report = worker.stop().await;
    assert!(report.drained);
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_jobs() {
    let queue = Arc::new(MemoryJobQueue::new());
    enqueue(queue.as_ref(), JobType::ProcessUrl, json!({})).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(JobType::ProcessUrl, |_| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(json!({ "done": true }))
    });

    let worker = Worker::builder(queue.clone(), Arc::new(MemoryContentStore::new()))
        .handlers(handlers)
        .config(fast_config())
        .build()
        .unwrap();
    worker.start().await;
    wait_until(Duration::from_secs(1), || worker.stats().active_jobs == 1).await;

    let report = worker.stop().await;

    assert!(report.drained);
    assert_eq!(report.remaining_jobs, 0);
    assert_eq!(queue.count_by_status(JobStatus::Completed), 1);
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_stop_is_bounded_by_drain_timeout() {
    let queue = Arc::new(MemoryJobQueue::new());
    enqueue(queue.as_ref(), JobType::ProcessUrl, json!({})).await;
    enqueue(queue.as_ref(), JobType::ProcessUrl, json!({})).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(JobType::ProcessUrl, |_| {
        std::future::pending::<anyhow::Result<Value>>()
    });

    let drain_timeout = Duration::from_millis(200);
    let worker = Worker::builder(queue.clone(), Arc::new(MemoryContentStore::new()))
        .handlers(handlers)
        .config(
            fast_config()
                .with_max_concurrent_jobs(1)
                .with_drain_timeout(drain_timeout),
        )
        .build()
        .unwrap();
    worker.start().await;
    wait_until(Duration::from_secs(1), || worker.stats().active_jobs == 1).await;

    let started = Instant::now();
    let report = worker.stop().await;
    let elapsed = started.elapsed();

    assert!(!report.drained);
    assert_eq!(report.remaining_jobs, 1);
    assert!(elapsed >= drain_timeout);
    assert!(elapsed < drain_timeout + Duration::from_millis(500));

    // The hung job is not completed and nothing new was claimed.
    assert_eq!(queue.count_by_status(JobStatus::Processing), 1);
    assert_eq!(queue.count_by_status(JobStatus::Pending), 1);
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_concurrent_stops_both_return() {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(JobType::ProcessUrl, |_| async { Ok(Value::Null) });
    let worker = Worker::builder(
        Arc::new(MemoryJobQueue::new()),
        Arc::new(MemoryContentStore::new()),
    )
    .handlers(handlers)
    .config(fast_config())
    .build()
    .unwrap();
    worker.start().await;

    let (a, b) = tokio::join!(worker.stop(), worker.stop());
    assert!(a.drained);
    assert!(b.drained);
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_start_reaps_stale_jobs_and_fails_their_entities() {
    let queue = Arc::new(MemoryJobQueue::new());
    let content = Arc::new(MemoryContentStore::new());
    let notifier = BroadcastNotifier::new();
    let mut rx = notifier.subscribe();

    let long_ago = Utc::now() - TimeDelta::hours(2);
    let mut stuck = NewJob::new(
        JobType::GeneratePodcast,
        "user-7",
        json!({ "podcastId": "pod-1" }),
    )
    .into_job(long_ago);
    stuck
        .transition(JobStatus::Processing, None, None, long_ago)
        .unwrap();
    queue.insert(stuck.clone());

    let pod = EntityRef::new(EntityKind::Podcast, "pod-1");
    content.insert(ContentEntity::new(pod.clone(), "user-7").with_job(stuck.id.clone()));

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(JobType::GeneratePodcast, |_| async { Ok(Value::Null) });

    let worker = Worker::builder(queue.clone(), content.clone())
        .notifier(Arc::new(notifier.clone()))
        .handlers(handlers)
        .config(fast_config())
        .build()
        .unwrap();
    worker.start().await;

    let job = queue.get_job(&stuck.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("timed out"));
    assert_eq!(content.get(&pod).unwrap().status, EntityStatus::Failed);

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.user_id, "user-7");
    match notification.event {
        WorkerEvent::EntityChanged(event) => {
            assert_eq!(event.entity_id, "pod-1");
            assert_eq!(event.status, EntityStatus::Failed);
        }
        other => panic!("unexpected event {other:?}"),
    }

    worker.stop().await;
}

#[tokio::test]
async fn test_start_resumes_orphaned_external_operations() {
    let queue = Arc::new(MemoryJobQueue::new());
    let content = Arc::new(MemoryContentStore::new());

    let doc = EntityRef::new(EntityKind::Document, "doc-9");
    let mut row = ContentEntity::new(doc.clone(), "user-3")
        .with_external_operation("op-123", OperationStatus::InProgress);
    row.status = EntityStatus::Failed;
    content.insert(row);

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(JobType::ProcessResearch, |job| async move {
        Ok(json!({
            "resumed": job.payload["resume"],
            "operation": job.payload["externalOperationId"],
        }))
    });

    let worker = Worker::builder(queue.clone(), content.clone())
        .handlers(handlers)
        .config(fast_config())
        .build()
        .unwrap();
    worker.start().await;

    let entity = content.get(&doc).unwrap();
    assert_eq!(entity.status, EntityStatus::Processing);
    let resume_id = entity.job_id.unwrap();

    wait_until(Duration::from_secs(2), || {
        queue.count_by_status(JobStatus::Completed) == 1
    })
    .await;

    let resumed = queue.get_job(&resume_id).await.unwrap();
    assert_eq!(resumed.job_type, JobType::ProcessResearch);
    assert_eq!(resumed.user_id(), "user-3");
    let result = resumed.result.unwrap();
    assert_eq!(result["resumed"], true);
    assert_eq!(result["operation"], "op-123");

    worker.stop().await;
}
