#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::batch::{BatchItem, BatchService};
    use crate::browser::testing::{DriverScript, ScriptedFactory};
    use crate::browser_pool::BrowserPool;
    use crate::config::{CaptureRequest, ImageFormat, Settings, SharedSettings};
    use crate::job::{BatchConfig, JobStatus, JobStore, RecurrencePattern};
    use crate::metrics::MetricsCollector;
    use crate::screenshot_service::ScreenshotService;
    use crate::storage::{
        LocalObjectStore, MappingUrlRewriter, MockObjectStore, MockUrlSigner, ProxyUrlSigner,
        StorageCollaborators,
    };
    use crate::tab_pool::TabPool;
    use crate::watchdog::RequestActivity;

    struct Stack {
        service: Arc<ScreenshotService>,
        pool: Arc<BrowserPool>,
        batch: Arc<BatchService>,
        store: Arc<JobStore>,
        script: Arc<DriverScript>,
        _dir: tempfile::TempDir,
    }

    /// Test settings: tiny pool, fast retries, no background churn.
    fn test_settings(dir: &tempfile::TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.screenshot_dir = dir.path().join("shots").to_string_lossy().into_owned();
        settings.pool.min_size = 1;
        settings.pool.max_size = 2;
        settings.pool.cleanup_interval = Duration::from_secs(3600);
        settings.tabs.cleanup_interval = Duration::from_secs(3600);
        settings.retry.max_retries = 0;
        settings.retry.base_delay = Duration::from_millis(1);
        settings.retry.max_delay = Duration::from_millis(5);
        settings.circuit_breaker.threshold = 3;
        settings.circuit_breaker.reset_time = Duration::from_millis(600);
        settings
    }

    async fn build_stack(
        script: Arc<DriverScript>,
        mutate: impl FnOnce(&mut Settings),
    ) -> Stack {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(&dir);
        mutate(&mut settings);
        build_stack_with_storage(script, settings, dir, None).await
    }

    async fn build_stack_with_storage(
        script: Arc<DriverScript>,
        settings: Settings,
        dir: tempfile::TempDir,
        storage: Option<StorageCollaborators>,
    ) -> Stack {
        let shared = SharedSettings::new(settings.clone());
        let metrics = MetricsCollector::new();
        let activity = RequestActivity::new();

        let pool = BrowserPool::new(shared.clone(), ScriptedFactory::new(script.clone()))
            .await
            .unwrap();
        let tabs = TabPool::new(shared.clone());

        let storage = storage.unwrap_or_else(|| StorageCollaborators {
            object_store: Arc::new(LocalObjectStore::new(
                std::path::PathBuf::from(&settings.screenshot_dir).join("store"),
            )),
            signer: Arc::new(ProxyUrlSigner::new("https://img.test", "test-secret")),
            rewriter: Arc::new(MappingUrlRewriter::identity()),
        });

        let service = ScreenshotService::new(
            shared.clone(),
            pool.clone(),
            Some(tabs),
            storage,
            metrics,
            activity,
        )
        .await
        .unwrap();

        let store = Arc::new(JobStore::new(100, Duration::from_secs(3600)));
        let batch = BatchService::new(shared, store.clone(), service.clone());

        Stack {
            service,
            pool,
            batch,
            store,
            script,
            _dir: dir,
        }
    }

    fn request(url: &str) -> CaptureRequest {
        CaptureRequest::new(url, 1280, 720, ImageFormat::Png)
    }

    async fn wait_for_terminal(batch: &BatchService, job_id: &str, deadline: Duration) -> JobStatus {
        let until = Instant::now() + deadline;
        loop {
            if let Some(snapshot) = batch.get_job(job_id).await {
                if snapshot.status.is_terminal() {
                    return snapshot.status;
                }
            }
            assert!(Instant::now() < until, "job {job_id} did not finish in time");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_the_browser_entirely() {
        let stack = build_stack(DriverScript::new(), |_| {}).await;

        stack
            .service
            .result_cache
            .set(
                "https://example.com",
                1280,
                720,
                ImageFormat::Png,
                "https://signed.example/img1".into(),
            )
            .await;

        let outcome = stack
            .service
            .capture(request("https://example.com"))
            .await
            .unwrap();

        assert_eq!(outcome.url, "https://signed.example/img1");
        assert!(outcome.cached);
        assert!(stack.script.navigated_urls().is_empty(), "no page was driven");

        let cache_stats = stack.service.result_cache.stats().await;
        assert_eq!(cache_stats.hits, 1);

        // No slot was taken from the pool
        let pool_stats = stack.pool.stats().await;
        assert_eq!(pool_stats.reused, 0);
        assert_eq!(pool_stats.in_use, 0);

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn capture_uploads_signs_and_fills_the_cache() {
        let stack = build_stack(DriverScript::new(), |_| {}).await;

        let first = stack
            .service
            .capture(request("https://example.com/page"))
            .await
            .unwrap();
        assert!(!first.cached);
        assert!(first.url.starts_with("https://img.test/"));
        assert_eq!(stack.script.captures.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Same arguments hit the cache and skip the second render
        let second = stack
            .service
            .capture(request("https://example.com/page"))
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.url, first.url);
        assert_eq!(stack.script.captures.load(std::sync::atomic::Ordering::SeqCst), 1);

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn pipeline_drives_collaborators() {
        let script = DriverScript::new();
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(&dir);

        let mut object_store = MockObjectStore::new();
        object_store
            .expect_upload()
            .times(1)
            .returning(|_| Ok("artifact.png".to_string()));
        let mut signer = MockUrlSigner::new();
        signer
            .expect_sign()
            .times(1)
            .returning(|_, _, _, _| Ok("https://signed.example/mocked".to_string()));

        let storage = StorageCollaborators {
            object_store: Arc::new(object_store),
            signer: Arc::new(signer),
            rewriter: Arc::new(MappingUrlRewriter::identity()),
        };
        let stack = build_stack_with_storage(script, settings, dir, Some(storage)).await;

        let outcome = stack
            .service
            .capture(request("https://example.com"))
            .await
            .unwrap();
        assert_eq!(outcome.url, "https://signed.example/mocked");

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_captures_share_the_bounded_pool() {
        let script = DriverScript::new();
        *script.nav_delay.lock().unwrap() = Duration::from_millis(200);
        let stack = build_stack(script, |_| {}).await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let service = stack.service.clone();
            handles.push(tokio::spawn(async move {
                let mut req = request(&format!("https://site{i}.test"));
                req.use_cache = false;
                service.capture(req).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stats = stack.pool.stats().await;
        assert_eq!(stats.peak_usage, 2, "pool never exceeded max_size");
        assert_eq!(stats.in_use, 0, "all slots returned");
        assert_eq!(stats.in_use + stats.available, stats.total_slots);

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn circuit_opens_after_failures_and_recovers() {
        let script = DriverScript::new();
        script
            .nav_failures
            .store(3, std::sync::atomic::Ordering::SeqCst);
        let stack = build_stack(script, |_| {}).await;

        let mut failing = request("https://flaky.test/page");
        failing.use_cache = false;

        for _ in 0..3 {
            let err = stack.service.capture(failing.clone()).await.unwrap_err();
            assert_eq!(err.error_code(), "max_retries_exceeded");
        }

        // Breaker (threshold 3) is now open: navigation fails fast
        let navigations_before = stack.script.navigated_urls().len();
        let err = stack.service.capture(failing.clone()).await.unwrap_err();
        assert_eq!(err.error_code(), "circuit_breaker_open");
        assert_eq!(
            stack.script.navigated_urls().len(),
            navigations_before,
            "no navigation attempted while open"
        );

        // After the reset window one probe is admitted and succeeds
        tokio::time::sleep(Duration::from_millis(700)).await;
        let outcome = stack.service.capture(failing).await.unwrap();
        assert!(!outcome.cached);

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn batch_submission_boundaries() {
        let stack = build_stack(DriverScript::new(), |_| {}).await;

        let err = stack
            .batch
            .submit(Vec::new(), BatchConfig::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "validation_error");

        let too_many: Vec<BatchItem> = (0..51)
            .map(|i| BatchItem {
                id: format!("item-{i}"),
                request: request("https://example.com"),
            })
            .collect();
        let err = stack
            .batch
            .submit(too_many, BatchConfig::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "validation_error");

        let one = vec![BatchItem {
            id: "a".into(),
            request: request("https://example.com"),
        }];
        for parallel in [0usize, 11] {
            let config = BatchConfig {
                parallel,
                ..Default::default()
            };
            let err = stack
                .batch
                .submit(one.clone(), config, None)
                .await
                .unwrap_err();
            assert_eq!(err.error_code(), "validation_error");
        }

        let config = BatchConfig {
            scheduled_time: Some("2001-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let err = stack.batch.submit(one, config, None).await.unwrap_err();
        assert_eq!(err.error_code(), "validation_error");

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn batch_fail_fast_cancels_remaining_items() {
        let script = DriverScript::new();
        script.fail_url("https://bad.test");
        *script.nav_delay.lock().unwrap() = Duration::from_millis(100);
        let stack = build_stack(script, |_| {}).await;
        stack.batch.start().await;

        let items: Vec<BatchItem> = (1..=5)
            .map(|i| BatchItem {
                id: format!("item-{i}"),
                request: if i == 2 {
                    request("https://bad.test")
                } else {
                    request(&format!("https://good{i}.test"))
                },
            })
            .collect();

        let snapshot = stack
            .batch
            .submit(
                items,
                BatchConfig {
                    parallel: 3,
                    timeout: 5,
                    fail_fast: true,
                    use_cache: false,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let status = wait_for_terminal(&stack.batch, &snapshot.job_id, Duration::from_secs(15)).await;
        assert!(
            matches!(status, JobStatus::Failed | JobStatus::CompletedWithErrors),
            "unexpected status {status:?}"
        );

        let results = stack.batch.get_job_results(&snapshot.job_id).await.unwrap();
        assert!(results.failed >= 1);
        let bad = results.results.iter().find(|r| r.id == "item-2").unwrap();
        assert!(bad.error.is_some());
        // Every item reached a terminal state
        assert_eq!(results.total, results.succeeded + results.failed);

        stack.batch.shutdown().await;
        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn recurring_job_spawns_bounded_successors() {
        let script = DriverScript::new();
        let stack = build_stack(script, |_| {}).await;
        stack.batch.start().await;

        let fire = (chrono::Utc::now() + chrono::Duration::milliseconds(1200)).to_rfc3339();
        let snapshot = stack
            .batch
            .submit(
                vec![BatchItem {
                    id: "a".into(),
                    request: request("https://example.com"),
                }],
                BatchConfig {
                    scheduled_time: Some(fire),
                    recurrence: RecurrencePattern::Daily,
                    recurrence_count: 2,
                    use_cache: false,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(snapshot.status, JobStatus::Scheduled);

        wait_for_terminal(&stack.batch, &snapshot.job_id, Duration::from_secs(15)).await;

        // Exactly one successor exists, scheduled a day ahead
        let mut successors = Vec::new();
        for id in stack.store.job_ids().await {
            if let Some(job) = stack.store.get(&id).await {
                if job.parent_job_id.as_deref() == Some(snapshot.job_id.as_str()) {
                    successors.push(job);
                }
            }
        }
        assert_eq!(successors.len(), 1);
        let successor = &successors[0];
        assert_eq!(successor.status, JobStatus::Scheduled);
        let gap = successor.scheduled_time.unwrap() - chrono::Utc::now();
        assert!(gap > chrono::Duration::hours(23) && gap <= chrono::Duration::hours(24));

        // Fire the successor now; the recurrence count stops the chain
        let soon = (chrono::Utc::now() + chrono::Duration::milliseconds(1200)).to_rfc3339();
        stack
            .batch
            .schedule_job(&successor.job_id, &soon)
            .await
            .unwrap()
            .expect("successor reschedulable");
        wait_for_terminal(&stack.batch, &successor.job_id, Duration::from_secs(15)).await;

        for id in stack.store.job_ids().await {
            if let Some(job) = stack.store.get(&id).await {
                assert_ne!(
                    job.parent_job_id.as_deref(),
                    Some(successor.job_id.as_str()),
                    "recurrence count must stop the chain"
                );
            }
        }

        stack.batch.shutdown().await;
        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn batch_cancellation_marks_items_cancelled() {
        let script = DriverScript::new();
        *script.nav_delay.lock().unwrap() = Duration::from_millis(3000);
        let stack = build_stack(script, |_| {}).await;
        stack.batch.start().await;

        let items: Vec<BatchItem> = (1..=3)
            .map(|i| BatchItem {
                id: format!("item-{i}"),
                request: request(&format!("https://slow{i}.test")),
            })
            .collect();
        let snapshot = stack
            .batch
            .submit(
                items,
                BatchConfig {
                    parallel: 1,
                    timeout: 30,
                    use_cache: false,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        // Let the worker pick the job up, then cancel mid-flight
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(stack.batch.cancel_job(&snapshot.job_id).await);

        let job = stack.batch.get_job(&snapshot.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let results = stack.batch.get_job_results(&snapshot.job_id).await.unwrap();
        for item in &results.results {
            if item.status == crate::job::ItemStatus::Error {
                assert_eq!(item.error.as_deref(), Some("Job cancelled"));
            }
        }
        assert!(results
            .results
            .iter()
            .any(|r| r.error.as_deref() == Some("Job cancelled")));

        // Cancelling again is a no-op
        assert!(!stack.batch.cancel_job(&snapshot.job_id).await);

        stack.batch.shutdown().await;
        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_a_scheduled_job_deletes_it() {
        let stack = build_stack(DriverScript::new(), |_| {}).await;

        let fire = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let snapshot = stack
            .batch
            .submit(
                vec![BatchItem {
                    id: "a".into(),
                    request: request("https://example.com"),
                }],
                BatchConfig {
                    scheduled_time: Some(fire),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(snapshot.status, JobStatus::Scheduled);

        assert!(stack.batch.cancel_job(&snapshot.job_id).await);
        assert!(stack.batch.get_job(&snapshot.job_id).await.is_none());

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn content_cache_serves_second_capture() {
        let script = DriverScript::new();
        script.subresources.lock().unwrap().push((
            "https://assets.test/app.js".to_string(),
            b"console.log(1)".to_vec(),
        ));
        let stack = build_stack(script, |_| {}).await;

        let mut req = request("https://example.com");
        req.use_cache = false;

        stack.service.capture(req.clone()).await.unwrap();
        assert_eq!(
            stack
                .script
                .fetched_upstream
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        // The store happens off the interception path; give it a beat
        tokio::time::sleep(Duration::from_millis(100)).await;

        stack.service.capture(req).await.unwrap();
        assert!(
            stack
                .script
                .fulfilled_from_cache
                .load(std::sync::atomic::Ordering::SeqCst)
                >= 1,
            "second capture was served from the content cache"
        );
        assert!(stack.service.content_cache.stats().hits >= 1);

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn invalidation_forces_a_fresh_render() {
        let stack = build_stack(DriverScript::new(), |_| {}).await;

        let first = stack
            .service
            .capture(request("https://example.com"))
            .await
            .unwrap();
        let second = stack
            .service
            .capture(request("https://example.com"))
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(first.url, second.url);

        let removed = stack.service.invalidate_cache(Some("https://example.com")).await;
        assert_eq!(removed, 1);

        let third = stack
            .service
            .capture(request("https://example.com"))
            .await
            .unwrap();
        assert!(!third.cached, "invalidation removed the entry");

        stack.service.shutdown().await;
    }

    #[tokio::test]
    async fn capture_rejects_invalid_viewport() {
        let stack = build_stack(DriverScript::new(), |_| {}).await;
        let mut req = request("https://example.com");
        req.width = 5000;
        let err = stack.service.capture(req).await.unwrap_err();
        assert_eq!(err.error_code(), "validation_error");
        stack.service.shutdown().await;
    }
}
