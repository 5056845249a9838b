//! Integration tests for the job queue and worker pool

use libcrosscast::platforms::mock::MockConnector;
use libcrosscast::platforms::ConnectorRegistry;
use libcrosscast::service::events::{Event, EventReceiver};
use libcrosscast::service::posting::{CreatePostRequest, TargetRequest};
use libcrosscast::{Config, CrosscastService, Database, Platform, PostStatus, TargetStatus};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.queue.max_attempts = 3;
    config.queue.backoff_base = Duration::from_millis(10);
    config.queue.job_timeout = Duration::from_secs(5);
    config.queue.synchronous_platforms = vec![Platform::X];
    config
}

async fn setup_service(registry: ConnectorRegistry, config: Config) -> (CrosscastService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();

    let service = CrosscastService::with_database(Arc::new(db), config, registry).unwrap();
    (service, temp_dir)
}

fn request(targets: Vec<TargetRequest>) -> CreatePostRequest {
    CreatePostRequest {
        user_id: "user-1".to_string(),
        workspace_id: None,
        main_caption: "From the queue".to_string(),
        scheduled_time: None,
        draft: false,
        post_now: false,
        targets,
    }
}

fn drain(events: &mut EventReceiver) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let facebook = Arc::new(MockConnector::flaky(Platform::Facebook, 2));
    let mut registry = ConnectorRegistry::new();
    registry.register(facebook.clone()).unwrap();
    let (mut service, _temp_dir) = setup_service(registry, fast_config()).await;
    let pool = service.start_workers().unwrap();

    let created = service
        .posts()
        .create_post(request(vec![TargetRequest::new(Platform::Facebook, "acct-fb")]))
        .await
        .unwrap();
    let report = created.dispatch.unwrap();
    assert_eq!(report.enqueued, 1);
    assert!(report.inline.is_empty());

    pool.shutdown().await;

    let loaded = service
        .posts()
        .get_post("user-1", &created.post.post.id)
        .await
        .unwrap();
    assert_eq!(loaded.targets[0].status, TargetStatus::Success);
    assert_eq!(loaded.post.status, PostStatus::Done);
    assert_eq!(facebook.publish_calls(), 3);
    assert_eq!(service.queue().live_jobs(), 0);
}

#[tokio::test]
async fn test_permanent_failure_runs_once_and_fails_target() {
    let threads = Arc::new(MockConnector::publish_failure(Platform::Threads, "Account suspended"));
    let mut registry = ConnectorRegistry::new();
    registry.register(threads.clone()).unwrap();
    let (mut service, _temp_dir) = setup_service(registry, fast_config()).await;
    let mut events = service.subscribe();
    let pool = service.start_workers().unwrap();

    let created = service
        .posts()
        .create_post(request(vec![TargetRequest::new(Platform::Threads, "acct-th")]))
        .await
        .unwrap();
    pool.shutdown().await;

    assert_eq!(threads.publish_calls(), 1);

    let loaded = service
        .posts()
        .get_post("user-1", &created.post.post.id)
        .await
        .unwrap();
    assert_eq!(loaded.post.status, PostStatus::Failed);
    assert_eq!(loaded.targets[0].status, TargetStatus::Failed);
    assert_eq!(
        loaded.targets[0].error_message.as_deref(),
        Some("Posting failed: Account suspended")
    );

    let job_failures: Vec<Event> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, Event::JobFailed { .. }))
        .collect();
    assert_eq!(job_failures.len(), 1);
    match &job_failures[0] {
        Event::JobFailed {
            platform,
            attempts,
            social_account_id,
            ..
        } => {
            assert_eq!(*platform, Platform::Threads);
            assert_eq!(*attempts, 1);
            assert_eq!(social_account_id.as_deref(), Some("acct-th"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let linkedin = Arc::new(MockConnector::flaky(Platform::Linkedin, 10));
    let mut registry = ConnectorRegistry::new();
    registry.register(linkedin.clone()).unwrap();
    let (mut service, _temp_dir) = setup_service(registry, fast_config()).await;
    let mut events = service.subscribe();
    let pool = service.start_workers().unwrap();

    let created = service
        .posts()
        .create_post(request(vec![TargetRequest::new(Platform::Linkedin, "acct-li")]))
        .await
        .unwrap();
    pool.shutdown().await;

    assert_eq!(linkedin.publish_calls(), 3);
    let loaded = service
        .posts()
        .get_post("user-1", &created.post.post.id)
        .await
        .unwrap();
    assert_eq!(loaded.targets[0].status, TargetStatus::Failed);
    assert_eq!(loaded.post.status, PostStatus::Failed);

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, Event::JobFailed { attempts: 3, .. })));
}

#[tokio::test]
async fn test_timed_out_job_does_not_leave_target_posting() {
    let mut config = fast_config();
    config.queue.max_attempts = 1;
    config.queue.job_timeout = Duration::from_millis(50);

    let mut registry = ConnectorRegistry::new();
    registry
        .register(Arc::new(MockConnector::with_delay(
            Platform::Pinterest,
            Duration::from_millis(500),
        )))
        .unwrap();
    let (mut service, _temp_dir) = setup_service(registry, config).await;
    let pool = service.start_workers().unwrap();

    let created = service
        .posts()
        .create_post(request(vec![TargetRequest::new(Platform::Pinterest, "acct-pin")]))
        .await
        .unwrap();
    pool.shutdown().await;

    let loaded = service
        .posts()
        .get_post("user-1", &created.post.post.id)
        .await
        .unwrap();
    assert_eq!(loaded.targets[0].status, TargetStatus::Failed);
    let message = loaded.targets[0].error_message.as_deref().unwrap();
    assert!(message.starts_with("job failed:"), "got {}", message);
    assert!(message.contains("timed out"), "got {}", message);
    assert_eq!(loaded.post.status, PostStatus::Failed);
}

#[tokio::test]
async fn test_live_job_is_not_enqueued_twice() {
    let mut config = fast_config();
    config.queue.concurrency = 1;

    let youtube = Arc::new(MockConnector::with_delay(
        Platform::Youtube,
        Duration::from_millis(300),
    ));
    let mut registry = ConnectorRegistry::new();
    registry.register(youtube.clone()).unwrap();
    let (mut service, _temp_dir) = setup_service(registry, config).await;
    let pool = service.start_workers().unwrap();

    let created = service
        .posts()
        .create_post(request(vec![TargetRequest::new(Platform::Youtube, "acct-yt")]))
        .await
        .unwrap();
    assert_eq!(created.dispatch.unwrap().enqueued, 1);

    let again = service
        .posts()
        .dispatch_post("user-1", &created.post.post.id)
        .await
        .unwrap();
    assert_eq!(again.enqueued, 0);
    assert_eq!(again.duplicates, 1);

    pool.shutdown().await;
    assert_eq!(youtube.publish_calls(), 1);
}

#[tokio::test]
async fn test_synchronous_platform_bypasses_queue() {
    let x = Arc::new(MockConnector::success(Platform::X));
    let facebook = Arc::new(MockConnector::success(Platform::Facebook));
    let mut registry = ConnectorRegistry::new();
    registry.register(x.clone()).unwrap();
    registry.register(facebook.clone()).unwrap();
    let (mut service, _temp_dir) = setup_service(registry, fast_config()).await;
    let pool = service.start_workers().unwrap();

    assert!(!service.queue().has_worker(Platform::X));
    assert!(service.queue().has_worker(Platform::Facebook));

    let created = service
        .posts()
        .create_post(request(vec![
            TargetRequest::new(Platform::X, "acct-x"),
            TargetRequest::new(Platform::Facebook, "acct-fb"),
        ]))
        .await
        .unwrap();
    let report = created.dispatch.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(report.inline.len(), 1);
    assert_eq!(report.inline[0].platform, Platform::X);
    assert!(report.inline[0].success);

    pool.shutdown().await;

    let loaded = service
        .posts()
        .get_post("user-1", &created.post.post.id)
        .await
        .unwrap();
    assert_eq!(loaded.post.status, PostStatus::Done);
    assert_eq!(x.publish_calls(), 1);
    assert_eq!(facebook.publish_calls(), 1);
}

#[tokio::test]
async fn test_due_posts_are_picked_up_by_workers() {
    let instagram = Arc::new(MockConnector::success(Platform::Instagram));
    let mut registry = ConnectorRegistry::new();
    registry.register(instagram.clone()).unwrap();
    let (mut service, _temp_dir) = setup_service(registry, fast_config()).await;
    let pool = service.start_workers().unwrap();

    let now = chrono::Utc::now().timestamp();
    let created = service
        .posts()
        .create_post(CreatePostRequest {
            scheduled_time: Some(now + 60),
            ..request(vec![TargetRequest::new(Platform::Instagram, "acct-ig")])
        })
        .await
        .unwrap();
    assert!(created.dispatch.is_none());

    // Not due yet
    assert_eq!(service.posts().dispatch_due_posts(now).await.unwrap(), 0);
    // Due a minute later
    assert_eq!(service.posts().dispatch_due_posts(now + 61).await.unwrap(), 1);

    pool.shutdown().await;

    let loaded = service
        .posts()
        .get_post("user-1", &created.post.post.id)
        .await
        .unwrap();
    assert_eq!(loaded.post.status, PostStatus::Done);
    assert_eq!(instagram.publish_calls(), 1);
}

#[tokio::test]
async fn test_workers_start_only_once() {
    let (mut service, _temp_dir) = setup_service(ConnectorRegistry::new(), fast_config()).await;
    let pool = service.start_workers().unwrap();

    let err = service
        .start_workers()
        .err()
        .expect("second start must fail");
    assert!(err.to_string().contains("already been started"));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_retry_while_job_is_live_is_conflict() {
    let facebook = Arc::new(MockConnector::with_delay(
        Platform::Facebook,
        Duration::from_millis(500),
    ));
    let mut registry = ConnectorRegistry::new();
    registry.register(facebook.clone()).unwrap();
    let (mut service, _temp_dir) = setup_service(registry, fast_config()).await;
    let pool = service.start_workers().unwrap();

    let created = service
        .posts()
        .create_post(request(vec![TargetRequest::new(Platform::Facebook, "acct-fb")]))
        .await
        .unwrap();
    assert_eq!(created.dispatch.unwrap().enqueued, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.queue().live_jobs(), 1);

    let err = service
        .posts()
        .retry_target("user-1", &created.post.post.id, Some("acct-fb"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    pool.shutdown().await;

    assert_eq!(facebook.publish_calls(), 1);
    let loaded = service
        .posts()
        .get_post("user-1", &created.post.post.id)
        .await
        .unwrap();
    assert_eq!(loaded.post.status, PostStatus::Done);
}
