// 上传引擎端到端场景
//
// 使用脚本化的任务仓库，在暂停的 tokio 时钟下驱动完整会话

use async_trait::async_trait;
use odm_dashboard_rust::config::UploadConfig;
use odm_dashboard_rust::uploader::{EventPublisher, ProgressReporter};
use odm_dashboard_rust::{
    ProjectId, RepositoryError, SessionOutcome, SessionPhase, TaskParams, TaskRepository,
    UploadAck, UploadEngine, UploadError, UploadEvent, UploadFile, UploadSession,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MB: u64 = 1024 * 1024;

/// 按文件名编排行为的任务仓库
#[derive(Default)]
struct ScriptedRepository {
    /// 每个文件剩余的失败次数（u32::MAX 表示永远失败）
    failures: StdMutex<HashMap<String, u32>>,
    /// 每个文件的传输耗时，未配置的文件耗时 100ms
    delays: HashMap<String, Duration>,
    /// 每次上传开始的时间
    attempts: StdMutex<Vec<(String, Instant)>>,
    /// 正在传输的文件数及其峰值
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    uploads_completed: AtomicUsize,
    commit_calls: AtomicUsize,
}

impl ScriptedRepository {
    fn fail(self, name: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), times);
        self
    }

    fn delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    fn attempts_of(&self, name: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, t)| *t)
            .collect()
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskRepository for ScriptedRepository {
    async fn create_task(
        &self,
        _project_id: ProjectId,
        _params: &TaskParams,
    ) -> Result<Value, RepositoryError> {
        Ok(json!({ "id": "task-1", "pending_action": null }))
    }

    async fn upload_file(
        &self,
        _endpoint: &str,
        file: &UploadFile,
        progress: ProgressReporter,
    ) -> Result<UploadAck, RepositoryError> {
        self.attempts
            .lock()
            .unwrap()
            .push((file.name.clone(), Instant::now()));
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = self
            .delays
            .get(&file.name)
            .copied()
            .unwrap_or(Duration::from_millis(100));
        progress.report(file.size / 2);
        tokio::time::sleep(delay).await;
        progress.report(file.size);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let should_fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&file.name) {
                Some(remaining) if *remaining > 0 => {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(RepositoryError::Status {
                status: 500,
                body: "internal error".to_string(),
            });
        }

        self.uploads_completed.fetch_add(1, Ordering::SeqCst);
        Ok(UploadAck::accepted(file.name.clone(), file.size))
    }

    async fn commit_task(
        &self,
        _project_id: ProjectId,
        task_id: &str,
    ) -> Result<Value, RepositoryError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "id": task_id }))
    }
}

fn jpg(name: &str, size: u64) -> UploadFile {
    UploadFile::new(format!("/survey/{}", name), name, size)
}

fn setup(
    repository: Arc<ScriptedRepository>,
    config: &UploadConfig,
    files: Vec<UploadFile>,
) -> (UploadEngine, Arc<Mutex<UploadSession>>, broadcast::Receiver<UploadEvent>) {
    let events = EventPublisher::new(4096);
    let rx = events.subscribe();
    let engine = UploadEngine::new(repository, config, events);

    let mut session = UploadSession::new(1, config);
    let rejected = session.add_files(files).unwrap();
    assert!(rejected.is_empty());

    (engine, Arc::new(Mutex::new(session)), rx)
}

fn drain(rx: &mut broadcast::Receiver<UploadEvent>) -> Vec<UploadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_all_files_succeed_and_commit_once() {
    let repository = Arc::new(ScriptedRepository::default());
    let config = UploadConfig::default();
    let (engine, session, mut rx) = setup(
        repository.clone(),
        &config,
        vec![jpg("a.jpg", 10 * MB), jpg("b.jpg", 10 * MB), jpg("c.jpg", 10 * MB)],
    );

    let outcome = engine
        .run(session.clone(), &TaskParams::new("Survey"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, SessionOutcome::Committed("task-1".to_string()));
    assert_eq!(repository.commit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(repository.uploads_completed.load(Ordering::SeqCst), 3);

    let snapshot = session.lock().await.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Committed);
    assert_eq!(snapshot.uploaded_count, 3);
    assert_eq!(snapshot.total_bytes_sent, 30 * MB);
    assert_eq!(snapshot.progress, 100.0);
    assert!(snapshot.error.is_none());

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(UploadEvent::TaskCreated { .. })));
    assert!(matches!(
        events.last(),
        Some(UploadEvent::TaskReady { task_id, .. }) if task_id == "task-1"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retries_with_linear_backoff() {
    let repository = Arc::new(ScriptedRepository::default().fail("flaky.jpg", 2));
    let config = UploadConfig::default();
    let (engine, session, mut rx) = setup(
        repository.clone(),
        &config,
        vec![jpg("flaky.jpg", 4 * MB), jpg("ok.jpg", 2 * MB)],
    );

    let outcome = engine
        .run(session.clone(), &TaskParams::new("Survey"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Committed("task-1".to_string()));

    // 第 n 次重试前等待 5000ms × n
    let attempts = repository.attempts_of("flaky.jpg");
    assert_eq!(attempts.len(), 3);
    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(first_gap >= Duration::from_millis(5000));
    assert!(first_gap < Duration::from_millis(10000));
    assert!(second_gap >= Duration::from_millis(10000));

    let snapshot = session.lock().await.snapshot();
    let flaky = snapshot.files.iter().find(|f| f.name == "flaky.jpg").unwrap();
    assert_eq!(flaky.retries, 2);
    assert_eq!(flaky.bytes_sent, 4 * MB);
    // 重试回滚后总量不重复计算
    assert_eq!(snapshot.total_bytes_sent, snapshot.total_bytes);
    assert_eq!(snapshot.total_bytes, 6 * MB);

    let retries: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            UploadEvent::FileRetrying {
                retry_count,
                delay_ms,
                ..
            } => {
                assert_eq!(delay_ms, 5000 * retry_count as u64);
                Some(retry_count)
            }
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_oversize_file_is_dropped_before_dispatch() {
    let repository = Arc::new(ScriptedRepository::default());
    let config = UploadConfig {
        max_file_size_mb: 1,
        ..Default::default()
    };
    let (engine, session, mut rx) = setup(
        repository.clone(),
        &config,
        vec![jpg("huge.jpg", 2 * MB), jpg("small.jpg", 100 * 1024)],
    );

    let outcome = engine
        .run(session.clone(), &TaskParams::new("Survey"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Committed("task-1".to_string()));
    assert_eq!(repository.attempts_of("huge.jpg").len(), 0);
    assert_eq!(repository.commit_calls.load(Ordering::SeqCst), 1);

    let snapshot = session.lock().await.snapshot();
    assert_eq!(snapshot.total_count, 1);
    assert_eq!(snapshot.uploaded_count, 1);
    assert_eq!(snapshot.total_bytes, 100 * 1024);
    assert_eq!(snapshot.progress, 100.0);

    let rejected = drain(&mut rx).into_iter().any(|e| {
        matches!(e, UploadEvent::FileRejected { ref filename, .. } if filename == "huge.jpg")
    });
    assert!(rejected);
}

#[tokio::test(start_paused = true)]
async fn test_nothing_uploaded_fails_without_commit() {
    let repository = Arc::new(
        ScriptedRepository::default()
            .fail("a.jpg", u32::MAX)
            .fail("b.jpg", u32::MAX),
    );
    let config = UploadConfig {
        max_retries: 2,
        retry_base_delay_ms: 10,
        abort_on_exhausted_retries: false,
        ..Default::default()
    };
    let (engine, session, mut rx) = setup(
        repository.clone(),
        &config,
        vec![jpg("a.jpg", MB), jpg("b.jpg", MB)],
    );

    let outcome = engine
        .run(session.clone(), &TaskParams::new("Survey"), CancellationToken::new())
        .await
        .unwrap();

    let expected = UploadError::NothingUploaded(2).to_string();
    assert_eq!(outcome, SessionOutcome::Failed(expected.clone()));
    assert_eq!(repository.commit_calls.load(Ordering::SeqCst), 0);
    // 首次尝试 + 2 次重试
    assert_eq!(repository.attempt_count(), 6);

    let snapshot = session.lock().await.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Failed);
    assert_eq!(snapshot.error.as_deref(), Some(expected.as_str()));
    assert!(!snapshot.uploading);

    let failed = drain(&mut rx)
        .into_iter()
        .any(|e| matches!(e, UploadEvent::Failed { ref message, .. } if *message == expected));
    assert!(failed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_session_by_default() {
    let repository = Arc::new(ScriptedRepository::default().fail("bad.jpg", u32::MAX));
    let config = UploadConfig {
        max_retries: 1,
        retry_base_delay_ms: 10,
        ..Default::default()
    };
    let (engine, session, mut rx) = setup(
        repository.clone(),
        &config,
        vec![jpg("bad.jpg", MB), jpg("good.jpg", MB)],
    );

    let outcome = engine
        .run(session.clone(), &TaskParams::new("Survey"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SessionOutcome::Failed("Cannot upload bad.jpg, exceeded max retries (1)".to_string())
    );
    assert_eq!(repository.commit_calls.load(Ordering::SeqCst), 0);
    assert_eq!(repository.attempts_of("bad.jpg").len(), 2);

    let snapshot = session.lock().await.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Failed);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Cannot upload bad.jpg, exceeded max retries (1)")
    );
    assert!(!snapshot.uploading);

    let failed = drain(&mut rx)
        .into_iter()
        .any(|e| matches!(e, UploadEvent::Failed { ref message, .. } if message.contains("bad.jpg")));
    assert!(failed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_file_can_be_dropped_instead() {
    let repository = Arc::new(ScriptedRepository::default().fail("bad.jpg", u32::MAX));
    let config = UploadConfig {
        max_retries: 1,
        retry_base_delay_ms: 10,
        abort_on_exhausted_retries: false,
        ..Default::default()
    };
    let (engine, session, _rx) = setup(
        repository.clone(),
        &config,
        vec![jpg("bad.jpg", MB), jpg("good.jpg", MB)],
    );

    let outcome = engine
        .run(session.clone(), &TaskParams::new("Survey"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, SessionOutcome::Committed("task-1".to_string()));
    assert_eq!(repository.commit_calls.load(Ordering::SeqCst), 1);
    let snapshot = session.lock().await.snapshot();
    assert_eq!(snapshot.total_count, 1);
    assert_eq!(snapshot.uploaded_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded_and_slots_refill() {
    let mut repository = ScriptedRepository::default();
    for i in 1..20 {
        repository = repository.delay(&format!("{:02}.jpg", i), Duration::from_secs(1));
    }
    let repository = Arc::new(repository);
    let config = UploadConfig::default();
    let files = (0..20).map(|i| jpg(&format!("{:02}.jpg", i), MB)).collect();
    let (engine, session, _rx) = setup(repository.clone(), &config, files);

    let outcome = engine
        .run(session.clone(), &TaskParams::new("Survey"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Committed("task-1".to_string()));
    assert_eq!(repository.uploads_completed.load(Ordering::SeqCst), 20);
    assert_eq!(
        repository.peak_in_flight.load(Ordering::SeqCst),
        config.parallel_uploads
    );

    // 00.jpg 在 100ms 时完成，第七个文件立刻补位，不等其它 1s 的传输
    let first = repository.attempts_of("00.jpg")[0];
    let refill = repository.attempts_of("06.jpg")[0];
    assert!(refill - first >= Duration::from_millis(100));
    assert!(refill - first < Duration::from_secs(1));
    let next = repository.attempts_of("07.jpg")[0];
    assert!(next - first >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_discards_in_flight_transfers() {
    let hour = Duration::from_secs(3600);
    let repository = Arc::new(
        ScriptedRepository::default()
            .delay("slow1.jpg", hour)
            .delay("slow2.jpg", hour)
            .delay("slow3.jpg", hour),
    );
    let config = UploadConfig::default();
    let (engine, session, mut rx) = setup(
        repository.clone(),
        &config,
        vec![
            jpg("fast1.jpg", MB),
            jpg("fast2.jpg", MB),
            jpg("slow1.jpg", MB),
            jpg("slow2.jpg", MB),
            jpg("slow3.jpg", MB),
        ],
    );
    let original_id = session.lock().await.id().to_string();

    let token = CancellationToken::new();
    let run = {
        let engine = engine.clone();
        let session = session.clone();
        let token = token.clone();
        tokio::spawn(async move {
            engine
                .run(session, &TaskParams::new("Survey"), token)
                .await
        })
    };

    // 等待两个快速文件完成
    loop {
        match rx.recv().await.unwrap() {
            UploadEvent::Progress { uploaded_count, .. } if uploaded_count == 2 => break,
            _ => {}
        }
    }

    token.cancel();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Canceled);

    // 被中止的传输永远不会完成
    tokio::time::sleep(hour * 2).await;
    assert_eq!(repository.uploads_completed.load(Ordering::SeqCst), 2);
    assert_eq!(repository.commit_calls.load(Ordering::SeqCst), 0);

    let guard = session.lock().await;
    assert_eq!(guard.phase(), SessionPhase::Editing);
    assert_eq!(guard.total_count(), 0);
    assert!(guard.task_id().is_none());
    assert_ne!(guard.id(), original_id);
}
