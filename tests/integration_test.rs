use std::sync::Arc;
use std::time::Duration;

use entry_engine::browser::{ChromiumEngineFactory, EngineFactory, SessionOptions};
use entry_engine::config::Config;
use entry_engine::events::{EngineEvent, EventBus};
use entry_engine::forms::FormAnalysis;
use entry_engine::models::{Contest, ContestType, EntryJob, EntryMethod, EntryResult, EntryStatus, FailureKind, ProfileData};
use entry_engine::orchestrator::{EntryEngine, ENTRY_QUEUE};
use entry_engine::queue::{GatewayMode, MemoryBroker};
use entry_engine::testing::{MockEngineFactory, MockProvider, MockSession, StaticForms};
use parking_lot::Mutex;
use serde_json::json;
use tokio_test::assert_ok;

fn entry(entry_id: &str, url: &str) -> EntryJob {
    let mut job = EntryJob::new(
        Contest {
            id: format!("contest-{}", entry_id),
            url: url.to_string(),
            title: Some("Summer Giveaway".to_string()),
            contest_type: ContestType::Sweepstakes,
            entry_method: EntryMethod::Form,
            is_multi_step: false,
        },
        ProfileData {
            id: "profile-1".to_string(),
            fields: [("email".to_string(), "someone@example.test".to_string())].into(),
        },
    );
    job.entry_id = Some(entry_id.to_string());
    job
}

/// 带 reCAPTCHA 的报名页，点击提交后显示 `after_submit`
fn challenge_page(after_submit: &'static str) -> MockSession {
    MockSession::new("Enter to win")
        .respond(
            "__detectChallenge",
            json!({ "type": "recaptcha_v2", "siteKey": "site-key", "pageUrl": "https://promo.test/enter" }),
        )
        .respond("__injectChallengeToken", json!(true))
        .on_click("#submit", after_submit)
}

struct Harness {
    engine: EntryEngine,
    events: Arc<Mutex<Vec<EngineEvent>>>,
    _dir: tempfile::TempDir,
}

async fn harness<F>(session: F, analysis: FormAnalysis, broker: MemoryBroker) -> Harness
where
    F: Fn() -> MockSession + Send + Sync + 'static,
{
    harness_with(session, analysis, broker, 4).await
}

async fn harness_with<F>(session: F, analysis: FormAnalysis, broker: MemoryBroker, concurrency: usize) -> Harness
where
    F: Fn() -> MockSession + Send + Sync + 'static,
{
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        screenshot_dir: dir.path().display().to_string(),
        max_browser_instances: 2,
        max_sessions_per_instance: 2,
        entry_concurrency: concurrency,
        ..Config::default()
    };
    let bus = EventBus::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        bus.subscribe(move |event| events.lock().push(event.clone()));
    }

    let engine = EntryEngine::build(
        config,
        Arc::new(MockEngineFactory::new().with_session(session)),
        Arc::new(broker),
        StaticForms::new(analysis).kit(),
        bus,
    )
    .await
    .unwrap();

    Harness {
        engine,
        events,
        _dir: dir,
    }
}

fn form(has_challenge: bool) -> FormAnalysis {
    FormAnalysis {
        has_challenge,
        submit_target: Some("#submit".into()),
        ..FormAnalysis::default()
    }
}

/// 提交任务、跑完队列、取回结果
async fn run_entry(h: &Harness, job: EntryJob) -> EntryResult {
    let handle = assert_ok!(h.engine.submit_entry(job).await);
    assert!(h.engine.start_entry_workers());
    let counts = h
        .engine
        .gateway()
        .wait_for_idle(ENTRY_QUEUE, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(counts.completed, 1);

    let finished = h.engine.gateway().job(&handle.id).await.unwrap().unwrap();
    h.engine.shutdown().await;
    serde_json::from_value(finished.return_value.unwrap()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_records_jobs_without_running_them() {
    let h = harness(|| MockSession::new(""), form(false), MemoryBroker::unreachable()).await;
    assert_eq!(h.engine.gateway().mode(), GatewayMode::Fallback);

    for n in 0..3 {
        let handle = assert_ok!(h.engine.submit_entry(entry(&format!("e-{}", n), "https://promo.test")).await);
        assert!(handle.fallback);
    }
    assert!(!h.engine.start_entry_workers());

    tokio::time::sleep(Duration::from_secs(60)).await;
    let counts = h.engine.gateway().status(ENTRY_QUEUE).await.unwrap();
    assert_eq!(counts.waiting, 3);
    assert_eq!(counts.completed + counts.active + counts.failed, 0);
    assert_eq!(h.engine.pool().stats().instances, 0);
}

#[tokio::test(start_paused = true)]
async fn test_instant_win_contest_uses_instant_win_strategy() {
    let analysis = FormAnalysis {
        play_target: Some("#play".into()),
        ..FormAnalysis::default()
    };
    let h = harness(
        || MockSession::new("Spin the wheel").on_click("#play", "Congratulations! You won a $25 gift card!"),
        analysis,
        MemoryBroker::new(),
    )
    .await;

    let mut job = entry("win-1", "https://wheel.test/play");
    job.contest.contest_type = ContestType::InstantWin;
    job.contest.entry_method = EntryMethod::Email;
    let result = run_entry(&h, job).await;

    assert_eq!(result.strategy, "instant_win");
    assert_eq!(result.status, EntryStatus::Confirmed);
    assert!(result.instant_win.unwrap().won);
    assert!(h
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, EngineEvent::InstantWin { entry_id, .. } if entry_id == "win-1")));
}

#[tokio::test(start_paused = true)]
async fn test_failing_provider_falls_back_to_next() {
    let h = harness(
        || challenge_page("Thank you for your entry! Confirmation #QX7781"),
        form(true),
        MemoryBroker::new(),
    )
    .await;
    h.engine
        .register_provider(Arc::new(MockProvider::failing("alpha", 1, false)));
    h.engine
        .register_provider(Arc::new(MockProvider::succeeding("beta", 2, "tok-beta")));

    let result = run_entry(&h, entry("e-fallback", "https://promo.test/enter")).await;

    assert_eq!(result.status, EntryStatus::Confirmed);
    assert_eq!(result.confirmation_token.as_deref(), Some("QX7781"));
    assert!(result.errors.is_empty());
    assert!(result.challenge_cost > 0.0);

    let events = h.events.lock();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ChallengeFailed { provider, .. } if provider == "alpha")));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ChallengeSolved { provider, .. } if provider == "beta")));
}

#[tokio::test(start_paused = true)]
async fn test_already_entered_wins_over_success_text() {
    let h = harness(
        || {
            MockSession::new("")
                .on_click("#submit", "Thank you for participating! You have already entered today.")
        },
        form(false),
        MemoryBroker::new(),
    )
    .await;

    let result = run_entry(&h, entry("e-dup", "https://promo.test/enter")).await;

    assert_eq!(result.status, EntryStatus::Failed);
    assert_eq!(result.failure_kind, Some(FailureKind::AlreadyEntered));
    // 已参加过不算站点故障
    assert!(h.engine.breaker().can_execute("promo.test"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_challenge_errors_are_retried_into_confirmed_entry() {
    let h = harness(
        || challenge_page("Your entry has been received. Good luck!"),
        form(true),
        MemoryBroker::new(),
    )
    .await;
    h.engine
        .register_provider(Arc::new(MockProvider::flaky("alpha", 1, 2, "tok-alpha")));

    let result = run_entry(&h, entry("e-flaky", "https://promo.test/enter")).await;

    assert_eq!(result.status, EntryStatus::Confirmed);
    assert_eq!(result.warnings.len(), 2);
    assert!(result.warnings.iter().all(|w| w.contains("打码")));
    assert!(result.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_broken_site_trips_breaker_and_jobs_retry() {
    // 导航一直失败；串行执行保证熔断前恰好失败 5 次
    let h = harness_with(
        || MockSession::new("").with_goto_failures(u32::MAX),
        form(false),
        MemoryBroker::new(),
        1,
    )
    .await;
    for n in 0..7 {
        assert_ok!(h.engine.submit_entry(entry(&format!("e-{}", n), "https://down.test/enter")).await);
    }
    h.engine.start_entry_workers();
    let counts = h
        .engine
        .gateway()
        .wait_for_idle(ENTRY_QUEUE, Duration::from_millis(100))
        .await
        .unwrap();
    h.engine.shutdown().await;

    // 失败结果本身是正常完成的任务；熔断拦下的两个任务重试耗尽进入死信
    assert_eq!(counts.completed, 5);
    assert_eq!(counts.failed, 2);
    assert!(!h.engine.breaker().can_execute("down.test"));

    let stats = h.engine.flow().stats();
    assert_eq!(stats.failed, 5);
    assert_eq!(stats.circuit_open, 6);

    let dead = h.engine.gateway().dead_letters(ENTRY_QUEUE).await.unwrap();
    assert!(dead.iter().all(|job| job.attempts_made == 3));
    assert!(h.events.lock().iter().any(|e| matches!(e, EngineEvent::CircuitStateChanged { .. })));
}

#[tokio::test]
#[ignore] // 需要本机安装 Chrome：cargo test -- --ignored
async fn test_real_chromium_session() {
    let factory = ChromiumEngineFactory::headless(true, None);
    let instance = factory.launch().await.expect("启动浏览器失败");
    let session = instance
        .new_session(&SessionOptions::default())
        .await
        .expect("创建会话失败");

    session
        .goto("data:text/html,<p>Thank you for your entry!</p>")
        .await
        .expect("导航失败");
    let text = session.text_content().await.expect("读取页面文本失败");
    assert!(text.contains("Thank you"));

    session.close().await.expect("关闭会话失败");
    instance.close().await.expect("关闭浏览器失败");
}
