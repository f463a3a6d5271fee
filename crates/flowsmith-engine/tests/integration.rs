//! Integration tests for the flowsmith-engine crate.
//!
//! These tests drive the [`FlowService`] facade end to end against an
//! on-disk SQLite database (via tempfile), stub integrations in place of
//! network services, and a manual clock for scheduling.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration};
use serde_json::json;

use flowsmith_adapters::{
    ActionOutput, ActionRequest, Capability, CapabilityTable, Credentials, DeliveryReceipt,
    HealthStatus, Integration, Quote,
};
use flowsmith_engine::flow::branch;
use flowsmith_engine::{
    ActionClass, Clock, Complexity, EngineConfig, EngineError, Flow, FlowEdge, FlowMetadata,
    FlowNode, FlowService, IntentInterpreter, IntentModel, IntentSource, ManualClock, NodeKind,
    NodeStatus, OutputKind, RunOutcome, Verdict,
};
use flowsmith_store::Database;

const T0: i64 = 1_760_000_000;

// ═══════════════════════════════════════════════════════════════════════
//  Stubs
// ═══════════════════════════════════════════════════════════════════════

struct StubQuote;

#[async_trait]
impl Integration for StubQuote {
    fn name(&self) -> &str {
        "quote"
    }
    fn capability(&self) -> Capability {
        Capability::QuoteFetch
    }
    fn is_configured(&self) -> bool {
        true
    }
    async fn health_check(&self) -> flowsmith_adapters::Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }
    async fn invoke(&self, request: ActionRequest) -> flowsmith_adapters::Result<ActionOutput> {
        let ActionRequest::QuoteFetch { symbol } = request else {
            unreachable!("only quote requests are routed here");
        };
        Ok(ActionOutput::Quote(Quote {
            name: "Dólar Americano".into(),
            symbol,
            value: 5.43,
            change_pct: -0.35,
            high: Some(5.5),
            low: Some(5.4),
            timestamp: DateTime::from_timestamp(T0, 0).unwrap(),
            provider: "stub".into(),
        }))
    }
}

/// Telegram stand-in that counts deliveries.
#[derive(Default)]
struct RecordingBot {
    sent: AtomicUsize,
}

impl RecordingBot {
    fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Integration for RecordingBot {
    fn name(&self) -> &str {
        "telegram"
    }
    fn capability(&self) -> Capability {
        Capability::MessagingBotSend
    }
    fn is_configured(&self) -> bool {
        true
    }
    async fn health_check(&self) -> flowsmith_adapters::Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }
    async fn invoke(&self, request: ActionRequest) -> flowsmith_adapters::Result<ActionOutput> {
        let ActionRequest::BotMessage { target, .. } = request else {
            unreachable!("only bot messages are routed here");
        };
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ActionOutput::Delivered(DeliveryReceipt {
            integration: "telegram".into(),
            target: target.unwrap_or_else(|| "chat".into()),
            message_id: Some(n.to_string()),
        }))
    }
}

/// Model stand-in that either answers with fixed text or fails.
struct ScriptedModel {
    answer: Option<&'static str>,
}

#[async_trait]
impl IntentModel for ScriptedModel {
    fn is_available(&self) -> bool {
        true
    }
    async fn classify(&self, _prompt: &str) -> flowsmith_engine::Result<String> {
        self.answer
            .map(str::to_string)
            .ok_or_else(|| EngineError::ModelUnavailable("connection refused".into()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Fixture
// ═══════════════════════════════════════════════════════════════════════

struct Fixture {
    service: FlowService,
    clock: Arc<ManualClock>,
    bot: Arc<RecordingBot>,
    dir: tempfile::TempDir,
}

fn telegram_credentials() -> Credentials {
    Credentials::from_pairs([
        ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ("TELEGRAM_CHAT_ID", "42"),
    ])
}

async fn service_in(
    dir: &tempfile::TempDir,
    credentials: Credentials,
    clock: Arc<ManualClock>,
    bot: Arc<RecordingBot>,
) -> FlowService {
    let db = Database::open_and_migrate(dir.path().join("flowsmith.db"))
        .await
        .unwrap();
    let mut config = EngineConfig::default();
    config.executor.output_dir = dir.path().join("output");
    let table = CapabilityTable::new()
        .with(Arc::new(StubQuote))
        .with(bot);
    FlowService::new(db, table, credentials, config, clock)
}

async fn fixture_with(credentials: Credentials) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_unix(T0));
    let bot = Arc::new(RecordingBot::default());
    let service = service_in(&dir, credentials, clock.clone(), bot.clone()).await;
    Fixture {
        service,
        clock,
        bot,
        dir,
    }
}

async fn fixture() -> Fixture {
    fixture_with(telegram_credentials()).await
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        handle.await.unwrap();
    }
}

fn at(secs: i64) -> DateTime<chrono::Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  Generation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn dollar_quote_prompt_builds_accepted_three_node_flow() {
    let fx = fixture().await;

    let generation = fx
        .service
        .generate_flow("send me the dollar quote every morning")
        .await
        .unwrap();

    assert_eq!(
        generation.flow.kinds(),
        vec![NodeKind::Trigger, NodeKind::Search, NodeKind::Output]
    );
    assert_eq!(generation.flow.nodes[1].integration(), Some("quote"));
    assert!(generation.validation.score >= 70);
    assert_eq!(generation.validation.verdict, Verdict::Accepted);
    assert_eq!(generation.intent.source, IntentSource::Keywords);

    let history = fx.service.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, generation.learning_id);
    assert_eq!(history[0].flow_id.as_deref(), Some(generation.flow.id.as_str()));
}

#[tokio::test]
async fn well_formed_prompts_have_one_trigger_and_an_output() {
    let fx = fixture().await;
    let prompts = [
        "send the dollar quote to telegram every hour",
        "summarize the weekly report as html",
        "if the euro goes above 6 notify slack",
        "for each currency fetch the quote and save it to the database",
        "email me the bitcoin price and keep a file copy",
        "please do something",
    ];

    for prompt in prompts {
        let generation = fx.service.generate_flow(prompt).await.unwrap();
        let flow = &generation.flow;
        assert_eq!(flow.count(NodeKind::Trigger), 1, "{prompt}");
        assert!(flow.count(NodeKind::Output) >= 1, "{prompt}");
        assert!(generation.validation.score >= 30, "{prompt}");
        assert!(flow.structural_errors().is_empty(), "{prompt}: {:?}", flow.structural_errors());
    }

    let stats = fx.service.stats().await.unwrap();
    assert_eq!(stats.learning.total, prompts.len() as i64);
    assert_eq!(stats.learning.errored, 0);
}

#[tokio::test]
async fn empty_prompt_is_rejected_and_recorded() {
    let fx = fixture().await;

    let err = fx.service.generate_flow("   ").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)), "{err}");

    let history = fx.service.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].flow_id.is_none());
    assert!(history[0].error.as_deref().unwrap().contains("prompt is empty"));
}

#[tokio::test]
async fn model_answer_drives_interpretation() {
    let fx = fixture().await;
    let model = Arc::new(ScriptedModel {
        answer: Some(
            r#"```json
{"goal": "send the dollar quote", "action": "hybrid", "complexity": "simple",
 "integrations": ["quote", "telegram"], "output": "message"}
```"#,
        ),
    });
    let service = fx
        .service
        .with_interpreter(IntentInterpreter::with_model(model, Duration::from_secs(5)));

    let generation = service.generate_flow("dólar no telegram").await.unwrap();

    assert_eq!(generation.intent.source, IntentSource::Model);
    assert_eq!(
        generation.flow.used_integrations(),
        BTreeSet::from(["quote".to_string(), "telegram".to_string()])
    );
}

#[tokio::test]
async fn failing_model_falls_back_to_keywords() {
    let fx = fixture().await;
    let service = fx.service.with_interpreter(IntentInterpreter::with_model(
        Arc::new(ScriptedModel { answer: None }),
        Duration::from_secs(5),
    ));

    let generation = service
        .generate_flow("send the dollar quote to telegram")
        .await
        .unwrap();

    assert_eq!(generation.intent.source, IntentSource::Keywords);
    assert!(generation.intent.wants("telegram"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Execution
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn dry_run_touches_nothing_and_real_run_delivers() {
    let fx = fixture().await;
    let flow = fx
        .service
        .generate_flow("send the dollar quote to telegram")
        .await
        .unwrap()
        .flow;

    let dry = fx.service.execute_flow(&flow, false).await;
    assert_eq!(dry.outcome, RunOutcome::Success);
    assert_eq!(fx.bot.sent(), 0);

    let real = fx.service.execute_flow(&flow, true).await;
    assert_eq!(real.outcome, RunOutcome::Success, "{:?}", real.first_error());
    assert_eq!(fx.bot.sent(), 1);
}

#[tokio::test]
async fn file_output_lands_in_output_dir() {
    let fx = fixture().await;
    let flow = fx
        .service
        .generate_flow("send me the dollar quote")
        .await
        .unwrap()
        .flow;

    let report = fx.service.execute_flow(&flow, true).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    let artifacts: Vec<_> = report.artifacts().collect();
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].starts_with(fx.dir.path().join("output")));
    let text = std::fs::read_to_string(artifacts[0]).unwrap();
    assert!(text.contains("5.43"), "{text}");
}

#[tokio::test]
async fn never_exiting_loop_completes_as_partial_failure() {
    let fx = fixture().await;
    let flow = Flow {
        id: "loop-flow".into(),
        name: "poll forever".into(),
        description: String::new(),
        nodes: vec![
            FlowNode::new("t", NodeKind::Trigger, "start"),
            FlowNode::new("l", NodeKind::Loop, "until never")
                .with_param("until", json!({ "field": "never.set", "operator": "exists" })),
            FlowNode::new("b", NodeKind::Transform, "collect").with_param("operation", "collect"),
            FlowNode::new("o", NodeKind::Output, "done").with_param("kind", "message"),
        ],
        edges: vec![
            FlowEdge::new("t", "l"),
            FlowEdge::labelled("l", "b", branch::BODY),
            FlowEdge::loop_back("b", "l"),
            FlowEdge::labelled("l", "o", branch::EXIT),
        ],
        created_at: at(T0),
        source_prompt: "poll forever".into(),
        metadata: FlowMetadata {
            action: ActionClass::Transform,
            complexity: Complexity::Complex,
            requested_integrations: BTreeSet::new(),
            output_kind: OutputKind::Message,
            goal: "poll forever".into(),
        },
    };

    let report = fx.service.execute_flow(&flow, true).await;

    assert_eq!(report.outcome, RunOutcome::PartialFailure);
    let l = report.node("l").unwrap();
    assert_eq!(l.status, NodeStatus::Failed);
    assert_eq!(l.iterations, Some(fx.service.config().executor.max_loop_iterations));
}

// ═══════════════════════════════════════════════════════════════════════
//  Automations
// ═══════════════════════════════════════════════════════════════════════

async fn dollar_automation(fx: &Fixture, cadence: i64) -> flowsmith_engine::Automation {
    let flow = fx
        .service
        .generate_flow("send me the dollar quote")
        .await
        .unwrap()
        .flow;
    fx.service.create_automation(flow, cadence).await.unwrap()
}

#[tokio::test]
async fn scheduled_run_advances_next_due_by_cadence() {
    let fx = fixture().await;
    let automation = dollar_automation(&fx, 60).await;
    assert_eq!(automation.next_due_at, at(T0 + 3600));

    let scheduler = fx.service.scheduler();
    assert!(scheduler.tick().await.unwrap().is_empty());

    // Runs late, but the schedule stays anchored to the due time.
    fx.clock.advance(ChronoDuration::minutes(61));
    join_all(scheduler.tick().await.unwrap()).await;

    let after = fx.service.get_automation(&automation.id).await.unwrap();
    assert_eq!(after.next_due_at, at(T0 + 7200));
    assert_eq!(after.run_count, 1);
    assert_eq!(after.last_outcome, Some(RunOutcome::Success));
    assert_eq!(after.last_run_at, Some(fx.clock.now()));
}

#[tokio::test]
async fn stop_and_restart_preserve_next_due() {
    let Fixture {
        service,
        clock,
        bot,
        dir,
    } = fixture().await;
    let flow = service
        .generate_flow("send me the dollar quote")
        .await
        .unwrap()
        .flow;
    let automation = service.create_automation(flow, 15).await.unwrap();

    let stopped = service.stop_automation(&automation.id).await.unwrap();
    assert!(!stopped.enabled);
    assert_eq!(stopped.next_due_at, automation.next_due_at);
    drop(service);

    // Engine restarts two hours later, long past the stored due time.
    clock.advance(ChronoDuration::hours(2));
    let service = service_in(&dir, telegram_credentials(), clock.clone(), bot.clone()).await;
    let mut scheduler = service.scheduler();
    scheduler.start().await.unwrap();
    assert!(scheduler.tick().await.unwrap().is_empty());
    scheduler.stop().await;

    let reopened = service.get_automation(&automation.id).await.unwrap();
    assert!(!reopened.enabled);
    assert_eq!(reopened.next_due_at, automation.next_due_at);
    assert_eq!(reopened.run_count, 0);
    assert_eq!(bot.sent(), 0);

    let started = service.start_automation(&automation.id).await.unwrap();
    assert!(started.enabled);
    assert_eq!(started.next_due_at, automation.next_due_at);
    assert_eq!(started.run_count, 0);
}

#[tokio::test]
async fn run_now_on_disabled_automation_updates_last_run_only() {
    let fx = fixture().await;
    let automation = dollar_automation(&fx, 30).await;
    fx.service.stop_automation(&automation.id).await.unwrap();
    fx.clock.advance(ChronoDuration::minutes(5));

    let report = fx.service.run_automation_now(&automation.id).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);

    let after = fx.service.get_automation(&automation.id).await.unwrap();
    assert!(!after.enabled);
    assert_eq!(after.next_due_at, automation.next_due_at);
    assert_eq!(after.last_run_at, Some(at(T0 + 300)));
    assert_eq!(after.run_count, 1);
}

#[tokio::test]
async fn paused_engine_catches_up_with_one_run() {
    let fx = fixture().await;
    let automation = dollar_automation(&fx, 1).await;
    let scheduler = fx.service.scheduler();

    fx.clock.advance(ChronoDuration::minutes(3));
    let handles = scheduler.tick().await.unwrap();
    assert_eq!(handles.len(), 1);
    join_all(handles).await;

    let after = fx.service.get_automation(&automation.id).await.unwrap();
    assert_eq!(after.run_count, 1);
    assert_eq!(after.next_due_at, fx.clock.now() + ChronoDuration::minutes(1));
    assert!(scheduler.tick().await.unwrap().is_empty());
}

#[tokio::test]
async fn creation_checks_cadence_and_credentials() {
    let fx = fixture_with(Credentials::default()).await;
    let flow = fx
        .service
        .generate_flow("send the dollar quote to telegram every hour")
        .await
        .unwrap()
        .flow;

    let err = fx
        .service
        .create_automation(flow.clone(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)), "{err}");

    let err = fx.service.create_automation(flow, 60).await.unwrap_err();
    match err {
        EngineError::MissingCredentials { integration, keys } => {
            assert_eq!(integration, "telegram");
            assert!(keys.contains(&"TELEGRAM_BOT_TOKEN".to_string()));
        }
        other => panic!("expected missing credentials, got {other}"),
    }
    assert!(fx.service.list_automations().await.unwrap().is_empty());
}

#[tokio::test]
async fn removed_automation_is_not_found() {
    let fx = fixture().await;
    let automation = dollar_automation(&fx, 10).await;

    fx.service.remove_automation(&automation.id).await.unwrap();

    let err = fx.service.get_automation(&automation.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "automation", .. }));
}

#[tokio::test]
async fn automations_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_unix(T0));
    let bot = Arc::new(RecordingBot::default());

    let created = {
        let service = service_in(&dir, telegram_credentials(), clock.clone(), bot.clone()).await;
        let flow = service
            .generate_flow("send me the dollar quote")
            .await
            .unwrap()
            .flow;
        let automation = service.create_automation(flow, 45).await.unwrap();
        service.stop_automation(&automation.id).await.unwrap()
    };

    let service = service_in(&dir, telegram_credentials(), clock, bot).await;
    let listed = service.list_automations().await.unwrap();
    assert_eq!(listed, vec![created]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Saved flows
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn saved_flow_lifecycle() {
    let fx = fixture().await;
    let flow = fx
        .service
        .generate_flow("send me the dollar quote")
        .await
        .unwrap()
        .flow;

    let saved = fx.service.save_flow(&flow).await.unwrap();
    assert_eq!(saved.id, flow.id);
    assert_eq!(saved.validation_score, Some(100));
    assert_eq!(fx.service.list_saved_flows(10, 0).await.unwrap().len(), 1);

    fx.service.execute_saved_flow(&saved.id, false).await.unwrap();
    let report = fx.service.execute_saved_flow(&saved.id, true).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
    let reloaded = fx.service.get_saved_flow(&saved.id).await.unwrap();
    assert_eq!(reloaded.execution_count, 1);
    assert!(reloaded.last_executed_at.is_some());

    let automation = fx.service.schedule_saved_flow(&saved.id, 30).await.unwrap();
    assert_eq!(automation.flow.id, flow.id);
    assert_eq!(automation.cadence_minutes, 30);

    fx.service.remove_saved_flow(&saved.id).await.unwrap();
    let err = fx.service.get_saved_flow(&saved.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

// ═══════════════════════════════════════════════════════════════════════
//  Reporting
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stats_and_integrations_reflect_state() {
    let fx = fixture().await;
    let automation = dollar_automation(&fx, 5).await;
    fx.service.stop_automation(&automation.id).await.unwrap();
    dollar_automation(&fx, 5).await;
    assert!(fx.service.generate_flow("   ").await.is_err());

    let stats = fx.service.stats().await.unwrap();
    assert_eq!(stats.learning.total, 3);
    assert_eq!(stats.learning.errored, 1);
    let rate = stats.success_rate.unwrap();
    assert!((rate - 2.0 / 3.0).abs() < 1e-9, "{rate}");
    assert_eq!(stats.learning.success_rate, stats.success_rate);
    assert_eq!(stats.automations, 2);
    assert_eq!(stats.enabled_automations, 1);
    assert_eq!(stats.saved_flows, 0);

    let integrations = fx.service.list_integrations();
    assert_eq!(integrations.len(), 4);
    let configured: BTreeSet<_> = integrations
        .iter()
        .filter(|s| s.configured)
        .map(|s| s.name)
        .collect();
    assert_eq!(configured, BTreeSet::from(["quote", "telegram"]));
}
