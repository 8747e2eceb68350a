use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use steward_agent::llm::{ChatModel, LlmClient, ModelRequest, ModelResponse, ToolCall};
use steward_agent::retrieval::KeywordRelevanceIndex;
use steward_agent::suspension::ActionExecutor;
use steward_agent::tools::{Tool, ToolRegistry};
use steward_agent::{AgentRuntime, Collaborators, TurnOutcome};
use steward_core::audit::InMemoryAuditSink;
use steward_core::config::AppConfig;
use steward_core::domain::message::{Message, MessageRole, SessionId, UserId};
use steward_core::domain::suspension::{
    DecisionKind, DecisionSubmission, SensitiveAction, SuspensionState,
};
use steward_core::errors::ApplicationError;
use steward_db::repositories::{InMemorySuspensionRepository, InMemoryTurnStore, TurnStore};

const SUMMARY_TEXT: &str = "用户询问了多个订单的物流状态，均已发货";

struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelResponse>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<ModelResponse>>) -> Self {
        Self { replies: Mutex::new(replies.into()), requests: Mutex::new(Vec::new()) }
    }

    fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        self.requests.lock().expect("requests").push(request.clone());
        self.replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("script exhausted")))
    }
}

struct FixedSummarizer;

#[async_trait]
impl LlmClient for FixedSummarizer {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(SUMMARY_TEXT.to_string())
    }
}

#[derive(Default)]
struct CountingExecutor {
    calls: AtomicUsize,
    sent: Mutex<Vec<SensitiveAction>>,
}

#[async_trait]
impl ActionExecutor for CountingExecutor {
    async fn execute(&self, action: &SensitiveAction) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().expect("sent").push(action.clone());
        Ok("Email sent successfully".to_string())
    }
}

struct OrderStatus;

#[async_trait]
impl Tool for OrderStatus {
    fn name(&self) -> &'static str {
        "query_order_status"
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        Ok(serde_json::json!({ "order_no": input["order_no"], "status": "shipped" }))
    }
}

struct Harness {
    runtime: AgentRuntime,
    store: Arc<InMemoryTurnStore>,
    model: Arc<ScriptedModel>,
    executor: Arc<CountingExecutor>,
}

fn harness(
    store: Arc<InMemoryTurnStore>,
    suspensions: Arc<InMemorySuspensionRepository>,
    replies: Vec<Result<ModelResponse>>,
) -> Harness {
    let model = Arc::new(ScriptedModel::new(replies));
    let executor = Arc::new(CountingExecutor::default());
    let mut tools = ToolRegistry::default();
    tools.register(OrderStatus);

    let runtime = AgentRuntime::new(
        &AppConfig::default(),
        store.clone(),
        suspensions,
        Collaborators {
            model: model.clone(),
            summarizer: Arc::new(FixedSummarizer),
            index: Arc::new(KeywordRelevanceIndex::default()),
            executor: executor.clone(),
            tools,
            audit: Arc::new(InMemoryAuditSink::default()),
            estimator: None,
        },
    )
    .expect("runtime");

    Harness { runtime, store, model, executor }
}

fn fresh(replies: Vec<Result<ModelResponse>>) -> Harness {
    harness(
        Arc::new(InMemoryTurnStore::default()),
        Arc::new(InMemorySuspensionRepository::default()),
        replies,
    )
}

fn reply(turn: usize) -> Result<ModelResponse> {
    Ok(ModelResponse::text(format!("第{turn}轮：您的订单已于昨天发货，预计三天内送达，请留意快递通知。")))
}

fn email_call() -> Result<ModelResponse> {
    Ok(ModelResponse::default().with_tool_call(ToolCall {
        id: "call-email-1".to_string(),
        name: "send_email_notification".to_string(),
        arguments: serde_json::json!({
            "to_email": "buyer@example.com",
            "subject": "发货延迟通知",
            "content": "您的订单 ORD1 将延迟一天发货。",
            "email_type": "SHIPPING_DELAY",
            "related_order_id": 1
        }),
    }))
}

fn user() -> UserId {
    UserId("u-1".to_string())
}

fn session() -> SessionId {
    SessionId("s-1".to_string())
}

fn submission(decision: &str, suspension_id: &str, reason: Option<&str>) -> DecisionSubmission {
    DecisionSubmission {
        session_id: session().0,
        suspension_id: Some(suspension_id.to_string()),
        decision: decision.to_string(),
        reason: reason.map(str::to_string),
        ..DecisionSubmission::default()
    }
}

async fn wait_for_summary(store: &InMemoryTurnStore) {
    for _ in 0..100 {
        if !store.summaries(&session()).await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("summary was never persisted");
}

#[tokio::test]
async fn first_turn_seeds_recent_history_without_summary() {
    let store = Arc::new(InMemoryTurnStore::default());
    let mut persisted = Vec::new();
    for index in 1..=6 {
        let message = if index % 2 == 1 {
            Message::user(format!("历史问题 {index}"))
        } else {
            Message::assistant(format!("历史回答 {index}"))
        };
        store.append_message(&session(), &user(), &message).await.expect("seed");
        persisted.push(message);
    }
    let harness =
        harness(store, Arc::new(InMemorySuspensionRepository::default()), vec![reply(1)]);

    let outcome =
        harness.runtime.handle_turn(&user(), &session(), "订单 ORD1 的状态").await.expect("turn");

    assert!(matches!(outcome, TurnOutcome::Reply { .. }));
    let requests = harness.model.requests();
    assert_eq!(requests.len(), 1);
    let sent = &requests[0].messages;
    assert_eq!(sent.len(), 5);
    assert_eq!(&sent[..4], &persisted[2..]);
    assert_eq!(sent[4].content, "订单 ORD1 的状态");
    assert!(sent.iter().all(|message| message.role != MessageRole::Summary));

    let stored = harness.store.messages(&session()).await;
    assert_eq!(stored.len(), 8);
    assert_eq!(stored[6].content, "订单 ORD1 的状态");
    assert_eq!(stored[7].role, MessageRole::Assistant);
}

#[tokio::test]
async fn eleventh_message_compacts_and_recovery_rebuilds_from_summary() {
    let store = Arc::new(InMemoryTurnStore::default());
    let suspensions = Arc::new(InMemorySuspensionRepository::default());
    let pipeline = harness(store.clone(), suspensions.clone(), (1..=6).map(reply).collect());

    for turn in 1..=6 {
        pipeline
            .runtime
            .handle_turn(&user(), &session(), &format!("问题{turn}：订单 ORD{turn} 的物流状态"))
            .await
            .expect("turn");
    }
    wait_for_summary(&store).await;

    let requests = pipeline.model.requests();
    let compacted = &requests[5].messages;
    assert_eq!(compacted.len(), 5, "summary plus the kept window of four");
    assert_eq!(compacted[0].role, MessageRole::Summary);
    assert!(compacted[0].content.contains(SUMMARY_TEXT));

    let stored = store.messages(&session()).await;
    assert_eq!(stored.len(), 12);
    let summary = store.latest_summary(&session()).await.expect("latest").expect("summary");
    assert_eq!(summary.range_start, stored[0].id);
    assert_eq!(summary.range_end, stored[6].id);
    assert_eq!(&compacted[1..], &stored[7..11]);

    // A new process has no live handle and must rebuild from the store.
    let restarted = harness(store.clone(), suspensions, vec![reply(7)]);
    restarted.runtime.handle_turn(&user(), &session(), "还有别的订单吗").await.expect("turn");

    let rebuilt = &restarted.model.requests()[0].messages;
    assert_eq!(rebuilt[0].id.0, summary.id.0);
    assert_eq!(rebuilt[0].role, MessageRole::Summary);
    assert_eq!(&rebuilt[1..6], &stored[7..12]);
    assert_eq!(rebuilt.len(), 7);
}

#[tokio::test]
async fn rejected_email_is_cancelled_without_executing() {
    let harness = fresh(vec![email_call()]);

    let outcome = harness
        .runtime
        .handle_turn(&user(), &session(), "请给客户发一封延迟发货的邮件")
        .await
        .expect("turn");
    let TurnOutcome::AwaitingDecision(request) = outcome else {
        panic!("expected a decision request");
    };
    let kinds: Vec<DecisionKind> =
        request.available_actions.iter().map(|option| option.action).collect();
    assert_eq!(kinds, vec![DecisionKind::Approve, DecisionKind::Reject, DecisionKind::Edit]);

    let blocked = harness
        .runtime
        .handle_turn(&user(), &session(), "还在吗")
        .await
        .expect_err("session awaits a decision");
    assert!(matches!(blocked, ApplicationError::SessionAwaitingDecision { .. }));

    let resumed = harness
        .runtime
        .resume(&user(), submission("reject", &request.suspension_id.0, Some("x")))
        .await
        .expect("resume");

    assert_eq!(resumed.state, SuspensionState::Cancelled);
    assert_eq!(resumed.message, "Email cancelled. Reason: x");
    assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 0);

    let stored = harness.store.messages(&session()).await;
    let tool_result = &stored[stored.len() - 2];
    assert!(tool_result.is_tool_result());
    assert_eq!(
        tool_result.payload.as_ref().and_then(|payload| payload.get("tool_call_id")),
        Some(&serde_json::json!("call-email-1"))
    );
}

#[tokio::test]
async fn duplicate_approval_executes_once_and_is_a_protocol_error() {
    let harness = fresh(vec![email_call(), reply(2)]);

    let TurnOutcome::AwaitingDecision(request) = harness
        .runtime
        .handle_turn(&user(), &session(), "请给客户发一封延迟发货的邮件")
        .await
        .expect("turn")
    else {
        panic!("expected a decision request");
    };

    let first = harness
        .runtime
        .resume(&user(), submission("approve", &request.suspension_id.0, None))
        .await
        .expect("first decision");
    assert_eq!(first.state, SuspensionState::Sent);

    let second = harness
        .runtime
        .resume(&user(), submission("approve", &request.suspension_id.0, None))
        .await
        .expect_err("second decision");
    assert!(matches!(second, ApplicationError::InvalidResumeTarget { .. }));
    assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 1);

    harness
        .runtime
        .handle_turn(&user(), &session(), "邮件发出去了吗")
        .await
        .expect("session accepts turns again");
}

#[tokio::test]
async fn approve_ignores_edited_fields() {
    let harness = fresh(vec![email_call()]);
    let TurnOutcome::AwaitingDecision(request) = harness
        .runtime
        .handle_turn(&user(), &session(), "请给客户发一封延迟发货的邮件")
        .await
        .expect("turn")
    else {
        panic!("expected a decision request");
    };

    let resumed = harness
        .runtime
        .resume(
            &user(),
            DecisionSubmission {
                edited_recipient: Some("someone-else@example.com".to_string()),
                edited_body: Some("改过的正文".to_string()),
                ..submission("approve", &request.suspension_id.0, None)
            },
        )
        .await
        .expect("resume");

    assert_eq!(resumed.state, SuspensionState::Sent);
    let sent = harness.executor.sent.lock().expect("sent");
    assert_eq!(sent.len(), 1);
    let SensitiveAction::SendEmail(email) = &sent[0];
    assert_eq!(email.to, "buyer@example.com");
    assert_eq!(email.body, "您的订单 ORD1 将延迟一天发货。");
}

#[tokio::test]
async fn another_user_cannot_resolve_the_suspension() {
    let harness = fresh(vec![email_call()]);
    let TurnOutcome::AwaitingDecision(request) = harness
        .runtime
        .handle_turn(&user(), &session(), "请给客户发一封延迟发货的邮件")
        .await
        .expect("turn")
    else {
        panic!("expected a decision request");
    };

    let error = harness
        .runtime
        .resume(
            &UserId("u-2".to_string()),
            submission("approve", &request.suspension_id.0, None),
        )
        .await
        .expect_err("foreign user");

    assert!(matches!(error, ApplicationError::InvalidResumeTarget { .. }));
    assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 0);
    let blocked = harness
        .runtime
        .handle_turn(&user(), &session(), "还在吗")
        .await
        .expect_err("still awaiting the owner");
    assert!(matches!(blocked, ApplicationError::SessionAwaitingDecision { .. }));
}

#[tokio::test]
async fn unknown_decision_resolves_as_reject() {
    let harness = fresh(vec![email_call()]);
    let TurnOutcome::AwaitingDecision(request) = harness
        .runtime
        .handle_turn(&user(), &session(), "请给客户发一封延迟发货的邮件")
        .await
        .expect("turn")
    else {
        panic!("expected a decision request");
    };

    let resumed = harness
        .runtime
        .resume(&user(), submission("later", &request.suspension_id.0, None))
        .await
        .expect("resume");
    assert_eq!(resumed.state, SuspensionState::Cancelled);
    assert!(resumed.message.contains("cancelled by user"));
    assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_first_turns_share_one_handle() {
    let harness = fresh(vec![reply(1), reply(2)]);

    let (user, session) = (user(), session());

    let (first, second) = tokio::join!(
        harness.runtime.handle_turn(&user, &session, "订单 ORD1 的状态"),
        harness.runtime.handle_turn(&user, &session, "订单 ORD2 的状态"),
    );

    first.expect("first turn");
    second.expect("second turn");
    assert_eq!(harness.runtime.registry().constructed(), 1);
    assert_eq!(harness.runtime.registry().len(), 1);
    assert_eq!(harness.store.messages(&session).await.len(), 4);
}

#[tokio::test]
async fn too_short_reply_is_retried_before_release() {
    let harness = fresh(vec![Ok(ModelResponse::text("好的")), reply(1)]);

    let outcome =
        harness.runtime.handle_turn(&user(), &session(), "订单 ORD1 的状态").await.expect("turn");

    let TurnOutcome::Reply { text, .. } = outcome else {
        panic!("expected a reply");
    };
    assert!(text.starts_with("第1轮"));
    let requests = harness.model.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].system_prompt.contains("empty_response"));
}

#[tokio::test]
async fn tool_results_are_fed_back_to_the_model() {
    let lookup = ModelResponse::default().with_tool_call(ToolCall {
        id: "call-lookup".to_string(),
        name: "query_order_status".to_string(),
        arguments: serde_json::json!({ "order_no": "ORD1" }),
    });
    let harness = fresh(vec![Ok(lookup), reply(1)]);

    harness.runtime.handle_turn(&user(), &session(), "订单 ORD1 的状态").await.expect("turn");

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].messages.last().expect("tool result");
    assert!(last.is_tool_result());
    assert!(last.content.contains("shipped"));
    assert_eq!(harness.store.messages(&session()).await.len(), 4);
}

#[tokio::test]
async fn model_failure_persists_nothing() {
    let harness = fresh(vec![Err(anyhow!("upstream unavailable"))]);

    let error = harness
        .runtime
        .handle_turn(&user(), &session(), "订单 ORD1 的状态")
        .await
        .expect_err("model failure is fatal");

    assert!(matches!(error, ApplicationError::Model(_)));
    assert!(harness.store.messages(&session()).await.is_empty());
}

#[tokio::test]
async fn transient_model_failure_is_retried_within_budget() {
    let harness = fresh(vec![Err(anyhow!("connection reset")), reply(1)]);

    harness.runtime.handle_turn(&user(), &session(), "订单 ORD1 的状态").await.expect("turn");

    assert_eq!(harness.model.requests().len(), 2);
    assert_eq!(harness.store.messages(&session()).await.len(), 2);
}
