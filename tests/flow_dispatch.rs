//! End-to-end dispatch tests
//!
//! Drive the dispatcher with the in-memory provider and history store and
//! check what each sender receives.

use chatflow::config::EngineConfig;
use async_trait::async_trait;
use chatflow::database::{Database, DatabaseError, DatabaseResult, HistoryEntry, MemoryDatabase};
use chatflow::flows::{
    DispatchError, DispatchStatus, Dispatcher, FlowDefinition, FlowGraph, Step, StepFailureCause,
};
use chatflow::provider::{InboundEvent, MemoryProvider, OutboundContent};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Harness {
    dispatcher: Dispatcher,
    provider: Arc<MemoryProvider>,
    database: Arc<MemoryDatabase>,
}

fn harness(flows: Vec<FlowDefinition>) -> Harness {
    harness_with(flows, EngineConfig::default())
}

fn harness_with(flows: Vec<FlowDefinition>, config: EngineConfig) -> Harness {
    let graph = Arc::new(FlowGraph::compile(&flows).unwrap());
    let provider = Arc::new(MemoryProvider::new());
    let database = Arc::new(MemoryDatabase::new());
    let dispatcher = Dispatcher::new(graph, provider.clone(), database.clone(), config);
    Harness {
        dispatcher,
        provider,
        database,
    }
}

/// History store that rejects one answer text and keeps the rest.
struct FailingDatabase {
    reject: String,
    saved: parking_lot::Mutex<Vec<String>>,
}

impl FailingDatabase {
    fn rejecting(answer: &str) -> Self {
        Self {
            reject: answer.to_string(),
            saved: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Database for FailingDatabase {
    async fn save(&self, entry: HistoryEntry) -> DatabaseResult<()> {
        if entry.answer == self.reject {
            return Err(DatabaseError::Storage("disk full".to_string()));
        }
        self.saved.lock().push(entry.answer);
        Ok(())
    }

    async fn get_prev_by_number(&self, _from: &str) -> DatabaseResult<Option<HistoryEntry>> {
        Ok(None)
    }
}

fn msg(from: &str, body: &str) -> InboundEvent {
    InboundEvent::new(from, body)
}

#[tokio::test]
async fn test_hola_flow_answers_in_order() {
    let h = harness(vec![FlowDefinition::keyword("hola")
        .answer("Buenas!")
        .answer("Como vamos!")]);

    let outcome = h.dispatcher.dispatch(msg("000", "hola")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::Completed);
    assert_eq!(outcome.answers, 2);
    assert_eq!(h.provider.texts_to("000"), vec!["Buenas!", "Como vamos!"]);
    assert_eq!(h.database.answers_for("000"), vec!["Buenas!", "Como vamos!"]);
}

#[tokio::test]
async fn test_unknown_keyword_is_silent() {
    let h = harness(vec![FlowDefinition::keyword("hola")
        .answer("Buenas!")
        .answer("Como vamos!")]);

    let outcome = h.dispatcher.dispatch(msg("000", "pepe")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::NoMatch);
    assert_eq!(outcome.answers, 0);
    assert!(h.provider.is_empty());
    assert!(h.database.is_empty());
}

#[tokio::test]
async fn test_keyword_match_ignores_case_and_whitespace() {
    let h = harness(vec![FlowDefinition::keyword("hola").answer("Buenas!")]);

    h.dispatcher.dispatch(msg("000", "  HoLa \n")).await.unwrap();
    assert_eq!(h.provider.texts_to("000"), vec!["Buenas!"]);
}

#[tokio::test]
async fn test_one_sender_keeps_arrival_order() {
    let h = harness(vec![FlowDefinition::fallback("echo").answer("{{body}}")]);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            h.dispatcher
                .on_inbound_message(msg("000", &i.to_string()))
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.sender(), "000");
        handle.wait().await.unwrap();
    }

    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(h.provider.texts_to("000"), expected);
}

#[tokio::test]
async fn test_senders_are_handled_in_parallel() {
    let h = harness(vec![FlowDefinition::keyword("slow").answer_with_delay("done", 200)]);

    let start = Instant::now();
    let handles: Vec<_> = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|from| h.dispatcher.on_inbound_message(msg(from, "slow")).unwrap())
        .collect();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    // Five sequential runs would take a full second.
    assert!(start.elapsed() < Duration::from_millis(700));
    assert_eq!(h.provider.len(), 5);
}

#[tokio::test]
async fn test_capture_takes_next_message_without_matching() {
    let h = harness(vec![
        FlowDefinition::keyword("hola")
            .answer("What is your name?")
            .capture("name")
            .answer("Hi {{name}}"),
        FlowDefinition::keyword("menu").answer("Menu"),
    ]);

    let outcome = h.dispatcher.dispatch(msg("000", "hola")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::AwaitingInput);

    let snapshot = h.dispatcher.conversation("000").await.unwrap();
    assert_eq!(snapshot.pending_capture, Some(1));

    // "menu" is a keyword, but the pending capture owns this message.
    let outcome = h.dispatcher.dispatch(msg("000", "menu")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::Completed);
    assert_eq!(
        h.provider.texts_to("000"),
        vec!["What is your name?", "Hi menu"]
    );

    let snapshot = h.dispatcher.conversation("000").await.unwrap();
    assert_eq!(snapshot.current, None);
    assert!(snapshot.variables.is_empty());
}

#[tokio::test]
async fn test_captures_are_per_sender() {
    let h = harness(vec![FlowDefinition::keyword("hola")
        .capture("name")
        .answer("Hi {{name}}")]);

    h.dispatcher.dispatch(msg("000", "hola")).await.unwrap();
    h.dispatcher.dispatch(msg("111", "hola")).await.unwrap();
    h.dispatcher.dispatch(msg("111", "Bea")).await.unwrap();
    h.dispatcher.dispatch(msg("000", "Ana")).await.unwrap();

    assert_eq!(h.provider.texts_to("000"), vec!["Hi Ana"]);
    assert_eq!(h.provider.texts_to("111"), vec!["Hi Bea"]);
}

#[tokio::test]
async fn test_jump_chain_limit_resets_conversation() {
    let h = harness_with(
        vec![
            FlowDefinition::keyword("a").answer("a").jump("b"),
            FlowDefinition::new("b").answer("b").jump("c"),
            FlowDefinition::new("c").answer("c").jump("d"),
            FlowDefinition::new("d").answer("d"),
        ],
        EngineConfig::default().with_max_jump_chain(2),
    );

    let err = h.dispatcher.dispatch(msg("000", "a")).await.unwrap_err();
    match err {
        DispatchError::FlowLoop { sender, flow, limit } => {
            assert_eq!(sender, "000");
            assert_eq!(flow, "c");
            assert_eq!(limit, 2);
        }
        other => panic!("Expected FlowLoop, got {:?}", other),
    }
    assert_eq!(h.provider.texts_to("000"), vec!["a", "b", "c"]);

    let snapshot = h.dispatcher.conversation("000").await.unwrap();
    assert_eq!(snapshot.current, None);
    assert_eq!(snapshot.pending_capture, None);
}

#[tokio::test]
async fn test_jump_chain_within_limit() {
    let h = harness(vec![
        FlowDefinition::keyword("a").answer("a").jump("b"),
        FlowDefinition::new("b").answer("b").jump("c"),
        FlowDefinition::new("c").answer("c"),
    ]);

    let outcome = h.dispatcher.dispatch(msg("000", "a")).await.unwrap();
    assert_eq!(outcome.answers, 3);
    // History keeps the keyword that entered the chain.
    let history = h.database.list_history();
    assert!(history.iter().all(|e| e.keyword == "a"));
    assert_eq!(history[2].reference, "c#0");
}

#[tokio::test]
async fn test_idle_timeout_resets_pending_capture() {
    let h = harness_with(
        vec![FlowDefinition::keyword("hola")
            .answer("Name?")
            .capture("name")
            .answer("Hi {{name}}")],
        EngineConfig::default().with_idle_timeout_ms(100),
    );

    h.dispatcher.dispatch(msg("000", "hola")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = h.dispatcher.conversation("000").await.unwrap();
    assert_eq!(snapshot.current, None);
    assert_eq!(snapshot.pending_capture, None);
    // The reset itself sends and records nothing.
    assert_eq!(h.database.len(), 1);

    // The next "hola" starts over instead of being captured.
    h.dispatcher.dispatch(msg("000", "hola")).await.unwrap();
    assert_eq!(h.provider.texts_to("000"), vec!["Name?", "Name?"]);
}

#[tokio::test]
async fn test_idle_timer_restarts_on_each_capture() {
    let h = harness_with(
        vec![FlowDefinition::keyword("form")
            .capture("first")
            .capture("second")
            .answer("{{first}} {{second}}")],
        EngineConfig::default().with_idle_timeout_ms(400),
    );

    h.dispatcher.dispatch(msg("000", "form")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.dispatcher.dispatch(msg("000", "one")).await.unwrap();

    // Past the first timer's deadline; the second capture is still pending.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = h.dispatcher.conversation("000").await.unwrap();
    assert_eq!(snapshot.pending_capture, Some(1));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let snapshot = h.dispatcher.conversation("000").await.unwrap();
    assert_eq!(snapshot.pending_capture, None);
    assert!(h.provider.is_empty());
}

#[tokio::test]
async fn test_duplicate_keyword_last_write_wins() {
    let h = harness(vec![
        FlowDefinition::keyword("hola").with_id("first").answer("one"),
        FlowDefinition::keyword("hola").with_id("second").answer("two"),
    ]);
    assert_eq!(h.dispatcher.graph().warnings().len(), 1);

    h.dispatcher.dispatch(msg("000", "hola")).await.unwrap();
    assert_eq!(h.provider.texts_to("000"), vec!["two"]);
}

#[tokio::test]
async fn test_fallback_flow() {
    let h = harness(vec![
        FlowDefinition::keyword("hola").answer("Buenas!"),
        FlowDefinition::fallback("help").answer("Say 'hola', not '{{body}}'"),
    ]);

    let outcome = h.dispatcher.dispatch(msg("000", "pepe")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::Completed);
    assert_eq!(h.provider.texts_to("000"), vec!["Say 'hola', not 'pepe'"]);
}

#[tokio::test]
async fn test_provider_failure_is_isolated() {
    let h = harness(vec![FlowDefinition::keyword("hola")
        .answer("one")
        .answer("two")
        .answer("three")]);
    h.provider.fail_on("two");

    let err = h.dispatcher.dispatch(msg("000", "hola")).await.unwrap_err();
    match err {
        DispatchError::StepFailures(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].flow, "hola");
            assert_eq!(failures[0].step, 1);
        }
        other => panic!("Expected StepFailures, got {:?}", other),
    }

    // Later steps still ran; only delivered answers are in history.
    assert_eq!(h.provider.texts_to("000"), vec!["one", "three"]);
    assert_eq!(h.database.answers_for("000"), vec!["one", "three"]);

    let snapshot = h.dispatcher.conversation("000").await.unwrap();
    assert_eq!(snapshot.current, None);

    // Other senders are unaffected.
    let outcome = h.dispatcher.dispatch(msg("111", "pepe")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::NoMatch);
}

#[tokio::test]
async fn test_history_failure_is_isolated() {
    let graph = Arc::new(
        FlowGraph::compile(&[FlowDefinition::keyword("hola")
            .answer("one")
            .answer("two")
            .answer("three")])
        .unwrap(),
    );
    let provider = Arc::new(MemoryProvider::new());
    let database = Arc::new(FailingDatabase::rejecting("two"));
    let dispatcher = Dispatcher::new(
        graph,
        provider.clone(),
        database.clone(),
        EngineConfig::default(),
    );

    let err = dispatcher.dispatch(msg("000", "hola")).await.unwrap_err();
    match err {
        DispatchError::StepFailures(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].flow, "hola");
            assert_eq!(failures[0].step, 1);
            assert!(matches!(
                failures[0].cause,
                StepFailureCause::Save(DatabaseError::Storage(_))
            ));
        }
        other => panic!("Expected StepFailures, got {:?}", other),
    }

    // The answer was delivered even though recording it failed.
    assert_eq!(provider.texts_to("000"), vec!["one", "two", "three"]);
    assert_eq!(*database.saved.lock(), vec!["one", "three"]);
}

#[tokio::test]
async fn test_queue_overflow_drops_event() {
    let h = harness_with(
        vec![FlowDefinition::fallback("slow").answer_with_delay("{{body}}", 300)],
        EngineConfig::default().with_max_queue_depth(1),
    );

    let first = h.dispatcher.on_inbound_message(msg("000", "1")).unwrap();
    // Let the worker pick up the first event and sit in its delay.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = h.dispatcher.on_inbound_message(msg("000", "2")).unwrap();
    let err = h.dispatcher.on_inbound_message(msg("000", "3")).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::QueueOverflow { ref sender, depth: 1 } if sender == "000"
    ));

    // Another sender has its own queue.
    let other = h.dispatcher.on_inbound_message(msg("111", "x")).unwrap();

    first.wait().await.unwrap();
    second.wait().await.unwrap();
    other.wait().await.unwrap();
    assert_eq!(h.provider.texts_to("000"), vec!["1", "2"]);
}

#[tokio::test]
async fn test_nested_flow_jump_and_successor() {
    let h = harness(vec![
        FlowDefinition::keyword("menu")
            .answer("Menu")
            .jump("details")
            .child(FlowDefinition::new("details").answer("Details").then("bye")),
        FlowDefinition::new("bye").answer("Bye"),
    ]);

    let outcome = h.dispatcher.dispatch(msg("000", "menu")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::Completed);
    assert_eq!(h.provider.texts_to("000"), vec!["Menu", "Details", "Bye"]);

    // Nested flows are not entry points.
    let outcome = h.dispatcher.dispatch(msg("000", "details")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::NoMatch);
}

#[tokio::test]
async fn test_jump_targets_flow_id_not_child_keyword() {
    let h = harness(vec![
        FlowDefinition::keyword("menu")
            .answer("Menu")
            .jump("bye")
            .child(
                FlowDefinition::new("prices")
                    .with_keywords(vec!["bye"])
                    .answer("Prices"),
            ),
        FlowDefinition::new("bye").answer("Bye"),
    ]);

    h.dispatcher.dispatch(msg("000", "menu")).await.unwrap();
    assert_eq!(h.provider.texts_to("000"), vec!["Menu", "Bye"]);
}

#[tokio::test]
async fn test_end_step_stops_flow() {
    let h = harness(vec![FlowDefinition::keyword("hola")
        .answer("Buenas!")
        .end()
        .answer("never sent")]);

    let outcome = h.dispatcher.dispatch(msg("000", "hola")).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::Completed);
    assert_eq!(h.provider.texts_to("000"), vec!["Buenas!"]);
}

#[tokio::test]
async fn test_media_answer_and_options() {
    let mut options = Map::new();
    options.insert("buttons".to_string(), json!(["yes", "no"]));
    let h = harness(vec![FlowDefinition::keyword("cat").step(Step::Answer {
        text: "A cat".to_string(),
        delay_ms: None,
        media: Some("https://example.com/cat.png".to_string()),
        options: options.clone(),
    })]);

    h.dispatcher.dispatch(msg("000", "cat")).await.unwrap();

    let sent = h.provider.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].content,
        OutboundContent::Media {
            caption: Some("A cat".to_string()),
            media_ref: "https://example.com/cat.png".to_string(),
        }
    );
    assert_eq!(sent[0].options, options);
    assert_eq!(h.database.list_history()[0].options, options);
}

#[tokio::test]
async fn test_default_delay_between_answers() {
    let h = harness_with(
        vec![FlowDefinition::keyword("hola").answer("one").answer("two")],
        EngineConfig::default().with_default_delay_ms(100),
    );

    let start = Instant::now();
    h.dispatcher.dispatch(msg("000", "hola")).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
}
