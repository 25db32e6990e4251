//! End-to-end runtime scenarios over a scripted agent transport.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use tandem_core::api::{FallbackResponse, ToolResultPayload};
use tandem_core::app::runtime::{RuntimeEvent, RuntimeService};
use tandem_core::config::RuntimeConfig;
use tandem_core::session::state::{MessageRole, TraceKind};
use tandem_core::session::MemoryPressure;
use tandem_core::test_utils::{ScriptedAgent, ScriptedTurn};

fn test_config(dir: &TempDir) -> RuntimeConfig {
    RuntimeConfig {
        data_file: Some(dir.path().join("sessions.json")),
        flush_interval: Duration::from_millis(25),
        save_debounce: Duration::from_millis(50),
        evict_scan_interval: Duration::from_secs(3600),
        idle_threshold: Duration::ZERO,
        ..RuntimeConfig::default()
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        loop {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_hello_round_trip() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent
        .push_turn(ScriptedTurn::events(&[
            r#"{"type":"think","content":"mulling it over"}"#,
            r#"{"type":"finalAnswer","content":"hi there"}"#,
        ]))
        .await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let id = handle.send_message("hello", None, Vec::new()).await.unwrap();

    wait_until(|| async {
        handle.session_messages(id).await.unwrap().len() == 2
    })
    .await;

    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "hi there");
    assert_eq!(messages[1].trace.len(), 1);
    assert_eq!(messages[1].trace[0].kind, TraceKind::Thought);

    // No residual pending trace once the turn is merged.
    assert!(handle.thinking_steps(id).await.unwrap().is_empty());
    assert!(handle.streaming_sessions().await.unwrap().is_empty());

    let sessions = handle.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].title, "hello");

    service.shutdown().await;
}

#[tokio::test]
async fn test_second_send_cancels_first_stream() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_turn(ScriptedTurn::held_open()).await;
    agent.push_turn(ScriptedTurn::held_open()).await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let id = handle.send_message("first", None, Vec::new()).await.unwrap();
    wait_until(|| async { agent.streams_opened() == 1 }).await;

    handle
        .send_message("second", Some(id), Vec::new())
        .await
        .unwrap();
    wait_until(|| async { agent.streams_opened() == 2 }).await;

    // Exactly one live stream for the session id.
    let streaming = handle.streaming_sessions().await.unwrap();
    assert_eq!(streaming, vec![id]);

    assert!(handle.cancel_agent(Some(id)).await.unwrap());
    wait_until(|| async {
        handle.streaming_sessions().await.unwrap().is_empty()
    })
    .await;

    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages.last().unwrap().role, MessageRole::Stopped);

    service.shutdown().await;
}

#[tokio::test]
async fn test_flush_batches_events_into_one_update() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent
        .push_turn(
            ScriptedTurn::events(&[
                r#"{"type":"think","content":"one"}"#,
                r#"{"type":"think","content":"two"}"#,
                r#"{"type":"toolCall","content":"looking up","tool":"search"}"#,
            ])
            .keep_open(),
        )
        .await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();
    let mut events = handle.subscribe();

    let id = handle.send_message("go", None, Vec::new()).await.unwrap();

    // All three events land within one flush window, so the first thinking
    // update carries all of them.
    let entries = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(RuntimeEvent::ThinkingUpdated { session_id, entries }) = events.recv().await
                && session_id == id
            {
                return entries;
            }
        }
    })
    .await
    .expect("no thinking update");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].kind, TraceKind::ToolCall);

    assert_eq!(handle.thinking_steps(id).await.unwrap().len(), 3);

    handle.cancel_agent(Some(id)).await.unwrap();
    service.shutdown().await;
}

#[tokio::test]
async fn test_switch_round_trip_preserves_messages() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_turn(ScriptedTurn::final_answer("hi there")).await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let a = handle.send_message("hello", None, Vec::new()).await.unwrap();
    wait_until(|| async { handle.session_messages(a).await.unwrap().len() == 2 }).await;

    let b = handle.new_session().await.unwrap();
    assert_eq!(handle.current_session().await.unwrap(), b);

    handle.switch_to_session(a).await.unwrap();
    assert_eq!(handle.current_session().await.unwrap(), a);

    let messages = handle.session_messages(a).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].content, "hi there");

    service.shutdown().await;
}

#[tokio::test]
async fn test_background_completion_raises_notification() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent
        .push_turn(
            ScriptedTurn::final_answer("done in the back").delayed(Duration::from_millis(100)),
        )
        .await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();
    let mut events = handle.subscribe();

    let a = handle
        .send_message("long running job", None, Vec::new())
        .await
        .unwrap();
    let b = handle.new_session().await.unwrap();
    assert_eq!(handle.current_session().await.unwrap(), b);

    let completed = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(RuntimeEvent::TaskCompleted { session_id, title }) = events.recv().await {
                return (session_id, title);
            }
        }
    })
    .await
    .expect("no completion notification");
    assert_eq!(completed.0, a);
    assert_eq!(completed.1, "long running job");

    let sessions = handle.list_sessions().await.unwrap();
    let summary = sessions.iter().find(|s| s.id == a).unwrap();
    assert!(summary.unread);

    // Switching to the session marks it read.
    handle.switch_to_session(a).await.unwrap();
    let sessions = handle.list_sessions().await.unwrap();
    assert!(!sessions.iter().find(|s| s.id == a).unwrap().unread);

    service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_preserves_prompt_for_resume() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_turn(ScriptedTurn::held_open()).await;
    agent
        .push_turn(ScriptedTurn::final_answer("resumed answer"))
        .await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let id = handle
        .send_message("do the thing", None, Vec::new())
        .await
        .unwrap();
    wait_until(|| async { agent.streams_opened() == 1 }).await;

    assert!(handle.cancel_agent(None).await.unwrap());
    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Stopped);

    // The prompt survived the stop; resume re-sends it without a new user
    // message.
    assert!(handle.resume(None).await.unwrap());
    wait_until(|| async { handle.session_messages(id).await.unwrap().len() == 3 }).await;

    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages[2].role, MessageRole::Assistant);
    assert_eq!(messages[2].content, "resumed answer");

    let requests = agent.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].message, "do the thing");

    service.shutdown().await;
}

#[tokio::test]
async fn test_delete_cancels_stream_and_replaces_current() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_turn(ScriptedTurn::held_open()).await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let doomed = handle
        .send_message("about to go", None, Vec::new())
        .await
        .unwrap();
    wait_until(|| async { agent.streams_opened() == 1 }).await;

    handle.delete_session(doomed).await.unwrap();

    let current = handle.current_session().await.unwrap();
    assert_ne!(current, doomed);
    assert!(handle.streaming_sessions().await.unwrap().is_empty());

    let sessions = handle.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, current);
    assert!(handle.session_messages(doomed).await.unwrap().is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_streaming_session_survives_memory_pressure() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_turn(ScriptedTurn::final_answer("saved")).await;
    agent
        .push_turn(
            ScriptedTurn::events(&[r#"{"type":"think","content":"still at it"}"#]).keep_open(),
        )
        .await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    // A dormant session with content, and a streaming one.
    let dormant = handle
        .send_message("remember this", None, Vec::new())
        .await
        .unwrap();
    wait_until(|| async { handle.session_messages(dormant).await.unwrap().len() == 2 }).await;

    let streaming = handle.new_session().await.unwrap();
    handle
        .send_message("keep going", Some(streaming), Vec::new())
        .await
        .unwrap();
    wait_until(|| async { !handle.thinking_steps(streaming).await.unwrap().is_empty() }).await;

    // Make a third session current so both others are background.
    let visible = handle.new_session().await.unwrap();
    assert_eq!(handle.current_session().await.unwrap(), visible);

    handle.memory_pressure(MemoryPressure::Critical).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The streaming session kept its trace buffer; it was not evicted.
    assert!(!handle.thinking_steps(streaming).await.unwrap().is_empty());

    // The dormant session's buffer moved to the durable record; its content
    // is still fully readable.
    let messages = handle.session_messages(dormant).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "saved");

    handle.cancel_agent(Some(streaming)).await.unwrap();
    service.shutdown().await;
}

#[tokio::test]
async fn test_images_use_fallback_endpoint() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent
        .push_fallback(FallbackResponse {
            output: "two cats on a couch".to_string(),
            tool_results: vec![ToolResultPayload {
                tool: Some("vision".to_string()),
                content: "analyzed 1 image".to_string(),
                success: true,
            }],
        })
        .await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let id = handle
        .send_message(
            "what's in this picture?",
            None,
            vec!["data:image/png;base64,AAAA".to_string()],
        )
        .await
        .unwrap();

    wait_until(|| async { handle.session_messages(id).await.unwrap().len() == 2 }).await;

    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages[1].content, "two cats on a couch");
    assert_eq!(messages[1].trace.len(), 1);
    assert_eq!(messages[1].trace[0].kind, TraceKind::ToolResult);

    // No stream was opened; the fallback endpoint served the turn.
    assert_eq!(agent.streams_opened(), 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_transport_error_surfaces_inline_and_is_resumable() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_turn(ScriptedTurn::events(&[]).status(503)).await;
    agent
        .push_turn(ScriptedTurn::final_answer("second try worked"))
        .await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let id = handle
        .send_message("flaky request", None, Vec::new())
        .await
        .unwrap();
    wait_until(|| async { handle.session_messages(id).await.unwrap().len() == 2 }).await;

    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages[1].role, MessageRole::Error);
    assert!(messages[1].content.contains("503"));

    assert!(handle.resume(None).await.unwrap());
    wait_until(|| async { handle.session_messages(id).await.unwrap().len() == 3 }).await;
    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages[2].content, "second try worked");

    service.shutdown().await;
}

#[tokio::test]
async fn test_queued_follow_up_dispatches_after_completion() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent
        .push_turn(ScriptedTurn::final_answer("first answer").delayed(Duration::from_millis(100)))
        .await;
    agent
        .push_turn(ScriptedTurn::final_answer("second answer"))
        .await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let id = handle
        .send_message("first question", None, Vec::new())
        .await
        .unwrap();
    handle.queue_message(id, "follow-up question").await.unwrap();

    wait_until(|| async { handle.session_messages(id).await.unwrap().len() == 4 }).await;

    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages[0].content, "first question");
    assert_eq!(messages[1].content, "first answer");
    assert_eq!(messages[2].content, "follow-up question");
    assert_eq!(messages[2].role, MessageRole::User);
    assert_eq!(messages[3].content, "second answer");

    service.shutdown().await;
}

#[tokio::test]
async fn test_sessions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_turn(ScriptedTurn::final_answer("kept")).await;

    let config = test_config(&dir);
    let service = RuntimeService::spawn(config.clone(), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let id = handle
        .send_message("persist across restarts", None, Vec::new())
        .await
        .unwrap();
    wait_until(|| async { handle.session_messages(id).await.unwrap().len() == 2 }).await;
    service.shutdown().await;

    let service = RuntimeService::spawn(config, Arc::new(ScriptedAgent::new()))
        .await
        .unwrap();
    let handle = service.handle();

    assert_eq!(handle.current_session().await.unwrap(), id);
    let messages = handle.session_messages(id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "persist across restarts");
    assert_eq!(messages[1].content, "kept");

    service.shutdown().await;
}

#[tokio::test]
async fn test_conversation_history_rides_along() {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_turn(ScriptedTurn::final_answer("one")).await;
    agent.push_turn(ScriptedTurn::final_answer("two")).await;

    let service = RuntimeService::spawn(test_config(&dir), agent.clone())
        .await
        .unwrap();
    let handle = service.handle();

    let id = handle.send_message("alpha", None, Vec::new()).await.unwrap();
    wait_until(|| async { handle.session_messages(id).await.unwrap().len() == 2 }).await;
    handle.send_message("beta", Some(id), Vec::new()).await.unwrap();
    wait_until(|| async { handle.session_messages(id).await.unwrap().len() == 4 }).await;

    let requests = agent.requests().await;
    assert_eq!(requests.len(), 2);
    // First turn: fresh session, no history.
    assert!(requests[0].conversation_history.is_none());
    // Second turn: prior user/assistant exchange, without the new prompt.
    let history = requests[1].conversation_history.as_ref().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "alpha");
    assert_eq!(history[1].content, "one");

    service.shutdown().await;
}
