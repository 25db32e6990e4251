use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::lines::parse_status_line;
use crate::api::{AgentApi, ApiError, LineStream, TurnRequest};
use crate::app::accumulator::{PendingFlush, TurnAccumulator, TurnOutcome};
use crate::session::state::{SessionId, TraceEntry};

/// Lines carrying one JSON event payload start with this prefix.
pub const DATA_PREFIX: &str = "data:";
/// Explicit event terminator; a blank line serves the same purpose.
pub const EVENT_TERMINATOR: &str = "[DONE]";

const ERROR_BODY_MAX_LINES: usize = 64;

/// Hand-off from a stream task back to the runtime actor. Stream tasks never
/// mutate shared state; every result travels through this channel.
#[derive(Debug)]
pub(crate) enum StreamUpdate {
    Partial {
        session_id: SessionId,
        turn: u64,
        flush: PendingFlush,
    },
    Finished {
        session_id: SessionId,
        turn: u64,
        outcome: TurnOutcome,
        cancelled: bool,
    },
    Failed {
        session_id: SessionId,
        turn: u64,
        error: ApiError,
    },
}

/// Drive one agent turn to completion and report back to the runtime.
pub(crate) async fn run_turn(
    api: Arc<dyn AgentApi>,
    request: TurnRequest,
    session_id: SessionId,
    turn: u64,
    flush_interval: Duration,
    cancel: CancellationToken,
    update_tx: mpsc::Sender<StreamUpdate>,
) {
    let update = if request.has_images() {
        run_fallback_turn(api.as_ref(), request, session_id, turn).await
    } else {
        run_streaming_turn(
            api.as_ref(),
            request,
            session_id,
            turn,
            flush_interval,
            cancel,
            &update_tx,
        )
        .await
    };

    if update_tx.send(update).await.is_err() {
        warn!(session_id = %session_id, "runtime gone before turn completion");
    }
}

/// Image-bearing turns use the plain request/response endpoint; the result
/// is shaped into the same outcome a stream would have produced.
async fn run_fallback_turn(
    api: &dyn AgentApi,
    request: TurnRequest,
    session_id: SessionId,
    turn: u64,
) -> StreamUpdate {
    match api.complete_turn(request).await {
        Ok(response) => {
            let mut outcome = TurnOutcome {
                final_answer: Some(response.output),
                ..TurnOutcome::default()
            };
            for result in response.tool_results {
                outcome.tool_steps += 1;
                outcome
                    .trace
                    .push(TraceEntry::tool_result(result.content, result.tool, result.success));
            }
            StreamUpdate::Finished {
                session_id,
                turn,
                outcome,
                cancelled: false,
            }
        }
        Err(error) => StreamUpdate::Failed {
            session_id,
            turn,
            error,
        },
    }
}

async fn run_streaming_turn(
    api: &dyn AgentApi,
    request: TurnRequest,
    session_id: SessionId,
    turn: u64,
    flush_interval: Duration,
    cancel: CancellationToken,
    update_tx: &mpsc::Sender<StreamUpdate>,
) -> StreamUpdate {
    let mut lines = match api.stream_turn(request, cancel.clone()).await {
        Ok(lines) => lines,
        Err(ApiError::Cancelled) => {
            return StreamUpdate::Finished {
                session_id,
                turn,
                outcome: TurnOutcome::default(),
                cancelled: true,
            };
        }
        Err(error) => {
            return StreamUpdate::Failed {
                session_id,
                turn,
                error,
            };
        }
    };

    let mut acc = TurnAccumulator::new();
    let mut payload: Vec<String> = Vec::new();
    let mut cancelled = false;

    let first_tick = tokio::time::Instant::now() + flush_interval;
    let mut flush = tokio::time::interval_at(first_tick, flush_interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                cancelled = true;
                break;
            }

            _ = flush.tick() => {
                if let Some(flush) = acc.take_pending_flush()
                    && update_tx
                        .send(StreamUpdate::Partial { session_id, turn, flush })
                        .await
                        .is_err()
                {
                    cancelled = true;
                    break;
                }
            }

            line = lines.next() => match line {
                Some(Ok(line)) => {
                    if let Some(code) = parse_status_line(&line) {
                        if !(200..300).contains(&code) {
                            let details = drain_error_body(&mut lines).await;
                            return StreamUpdate::Failed {
                                session_id,
                                turn,
                                error: ApiError::Status { code, details },
                            };
                        }
                    } else if let Some(data) = line.strip_prefix(DATA_PREFIX) {
                        let data = data.trim_start();
                        if data == EVENT_TERMINATOR {
                            complete_pending(&mut acc, &mut payload);
                        } else {
                            payload.push(data.to_string());
                        }
                    } else if line.is_empty() || line == EVENT_TERMINATOR {
                        complete_pending(&mut acc, &mut payload);
                    } else {
                        debug!(session_id = %session_id, "ignoring non-protocol line");
                    }
                }
                Some(Err(error)) => {
                    return StreamUpdate::Failed {
                        session_id,
                        turn,
                        error,
                    };
                }
                None => break,
            }
        }
    }

    complete_pending(&mut acc, &mut payload);

    StreamUpdate::Finished {
        session_id,
        turn,
        outcome: acc.take_final_result(),
        cancelled,
    }
}

/// Complete the pending event payload, if any. Multi-line payloads are
/// joined the way they arrived.
fn complete_pending(acc: &mut TurnAccumulator, payload: &mut Vec<String>) {
    if payload.is_empty() {
        return;
    }
    let raw = payload.join("\n");
    payload.clear();
    acc.process_raw(&raw);
}

/// A non-success status means the rest of the body is an error description,
/// not protocol events. Collect a bounded amount of it for the message.
async fn drain_error_body(lines: &mut LineStream) -> String {
    let mut body = Vec::new();
    while body.len() < ERROR_BODY_MAX_LINES {
        match lines.next().await {
            Some(Ok(line)) => body.push(line),
            _ => break,
        }
    }
    body.retain(|l| !l.is_empty());
    body.join("\n")
}
