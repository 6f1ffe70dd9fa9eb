//! SSE push channel for run progress.
//!
//! The stream opens with a `snapshot` event built from the current run
//! state, then carries one `progress` event per published [`ProgressEvent`].
//! It ends after the first terminal event, or right after the snapshot when
//! the run has already finished.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use devteam_core::{ProgressEvent, RunId};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::broadcast::Subscription;
use crate::http::responses::ApiError;
use crate::state::AppState;

/// Type alias for boxed SSE stream.
type SseEventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

fn sse_event(name: &'static str, data: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| {
            warn!(event = name, error = %e, "Failed to encode SSE event");
            Event::default().comment("unencodable event")
        })
}

/// Subscribe to a run's progress.
pub async fn run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Sse<SseEventStream>, ApiError> {
    let run_id = RunId::new(run_id);
    let (snapshot, subscription) = state.service.subscribe(&run_id).await?;
    debug!(run_id = %run_id, listener = subscription.id(), "SSE subscriber attached");

    let initial = stream::once(std::future::ready(Ok::<_, Infallible>(sse_event(
        "snapshot", &snapshot,
    ))));

    let stream: SseEventStream = if snapshot.status.is_terminal() {
        Box::pin(initial)
    } else {
        Box::pin(initial.chain(progress_stream(subscription)))
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn progress_stream(
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(
        (subscription, false),
        |(mut subscription, finished)| async move {
            if finished {
                return None;
            }
            let event: ProgressEvent = subscription.recv().await?;
            let terminal = event.is_terminal();
            Some((Ok(sse_event("progress", &event)), (subscription, terminal)))
        },
    )
}
