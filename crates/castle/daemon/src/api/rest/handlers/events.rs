//! Event streaming handlers

use crate::api::rest::state::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Stream events via SSE
pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let shutdown = state.shutdown_tx.subscribe();

    // the stream ends when the daemon stops so graceful shutdown is not held open
    let stream = stream::unfold((rx, shutdown), |(mut rx, mut shutdown)| async move {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => {
                    let sse_event = Event::default()
                        .event(event_name(&event.event))
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().comment("unserializable event"));
                    Some((Ok(sse_event), (rx, shutdown)))
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Client lagged behind, continue
                    let comment = Event::default().comment(format!("lagged {}", skipped));
                    Some((Ok(comment), (rx, shutdown)))
                }
                Err(RecvError::Closed) => None,
            },
            _ = shutdown.changed() => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn event_name(event: &castle_types::CastleEvent) -> &'static str {
    use castle_types::CastleEvent;
    match event {
        CastleEvent::HealthUpdated(_) => "health",
        CastleEvent::HealthChanged { .. } => "health_changed",
        CastleEvent::Mesh(_) => "mesh",
        CastleEvent::Deployed { .. } => "deployed",
        CastleEvent::ShuttingDown => "shutdown",
    }
}
