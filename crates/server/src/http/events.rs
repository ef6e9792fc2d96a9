//! One-way event stream (`text/event-stream`).

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::info;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::events::EventHub;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route("/api/events", get(events))
}

async fn events(State(state): State<AppState>) -> Response {
    let Some(subscription) = state.hub.subscribe() else {
        return AppError::service_unavailable("too many event stream subscribers").into_response();
    };
    info!(
        subscribers = state.hub.client_count(),
        "event stream subscriber connected"
    );

    let stream = EventStream {
        hub: state.hub.clone(),
        id: subscription.id,
        rx: subscription.rx,
        greeted: false,
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Adapts a hub subscription into an SSE stream and guarantees the
/// subscription is released when the client goes away.
struct EventStream {
    hub: Arc<EventHub>,
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    greeted: bool,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.greeted {
            this.greeted = true;
            return Poll::Ready(Some(Ok(Event::default().comment("connected"))));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => Poll::Ready(Some(Ok(Event::default().data(data.as_ref())))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
        info!(
            subscribers = self.hub.client_count(),
            "event stream subscriber disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn stream_greets_then_relays_broadcasts_and_unsubscribes_on_drop() {
        let hub = Arc::new(EventHub::new());
        let subscription = hub.subscribe().expect("subscribe");
        let mut stream = EventStream {
            hub: hub.clone(),
            id: subscription.id,
            rx: subscription.rx,
            greeted: false,
        };

        // Preamble comes first, before any broadcast.
        let greeting = stream.next().await.expect("greeting").expect("ok");
        let _ = greeting;

        hub.broadcast(&crate::diff::Update {
            kind: crate::diff::UpdateKind::Stats,
            stats: crate::snapshot::Stats::default(),
            changed: Vec::new(),
            gone: Vec::new(),
            new: Vec::new(),
        });
        let event = stream.next().await.expect("event").expect("ok");
        let _ = event;

        assert_eq!(hub.client_count(), 1);
        drop(stream);
        assert_eq!(hub.client_count(), 0);
    }
}
