// Server-Sent Events stream; each open stream is one mounted, focused screen
use crate::application::events::SessionEvent;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::SiteView;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

fn to_event(event: &SessionEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!("Failed to encode session event: {}", e);
            None
        }
    }
}

/// Stream a site's events. The screen detaches when the client disconnects.
pub async fn stream_site(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let screen = state.registry.attach(&id);
    // Subscribe before focusing so the connection events are not missed
    let mut events = BroadcastStream::new(screen.session().subscribe());
    screen.focus();

    let stream = async_stream::stream! {
        let session = screen.session().clone();
        if let Ok(event) = Event::default().event("snapshot").json_data(SiteView::of(&session)) {
            yield Ok(event);
        }

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    if let Some(sse) = to_event(&event) {
                        yield Ok(sse);
                    }
                    if session.is_shut_down() {
                        break;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!("Event stream for site {} skipped {} events", session.site_id(), skipped);
                }
            }
        }

        // Keeps the screen mounted for as long as the client listens
        drop(screen);
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
