use std::convert::Infallible;

use axum::Router;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures::stream::Stream;

use super::AppState;

/// GET /run/live: the current session, then every change to it.
///
/// Bursts of updates between two reads collapse into the latest snapshot.
pub(crate) async fn stream_session(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.tracker.session().subscribe();
    let stream = async_stream::stream! {
        loop {
            let data = {
                let session = rx.borrow_and_update();
                serde_json::to_string(&*session).unwrap_or_default()
            };
            yield Ok(Event::default().event("session").data(data));

            if rx.changed().await.is_err() {
                break;
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/run/live", get(stream_session))
}
