//! Live task event stream.
//!
//! Long-lived SSE response: recent history first, then live events as
//! they publish. Heartbeat comments keep intermediaries from closing idle
//! connections; dropping the connection tears the subscription down.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::routes::UserId;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Restrict the stream to one task; all tasks when absent
    pub task_id: Option<Uuid>,
}

pub async fn task_stream(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<StreamQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    debug!(user_id, task_id = ?query.task_id, "stream subscriber connected");
    let mut subscription = match query.task_id {
        Some(task_id) => state.bus.subscribe(task_id),
        None => state.bus.subscribe_all(),
    };

    let stream = async_stream::stream! {
        while let Some(event) = subscription.next().await {
            yield Ok::<Event, Infallible>(Event::default().data(event.frame_json()));
        }
        debug!("stream subscription drained");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("keepalive"),
    )
}
