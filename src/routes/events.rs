//! SSE relays for the in-process change feed. Each endpoint filters the
//! broadcast stream down to one scope before it reaches the browser.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::realtime::ChangeEvent;
use crate::routes::jobs::find_job_scoped;
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `GET /api/events/jobs/:job_id` — task and job updates for one generation
/// job. The job must belong to the caller's organisation.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    {
        let mut conn = state.db()?;
        find_job_scoped(&mut conn, job_id, user.organisation_id)?;
    }
    debug!(job_id = %job_id, user_id = %user.user_id, "sse client subscribed to job events");
    Ok(scoped_stream(&state, job_id))
}

/// `GET /api/events/documents` — document changes for the caller's
/// organisation.
pub async fn document_events(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(
        organisation_id = %user.organisation_id,
        user_id = %user.user_id,
        "sse client subscribed to document events"
    );
    scoped_stream(&state, user.organisation_id)
}

fn scoped_stream(
    state: &AppState,
    scope_id: Uuid,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.changes.raw_receiver();
    let stream = BroadcastStream::new(receiver).filter_map(move |result| async move {
        match result {
            Ok(event) if event.scope_id == scope_id => Some(to_sse_event(&event)),
            Ok(_) => None,
            Err(err) => {
                // Lagged receivers skip ahead rather than disconnect.
                warn!(error = ?err, "sse stream lagged");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("keep-alive"))
}

fn to_sse_event(event: &ChangeEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().event(event.table.clone()).data(data))
}
