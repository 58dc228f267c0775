use std::time::Duration;

use futures::stream;
use uuid::Uuid;
use warp::sse::Event;
use warp::{Filter, Rejection};

use super::tasks::status_or_pending;
use super::with_service;
use crate::service::AppService;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn events_route(service: AppService) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  warp::path!("api" / "tasks" / Uuid / "events")
    .and(warp::get())
    .and(with_service(service))
    .map(handle_events)
}

/// Streams the task status once per interval and closes after the first
/// terminal state.
fn handle_events(task_id: Uuid, service: AppService) -> impl warp::Reply {
  let interval = tokio::time::interval(POLL_INTERVAL);
  let events = stream::unfold(Some(interval), move |state| {
    let service = service.clone();
    async move {
      let mut interval = state?;
      interval.tick().await;
      match status_or_pending(&service, task_id).await {
        Ok(status) => {
          let next = (!status.state.is_terminal()).then_some(interval);
          Some((Event::default().event("status").json_data(&status), next))
        }
        Err(e) => {
          tracing::error!(task_id = %task_id, "Error fetching task status: {}", e);
          Some((Ok(Event::default().event("error").data(e.to_string())), None))
        }
      }
    }
  });
  warp::sse::reply(warp::sse::keep_alive().stream(events))
}
