use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::error::DataError;
use crate::models::RequestLogEntry;
use crate::service::AppService;

pub mod data;
pub mod sse;
pub mod tasks;

pub fn routes(service: AppService) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  data::health_route(service.clone())
    .or(data::root_route(service.clone()))
    .or(data::users_routes(service.clone()))
    .or(data::products_route(service.clone()))
    .or(data::requests_log_route(service.clone()))
    .or(tasks::task_routes(service.clone()))
    .or(sse::events_route(service))
    .recover(handle_rejection)
}

#[derive(Debug)]
pub struct ApiError(pub DataError);
impl warp::reject::Reject for ApiError {}

pub(crate) fn with_service(service: AppService) -> impl Filter<Extract = (AppService,), Error = Infallible> + Clone {
  warp::any().map(move || service.clone())
}

/// Request facts needed for the audit entry, captured before the handler runs.
#[derive(Debug, Clone)]
pub struct RequestMeta {
  pub path: String,
  pub method: Method,
  pub client_ip: Option<String>,
  pub user_agent: Option<String>,
  pub started: Instant,
}

impl RequestMeta {
  pub fn into_entry(self, server_id: &str) -> RequestLogEntry {
    RequestLogEntry {
      server_id: server_id.to_string(),
      endpoint: self.path,
      method: self.method.to_string(),
      client_ip: self.client_ip,
      user_agent: self.user_agent,
      response_time_ms: self.started.elapsed().as_millis() as i64,
      timestamp: Utc::now(),
    }
  }
}

pub(crate) fn request_meta() -> impl Filter<Extract = (RequestMeta,), Error = Rejection> + Clone {
  warp::any()
    .map(Instant::now)
    .and(warp::path::full())
    .and(warp::method())
    .and(warp::addr::remote())
    .and(warp::header::optional::<String>("user-agent"))
    .map(
      |started: Instant, path: FullPath, method: Method, remote: Option<SocketAddr>, user_agent: Option<String>| RequestMeta {
        path: path.as_str().to_string(),
        method,
        client_ip: remote.map(|addr| addr.ip().to_string()),
        user_agent,
        started,
      },
    )
}

/// Records the audit entry for a finished request and turns the result into
/// a reply or a rejection.
pub(crate) fn finish<T: Serialize>(
  service: &AppService,
  meta: RequestMeta,
  result: Result<T, DataError>,
  status: StatusCode,
) -> Result<Response, Rejection> {
  service.audit().record(meta.into_entry(&service.server_id));
  match result {
    Ok(body) => Ok(warp::reply::with_status(warp::reply::json(&body), status).into_response()),
    Err(e) => Err(warp::reject::custom(ApiError(e))),
  }
}

pub fn status_for(err: &DataError) -> StatusCode {
  match err {
    DataError::Validation(_) => StatusCode::BAD_REQUEST,
    DataError::UserNotFound(_) | DataError::UnknownTask(_) => StatusCode::NOT_FOUND,
    e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if let Some(ApiError(e)) = err.find::<ApiError>() {
    (status_for(e), e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else {
    tracing::error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
