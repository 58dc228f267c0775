use serde_json::json;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection};

use super::{RequestMeta, finish, request_meta, with_service};
use crate::error::DataError;
use crate::service::AppService;
use crate::task::TaskStatus;

pub fn task_routes(service: AppService) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  let create_product = warp::path!("api" / "tasks" / "create-product" / i64)
    .and(warp::post())
    .and(request_meta())
    .and(with_service(service.clone()))
    .and_then(handle_create_product);
  let self_test = warp::path!("api" / "tasks" / "test-worker")
    .and(warp::post())
    .and(request_meta())
    .and(with_service(service.clone()))
    .and_then(handle_self_test);
  let status = warp::path!("api" / "tasks" / Uuid)
    .and(warp::get())
    .and(request_meta())
    .and(with_service(service))
    .and_then(handle_status);
  create_product.or(self_test).or(status)
}

async fn handle_create_product(user_id: i64, meta: RequestMeta, service: AppService) -> Result<Response, Rejection> {
  let result = service.enqueue_product_creation(user_id).await.map(|task| {
    json!({
      "message": format!("Product creation task queued for user {}", user_id),
      "task_id": task.task_id,
      "user_id": task.user_id,
      "user_name": task.user_name,
      "status_url": format!("/api/tasks/{}", task.task_id),
      "served_by": service.server_id,
    })
  });
  finish(&service, meta, result, StatusCode::ACCEPTED)
}

async fn handle_self_test(meta: RequestMeta, service: AppService) -> Result<Response, Rejection> {
  let result = service.enqueue_self_test().await.map(|task| {
    json!({
      "message": "Worker self-test queued",
      "task_id": task.task_id,
      "status_url": format!("/api/tasks/{}", task.task_id),
      "served_by": service.server_id,
    })
  });
  finish(&service, meta, result, StatusCode::ACCEPTED)
}

/// Unknown ids read as PENDING: the enqueue record may not be visible yet.
pub(crate) async fn status_or_pending(service: &AppService, task_id: Uuid) -> Result<TaskStatus, DataError> {
  match service.task_status(task_id).await {
    Err(DataError::UnknownTask(id)) => Ok(TaskStatus::pending(id)),
    other => other,
  }
}

async fn handle_status(task_id: Uuid, meta: RequestMeta, service: AppService) -> Result<Response, Rejection> {
  let result = status_or_pending(&service, task_id).await;
  finish(&service, meta, result, StatusCode::OK)
}
