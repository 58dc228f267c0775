use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection};

use super::{RequestMeta, finish, request_meta, with_service};
use crate::service::AppService;

#[derive(Debug, Deserialize)]
pub struct NewUser {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub email: String,
}

pub fn health_route(service: AppService) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  warp::path!("health")
    .and(warp::get())
    .and(with_service(service))
    .map(|service: AppService| {
      warp::reply::json(&json!({
        "status": "healthy",
        "server_id": service.server_id,
        "timestamp": Utc::now().to_rfc3339(),
      }))
    })
}

pub fn root_route(service: AppService) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  warp::path!("api")
    .and(warp::get())
    .and(request_meta())
    .and(with_service(service))
    .and_then(handle_root)
}

pub fn users_routes(service: AppService) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  let list = warp::path!("api" / "users")
    .and(warp::get())
    .and(request_meta())
    .and(with_service(service.clone()))
    .and_then(handle_list_users);
  let create = warp::path!("api" / "users")
    .and(warp::post())
    .and(request_meta())
    .and(warp::body::content_length_limit(16 * 1024))
    .and(warp::body::json())
    .and(with_service(service))
    .and_then(handle_create_user);
  list.or(create)
}

pub fn products_route(service: AppService) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  warp::path!("api" / "products")
    .and(warp::get())
    .and(request_meta())
    .and(with_service(service))
    .and_then(handle_list_products)
}

pub fn requests_log_route(service: AppService) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  warp::path!("api" / "requests-log")
    .and(warp::get())
    .and(request_meta())
    .and(with_service(service))
    .and_then(handle_requests_log)
}

async fn handle_root(meta: RequestMeta, service: AppService) -> Result<Response, Rejection> {
  let body = json!({
    "message": "Hello from the read/write split API",
    "server_id": service.server_id,
    "timestamp": Utc::now().to_rfc3339(),
  });
  finish(&service, meta, Ok(body), StatusCode::OK)
}

async fn handle_list_users(meta: RequestMeta, service: AppService) -> Result<Response, Rejection> {
  let result = service.list_users().await.map(|served| {
    json!({
      "users": served.data,
      "served_by": service.server_id,
      "database": served.database,
    })
  });
  finish(&service, meta, result, StatusCode::OK)
}

async fn handle_create_user(meta: RequestMeta, new_user: NewUser, service: AppService) -> Result<Response, Rejection> {
  let result = service.create_user(&new_user.name, &new_user.email).await.map(|created| {
    json!({
      "message": "User created successfully",
      "user": created,
      "served_by": service.server_id,
    })
  });
  finish(&service, meta, result, StatusCode::CREATED)
}

async fn handle_list_products(meta: RequestMeta, service: AppService) -> Result<Response, Rejection> {
  let result = service.list_products().await.map(|served| {
    json!({
      "products": served.data,
      "served_by": service.server_id,
      "database": served.database,
    })
  });
  finish(&service, meta, result, StatusCode::OK)
}

async fn handle_requests_log(meta: RequestMeta, service: AppService) -> Result<Response, Rejection> {
  let result = service.list_request_log().await.map(|served| {
    json!({
      "requests": served.data,
      "served_by": service.server_id,
      "database": served.database,
    })
  });
  finish(&service, meta, result, StatusCode::OK)
}
