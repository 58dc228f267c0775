use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::database::{Query, Row};
use crate::error::DataError;

pub const PRODUCT_CATEGORIES: [&str; 6] = ["Electronics", "Clothing", "Books", "Home & Garden", "Sports", "Toys"];
pub const MIN_PRICE: f64 = 10.0;
pub const MAX_PRICE: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: i64,
  pub name: String,
  pub email: String,
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: i64,
  pub name: String,
  pub description: Option<String>,
  pub price: f64,
  pub stock_quantity: i32,
  pub category: String,
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
  pub server_id: String,
  pub endpoint: String,
  pub method: String,
  pub client_ip: Option<String>,
  pub user_agent: Option<String>,
  pub response_time_ms: i64,
  pub timestamp: DateTime<Utc>,
}

impl RequestLogEntry {
  pub fn insert_query(&self) -> Query {
    Query::write(
      "INSERT INTO requests (server_id, endpoint, method, client_ip, user_agent, response_time_ms, timestamp)
       VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(self.server_id.as_str())
    .bind(self.endpoint.as_str())
    .bind(self.method.as_str())
    .bind(self.client_ip.clone())
    .bind(self.user_agent.clone())
    .bind(self.response_time_ms)
    .bind(self.timestamp)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogRow {
  pub id: i64,
  pub server_id: String,
  pub endpoint: Option<String>,
  pub method: Option<String>,
  pub client_ip: Option<String>,
  pub user_agent: Option<String>,
  pub response_time_ms: Option<i64>,
  pub timestamp: Option<DateTime<Utc>>,
}

/// A product derived from a user's name with randomized commercial fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProduct {
  pub name: String,
  pub description: String,
  pub price: f64,
  pub stock_quantity: i32,
  pub category: String,
}

impl NewProduct {
  pub fn for_user(user_name: &str) -> Self {
    let mut rng = rand::thread_rng();
    let price = (rng.gen_range(MIN_PRICE..=MAX_PRICE) * 100.0).round() / 100.0;
    let category = PRODUCT_CATEGORIES
      .choose(&mut rng)
      .copied()
      .unwrap_or(PRODUCT_CATEGORIES[0]);
    Self {
      name: format!("Product for {}", user_name),
      description: format!(
        "Custom product created for user {} at {}",
        user_name,
        Utc::now().format("%Y-%m-%d %H:%M:%S")
      ),
      price,
      stock_quantity: rng.gen_range(1..=100),
      category: category.to_string(),
    }
  }

  pub fn insert_query(&self) -> Query {
    Query::insert(
      "INSERT INTO products (name, description, price, stock_quantity, category)
       VALUES ($1, $2, $3::float8::numeric(10,2), $4::int4, $5) RETURNING id",
    )
    .bind(self.name.as_str())
    .bind(self.description.as_str())
    .bind(self.price)
    .bind(self.stock_quantity)
    .bind(self.category.as_str())
  }
}

pub fn from_rows<T: serde::de::DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, DataError> {
  rows
    .into_iter()
    .map(|row| serde_json::from_value(serde_json::Value::Object(row)).map_err(DataError::from))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn generated_products_stay_in_range() {
    for _ in 0..500 {
      let product = NewProduct::for_user("Ann");
      assert!((MIN_PRICE..=MAX_PRICE).contains(&product.price));
      assert_eq!((product.price * 100.0).round() / 100.0, product.price);
      assert!((1..=100).contains(&product.stock_quantity));
      assert!(PRODUCT_CATEGORIES.contains(&product.category.as_str()));
      assert_eq!(product.name, "Product for Ann");
      assert!(product.description.starts_with("Custom product created for user Ann at "));
    }
  }

  #[test]
  fn rows_decode_into_models() {
    let row = json!({
      "id": 7,
      "name": "Ann",
      "email": "ann@x.com",
      "created_at": "2025-01-02T03:04:05+00:00"
    });
    let users: Vec<User> = from_rows(vec![row.as_object().unwrap().clone()]).unwrap();
    assert_eq!(users[0].id, 7);
    assert_eq!(users[0].email, "ann@x.com");
    assert!(users[0].created_at.is_some());
  }

  #[test]
  fn log_entry_binds_every_column() {
    let entry = RequestLogEntry {
      server_id: "api-1".into(),
      endpoint: "/api/users".into(),
      method: "GET".into(),
      client_ip: None,
      user_agent: Some("curl".into()),
      response_time_ms: 12,
      timestamp: Utc::now(),
    };
    assert_eq!(entry.insert_query().params.len(), 7);
  }
}
