use std::ops::DerefMut;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Number, Value};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column, Connection, PgConnection, Pool, Postgres, Row as _, TypeInfo};
use tracing::{debug, info, warn};

use crate::error::DataError;
use crate::router::{ConnectionRouter, Endpoint, Role};

static MIGRATOR: Migrator = sqlx::migrate!();

pub type Row = Map<String, Value>;

pub async fn setup_database(options: PgConnectOptions) -> Result<Pool<Postgres>, sqlx::Error> {
  let pool = Pool::<Postgres>::connect_with(options).await?;
  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
  Timestamp(DateTime<Utc>),
}

impl From<i64> for SqlValue {
  fn from(v: i64) -> Self {
    SqlValue::Int(v)
  }
}

impl From<i32> for SqlValue {
  fn from(v: i32) -> Self {
    SqlValue::Int(v as i64)
  }
}

impl From<f64> for SqlValue {
  fn from(v: f64) -> Self {
    SqlValue::Float(v)
  }
}

impl From<bool> for SqlValue {
  fn from(v: bool) -> Self {
    SqlValue::Bool(v)
  }
}

impl From<&str> for SqlValue {
  fn from(v: &str) -> Self {
    SqlValue::Text(v.to_string())
  }
}

impl From<String> for SqlValue {
  fn from(v: String) -> Self {
    SqlValue::Text(v)
  }
}

impl From<DateTime<Utc>> for SqlValue {
  fn from(v: DateTime<Utc>) -> Self {
    SqlValue::Timestamp(v)
  }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(SqlValue::Null)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
  Read,
  /// Write that reports the number of affected rows.
  Write,
  /// Insert whose statement ends in `RETURNING id`.
  Insert,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
  pub statement: String,
  pub params: Vec<SqlValue>,
  pub kind: QueryKind,
}

impl Query {
  fn new(statement: impl Into<String>, kind: QueryKind) -> Self {
    Self {
      statement: statement.into(),
      params: Vec::new(),
      kind,
    }
  }

  pub fn read(statement: impl Into<String>) -> Self {
    Self::new(statement, QueryKind::Read)
  }

  pub fn write(statement: impl Into<String>) -> Self {
    Self::new(statement, QueryKind::Write)
  }

  pub fn insert(statement: impl Into<String>) -> Self {
    Self::new(statement, QueryKind::Insert)
  }

  pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
    self.params.push(value.into());
    self
  }

  pub fn is_write(&self) -> bool {
    self.kind != QueryKind::Read
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
  Rows { rows: Vec<Row>, endpoint: String },
  Inserted { id: i64, endpoint: String },
  Affected { count: u64, endpoint: String },
}

impl QueryOutput {
  pub fn endpoint(&self) -> &str {
    match self {
      QueryOutput::Rows { endpoint, .. }
      | QueryOutput::Inserted { endpoint, .. }
      | QueryOutput::Affected { endpoint, .. } => endpoint,
    }
  }

  pub fn into_rows(self) -> Vec<Row> {
    match self {
      QueryOutput::Rows { rows, .. } => rows,
      _ => Vec::new(),
    }
  }

  pub fn inserted_id(&self) -> Option<i64> {
    match self {
      QueryOutput::Inserted { id, .. } => Some(*id),
      _ => None,
    }
  }
}

/// Runs a statement against whichever endpoint the role resolves to.
#[async_trait]
pub trait Executor: Send + Sync {
  async fn execute(&self, role: Role, query: Query) -> Result<QueryOutput, DataError>;
}

/// Source of connections for the executor. The direct provider opens one
/// connection per call; a pooled provider can hand out pool checkouts.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
  type Connection: DerefMut<Target = PgConnection> + Send;

  async fn acquire(&self, endpoint: &Endpoint) -> Result<Self::Connection, sqlx::Error>;

  async fn release(&self, conn: Self::Connection);
}

pub struct DirectConnection(PgConnection);

impl std::ops::Deref for DirectConnection {
  type Target = PgConnection;

  fn deref(&self) -> &PgConnection {
    &self.0
  }
}

impl DerefMut for DirectConnection {
  fn deref_mut(&mut self) -> &mut PgConnection {
    &mut self.0
  }
}

#[derive(Debug, Clone, Default)]
pub struct DirectConnectionProvider;

#[async_trait]
impl ConnectionProvider for DirectConnectionProvider {
  type Connection = DirectConnection;

  async fn acquire(&self, endpoint: &Endpoint) -> Result<DirectConnection, sqlx::Error> {
    let conn = PgConnection::connect_with(&endpoint.connect_options()).await?;
    Ok(DirectConnection(conn))
  }

  async fn release(&self, conn: DirectConnection) {
    if let Err(e) = conn.0.close().await {
      debug!("Connection close failed: {:?}", e);
    }
  }
}

pub struct QueryExecutor<P = DirectConnectionProvider> {
  router: Arc<ConnectionRouter>,
  provider: P,
}

impl QueryExecutor<DirectConnectionProvider> {
  pub fn new(router: Arc<ConnectionRouter>) -> Self {
    Self::with_provider(router, DirectConnectionProvider)
  }
}

impl<P: ConnectionProvider> QueryExecutor<P> {
  pub fn with_provider(router: Arc<ConnectionRouter>, provider: P) -> Self {
    Self { router, provider }
  }
}

#[async_trait]
impl<P: ConnectionProvider> Executor for QueryExecutor<P> {
  async fn execute(&self, role: Role, query: Query) -> Result<QueryOutput, DataError> {
    if query.is_write() && role != Role::Primary {
      return Err(DataError::WriteOnReplica);
    }
    let endpoint = self.router.resolve(role)?;
    let mut conn = self
      .provider
      .acquire(endpoint)
      .await
      .map_err(|source| DataError::Connection {
        endpoint: endpoint.to_string(),
        source,
      })?;

    let result = match query.kind {
      QueryKind::Read => run_read(&mut *conn, &query).await,
      QueryKind::Write | QueryKind::Insert => run_write(&mut *conn, &query).await,
    };
    self.provider.release(conn).await;

    let endpoint = endpoint.to_string();
    match result? {
      Outcome::Rows(rows) => Ok(QueryOutput::Rows { rows, endpoint }),
      Outcome::Inserted(id) => Ok(QueryOutput::Inserted { id, endpoint }),
      Outcome::Affected(count) => Ok(QueryOutput::Affected { count, endpoint }),
    }
  }
}

enum Outcome {
  Rows(Vec<Row>),
  Inserted(i64),
  Affected(u64),
}

fn bind_all<'q>(query: &'q Query) -> sqlx::query::Query<'q, Postgres, PgArguments> {
  query
    .params
    .iter()
    .fold(sqlx::query(&query.statement), |q, param| match param {
      SqlValue::Null => q.bind(None::<String>),
      SqlValue::Bool(v) => q.bind(*v),
      SqlValue::Int(v) => q.bind(*v),
      SqlValue::Float(v) => q.bind(*v),
      SqlValue::Text(v) => q.bind(v.as_str()),
      SqlValue::Timestamp(v) => q.bind(*v),
    })
}

/// Reads run in a read-only transaction so a mutating statement sent as a
/// read fails instead of committing.
async fn run_read(conn: &mut PgConnection, query: &Query) -> Result<Outcome, DataError> {
  let mut tx = conn.begin().await?;
  sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
  let rows = bind_all(query).fetch_all(&mut *tx).await?;
  tx.commit().await?;
  let rows = rows.iter().map(row_to_map).collect::<Result<Vec<_>, _>>()?;
  Ok(Outcome::Rows(rows))
}

async fn run_write(conn: &mut PgConnection, query: &Query) -> Result<Outcome, DataError> {
  let mut tx = conn.begin().await?;
  let executed = match query.kind {
    QueryKind::Insert => match bind_all(query).fetch_one(&mut *tx).await {
      Ok(row) => row.try_get::<i64, _>(0).map(Outcome::Inserted),
      Err(e) => Err(e),
    },
    _ => bind_all(query)
      .execute(&mut *tx)
      .await
      .map(|done| Outcome::Affected(done.rows_affected())),
  };
  match executed {
    Ok(outcome) => {
      tx.commit().await?;
      Ok(outcome)
    }
    Err(e) => {
      if let Err(rollback) = tx.rollback().await {
        warn!("Rollback failed: {:?}", rollback);
      }
      Err(DataError::Query(e))
    }
  }
}

fn numeric_to_json(v: BigDecimal) -> Value {
  let text = v.to_string();
  text
    .parse::<f64>()
    .ok()
    .and_then(Number::from_f64)
    .map(Value::Number)
    .unwrap_or(Value::String(text))
}

fn row_to_map(row: &PgRow) -> Result<Row, DataError> {
  let mut map = Map::new();
  for column in row.columns() {
    let name = column.name();
    let type_name = column.type_info().name();
    let value = match type_name {
      "BOOL" => row.try_get::<Option<bool>, _>(name)?.map(Value::from),
      "INT2" => row.try_get::<Option<i16>, _>(name)?.map(Value::from),
      "INT4" => row.try_get::<Option<i32>, _>(name)?.map(Value::from),
      "INT8" => row.try_get::<Option<i64>, _>(name)?.map(Value::from),
      "FLOAT4" => row.try_get::<Option<f32>, _>(name)?.map(|v| Value::from(v as f64)),
      "FLOAT8" => row.try_get::<Option<f64>, _>(name)?.map(Value::from),
      "TIMESTAMPTZ" => row
        .try_get::<Option<DateTime<Utc>>, _>(name)?
        .map(|v| Value::from(v.to_rfc3339())),
      "TIMESTAMP" => row
        .try_get::<Option<NaiveDateTime>, _>(name)?
        .map(|v| Value::from(v.and_utc().to_rfc3339())),
      "UUID" => row
        .try_get::<Option<uuid::Uuid>, _>(name)?
        .map(|v| Value::from(v.to_string())),
      "NUMERIC" => row.try_get::<Option<BigDecimal>, _>(name)?.map(numeric_to_json),
      "DATE" => row
        .try_get::<Option<NaiveDate>, _>(name)?
        .map(|v| Value::from(v.to_string())),
      "TIME" => row
        .try_get::<Option<NaiveTime>, _>(name)?
        .map(|v| Value::from(v.to_string())),
      "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(name)?,
      "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" | "citext" | "UNKNOWN" => {
        row.try_get::<Option<String>, _>(name)?.map(Value::from)
      }
      _ => {
        return Err(DataError::UnsupportedColumn {
          column: name.to_string(),
          type_name: type_name.to_string(),
        });
      }
    };
    map.insert(name.to_string(), value.unwrap_or(Value::Null));
  }
  Ok(map)
}
