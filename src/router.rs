use std::fmt;

use rand::seq::SliceRandom;
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;

use crate::error::DataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Primary,
  Replica,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Role::Primary => f.write_str("primary"),
      Role::Replica => f.write_str("replica"),
    }
  }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
  pub user: String,
  pub password: String,
  pub database: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
  pub role: Role,
  pub host: String,
  pub port: u16,
  pub credentials: Credentials,
}

impl Endpoint {
  pub fn new(role: Role, host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
    Self {
      role,
      host: host.into(),
      port,
      credentials,
    }
  }

  pub fn address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  pub fn connect_options(&self) -> PgConnectOptions {
    PgConnectOptions::new()
      .host(&self.host)
      .port(self.port)
      .username(&self.credentials.user)
      .password(&self.credentials.password)
      .database(&self.credentials.database)
  }
}

// Credentials stay out of logs.
impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
      .field("role", &self.role)
      .field("host", &self.host)
      .field("port", &self.port)
      .field("user", &self.credentials.user)
      .field("database", &self.credentials.database)
      .finish()
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}:{}", self.role, self.host, self.port)
  }
}

/// Maps a logical role onto a configured endpoint. Replica selection is
/// uniform random with no health or weighting information.
#[derive(Debug, Clone)]
pub struct ConnectionRouter {
  primary: Option<Endpoint>,
  replicas: Vec<Endpoint>,
}

impl ConnectionRouter {
  pub fn new(primary: Option<Endpoint>, replicas: Vec<Endpoint>) -> Self {
    Self { primary, replicas }
  }

  pub fn resolve(&self, role: Role) -> Result<&Endpoint, DataError> {
    match role {
      Role::Primary => self.primary.as_ref(),
      Role::Replica => self.replicas.choose(&mut rand::thread_rng()),
    }
    .ok_or(DataError::NoEndpointConfigured(role))
  }

  pub fn replicas(&self) -> &[Endpoint] {
    &self.replicas
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn creds() -> Credentials {
    Credentials {
      user: "user".into(),
      password: "secret".into(),
      database: "db".into(),
    }
  }

  fn router(replica_count: usize) -> ConnectionRouter {
    let primary = Endpoint::new(Role::Primary, "primary", 5432, creds());
    let replicas = (0..replica_count)
      .map(|i| Endpoint::new(Role::Replica, format!("replica-{i}"), 5432, creds()))
      .collect();
    ConnectionRouter::new(Some(primary), replicas)
  }

  #[test]
  fn primary_is_always_the_same_endpoint() {
    let router = router(3);
    for _ in 0..50 {
      let _ = router.resolve(Role::Replica);
      assert_eq!(router.resolve(Role::Primary).unwrap().host, "primary");
    }
  }

  #[test]
  fn replica_selection_stays_within_configured_set() {
    for n in 1..=4 {
      let router = router(n);
      for _ in 0..100 {
        let endpoint = router.resolve(Role::Replica).unwrap();
        assert!(router.replicas().contains(endpoint));
        assert_eq!(endpoint.role, Role::Replica);
      }
    }
  }

  #[test]
  fn replica_selection_is_roughly_uniform() {
    let router = router(3);
    let mut hits: HashMap<String, usize> = HashMap::new();
    let draws = 6000;
    for _ in 0..draws {
      *hits.entry(router.resolve(Role::Replica).unwrap().host.clone()).or_default() += 1;
    }
    assert_eq!(hits.len(), 3);
    for count in hits.values() {
      // expected 2000 each
      assert!((1600..=2400).contains(count), "skewed distribution: {hits:?}");
    }
  }

  #[test]
  fn empty_role_reports_no_endpoint() {
    let router = ConnectionRouter::new(None, Vec::new());
    assert!(matches!(router.resolve(Role::Replica), Err(DataError::NoEndpointConfigured(Role::Replica))));
    assert!(matches!(router.resolve(Role::Primary), Err(DataError::NoEndpointConfigured(Role::Primary))));
  }

  #[test]
  fn debug_output_hides_password() {
    let endpoint = Endpoint::new(Role::Primary, "primary", 5432, creds());
    assert!(!format!("{endpoint:?}").contains("secret"));
    assert_eq!(endpoint.to_string(), "primary@primary:5432");
  }
}
