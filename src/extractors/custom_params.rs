//! Per-request custom parameter store shared by middleware and handlers.
//!
//! Middleware frequently needs to stash a value (an authenticated user id, a parsed
//! API key, a rate-limit bucket) for a handler further down the chain to read. This
//! module models that as a single mapping carried in the request's extensions,
//! inserted once by [`crate::pipeline::Pipeline`] before the middleware chain runs and
//! dropped with the request when it completes — never shared across requests.

use std::{
  collections::HashMap,
  convert::Infallible,
  future::ready,
  sync::{Arc, RwLock},
};

use serde_json::Value;

use crate::{extractors::FromRequest, types::Request};

/// Shared, mutable per-request key/value store.
///
/// Cloning a [`CustomParams`] clones the `Arc`, not the underlying map, so every
/// middleware and the handler observe the same storage for the lifetime of one
/// request — exactly the "exclusive mutable access at each suspension point"
/// invariant the middleware chain relies on, since only one step runs at a time.
#[derive(Clone, Default)]
pub struct CustomParams(Arc<RwLock<HashMap<String, Value>>>);

impl CustomParams {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts or overwrites a value by key.
  pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
    self.0.write().unwrap().insert(key.into(), value.into());
  }

  /// Reads a value by key, if present.
  pub fn get(&self, key: &str) -> Option<Value> {
    self.0.read().unwrap().get(key).cloned()
  }

  /// Removes a value by key, returning it if present.
  pub fn remove(&self, key: &str) -> Option<Value> {
    self.0.write().unwrap().remove(key)
  }

  /// Returns a snapshot of every key currently stored.
  pub fn keys(&self) -> Vec<String> {
    self.0.read().unwrap().keys().cloned().collect()
  }
}

impl<'a> FromRequest<'a> for CustomParams {
  type Error = Infallible;

  fn from_request(
    req: &'a mut Request,
  ) -> impl core::future::Future<Output = core::result::Result<Self, Self::Error>> + Send + 'a {
    let params = req.extensions().get::<CustomParams>().cloned().unwrap_or_default();
    ready(Ok(params))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn insert_and_get_round_trips() {
    let params = CustomParams::new();
    params.insert("user_id", "42");
    assert_eq!(params.get("user_id"), Some(Value::String("42".into())));
    assert_eq!(params.get("missing"), None);
  }

  #[test]
  fn clone_shares_storage() {
    let params = CustomParams::new();
    let cloned = params.clone();
    params.insert("a", 1);
    assert_eq!(cloned.get("a"), Some(Value::from(1)));
  }

  #[test]
  fn remove_returns_previous_value() {
    let params = CustomParams::new();
    params.insert("k", true);
    assert_eq!(params.remove("k"), Some(Value::Bool(true)));
    assert_eq!(params.get("k"), None);
  }
}
