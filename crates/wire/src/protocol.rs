use crate::Method;
use serde::{Deserialize, Serialize};

/// A client query. Params are free-form JSON, interpreted per method by the
/// router; the reply is a stream of `Output` lines and a `Finish` code on the
/// same connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request<P = serde_json::Value> {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<u64>,
  pub method: Method,
  #[serde(default)]
  pub params: P,
}

impl Request {
  pub fn new(method: Method, params: serde_json::Value) -> Request {
    Request {
      id: None,
      method,
      params,
    }
  }

  /// A string parameter, with "" as the missing default.
  pub fn str_param(&self, key: &str) -> &str {
    self.params.get(key).and_then(|v| v.as_str()).unwrap_or("")
  }
}
