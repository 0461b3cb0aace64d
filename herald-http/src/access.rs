//! HTTP access description: how to reach a peer's servlet.

use serde_json::{json, Value};

use herald_core::HeraldError;

/// Host, port and servlet path of a peer's HTTP endpoint.
///
/// Dumped as the `[host, port, path]` array of the peer-dump contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAccess {
    host: String,
    port: u16,
    path: String,
}

impl HttpAccess {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            host: host.into(),
            port,
            path,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Servlet path, always with a leading slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn dump(&self) -> Value {
        json!([self.host, self.port, self.path])
    }

    pub fn load(value: &Value) -> Result<Self, HeraldError> {
        let items = value
            .as_array()
            .ok_or_else(|| HeraldError::Malformed("http access must be an array".into()))?;
        let host = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| HeraldError::Malformed("http access without host".into()))?;
        let port = items
            .get(1)
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| HeraldError::Malformed("http access without port".into()))?;
        let path = items.get(2).and_then(Value::as_str).unwrap_or("/herald");
        Ok(Self::new(host, port, path))
    }

    /// URL of the remote servlet. IPv6 hosts get bracketed, port 0 maps to
    /// the default HTTP port.
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let port = if self.port == 0 { 80 } else { self.port };
        format!("http://{host}:{port}{}", self.path)
    }
}
