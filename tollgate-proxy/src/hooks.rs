//! Proxy-local hooks.

use std::collections::HashMap;
use std::hash::BuildHasher;

use http::{HeaderMap, HeaderName, HeaderValue};
use tollgate::BoxFuture;
use tollgate_mcp::hook::{Capabilities, Hook, RequestExtra};
use tollgate_mcp::HookError;

use crate::error::ProxyError;

/// Adds a fixed set of headers to every upstream request.
///
/// Configured values win over inbound headers of the same name.
#[derive(Debug, Clone, Default)]
pub struct ForwardHeadersHook {
    headers: HeaderMap,
}

impl ForwardHeadersHook {
    /// Creates the hook from ready header values.
    #[must_use]
    pub const fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// Creates the hook from the `forward_headers` config table.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidHeader`] if a name or value is not valid HTTP.
    pub fn from_config<S: BuildHasher>(
        headers: &HashMap<String, String, S>,
    ) -> Result<Self, ProxyError> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let invalid = |reason: String| ProxyError::InvalidHeader {
                name: name.clone(),
                reason,
            };
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
            let mut header_value =
                HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
            header_value.set_sensitive(true);
            map.insert(header_name, header_value);
        }
        Ok(Self::new(map))
    }

    /// Number of configured headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Whether no headers are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl Hook for ForwardHeadersHook {
    fn name(&self) -> &str {
        "forward-headers"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new().headers()
    }

    fn prepare_headers<'a>(
        &'a self,
        headers: &'a mut HeaderMap,
        _extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(async move {
            for (name, value) in &self.headers {
                headers.insert(name.clone(), value.clone());
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extra() -> RequestExtra {
        RequestExtra::new(
            "/mcp".to_owned(),
            "http://upstream/mcp".to_owned(),
            HeaderMap::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_adds_and_overrides_headers() {
        let config = HashMap::from([
            ("x-api-key".to_owned(), "secret".to_owned()),
            ("user-agent".to_owned(), "tollgate".to_owned()),
        ]);
        let hook = ForwardHeadersHook::from_config(&config).unwrap();
        assert_eq!(hook.len(), 2);

        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("curl"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        hook.prepare_headers(&mut headers, &extra()).await.unwrap();

        assert_eq!(headers.get("x-api-key").unwrap(), "secret");
        assert_eq!(headers.get("user-agent").unwrap(), "tollgate");
        assert_eq!(headers.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_rejects_invalid_header_name() {
        let config = HashMap::from([("bad header".to_owned(), "v".to_owned())]);
        let err = ForwardHeadersHook::from_config(&config).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidHeader { name, .. } if name == "bad header"));
    }

    #[test]
    fn test_declares_only_headers() {
        let caps = ForwardHeadersHook::default().capabilities();
        assert!(caps.has_headers());
        assert!(!caps.has_notifications());
    }
}
