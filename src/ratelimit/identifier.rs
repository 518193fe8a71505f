//! Client identifier resolution.

use axum::http::HeaderMap;

/// Comma-separated proxy chain header; the first hop is the client.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Single direct-address header set by the edge proxy.
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Shared bucket for traffic that carries no origin metadata.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A key that buckets a requester for rate limit accounting.
///
/// This is a best-effort key derived from proxy headers. It is not
/// validated as an IP address and is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentifier(String);

impl ClientIdentifier {
    /// Resolve the identifier from request headers.
    ///
    /// Never fails: anonymous traffic is pooled under [`UNKNOWN_CLIENT`].
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());

        if let Some(hop) = forwarded {
            return Self(hop.to_string());
        }

        let real_ip = headers
            .get(REAL_IP_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        match real_ip {
            Some(ip) => Self(ip.to_string()),
            None => Self::unknown(),
        }
    }

    /// The sentinel identifier for unattributable traffic.
    pub fn unknown() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CLIENT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Counter key for this client under a named policy.
    ///
    /// Stores key purely by the string they are given, so the policy name
    /// is folded in here to keep policies from sharing a bucket.
    pub fn scoped(&self, policy: &str) -> String {
        format!("{}:{}", policy, self.0)
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_first_forwarded_hop_wins() {
        let map = headers(&[
            (FORWARDED_FOR_HEADER, "203.0.113.7, 10.0.0.1, 10.0.0.2"),
            (REAL_IP_HEADER, "10.0.0.2"),
        ]);

        let id = ClientIdentifier::from_headers(&map);
        assert_eq!(id.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_falls_back_to_real_ip() {
        let map = headers(&[(REAL_IP_HEADER, "198.51.100.4")]);
        assert_eq!(ClientIdentifier::from_headers(&map).as_str(), "198.51.100.4");
    }

    #[test]
    fn test_empty_forwarded_header_falls_through() {
        let map = headers(&[(FORWARDED_FOR_HEADER, " , 10.0.0.1"), (REAL_IP_HEADER, "198.51.100.4")]);
        assert_eq!(ClientIdentifier::from_headers(&map).as_str(), "198.51.100.4");
    }

    #[test]
    fn test_no_metadata_is_unknown() {
        let id = ClientIdentifier::from_headers(&HeaderMap::new());
        assert!(id.is_unknown());
        assert_eq!(id.to_string(), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_no_ip_syntax_validation() {
        let map = headers(&[(FORWARDED_FOR_HEADER, "not-an-ip")]);
        assert_eq!(ClientIdentifier::from_headers(&map).as_str(), "not-an-ip");
    }

    #[test]
    fn test_scoped_key_includes_policy() {
        let id = ClientIdentifier::from_headers(&headers(&[(REAL_IP_HEADER, "1.2.3.4")]));
        assert_eq!(id.scoped("login"), "login:1.2.3.4");
        assert_ne!(id.scoped("login"), id.scoped("register"));
    }
}
