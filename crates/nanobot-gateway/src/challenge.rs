//! `WWW-Authenticate` challenge construction.

use axum::http::HeaderMap;

/// Build the Bearer challenge pointing at the protected-resource metadata.
///
/// The scheme comes from `X-Forwarded-Proto` when a proxy set it, and
/// otherwise defaults to https, except for localhost peers.
pub fn challenge_header(headers: &HeaderMap, path: &str) -> String {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| {
            if host.starts_with("localhost") || host.starts_with("127.") {
                "http".to_string()
            } else {
                "https".to_string()
            }
        });
    let path = path.trim_start_matches('/');
    format!(
        r#"Bearer error="invalid_request", resource_metadata="{}://{}/.well-known/oauth-protected-resource/{}""#,
        scheme, host, path
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localhost_defaults_to_http() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "localhost:8080".parse().unwrap());
        let challenge = challenge_header(&headers, "/mcp");
        assert!(challenge.contains("http://localhost:8080/.well-known/oauth-protected-resource/mcp"));
    }

    #[test]
    fn test_public_host_defaults_to_https() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "bot.example".parse().unwrap());
        let challenge = challenge_header(&headers, "/mcp");
        assert!(challenge.starts_with(r#"Bearer error="invalid_request""#));
        assert!(challenge.contains("https://bot.example/"));
    }

    #[test]
    fn test_forwarded_proto_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "localhost".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert!(challenge_header(&headers, "/mcp").contains("https://localhost/"));
    }
}
