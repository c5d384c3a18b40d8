//! OAuth 2.1 discovery, token grants, PKCE, and RFC 8693 token exchange.

use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::WireError;

const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
const TOKEN_TYPE_API_KEY: &str = "urn:obot:token-type:api-key";

/// Authorization-server metadata, the subset the client needs.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// A successful token grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// RFC 8693 exchange coordinates, configured per downstream server.
#[derive(Debug, Clone)]
pub struct TokenExchangeConfig {
    pub endpoint: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Pull `resource_metadata="URL"` out of a `WWW-Authenticate: Bearer …`
/// challenge.
pub fn parse_www_authenticate(header: &str) -> Option<String> {
    let idx = header.find("resource_metadata=")?;
    let rest = &header[idx + "resource_metadata=".len()..];
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Follow the challenge: fetch the protected-resource metadata, then the
/// first advertised authorization server's metadata.
pub async fn discover_auth_server(
    http: &reqwest::Client,
    protected_resource_url: &str,
) -> Result<AuthServerMetadata, WireError> {
    let resource: ProtectedResourceMetadata = http
        .get(protected_resource_url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let issuer = resource
        .authorization_servers
        .first()
        .ok_or_else(|| WireError::transport("protected resource lists no authorization server"))?;
    let metadata_url = format!(
        "{}/.well-known/oauth-authorization-server",
        issuer.trim_end_matches('/')
    );
    let meta: AuthServerMetadata = http
        .get(&metadata_url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(meta)
}

/// Client-credentials grant.
pub async fn client_credentials_token(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenResponse, WireError> {
    let resp = http
        .post(token_endpoint)
        .basic_auth(client_id, Some(client_secret))
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

/// Authorization-code exchange with the PKCE verifier.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
    verifier: &str,
) -> Result<TokenResponse, WireError> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("code_verifier", verifier),
        ("client_id", client_id),
    ];
    // Public clients authenticate with PKCE alone.
    if !client_secret.is_empty() {
        form.push(("client_secret", client_secret));
    }
    let resp = http
        .post(token_endpoint)
        .form(&form)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

/// RFC 8693 token exchange.
///
/// Returns the substituted access token on 200. Any non-200 answer falls
/// through to `None`: the caller keeps its original bearer, which may still
/// be authorized by ordinary OAuth.
pub async fn token_exchange(
    http: &reqwest::Client,
    config: &TokenExchangeConfig,
    subject_token: &str,
    resource: &str,
) -> Result<Option<String>, WireError> {
    let resp = http
        .post(&config.endpoint)
        .basic_auth(&config.client_id, Some(&config.client_secret))
        .form(&[
            ("grant_type", GRANT_TOKEN_EXCHANGE),
            ("subject_token", subject_token),
            ("subject_token_type", subject_token_type(subject_token)),
            ("resource", resource),
        ])
        .send()
        .await?;
    if !resp.status().is_success() {
        debug!(status = %resp.status(), "token exchange declined, keeping original bearer");
        return Ok(None);
    }
    let token: TokenResponse = resp.json().await?;
    Ok(Some(token.access_token))
}

/// JWTs are three dot-separated base64url segments; anything else is treated
/// as an opaque API key.
pub fn subject_token_type(token: &str) -> &'static str {
    let mut segments = 0;
    for part in token.split('.') {
        if part.is_empty()
            || !part
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
        {
            return TOKEN_TYPE_API_KEY;
        }
        segments += 1;
    }
    if segments == 3 {
        TOKEN_TYPE_JWT
    } else {
        TOKEN_TYPE_API_KEY
    }
}

/// Cryptographically random lowercase state for the redirect round-trip.
pub fn random_state() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(bytes)
        .to_lowercase()
}

/// PKCE S256 pair: (verifier, challenge).
pub fn pkce_pair() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    (verifier, challenge)
}

/// Build the authorization URL the user must visit.
pub fn authorize_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
    resource: &str,
) -> Result<String, WireError> {
    let mut url = url::Url::parse(authorization_endpoint)?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("resource", resource);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_www_authenticate() {
        let header = r#"Bearer error="invalid_request", resource_metadata="https://rs/.well-known/oauth-protected-resource""#;
        assert_eq!(
            parse_www_authenticate(header).as_deref(),
            Some("https://rs/.well-known/oauth-protected-resource")
        );
        assert!(parse_www_authenticate("Bearer realm=\"x\"").is_none());
    }

    #[test]
    fn test_subject_token_type_jwt() {
        assert_eq!(subject_token_type("eyJh.eyJz.c2ln"), TOKEN_TYPE_JWT);
    }

    #[test]
    fn test_subject_token_type_api_key() {
        assert_eq!(subject_token_type("sk-plain-key"), TOKEN_TYPE_API_KEY);
        assert_eq!(subject_token_type("a.b"), TOKEN_TYPE_API_KEY);
        assert_eq!(subject_token_type("a.b.c.d"), TOKEN_TYPE_API_KEY);
        assert_eq!(subject_token_type("x y.z w.q"), TOKEN_TYPE_API_KEY);
    }

    #[test]
    fn test_random_state_is_lowercase_and_unique() {
        let a = random_state();
        let b = random_state();
        assert_ne!(a, b);
        assert_eq!(a, a.to_lowercase());
        assert!(a.len() >= 24);
    }

    #[test]
    fn test_pkce_pair_shape() {
        let (verifier, challenge) = pkce_pair();
        assert!(verifier.len() >= 43);
        assert_ne!(verifier, challenge);
        // Challenge must be deterministic over the verifier.
        let digest = Sha256::digest(verifier.as_bytes());
        let expect = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        assert_eq!(challenge, expect);
    }

    #[tokio::test]
    async fn test_token_exchange_non_200_falls_through() {
        let app = axum::Router::new().route(
            "/exchange",
            axum::routing::post(|| async { axum::http::StatusCode::FORBIDDEN }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = TokenExchangeConfig {
            endpoint: format!("http://{}/exchange", addr),
            client_id: "cid".into(),
            client_secret: "sec".into(),
        };
        let out = token_exchange(&reqwest::Client::new(), &config, "subject", "https://peer")
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_token_exchange_success_replaces_bearer() {
        let app = axum::Router::new().route(
            "/exchange",
            axum::routing::post(|body: String| async move {
                assert!(body.contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange"));
                axum::Json(serde_json::json!({"access_token": "swapped", "token_type": "Bearer"}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = TokenExchangeConfig {
            endpoint: format!("http://{}/exchange", addr),
            client_id: "cid".into(),
            client_secret: "sec".into(),
        };
        let out = token_exchange(&reqwest::Client::new(), &config, "subject", "https://peer")
            .await
            .unwrap();
        assert_eq!(out.as_deref(), Some("swapped"));
    }

    #[test]
    fn test_authorize_url_carries_pkce() {
        let url = authorize_url(
            "https://as.example/authorize",
            "cid",
            "http://localhost:8099/oauth/callback",
            "st",
            "ch",
            "https://mcp.example/atp",
        )
        .unwrap();
        assert!(url.contains("code_challenge=ch"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=st"));
    }
}
