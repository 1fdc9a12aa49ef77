//! End-to-end OIDC flow tests
//!
//! Drives the full router the way a client application would:
//! - discovery and JWKS publication
//! - authorization-code grant with PKCE
//! - userinfo resolution from the access token
//! - refresh grant and its platform-session pinning

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use sha2::{Digest, Sha256};
use tower::ServiceExt;
use url::Url;

use oidc_provider::config::ProviderConfig;
use oidc_provider::directory::{
    ClientDirectory, InMemoryClientDirectory, InMemoryUserDirectory, OidcClient, OidcClientSpec,
    OidcClientStatus, SessionToken, User, UserAttributes,
};
use oidc_provider::lifecycle::ClientSecretController;
use oidc_provider::store::{InMemoryObjectStore, ObjectStore};
use oidc_provider::{routes, Provider};

const CALLBACK: &str = "https://app.example.com/callback";
const VERIFIER: &str = "a-code-verifier-of-sufficient-length";
const COOKIE: &str = "platform_session=token-1:sekret";

struct Harness {
    app: Router,
    provider: Arc<Provider>,
    users: Arc<InMemoryUserDirectory>,
    client_id: String,
    client_secret: String,
}

async fn harness() -> Harness {
    let mut config = ProviderConfig {
        issuer: "https://platform.example.com".to_string(),
        ..ProviderConfig::default()
    };
    config.session.retry.attempts = 1;
    config.session.retry.min_delay_ms = 0;
    config.session.retry.max_delay_ms = 0;

    let clients = Arc::new(InMemoryClientDirectory::new());
    clients.insert(OidcClient {
        name: "app".to_string(),
        spec: OidcClientSpec {
            redirect_uris: vec![CALLBACK.to_string()],
            token_expiration_seconds: 3600,
            refresh_token_expiration_seconds: 86400,
        },
        status: OidcClientStatus::default(),
        annotations: BTreeMap::new(),
    });

    let users = Arc::new(InMemoryUserDirectory::new());
    users.insert_user(User {
        id: "u-1".to_string(),
        display_name: "admin".to_string(),
        enabled: true,
    });
    users.insert_attributes(
        "u-1",
        UserAttributes {
            group_principals: BTreeMap::from([(
                "local".to_string(),
                vec!["local://admins".to_string()],
            )]),
        },
    );
    users.insert_token(SessionToken {
        name: "token-1".to_string(),
        secret: "sekret".to_string(),
        user_id: "u-1".to_string(),
        auth_provider: None,
        enabled: true,
        expires_at: None,
        labels: BTreeMap::new(),
    });

    let store = Arc::new(InMemoryObjectStore::new());
    let secrets_namespace = config.namespaces.client_secrets.clone();

    let provider = Arc::new(Provider::new(config, store.clone(), clients.clone(), users.clone()));
    provider.keys.ensure_keys().await.unwrap();

    // Register the client the way the lifecycle controller would.
    let controller = ClientSecretController::new(clients.clone(), store.clone(), secrets_namespace.clone());
    let client = clients.get("app").await.unwrap();
    let client = controller.on_change(&client).await.unwrap();
    let client_id = client.status.client_id.clone();
    let client_secret = {
        let record = store.get(&secrets_namespace, &client_id).await.unwrap();
        String::from_utf8(record.data["client-secret-1"].clone()).unwrap()
    };

    Harness {
        app: routes(provider.clone()),
        provider,
        users,
        client_id,
        client_secret,
    }
}

fn challenge() -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes()))
}

fn authorize_uri(harness: &Harness, method: &str, scope: &str) -> String {
    let query = serde_urlencoded::to_string([
        ("client_id", harness.client_id.as_str()),
        ("response_type", "code"),
        ("scope", scope),
        ("code_challenge", &challenge()),
        ("code_challenge_method", method),
        ("redirect_uri", CALLBACK),
        ("state", "xyz"),
        ("nonce", "n-1"),
    ])
    .unwrap();
    format!("/oidc/authorize?{query}")
}

async fn authorize(harness: &Harness, scope: &str) -> String {
    let request = Request::builder()
        .uri(authorize_uri(harness, "S256", scope))
        .header(header::COOKIE, COOKIE)
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let location = Url::parse(
        response.headers()[header::LOCATION].to_str().unwrap(),
    )
    .unwrap();
    let params: BTreeMap<_, _> = location.query_pairs().into_owned().collect();
    assert_eq!(params["state"], "xyz");
    params["code"].clone()
}

async fn redeem(harness: &Harness, form: &[(&str, &str)]) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/oidc/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(serde_urlencoded::to_string(form).unwrap()))
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

fn decode_claims(token: &str) -> serde_json::Value {
    let payload = token.split('.').nth(1).unwrap();
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap()
}

#[tokio::test]
async fn discovery_document_matches_issuer() {
    let harness = harness().await;
    let request = Request::builder()
        .uri("/oidc/.well-known/openid-configuration")
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["issuer"], "https://platform.example.com/oidc");
    assert_eq!(
        doc["token_endpoint"],
        "https://platform.example.com/oidc/token"
    );
    assert_eq!(doc["code_challenge_methods_supported"][0], "S256");
    assert_eq!(doc["grant_types_supported"][1], "refresh_token");
}

#[tokio::test]
async fn jwks_publishes_the_signing_key() {
    let harness = harness().await;
    let request = Request::builder()
        .uri("/oidc/.well-known/jwks.json")
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let jwks: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
    assert_eq!(jwks["keys"][0]["kty"], "RSA");
    assert_eq!(jwks["keys"][0]["use"], "sig");
}

#[tokio::test]
async fn full_code_flow_with_userinfo() {
    let harness = harness().await;
    let code = authorize(&harness, "openid profile").await;

    let (status, body) = redeem(
        &harness,
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("code_verifier", VERIFIER),
            ("client_id", &harness.client_id),
            ("client_secret", &harness.client_secret),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 3600);
    assert!(body.get("refresh_token").is_none());

    let id = decode_claims(body["id_token"].as_str().unwrap());
    assert_eq!(id["iss"], "https://platform.example.com/oidc");
    assert_eq!(id["sub"], "u-1");
    assert_eq!(id["aud"][0], harness.client_id);
    assert_eq!(id["preferred_username"], "admin");
    assert_eq!(id["nonce"], "n-1");
    assert_eq!(id["exp"].as_i64().unwrap() - id["iat"].as_i64().unwrap(), 3600);

    let request = Request::builder()
        .uri("/oidc/userinfo")
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", body["access_token"].as_str().unwrap()),
        )
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["sub"], "u-1");
    assert_eq!(info["username"], "admin");
    assert_eq!(info["groups"][0], "admins");
}

#[tokio::test]
async fn token_response_is_uncacheable() {
    let harness = harness().await;
    let code = authorize(&harness, "openid").await;

    let request = Request::builder()
        .method("POST")
        .uri("/oidc/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(
            serde_urlencoded::to_string([
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("code_verifier", VERIFIER),
                ("client_id", harness.client_id.as_str()),
                ("client_secret", harness.client_secret.as_str()),
            ])
            .unwrap(),
        ))
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    assert_eq!(response.headers()[header::PRAGMA], "no-cache");
}

#[tokio::test]
async fn missing_session_redirects_to_login() {
    let harness = harness().await;
    let request = Request::builder()
        .uri(authorize_uri(&harness, "S256", "openid"))
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let location =
        Url::parse(response.headers()[header::LOCATION].to_str().unwrap()).unwrap();
    assert_eq!(location.path(), "/login");
    let params: BTreeMap<_, _> = location.query_pairs().into_owned().collect();
    assert_eq!(params["redirect_uri"], CALLBACK);
    assert_eq!(params["client_id"], harness.client_id);
}

#[tokio::test]
async fn plain_challenge_method_is_redirected_as_error() {
    let harness = harness().await;
    let request = Request::builder()
        .uri(authorize_uri(&harness, "plain", "openid"))
        .header(header::COOKIE, COOKIE)
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let location =
        Url::parse(response.headers()[header::LOCATION].to_str().unwrap()).unwrap();
    let params: BTreeMap<_, _> = location.query_pairs().into_owned().collect();
    assert_eq!(params["error"], "invalid_request");
    assert_eq!(params["state"], "xyz");
}

#[tokio::test]
async fn code_is_single_use() {
    let harness = harness().await;
    let code = authorize(&harness, "openid").await;
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("code_verifier", VERIFIER),
        ("client_id", harness.client_id.as_str()),
        ("client_secret", harness.client_secret.as_str()),
    ];

    let (status, _) = redeem(&harness, &form).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = redeem(&harness, &form).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(body["error_description"], "invalid code");
}

#[tokio::test]
async fn refresh_flow_survives_and_then_loses_its_session() {
    let harness = harness().await;
    let code = authorize(&harness, "openid offline_access").await;

    let (status, body) = redeem(
        &harness,
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("code_verifier", VERIFIER),
            ("client_id", &harness.client_id),
            ("client_secret", &harness.client_secret),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let refresh_token = body["refresh_token"].as_str().unwrap().to_string();

    let claims = decode_claims(&refresh_token);
    assert_eq!(
        claims["session_token_hash"],
        hex::encode(Sha256::digest(b"token-1"))
    );

    // Issuing the refresh token labeled the platform session for the client.
    let token = harness.provider.users.get_session_token("token-1").await.unwrap();
    assert_eq!(
        token.labels.get("oidc.management.io/client-app").map(String::as_str),
        Some("true")
    );

    // While the session lives, the grant works.
    let (status, body) = redeem(
        &harness,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", &refresh_token),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode_claims(body["id_token"].as_str().unwrap())["sub"], "u-1");

    // Revoking the platform session kills the refresh token with it.
    harness.users.remove_token("token-1");
    let (status, body) = redeem(
        &harness,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", &refresh_token),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "access_denied");
    assert_eq!(body["error_description"], "session token no longer present");
}

#[tokio::test]
async fn wrong_verifier_fails_the_grant() {
    let harness = harness().await;
    let code = authorize(&harness, "openid").await;

    let (status, body) = redeem(
        &harness,
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("code_verifier", "not-the-verifier"),
            ("client_id", &harness.client_id),
            ("client_secret", &harness.client_secret),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(body["error_description"], "failed to verify PKCE code challenge");
}
