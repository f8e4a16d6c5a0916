//! Identity resolution for incoming requests.
//!
//! Two credential shapes are accepted: a bearer access token (an HS256
//! JWT whose `sub` is the user id; issuance and refresh live in the
//! identity service) and an API key with the literal `cmk_` prefix,
//! resolved against the users table. Everything downstream of this module
//! receives an already-resolved identity — the state machine never sees a
//! credential.

use crate::config::Config;
use crate::error::ApiError;
use crate::store::GameStore;
use actix_web::HttpRequest;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an access token.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// The user id.
    sub: String,
    exp: usize,
}

/// A resolved caller identity.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub display_name: String,
}

/// Pulls the credential out of the request, if any: `Authorization:
/// Bearer <jwt>`, an `Authorization` header carrying a raw `cmk_` key,
/// or the `X-Api-Key` header.
fn credential(req: &HttpRequest) -> Option<String> {
    if let Some(value) = req.headers().get("Authorization")
        && let Ok(value) = value.to_str()
    {
        let value = value.trim();
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
        if value.starts_with("cmk_") {
            return Some(value.to_string());
        }
    }
    if let Some(value) = req.headers().get("X-Api-Key")
        && let Ok(value) = value.to_str()
    {
        return Some(value.trim().to_string());
    }
    None
}

/// Resolves the caller, if credentials are present. Anonymous requests
/// resolve to `None`; malformed or unknown credentials are an error so a
/// client with a bad key hears about it instead of playing anonymously.
pub async fn resolve(
    req: &HttpRequest,
    store: &GameStore,
    config: &Config,
) -> Result<Option<AuthedUser>, ApiError> {
    let Some(credential) = credential(req) else {
        return Ok(None);
    };

    if let Some(key) = credential.strip_prefix("cmk_") {
        let full_key = format!("cmk_{}", key);
        let user = store
            .get_user_by_api_key(&full_key)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("unknown API key".to_string()))?;
        return Ok(Some(AuthedUser {
            user_id: user.user_id,
            display_name: user.display_name,
        }));
    }

    let data = decode::<Claims>(
        &credential,
        &DecodingKey::from_secret(config.jwt_access_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|err| ApiError::Unauthorized(format!("invalid access token: {}", err)))?;

    let user_id = data.claims.sub;
    let display_name = store
        .get_user(&user_id)
        .await?
        .map(|user| user.display_name)
        .unwrap_or_else(|| user_id.clone());

    Ok(Some(AuthedUser {
        user_id,
        display_name,
    }))
}

/// Like [`resolve`], but authentication is mandatory.
pub async fn require(
    req: &HttpRequest,
    store: &GameStore,
    config: &Config,
) -> Result<AuthedUser, ApiError> {
    resolve(req, store, config)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_ms;
    use crate::store::{connect, UserAccount};
    use actix_web::test::TestRequest;
    use jsonwebtoken::{encode, EncodingKey, Header};

    async fn store_with_user() -> GameStore {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = GameStore::new(pool);
        store.init_schema().await.unwrap();
        store
            .upsert_user(
                &UserAccount {
                    user_id: "u-1".into(),
                    display_name: "Alice".into(),
                    api_key: Some("cmk_testkey".into()),
                    auto_decline_draws: false,
                },
                now_ms(),
            )
            .await
            .unwrap();
        store
    }

    fn token(config: &Config, sub: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_access_secret.as_bytes()),
        )
        .unwrap()
    }

    #[actix_web::test]
    async fn bearer_token_resolves_the_subject() {
        let store = store_with_user().await;
        let config = Config::default();
        let req = TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {}", token(&config, "u-1"))))
            .to_http_request();
        let user = resolve(&req, &store, &config).await.unwrap().unwrap();
        assert_eq!(user.user_id, "u-1");
        assert_eq!(user.display_name, "Alice");
    }

    #[actix_web::test]
    async fn api_key_resolves_via_the_users_table() {
        let store = store_with_user().await;
        let config = Config::default();
        let req = TestRequest::default()
            .insert_header(("X-Api-Key", "cmk_testkey"))
            .to_http_request();
        let user = resolve(&req, &store, &config).await.unwrap().unwrap();
        assert_eq!(user.user_id, "u-1");

        let req = TestRequest::default()
            .insert_header(("X-Api-Key", "cmk_wrong"))
            .to_http_request();
        assert!(resolve(&req, &store, &config).await.is_err());
    }

    #[actix_web::test]
    async fn missing_credentials_resolve_to_anonymous() {
        let store = store_with_user().await;
        let config = Config::default();
        let req = TestRequest::default().to_http_request();
        assert!(resolve(&req, &store, &config).await.unwrap().is_none());

        assert!(require(&req, &store, &config).await.is_err());
    }

    #[actix_web::test]
    async fn garbage_bearer_tokens_are_rejected() {
        let store = store_with_user().await;
        let config = Config::default();
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer not-a-jwt"))
            .to_http_request();
        assert!(resolve(&req, &store, &config).await.is_err());
    }
}
