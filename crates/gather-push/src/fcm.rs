use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::PushError;
use crate::message::{DeliveryReport, PushMessage};
use crate::provider::PushProvider;

const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

#[derive(Deserialize, Debug)]
pub struct ServiceAccountKey {
    pub private_key: String,
    pub client_email: String,
    pub token_uri: String,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Firebase Cloud Messaging HTTP v1 client.
///
/// Authenticates with a service account: a signed JWT assertion is exchanged
/// for an OAuth2 access token, which is cached until shortly before it
/// expires.
pub struct FcmClient {
    http: reqwest::Client,
    key: ServiceAccountKey,
    project_id: String,
    cached_token: RwLock<Option<(String, DateTime<Utc>)>>,
}

impl FcmClient {
    pub fn new(key: ServiceAccountKey, project_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            key,
            project_id: project_id.into(),
            cached_token: RwLock::new(None),
        }
    }

    pub fn from_key_file(path: &Path, project_id: impl Into<String>) -> Result<Self, PushError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| PushError::Credentials(format!("{}: {}", path.display(), e)))?;
        let key: ServiceAccountKey = serde_json::from_str(&data)
            .map_err(|e| PushError::Credentials(format!("{}: {}", path.display(), e)))?;

        Ok(Self::new(key, project_id))
    }

    fn endpoint(&self) -> String {
        format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.project_id
        )
    }

    async fn access_token(&self) -> Result<String, PushError> {
        let refresh_margin = Duration::minutes(5);

        if let Some((token, expiry)) = self.cached_token.read().await.as_ref() {
            if *expiry - refresh_margin > Utc::now() {
                return Ok(token.clone());
            }
        }

        let mut guard = self.cached_token.write().await;
        // Another request may have refreshed while we waited for the lock
        if let Some((token, expiry)) = guard.as_ref() {
            if *expiry - refresh_margin > Utc::now() {
                return Ok(token.clone());
            }
        }

        let assertion = self.create_assertion()?;
        let response = self.exchange_assertion(&assertion).await?;
        let expiry = Utc::now() + Duration::seconds(response.expires_in);
        *guard = Some((response.access_token.clone(), expiry));

        info!("[push] New FCM access token cached (valid until {})", expiry);
        Ok(response.access_token)
    }

    fn create_assertion(&self) -> Result<String, PushError> {
        let now = Utc::now();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(60)).timestamp(),
        };

        let key = EncodingKey::from_rsa_pem(self.key.private_key.replace("\\n", "\n").as_bytes())?;
        Ok(encode(&Header::new(Algorithm::RS256), &claims, &key)?)
    }

    async fn exchange_assertion(&self, assertion: &str) -> Result<TokenResponse, PushError> {
        let params = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion),
        ];

        let res = self.http.post(&self.key.token_uri).form(&params).send().await?;
        if !res.status().is_success() {
            let body = res.text().await?;
            return Err(PushError::TokenExchange(body));
        }

        Ok(res.json().await?)
    }

    async fn post_message(
        &self,
        access_token: &str,
        token: &str,
        message: &PushMessage,
    ) -> Result<DeliveryReport, PushError> {
        let res = self
            .http
            .post(self.endpoint())
            .bearer_auth(access_token)
            .json(&message_body(token, message))
            .send()
            .await?;

        if res.status().is_success() {
            debug!("[push] Delivered to {}", token);
            return Ok(DeliveryReport::Delivered);
        }

        let status = res.status();
        let text = res.text().await?;
        warn!("[push] FCM rejected {} with {}: {}", token, status, text);
        Ok(DeliveryReport::Rejected(format!("{}: {}", status, text)))
    }
}

/// FCM v1 request body. Data values must be strings on the wire.
fn message_body(token: &str, message: &PushMessage) -> Value {
    let data: Map<String, Value> = message
        .data
        .iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), Value::String(s))
        })
        .collect();

    json!({
        "message": {
            "token": token,
            "notification": {
                "title": message.title,
                "body": message.body,
            },
            "data": data,
            "android": {
                "priority": "high"
            }
        }
    })
}

#[async_trait]
impl PushProvider for FcmClient {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<DeliveryReport, PushError> {
        let access_token = self.access_token().await?;
        self.post_message(&access_token, token, message).await
    }

    /// The v1 API has no multicast endpoint, so each token gets its own
    /// request, issued concurrently. A transport error on one token is
    /// reported as a rejection of that token only.
    async fn send_bulk(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<Vec<DeliveryReport>, PushError> {
        let access_token = self.access_token().await?;

        let results = join_all(
            tokens
                .iter()
                .map(|token| self.post_message(&access_token, token, message)),
        )
        .await;

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|e| DeliveryReport::Rejected(e.to_string())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_stringifies_data_values() {
        let mut data = Map::new();
        data.insert("type".into(), json!("new-gathering"));
        data.insert("count".into(), json!(3));
        let message = PushMessage {
            title: "t".into(),
            body: "b".into(),
            data,
        };

        let body = message_body("tok", &message);
        assert_eq!(body["message"]["token"], "tok");
        assert_eq!(body["message"]["notification"]["title"], "t");
        assert_eq!(body["message"]["data"]["type"], "new-gathering");
        assert_eq!(body["message"]["data"]["count"], "3");
    }

    #[test]
    fn missing_key_file_is_a_credentials_error() {
        let err = FcmClient::from_key_file(Path::new("/nonexistent/key.json"), "proj")
            .err()
            .unwrap();
        assert!(matches!(err, PushError::Credentials(_)));
    }
}
