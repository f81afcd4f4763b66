//! HTTP email API transport (Resend-compatible JSON, bearer auth).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use nurture_core::config::MailConfig;
use nurture_core::{MailTransport, NurtureError, OutboundEmail, Result, TransportReceipt};

pub struct HttpApiTransport {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

impl HttpApiTransport {
    pub fn new(config: &MailConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(NurtureError::Config("mail.api_key is required for the http provider".into()));
        }
        if !config.api_url.starts_with("http://") && !config.api_url.starts_with("https://") {
            return Err(NurtureError::Config(format!("mail.api_url is not an http(s) url: {}", config.api_url)));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| NurtureError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            from: crate::from_header(config),
        })
    }

    fn payload(&self, email: &OutboundEmail) -> serde_json::Value {
        let mut body = serde_json::json!({
            "from": self.from,
            "to": [email.to],
            "subject": email.subject,
            "html": email.html,
        });
        if let Some(text) = &email.text {
            body["text"] = serde_json::Value::String(text.clone());
        }
        body
    }
}

#[async_trait]
impl MailTransport for HttpApiTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<TransportReceipt> {
        let resp = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.payload(email))
            .send()
            .await
            .map_err(|e| NurtureError::Transport(format!("email API request: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NurtureError::Transport(format!("email API {status}: {text}")));
        }

        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| NurtureError::Transport(format!("email API response: {e}")))?;
        let id = parsed
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("http-{}", uuid::Uuid::new_v4()));
        tracing::info!("📤 Email for delivery #{} sent to {} ({id})", email.delivery_id, email.to);
        Ok(TransportReceipt { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    fn email() -> OutboundEmail {
        OutboundEmail {
            delivery_id: 7,
            to: "lead@x.com".into(),
            subject: "Welcome".into(),
            html: "<p>Hi</p>".into(),
            text: Some("Hi".into()),
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/emails")
    }

    fn config(api_url: String) -> MailConfig {
        MailConfig {
            provider: "http".into(),
            api_url,
            api_key: "re_test".into(),
            from_name: "Coach".into(),
            from_address: "coach@example.com".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_api_key() {
        let cfg = MailConfig { api_key: String::new(), ..config("https://api.example.com".into()) };
        assert!(matches!(HttpApiTransport::new(&cfg), Err(NurtureError::Config(_))));
    }

    #[tokio::test]
    async fn test_posts_json_with_bearer() {
        let seen: Arc<Mutex<Option<(String, serde_json::Value)>>> = Arc::default();
        let capture = seen.clone();
        let app = Router::new().route(
            "/emails",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let capture = capture.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    *capture.lock().unwrap() = Some((auth, body));
                    Json(serde_json::json!({ "id": "re_123" }))
                }
            }),
        );
        let transport = HttpApiTransport::new(&config(serve(app).await)).unwrap();

        let receipt = transport.send(&email()).await.unwrap();
        assert_eq!(receipt.id, "re_123");

        let (auth, body) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(auth, "Bearer re_test");
        assert_eq!(body["from"], "Coach <coach@example.com>");
        assert_eq!(body["to"][0], "lead@x.com");
        assert_eq!(body["subject"], "Welcome");
        assert_eq!(body["text"], "Hi");
    }

    #[tokio::test]
    async fn test_rejection_is_transport_error() {
        let app = Router::new().route(
            "/emails",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "invalid recipient") }),
        );
        let transport = HttpApiTransport::new(&config(serve(app).await)).unwrap();
        match transport.send(&email()).await {
            Err(NurtureError::Transport(msg)) => assert!(msg.contains("422")),
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
