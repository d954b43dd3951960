//! Router local config API client
//!
//! Every tree path maps to `<base_url>/api/<path>`. Responses carry a
//! `{"success": bool, "data": ...}` envelope; writes send the value as a
//! form field named `data`.

use crate::config::RouterApiConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use simselector_engine::{RouterConfigClient, SelectorError};
use std::time::Duration;
use tracing::debug;

type Result<T> = simselector_engine::Result<T>;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    /// The router reports a missing node as `{"exception": "key"}`
    fn is_missing_key(&self) -> bool {
        self.data.get("exception").and_then(Value::as_str) == Some("key")
    }
}

/// [`RouterConfigClient`] over the router's HTTP API
pub struct HttpRouterClient {
    base_url: String,
    username: String,
    password: Option<String>,
    client: reqwest::Client,
}

impl HttpRouterClient {
    /// Build a client with the configured request timeout
    pub fn new(config: &RouterApiConfig) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_matches('/'))
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Envelope> {
        let url = self.url(path);
        debug!(%method, %url, "Router API request");

        let mut req = self
            .client
            .request(method, &url)
            .basic_auth(&self.username, self.password.as_ref());
        if let Some(value) = body {
            req = req.form(&[("data", value.to_string())]);
        }

        let resp = req.send().await.map_err(router_error)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Envelope {
                success: false,
                data: serde_json::json!({"exception": "key"}),
            });
        }
        if !status.is_success() {
            return Err(SelectorError::Router(format!("{} returned {}", url, status)));
        }
        resp.json::<Envelope>().await.map_err(router_error)
    }
}

#[async_trait]
impl RouterConfigClient for HttpRouterClient {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let envelope = self.send(reqwest::Method::GET, path, None).await?;
        if envelope.success {
            Ok(Some(envelope.data))
        } else if envelope.is_missing_key() {
            Ok(None)
        } else {
            Err(SelectorError::Router(format!("GET {} failed: {}", path, envelope.data)))
        }
    }

    async fn put(&self, path: &str, value: Value) -> Result<bool> {
        let envelope = self.send(reqwest::Method::PUT, path, Some(&value)).await?;
        Ok(envelope.success)
    }

    async fn post(&self, path: &str, value: Value) -> Result<Value> {
        let envelope = self.send(reqwest::Method::POST, path, Some(&value)).await?;
        if !envelope.success {
            return Err(SelectorError::Router(format!("POST {} failed: {}", path, envelope.data)));
        }
        Ok(envelope.data)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let envelope = self.send(reqwest::Method::DELETE, path, None).await?;
        Ok(envelope.success)
    }
}

fn router_error(e: reqwest::Error) -> SelectorError {
    SelectorError::Router(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HttpRouterClient {
        HttpRouterClient::new(&RouterApiConfig {
            base_url: format!("{}/", server.uri()),
            username: "admin".into(),
            password: Some("secret".into()),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_unwraps_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/status/wan/connection_state"))
            .and(basic_auth("admin", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": "connected"})))
            .mount(&server)
            .await;

        let router = client(&server).await;
        let value = router.get("status/wan/connection_state").await.unwrap();
        assert_eq!(value, Some(json!("connected")));
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/config/wan/rules2/nope"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"success": false, "data": {"exception": "key", "key": "nope"}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/status/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let router = client(&server).await;
        assert_eq!(router.get("config/wan/rules2/nope").await.unwrap(), None);
        assert_eq!(router.get("status/gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_other_failures_are_router_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"success": false, "data": {"exception": "unauthorized"}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let router = client(&server).await;
        let err = router.get("status/system").await.unwrap_err();
        assert!(matches!(err, SelectorError::Router(_)));
        tokio_test::assert_err!(router.put("config/system/desc", json!("x")).await);
    }

    #[tokio::test]
    async fn test_writes_send_form_data() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/config/wan/rules2/0/disabled"))
            .and(body_string_contains("data=true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/config/wan/rules2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": 3})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/config/wan/rules2/2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": null})))
            .mount(&server)
            .await;

        let router = client(&server).await;
        assert!(router.put("config/wan/rules2/0/disabled", json!(true)).await.unwrap());
        assert_eq!(router.post("config/wan/rules2/", json!({"priority": 1.1})).await.unwrap(), json!(3));
        assert!(router.delete("config/wan/rules2/2").await.unwrap());
    }
}
