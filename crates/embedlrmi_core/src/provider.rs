use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result};

/// Repository property the provider matches the canonical page URL against.
pub const URL_PROPERTY: &str = "ccm:wwwurl";

/// Source of LRMI metadata for a canonical page URL.
pub trait MetadataProvider: Send + Sync {
    /// One lookup, no retries. Any `Err` means "no metadata this time".
    fn query(&self, canonical_url: &str) -> Result<Value>;
}

/// Search body the repository expects: a single criterion on [`URL_PROPERTY`].
pub fn search_criteria(canonical_url: &str) -> Value {
    json!({
        "criteria": [
            {
                "property": URL_PROPERTY,
                "values": [canonical_url],
            }
        ]
    })
}

/// Blocking HTTP provider. Every request carries a client-side timeout.
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    user_agent: String,
}

impl HttpProvider {
    pub fn new(endpoint: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            user_agent: user_agent.to_string(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(&settings.endpoint, settings.http_timeout, &settings.user_agent)
    }
}

impl MetadataProvider for HttpProvider {
    fn query(&self, canonical_url: &str) -> Result<Value> {
        let body = search_criteria(canonical_url);
        debug!(endpoint = %self.endpoint, %body, "querying LRMI provider");

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, self.user_agent.clone())
            .json(&body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                endpoint: self.endpoint.clone(),
            });
        }

        let text = response.text()?;
        debug!(bytes = text.len(), "provider response received");
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // The blocking client owns its own runtime, so it is built, used and dropped off the
    // async test thread.
    async fn query_blocking(endpoint: String, timeout: Duration, url: &str) -> Result<Value> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            let provider = HttpProvider::new(&endpoint, timeout, "embedlrmi-test/1.0")?;
            provider.query(&url)
        })
        .await
        .expect("blocking task")
    }

    #[test]
    fn search_criteria_wraps_url() {
        assert_eq!(
            search_criteria("https://example.org/wiki/Foo"),
            json!({"criteria": [{"property": "ccm:wwwurl", "values": ["https://example.org/wiki/Foo"]}]})
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn posts_criteria_with_json_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("Content-Type", "application/json"))
            .and(header("Accept", "application/json"))
            .and(header("User-Agent", "embedlrmi-test/1.0"))
            .and(body_json(search_criteria("https://example.org/wiki/Foo")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"nodes": [{"name": "Foo Lesson"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let payload = query_blocking(
            format!("{}/search", server.uri()),
            Duration::from_secs(5),
            "https://example.org/wiki/Foo",
        )
        .await
        .expect("query");
        assert_eq!(payload["nodes"][0]["name"], "Foo Lesson");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_error_maps_to_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let error = query_blocking(server.uri(), Duration::from_secs(5), "https://example.org/a")
            .await
            .expect_err("must fail");
        assert!(matches!(error, Error::Status { status: 500, .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_body_maps_to_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let error = query_blocking(server.uri(), Duration::from_secs(5), "https://example.org/a")
            .await
            .expect_err("must fail");
        assert!(matches!(error, Error::Parse(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_provider_hits_client_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"nodes": []}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let error = query_blocking(
            server.uri(),
            Duration::from_millis(200),
            "https://example.org/a",
        )
        .await
        .expect_err("must time out");
        match error {
            Error::Transport(inner) => assert!(inner.is_timeout()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unreachable_endpoint_is_transport_error() {
        let provider = HttpProvider::new(
            "http://127.0.0.1:9/search",
            Duration::from_secs(2),
            "embedlrmi-test/1.0",
        )
        .expect("provider");
        let error = provider
            .query("https://example.org/a")
            .expect_err("must fail");
        assert!(matches!(error, Error::Transport(_)));
    }
}
