use async_trait::async_trait;
use reqwest::Client;

use crate::protocol::{Method, TusRequest, TusResponse};
use crate::transport::Transport;
use crate::{TusConfig, TusError, TusResult};

/// `Transport` backed by a reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a client honoring the configured request timeout
    pub fn new(config: &TusConfig) -> TusResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TusError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn method(method: Method) -> reqwest::Method {
    match method {
        Method::Post => reqwest::Method::POST,
        Method::Head => reqwest::Method::HEAD,
        Method::Patch => reqwest::Method::PATCH,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TusRequest) -> TusResult<TusResponse> {
        let mut builder = self.client.request(method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TusError::transport(format!("request timed out: {}", e))
            } else {
                TusError::transport(e.to_string())
            }
        })?;

        let mut out = TusResponse::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                out.insert_header(name.as_str(), value);
            }
        }
        Ok(out)
    }
}
