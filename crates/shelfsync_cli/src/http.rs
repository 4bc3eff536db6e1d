//! Blocking reqwest transport for the HTTP remote store.

use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use shelfsync_engine::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use std::time::Duration;

/// [`HttpClient`] backed by `reqwest::blocking`.
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    /// Builds a client with a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("shelfsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Patch => Method::PATCH,
        };

        let mut builder = self
            .client
            .request(method, &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().map_err(|e| e.to_string())?.to_vec();

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}
