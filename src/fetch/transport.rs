//! HTTP transport seam.
//!
//! The fetch layer only talks to an `HttpTransport`. Production uses
//! reqwest; tests script responses without a network.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Request options. Serialized into the cache key, so two requests with
/// the same URL but different options never share a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchOptions {
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    /// URL-encoded form body, sent for POST requests.
    pub form: Vec<(String, String)>,
}

impl FetchOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post_form(form: Vec<(String, String)>) -> Self {
        Self {
            method: HttpMethod::Post,
            form,
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

/// A fully-read HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into `FetchError::Status`.
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::Status {
                status: self.status,
                url: self.url,
            })
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_str(&self.body).map_err(|e| FetchError::Parse {
            url: self.url.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed transport shared by every fetcher and the store client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;

        let mut request = match options.method {
            HttpMethod::Get => self.client.get(parsed),
            HttpMethod::Post => self.client.post(parsed).form(&options.form),
        };
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let network = |e: reqwest::Error| FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = request.send().await.map_err(network)?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(network)?;

        Ok(FetchResponse {
            url: final_url,
            status,
            body,
        })
    }
}
