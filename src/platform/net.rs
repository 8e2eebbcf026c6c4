//! HTTP fetch backend on reqwest
//!
//! The async client serves main-thread fetches. Worker threads use a
//! blocking client that is created and dropped on the worker itself, since
//! the blocking client must not live inside an async runtime.

use super::{BlockingFetch, FetchRequest, FetchResponse};
use crate::{Error, Result};
use futures::future::LocalBoxFuture;
use log::debug;
use std::cell::RefCell;
use std::time::Duration;

const USER_AGENT: &str = concat!("domsnap/", env!("CARGO_PKG_VERSION"));

thread_local! {
    static BLOCKING_CLIENT: RefCell<Option<reqwest::blocking::Client>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// GET `request.url` with its headers and timeout
    pub fn fetch(&self, request: FetchRequest) -> LocalBoxFuture<'static, Result<FetchResponse>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = client
                .get(&request.url)
                .timeout(Duration::from_millis(request.timeout_ms));
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder
                .send()
                .await
                .map_err(|e| Error::fetch(&request.url, e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::fetch(&request.url, format!("HTTP {}", status)));
            }
            let content_type = content_type(response.headers());
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::fetch(&request.url, e.to_string()))?;
            debug!("fetched {} ({} bytes)", request.url, body.len());
            Ok(FetchResponse {
                content_type,
                body: body.to_vec(),
            })
        })
    }
}

fn content_type(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn blocking_client() -> Result<reqwest::blocking::Client> {
    BLOCKING_CLIENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Other(format!("failed to build HTTP client: {}", e)))?;
        *slot = Some(client.clone());
        Ok(client)
    })
}

impl BlockingFetch for HttpFetcher {
    fn fetch_blocking(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let client = blocking_client()?;
        let mut builder = client
            .get(&request.url)
            .timeout(Duration::from_millis(request.timeout_ms));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .send()
            .map_err(|e| Error::fetch(&request.url, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::fetch(&request.url, format!("HTTP {}", status)));
        }
        let content_type = content_type(response.headers());
        let body = response
            .bytes()
            .map_err(|e| Error::fetch(&request.url, e.to_string()))?;
        Ok(FetchResponse {
            content_type,
            body: body.to_vec(),
        })
    }
}
