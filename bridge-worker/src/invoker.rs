//! HTTP invoker for compute targets.
//!
//! A binding's target is an invocation URL; the payload is POSTed as
//! JSON. A target signals an application-level failure with the
//! `x-function-error` response header, which can accompany any status
//! code and always rejects the implicated messages.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use bridge_common::invoke::{InvokeError, Invoker};

const FUNCTION_ERROR_HEADER: &str = "x-function-error";

pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("bridge-worker")
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(&self, target: &str, payload: Vec<u8>) -> Result<(), InvokeError> {
        let response = self
            .client
            .post(target)
            .body(payload)
            .send()
            .await
            .map_err(|request_error| InvokeError::Transport(request_error.to_string()))?;

        if let Some(value) = response.headers().get(FUNCTION_ERROR_HEADER) {
            let detail = value.to_str().unwrap_or("unspecified").to_owned();
            return Err(InvokeError::Function(detail));
        }

        let status = response.status();
        if !status.is_success() {
            return Err(InvokeError::Status(status.as_u16()));
        }
        Ok(())
    }
}
