//! reqwest-backed clients for the dialer, conversation API and analysis hook.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use dialback_core::CallRecordId;

use super::{Analysis, ConversationFetcher, DialError, DialReceipt, DialRequest, Dialer, ExternalError};

/// Base URL plus optional bearer token, shared by all clients.
#[derive(Debug, Clone)]
struct Endpoint {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl Endpoint {
    fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ExternalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExternalError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, ExternalError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ExternalError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExternalError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await.map_err(|e| ExternalError::Network(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ExternalError::Decode(e.to_string()))
    }
}

/// `POST {base}/calls` with the phone number and call context.
#[derive(Debug, Clone)]
pub struct HttpDialer {
    endpoint: Endpoint,
}

impl HttpDialer {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ExternalError> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, api_key, timeout)?,
        })
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn place_call(&self, request: &DialRequest) -> Result<DialReceipt, DialError> {
        let body = json!({
            "to": request.phone,
            "name": request.contact_name,
            "context": request.context,
        });
        let raw = self
            .endpoint
            .send(self.endpoint.client.post(self.endpoint.url("/calls")).json(&body))
            .await?;

        let provider_call_id = ["call_id", "callSid", "call_sid", "id"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| DialError::Rejected("dialer response carried no call id".to_string()))?;
        let conversation_id = ["conversation_id", "conversationId"]
            .iter()
            .find_map(|k| raw.get(*k).and_then(Value::as_str))
            .map(str::to_string);

        debug!(provider_call_id = %provider_call_id, "dialer accepted call");
        Ok(DialReceipt {
            provider_call_id,
            conversation_id,
            raw,
        })
    }
}

/// `GET {base}/conversations/{id}`.
#[derive(Debug, Clone)]
pub struct HttpConversationFetcher {
    endpoint: Endpoint,
}

impl HttpConversationFetcher {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ExternalError> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, api_key, timeout)?,
        })
    }
}

#[async_trait]
impl ConversationFetcher for HttpConversationFetcher {
    async fn fetch(&self, conversation_id: &str) -> Result<Value, ExternalError> {
        let url = self.endpoint.url(&format!("/conversations/{conversation_id}"));
        self.endpoint.send(self.endpoint.client.get(url)).await
    }
}

/// `POST {url}` with the call record id.
#[derive(Debug, Clone)]
pub struct HttpAnalysis {
    endpoint: Endpoint,
}

impl HttpAnalysis {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ExternalError> {
        Ok(Self {
            endpoint: Endpoint::new(url, None, timeout)?,
        })
    }
}

#[async_trait]
impl Analysis for HttpAnalysis {
    async fn analyze(&self, call_record_id: CallRecordId) -> Result<(), ExternalError> {
        let body = json!({ "call_record_id": call_record_id });
        self.endpoint
            .send(self.endpoint.client.post(self.endpoint.url("")).json(&body))
            .await?;
        Ok(())
    }
}
