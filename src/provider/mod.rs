//! Voice Provider Adapter (spec.md §5): the boundary between this control
//! plane and the actual telephony/voice-agent platform dialing the call.
//! The SDK/protocol details of that platform are out of scope; only the
//! thin request/response contract is modeled here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

#[async_trait]
pub trait VoiceProviderAdapter: Send + Sync {
    /// Places an outbound call and returns the provider's execution id,
    /// which later webhooks use to correlate back to this call.
    async fn start_call(&self, call_id: Uuid, phone: &str, agent_id: Uuid) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct StartCallRequest<'a> {
    internal_call_id: Uuid,
    agent_id: Uuid,
    phone_number: &'a str,
}

#[derive(Debug, Deserialize)]
struct StartCallResponse {
    execution_id: String,
}

pub struct HttpVoiceProviderAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpVoiceProviderAdapter {
    pub fn new(base_url: String, api_key: String, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build voice provider client: {e}")))?;
        Ok(Self { client, base_url, api_key })
    }
}

#[async_trait]
impl VoiceProviderAdapter for HttpVoiceProviderAdapter {
    async fn start_call(&self, call_id: Uuid, phone: &str, agent_id: Uuid) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/calls", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&StartCallRequest { internal_call_id: call_id, agent_id, phone_number: phone })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::Provider(e)
                }
            })?;

        let resp = resp.error_for_status().map_err(Error::Provider)?;
        let body: StartCallResponse = resp.json().await.map_err(Error::Provider)?;
        Ok(body.execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAdapter {
        execution_id: String,
    }

    #[async_trait]
    impl VoiceProviderAdapter for FakeAdapter {
        async fn start_call(&self, _call_id: Uuid, _phone: &str, _agent_id: Uuid) -> Result<String> {
            Ok(self.execution_id.clone())
        }
    }

    #[tokio::test]
    async fn fake_adapter_returns_configured_execution_id() {
        let adapter = FakeAdapter { execution_id: "exec-123".to_string() };
        let id = adapter.start_call(Uuid::new_v4(), "+15551234567", Uuid::new_v4()).await.unwrap();
        assert_eq!(id, "exec-123");
    }
}
