//! HTTP client for a remote facilitator.
//!
//! Implements the [`Facilitator`] trait over the facilitator's HTTP
//! surface, so a merchant process can run the upto session engine against a
//! facilitator deployed elsewhere: the orchestrator and sweeper consume this
//! client exactly like the in-process dispatcher.

use url::Url;

use crate::facilitator::Facilitator;
use crate::proto::{
    PaymentPayload, PaymentRequirements, SettleResponse, SupportedResponse, VerifyRequest,
    VerifyResponse, X402Version2,
};

#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("invalid facilitator URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("facilitator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("facilitator returned HTTP {0}")]
    Status(reqwest::StatusCode),
}

/// Remote facilitator reachable over HTTP.
#[derive(Debug, Clone)]
pub struct FacilitatorHttpClient {
    base_url: Url,
    http: reqwest::Client,
}

impl FacilitatorHttpClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, FacilitatorClientError> {
        Ok(self.base_url.join(path)?)
    }

    async fn post_request(
        &self,
        path: &str,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<reqwest::Response, FacilitatorClientError> {
        let body = VerifyRequest {
            x402_version: X402Version2,
            payment_payload: payload.clone(),
            payment_requirements: requirements.clone(),
        };
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FacilitatorClientError::Status(response.status()));
        }
        Ok(response)
    }
}

impl TryFrom<&str> for FacilitatorHttpClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self::new(value.parse()?))
    }
}

impl Facilitator for FacilitatorHttpClient {
    type Error = FacilitatorClientError;

    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, Self::Error> {
        let response = self.post_request("verify", payload, requirements).await?;
        Ok(response.json().await?)
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, Self::Error> {
        let response = self.post_request("settle", payload, requirements).await?;
        Ok(response.json().await?)
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        let response = self.http.get(self.endpoint("supported")?).send().await?;
        if !response.status().is_success() {
            return Err(FacilitatorClientError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}
