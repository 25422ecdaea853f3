use crate::error::DeliveryError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Request body accepted by the reporting service. `data` is itself a JSON
/// document, sent as a string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportPayload {
    pub data: String,
    pub email_address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResponse {
    pub status: u16,
    pub body: String,
}

impl DeliveryResponse {
    pub fn is_accepted(&self) -> bool {
        self.status == 200
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportClient: Send + Sync {
    async fn send(&self, payload: &ReportPayload) -> Result<DeliveryResponse, DeliveryError>;
}

pub struct HttpReportClient {
    http: reqwest::Client,
    url: String,
}

impl HttpReportClient {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReportClient for HttpReportClient {
    async fn send(&self, payload: &ReportPayload) -> Result<DeliveryResponse, DeliveryError> {
        debug!(url = %self.url, bytes = payload.data.len(), "sending report request");
        let response = self.http.post(&self.url).json(payload).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(status, body = %body, "report service responded");
        Ok(DeliveryResponse { status, body })
    }
}
