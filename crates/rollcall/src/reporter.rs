//! HTTP client for the attendance service.

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use rollcall_core::{AttendanceRecord, AttendanceReporter, ReportError};
use std::time::Duration;

/// Posts attendance records as JSON. Only `200 OK` counts as success and
/// nothing is retried.
pub struct HttpReporter {
    client: Client,
    endpoint: Url,
}

impl HttpReporter {
    pub fn new(endpoint: &str, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| anyhow::anyhow!("invalid attendance endpoint {endpoint:?}: {e}"))?;

        // The blocking client defaults to a 30s timeout; `None` here means none at all.
        let client = Client::builder().timeout(timeout).build()?;

        tracing::debug!(%endpoint, ?timeout, "attendance reporter ready");
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl AttendanceReporter for HttpReporter {
    fn report(&self, record: &AttendanceRecord) -> Result<(), ReportError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(record)
            .send()
            .map_err(|e| ReportError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        Err(ReportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
