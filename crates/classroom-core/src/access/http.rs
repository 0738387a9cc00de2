//! HTTP clients for the authorization check and presence telemetry
//!
//! Both endpoints take a JSON `POST`. Status codes map onto the access model:
//!
//! | status            | meaning                          |
//! |-------------------|----------------------------------|
//! | 2xx               | body is an [`AccessDecision`]    |
//! | 401, 403          | denial                           |
//! | 408, 429, 5xx     | [`AccessError::Transient`]       |
//! | other 4xx         | [`AccessError::Rejected`]        |
//!
//! Connection errors and timeouts are transient as well.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{AccessDecision, AccessError, AccessRequest, AccessValidator, PresenceRecord, PresenceTelemetry};
use crate::config::AccessConfig;
use crate::error::{ClassroomError, ClassroomResult};

#[derive(Debug, Clone)]
struct Endpoint {
    client: Client,
    url: Url,
    api_key: Option<String>,
}

impl Endpoint {
    fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, AccessError> {
        let url = Url::parse(url).map_err(|e| AccessError::Malformed(format!("invalid url {}: {}", url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccessError::Transient(e.to_string()))?;
        Ok(Self { client, url, api_key })
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, body: &T) -> Result<reqwest::Response, AccessError> {
        let mut request = self.client.post(self.url.clone()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request.send().await.map_err(classify_request_error)
    }
}

fn classify_request_error(err: reqwest::Error) -> AccessError {
    if err.is_decode() {
        AccessError::Malformed(err.to_string())
    } else {
        AccessError::Transient(err.to_string())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS
}

fn config_error(field: &str, err: AccessError) -> ClassroomError {
    ClassroomError::InvalidConfiguration {
        field: field.to_string(),
        reason: err.to_string(),
    }
}

/// [`AccessValidator`] backed by the platform's validation function
#[derive(Debug, Clone)]
pub struct HttpAccessValidator {
    endpoint: Endpoint,
}

impl HttpAccessValidator {
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, AccessError> {
        Ok(Self {
            endpoint: Endpoint::new(url, api_key, timeout)?,
        })
    }

    pub fn from_config(config: &AccessConfig) -> ClassroomResult<Self> {
        let url = config.validate_url.as_deref().ok_or_else(|| ClassroomError::InvalidConfiguration {
            field: "access.validate_url".to_string(),
            reason: "not set".to_string(),
        })?;
        Self::new(url, config.api_key.clone(), config.request_timeout())
            .map_err(|e| config_error("access.validate_url", e))
    }
}

#[async_trait]
impl AccessValidator for HttpAccessValidator {
    async fn validate(&self, request: &AccessRequest) -> Result<AccessDecision, AccessError> {
        let response = self.endpoint.post(request).await?;
        let status = response.status();
        debug!("Authorization check for {} returned {}", request.participant_id, status);

        if status.is_success() {
            return response
                .json::<AccessDecision>()
                .await
                .map_err(|e| AccessError::Malformed(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // The service may still explain itself with a decision body
            let message = serde_json::from_str::<AccessDecision>(&body)
                .ok()
                .and_then(|d| d.message)
                .unwrap_or_else(|| format!("not authorized ({})", status.as_u16()));
            return Ok(AccessDecision::deny(message));
        }
        if is_transient_status(status) {
            return Err(AccessError::Transient(format!("status {}", status.as_u16())));
        }
        Err(AccessError::Rejected {
            status: status.as_u16(),
            message: body,
        })
    }
}

/// [`PresenceTelemetry`] posting join/leave records
#[derive(Debug, Clone)]
pub struct HttpPresenceTelemetry {
    endpoint: Endpoint,
}

impl HttpPresenceTelemetry {
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, AccessError> {
        Ok(Self {
            endpoint: Endpoint::new(url, api_key, timeout)?,
        })
    }

    pub fn from_config(config: &AccessConfig) -> ClassroomResult<Self> {
        let url = config.telemetry_url.as_deref().ok_or_else(|| ClassroomError::InvalidConfiguration {
            field: "access.telemetry_url".to_string(),
            reason: "not set".to_string(),
        })?;
        Self::new(url, config.api_key.clone(), config.request_timeout())
            .map_err(|e| config_error("access.telemetry_url", e))
    }
}

#[async_trait]
impl PresenceTelemetry for HttpPresenceTelemetry {
    async fn record(&self, record: &PresenceRecord) -> Result<(), AccessError> {
        let response = self.endpoint.post(record).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if is_transient_status(status) {
            Err(AccessError::Transient(format!("status {}", status.as_u16())))
        } else {
            Err(AccessError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}
