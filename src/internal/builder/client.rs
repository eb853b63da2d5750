use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::internal::registry::programs::ProgramSource;

/// Attestation parameters handed to the enclave build service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildParams {
    /// Service provider id registered with the attestation service.
    pub spid: String,
    pub linkable: bool,
}

impl BuildParams {
    pub fn new(spid: impl Into<String>, linkable: bool) -> Self {
        Self {
            spid: spid.into(),
            linkable,
        }
    }

    pub fn linkable_flag(&self) -> &'static str {
        if self.linkable {
            "1"
        } else {
            "0"
        }
    }
}

/// Builds a program inside the enclave toolchain and reports its measurement.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn measure(&self, source: &ProgramSource, params: &BuildParams) -> Result<String, BuildError>;
}

/// Client for the enclave build service's `/upload` endpoint.
#[derive(Debug, Clone)]
pub struct HttpBuilderClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBuilderClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BuildError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BuildError::Communication(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Builder for HttpBuilderClient {
    async fn measure(&self, source: &ProgramSource, params: &BuildParams) -> Result<String, BuildError> {
        if params.spid.trim().is_empty() {
            return Err(BuildError::InvalidParams("SPID not specified".to_string()));
        }

        let program = Part::bytes(source.bytes().to_vec()).file_name(source.file_name().to_string());
        let form = Form::new()
            .part("program", program)
            .text("SPID", params.spid.clone())
            .text("isLinkable", params.linkable_flag());

        let upload_url = format!("{}/upload", self.base_url);
        tracing::debug!(url = %upload_url, bytes = source.len(), "submitting program to builder");

        let response = self
            .client
            .post(upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BuildError::Timeout(e.to_string())
                } else {
                    BuildError::Communication(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BuildError::Communication(e.to_string()))?;

        if !status.is_success() {
            return Err(BuildError::Rejected {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let measurement = body.trim().to_string();
        if measurement.is_empty() {
            return Err(BuildError::EmptyMeasurement);
        }
        Ok(measurement)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Build service communication error: {0}")]
    Communication(String),
    #[error("Build service timed out: {0}")]
    Timeout(String),
    #[error("Build service responded with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Invalid build parameters: {0}")]
    InvalidParams(String),
    #[error("Cannot get MRENCLAVE: build service returned an empty measurement")]
    EmptyMeasurement,
}
