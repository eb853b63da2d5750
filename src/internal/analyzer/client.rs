use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::internal::registry::programs::ProgramSource;

/// Analyzer verdict wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VerdictKind {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NG")]
    Ng,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclaredFlows {
    #[serde(rename = "Input", default)]
    pub inputs: Vec<String>,
    #[serde(rename = "Output", default)]
    pub outputs: Vec<String>,
    #[serde(rename = "Functions", default)]
    pub functions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerResponse {
    #[serde(rename = "Result")]
    pub result: VerdictKind,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "ProcessingSpec", default)]
    pub processing_spec: Option<DeclaredFlows>,
}

/// Outcome of a successful information-flow analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub called_functions: Vec<String>,
}

impl From<DeclaredFlows> for Analysis {
    fn from(flows: DeclaredFlows) -> Self {
        Self {
            inputs: flows.inputs,
            outputs: flows.outputs,
            called_functions: flows.functions,
        }
    }
}

impl AnalyzerResponse {
    pub fn into_analysis(self) -> Result<Analysis, VerificationError> {
        match self.result {
            VerdictKind::Ng => Err(VerificationError::LeakDetected(self.error)),
            VerdictKind::Ok => Ok(self.processing_spec.unwrap_or_default().into()),
        }
    }
}

/// Decides whether a program can leak the data it processes.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, source: &ProgramSource) -> Result<Analysis, VerificationError>;
}

/// Client for the analysis service's `/verify` endpoint.
#[derive(Debug, Clone)]
pub struct HttpAnalyzerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnalyzerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, VerificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerificationError::Communication(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzerClient {
    async fn analyze(&self, source: &ProgramSource) -> Result<Analysis, VerificationError> {
        let file = Part::bytes(source.bytes().to_vec()).file_name(source.file_name().to_string());
        let form = Form::new().part("file", file);

        let verify_url = format!("{}/verify", self.base_url);
        tracing::debug!(url = %verify_url, "submitting program to analyzer");

        let response = self
            .client
            .post(verify_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VerificationError::Timeout(e.to_string())
                } else {
                    VerificationError::Communication(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(VerificationError::BadRequest);
        }
        if !response.status().is_success() {
            return Err(VerificationError::Communication(format!(
                "Analysis server responded with status {}",
                response.status()
            )));
        }

        let verdict: AnalyzerResponse = response
            .json()
            .await
            .map_err(|e| VerificationError::InvalidResponse(e.to_string()))?;

        verdict.into_analysis()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("A data leak has been detected{}", leak_detail(.0))]
    LeakDetected(Option<String>),
    #[error("Analysis server: 400 Bad Request")]
    BadRequest,
    #[error("Analysis service communication error: {0}")]
    Communication(String),
    #[error("Analysis service timed out: {0}")]
    Timeout(String),
    #[error("Invalid analysis response: {0}")]
    InvalidResponse(String),
}

fn leak_detail(detail: &Option<String>) -> String {
    match detail {
        Some(detail) if !detail.is_empty() => format!(": {}", detail),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_verdict_maps_declared_flows() {
        let raw = r#"{"Result":"OK","ProcessingSpec":{"Input":["x"],"Output":["y"],"Functions":["plib.mean"]}}"#;
        let response: AnalyzerResponse = serde_json::from_str(raw).unwrap();
        let analysis = response.into_analysis().unwrap();
        assert_eq!(analysis.inputs, vec!["x"]);
        assert_eq!(analysis.outputs, vec!["y"]);
        assert_eq!(analysis.called_functions, vec!["plib.mean"]);
    }

    #[test]
    fn test_ng_verdict_is_a_leak() {
        let raw = r#"{"Result":"NG","Error":"Incorrect format."}"#;
        let response: AnalyzerResponse = serde_json::from_str(raw).unwrap();
        let err = response.into_analysis().unwrap_err();
        assert!(matches!(err, VerificationError::LeakDetected(Some(_))));
        assert_eq!(err.to_string(), "A data leak has been detected: Incorrect format.");
    }
}
