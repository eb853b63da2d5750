use futures::future::try_join_all;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::internal::governance::library::{GovernanceError, LibraryGovernance};

const LIBRARY_FILE_NAME: &str = "plib.py";
const ACK_BODY: &str = "Updated";

/// A build or verification node that must run against the approved library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownstreamNode {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PropagationMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropagationReport {
    pub bundle_bytes: usize,
    pub nodes: Vec<String>,
}

/// Pushes the accepted-function bundle to every downstream node.
///
/// There is no rollback: when a push fails, nodes updated before it keep the
/// new library and the operator re-runs propagation until all converge.
#[derive(Debug, Clone)]
pub struct LibraryPropagator {
    client: reqwest::Client,
    nodes: Vec<DownstreamNode>,
    mode: PropagationMode,
}

impl LibraryPropagator {
    pub fn new(
        nodes: Vec<DownstreamNode>,
        mode: PropagationMode,
        timeout: Duration,
    ) -> Result<Self, PropagationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PropagationError::Client(e.to_string()))?;
        Ok(Self {
            client,
            nodes,
            mode,
        })
    }

    /// Recomputes the current library and pushes it to all nodes.
    #[tracing::instrument(skip(self, governance))]
    pub async fn propagate_library(
        &self,
        caller: &str,
        governance: &LibraryGovernance,
    ) -> Result<PropagationReport, PropagationError> {
        let bundle = governance.current_library_bundle(caller).await?;
        self.push_bundle(&bundle).await
    }

    pub async fn push_bundle(&self, bundle: &str) -> Result<PropagationReport, PropagationError> {
        match self.mode {
            PropagationMode::Sequential => {
                for node in &self.nodes {
                    self.push_to(node, bundle).await?;
                }
            }
            PropagationMode::Parallel => {
                try_join_all(self.nodes.iter().map(|node| self.push_to(node, bundle))).await?;
            }
        }

        tracing::info!(nodes = self.nodes.len(), bytes = bundle.len(), "library propagated");
        Ok(PropagationReport {
            bundle_bytes: bundle.len(),
            nodes: self.nodes.iter().map(|n| n.name.clone()).collect(),
        })
    }

    async fn push_to(&self, node: &DownstreamNode, bundle: &str) -> Result<(), PropagationError> {
        let result = self.send_update(node, bundle).await;
        if let Err(reason) = &result {
            tracing::warn!(node = %node.name, url = %node.url, %reason, "library update not acknowledged");
        }
        result.map_err(|reason| PropagationError::Node {
            node: node.name.clone(),
            url: node.url.clone(),
            reason,
        })
    }

    async fn send_update(&self, node: &DownstreamNode, bundle: &str) -> Result<(), String> {
        let lib = Part::bytes(bundle.as_bytes().to_vec()).file_name(LIBRARY_FILE_NAME);
        let form = Form::new().part("lib", lib);
        let update_url = format!("{}/update", node.url.trim_end_matches('/'));

        let response = self
            .client
            .post(update_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;

        if status.is_success() && is_acknowledgement(&body) {
            tracing::debug!(node = %node.name, "library update acknowledged");
            Ok(())
        } else {
            Err(format!("status {}, body {:?}", status, body.trim()))
        }
    }
}

/// Nodes answer either the bare text or a JSON-encoded string, byte for byte.
fn is_acknowledgement(body: &str) -> bool {
    body == ACK_BODY || body.strip_prefix('"').and_then(|b| b.strip_suffix('"')) == Some(ACK_BODY)
}

#[derive(Debug, thiserror::Error)]
pub enum PropagationError {
    #[error("Library propagation to {node} ({url}) failed: {reason}")]
    Node {
        node: String,
        url: String,
        reason: String,
    },
    #[error("Propagation client error: {0}")]
    Client(String),
    #[error(transparent)]
    Governance(#[from] GovernanceError),
}
