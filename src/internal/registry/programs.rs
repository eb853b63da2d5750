use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::internal::{
    analyzer::client::{Analyzer, VerificationError},
    builder::client::{BuildError, BuildParams, Builder},
    ledger::store::{Ledger, LedgerError},
};

const SPEC_PREFIX: &str = "spec/";
const PROGRAM_FILE_NAME: &str = "program.py";

fn spec_key(measurement: &str) -> String {
    format!("{}{}", SPEC_PREFIX, measurement)
}

/// Program text staged for the build and analysis requests.
#[derive(Debug, Clone)]
pub struct ProgramSource {
    file_name: String,
    bytes: Vec<u8>,
}

impl ProgramSource {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            file_name: PROGRAM_FILE_NAME.to_string(),
            bytes: source.into().into_bytes(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(|b| b.is_ascii_whitespace())
    }
}

/// Registry entry for one attested program, keyed by its enclave measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingSpec {
    pub measurement: String,
    pub registered_at: DateTime<Utc>,
    pub registered_by: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub called_functions: Vec<String>,
}

impl ProcessingSpec {
    /// Human-readable summary returned to the submitter.
    pub fn summary(&self) -> String {
        format!(
            "AppID(MRENCLAVE): {}\nInput: {}\nOutput: {}\n",
            self.measurement,
            self.inputs.join(", "),
            self.outputs.join(", ")
        )
    }
}

/// Result of [`ProgramRegistry::register_program`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub spec: ProcessingSpec,
    /// False when the measurement was already registered and the stored record came back.
    pub created: bool,
}

/// Build, verify and record data-processing programs.
#[derive(Clone)]
pub struct ProgramRegistry {
    ledger: Ledger,
    builder: Arc<dyn Builder>,
    analyzer: Arc<dyn Analyzer>,
}

impl ProgramRegistry {
    pub fn new(ledger: Ledger, builder: Arc<dyn Builder>, analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            ledger,
            builder,
            analyzer,
        }
    }

    /// Runs the attestation pipeline and commits the resulting spec.
    ///
    /// Nothing is written unless both the build and the analysis succeed. A
    /// measurement that is already registered is returned as stored.
    #[tracing::instrument(skip(self, source, params))]
    pub async fn register_program(
        &self,
        caller: &str,
        source: &str,
        params: &BuildParams,
    ) -> Result<Registration, ProgramError> {
        let source = ProgramSource::new(source);
        if source.is_blank() {
            return Err(ProgramError::InvalidSource(
                "program source is empty".to_string(),
            ));
        }

        let measurement = self.builder.measure(&source, params).await?;
        if measurement.is_empty() {
            return Err(BuildError::EmptyMeasurement.into());
        }

        let analysis = match self.analyzer.analyze(&source).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(%measurement, error = %e, "program failed verification");
                return Err(e.into());
            }
        };

        let mut tx = self.ledger.begin(caller);
        let key = spec_key(&measurement);
        if let Some(existing) = tx.get_json::<ProcessingSpec>(&key).await? {
            tracing::info!(%measurement, "program already registered");
            return Ok(Registration {
                spec: existing,
                created: false,
            });
        }

        let spec = ProcessingSpec {
            measurement: measurement.clone(),
            registered_at: tx.tx_timestamp(),
            registered_by: tx.caller_identity().to_string(),
            inputs: analysis.inputs,
            outputs: analysis.outputs,
            called_functions: analysis.called_functions,
        };
        tx.put_json(&key, &spec)?;
        tx.commit().await?;

        tracing::info!(%measurement, "program registered");
        Ok(Registration {
            spec,
            created: true,
        })
    }

    pub async fn get_processing_spec(
        &self,
        caller: &str,
        measurement: &str,
    ) -> Result<ProcessingSpec, ProgramError> {
        let mut tx = self.ledger.begin(caller);
        tx.get_json(&spec_key(measurement))
            .await?
            .ok_or_else(|| ProgramError::NotFound(measurement.to_string()))
    }

    /// All registered specs in ledger key order, which is not registration order.
    pub async fn list_processing_specs(&self, caller: &str) -> Result<Vec<ProcessingSpec>, ProgramError> {
        let mut tx = self.ledger.begin(caller);
        Ok(tx.scan_json(SPEC_PREFIX).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn revoke_processing_spec(&self, caller: &str, measurement: &str) -> Result<(), ProgramError> {
        let mut tx = self.ledger.begin(caller);
        let key = spec_key(measurement);
        if tx.get_state(&key).await?.is_none() {
            return Err(ProgramError::NotFound(measurement.to_string()));
        }
        tx.del_state(&key);
        tx.commit().await?;

        tracing::info!(%measurement, "processing spec revoked");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("Invalid program source: {0}")]
    InvalidSource(String),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("Data processing specification {0} does not exist")]
    NotFound(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
