//! Program registry: attestation pipeline against fake build and analysis services

use async_trait::async_trait;
use dpr::internal::{
    analyzer::client::{Analysis, Analyzer, VerificationError},
    builder::client::{BuildError, BuildParams, Builder},
    ledger::store::Ledger,
    registry::programs::{ProgramError, ProgramRegistry, ProgramSource},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Measures sources from a fixed table.
struct TableBuilder {
    measurements: HashMap<String, String>,
    calls: AtomicUsize,
}

impl TableBuilder {
    fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            measurements: entries
                .iter()
                .map(|(source, m)| (source.to_string(), m.to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Builder for TableBuilder {
    async fn measure(&self, source: &ProgramSource, _params: &BuildParams) -> Result<String, BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = String::from_utf8_lossy(source.bytes()).to_string();
        self.measurements
            .get(&text)
            .cloned()
            .ok_or_else(|| BuildError::Rejected {
                status: 500,
                body: "build failed".to_string(),
            })
    }
}

struct FixedAnalyzer {
    verdict: Result<Analysis, String>,
}

impl FixedAnalyzer {
    fn approving(inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            verdict: Ok(Analysis {
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
                called_functions: vec!["plib.mean".to_string()],
            }),
        }
    }

    fn leaking() -> Self {
        Self {
            verdict: Err("raw input reaches output".to_string()),
        }
    }
}

#[async_trait]
impl Analyzer for FixedAnalyzer {
    async fn analyze(&self, _source: &ProgramSource) -> Result<Analysis, VerificationError> {
        self.verdict
            .clone()
            .map_err(|detail| VerificationError::LeakDetected(Some(detail)))
    }
}

fn registry(builder: TableBuilder, analyzer: FixedAnalyzer) -> ProgramRegistry {
    ProgramRegistry::new(Ledger::in_memory(), Arc::new(builder), Arc::new(analyzer))
}

fn params() -> BuildParams {
    BuildParams::new("0123456789ABCDEF", false)
}

#[tokio::test]
async fn test_register_and_get_processing_spec() {
    let registry = registry(
        TableBuilder::new(&[("print(x)", "abc123")]),
        FixedAnalyzer::approving(&["x"], &["y"]),
    );

    let registration = registry
        .register_program("Org1", "print(x)", &params())
        .await
        .unwrap();
    assert!(registration.created);
    let spec = registration.spec;
    assert_eq!(spec.measurement, "abc123");
    assert_eq!(spec.inputs, vec!["x"]);
    assert_eq!(spec.outputs, vec!["y"]);
    assert_eq!(spec.called_functions, vec!["plib.mean"]);
    assert_eq!(spec.registered_by, "Org1");
    assert_eq!(spec.summary(), "AppID(MRENCLAVE): abc123\nInput: x\nOutput: y\n");

    let fetched = registry.get_processing_spec("Org2", "abc123").await.unwrap();
    assert_eq!(fetched, spec);
}

#[tokio::test]
async fn test_leak_verdict_writes_nothing() {
    let registry = registry(
        TableBuilder::new(&[("leak()", "def456")]),
        FixedAnalyzer::leaking(),
    );

    let err = registry
        .register_program("Org1", "leak()", &params())
        .await
        .unwrap_err();
    assert!(matches!(err, ProgramError::Verification(_)));
    assert!(err.to_string().contains("A data leak has been detected"));

    assert!(registry.list_processing_specs("Org1").await.unwrap().is_empty());
    assert!(matches!(
        registry.get_processing_spec("Org1", "def456").await,
        Err(ProgramError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_build_failure_writes_nothing() {
    let registry = registry(TableBuilder::new(&[]), FixedAnalyzer::approving(&[], &[]));

    let err = registry
        .register_program("Org1", "unbuildable", &params())
        .await
        .unwrap_err();
    assert!(matches!(err, ProgramError::Build(_)));
    assert!(registry.list_processing_specs("Org1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_measurement_is_a_build_error() {
    let registry = registry(
        TableBuilder::new(&[("print(1)", "")]),
        FixedAnalyzer::approving(&[], &[]),
    );
    let err = registry
        .register_program("Org1", "print(1)", &params())
        .await
        .unwrap_err();
    assert!(matches!(err, ProgramError::Build(BuildError::EmptyMeasurement)));
}

#[tokio::test]
async fn test_empty_source_fails_before_building() {
    let builder = Arc::new(TableBuilder::new(&[]));
    let registry = ProgramRegistry::new(
        Ledger::in_memory(),
        builder.clone(),
        Arc::new(FixedAnalyzer::approving(&[], &[])),
    );

    let err = registry
        .register_program("Org1", "  \n", &params())
        .await
        .unwrap_err();
    assert!(matches!(err, ProgramError::InvalidSource(_)));
    assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reregistration_is_idempotent() {
    let registry = registry(
        TableBuilder::new(&[("print(x)", "abc123")]),
        FixedAnalyzer::approving(&["x"], &["y"]),
    );

    let first = registry
        .register_program("Org1", "print(x)", &params())
        .await
        .unwrap();
    let second = registry
        .register_program("Org2", "print(x)", &params())
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.spec, second.spec);
    assert_eq!(second.spec.registered_by, "Org1");
    assert_eq!(registry.list_processing_specs("Org1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_follows_key_order() {
    let registry = registry(
        TableBuilder::new(&[("b()", "bbb"), ("c()", "ccc"), ("a()", "aaa")]),
        FixedAnalyzer::approving(&["x"], &["y"]),
    );
    for source in ["c()", "a()", "b()"] {
        registry
            .register_program("Org1", source, &params())
            .await
            .unwrap();
    }

    let measurements: Vec<String> = registry
        .list_processing_specs("Org1")
        .await
        .unwrap()
        .into_iter()
        .map(|spec| spec.measurement)
        .collect();
    assert_eq!(measurements, vec!["aaa", "bbb", "ccc"]);
}

#[tokio::test]
async fn test_revoke_removes_spec() {
    let registry = registry(
        TableBuilder::new(&[("print(x)", "abc123")]),
        FixedAnalyzer::approving(&["x"], &["y"]),
    );
    registry
        .register_program("Org1", "print(x)", &params())
        .await
        .unwrap();

    registry
        .revoke_processing_spec("Org1", "abc123")
        .await
        .unwrap();
    assert!(matches!(
        registry.get_processing_spec("Org1", "abc123").await,
        Err(ProgramError::NotFound(_))
    ));

    let err = registry
        .revoke_processing_spec("Org1", "abc123")
        .await
        .unwrap_err();
    assert!(matches!(err, ProgramError::NotFound(ref m) if m == "abc123"));
}
