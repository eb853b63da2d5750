//! HTTP clients for the build and analysis services, against stub servers

use axum::{extract::Multipart, http::StatusCode, routing::post, Json, Router};
use dpr::internal::{
    analyzer::client::{Analyzer, HttpAnalyzerClient, VerificationError},
    builder::client::{BuildError, BuildParams, Builder, HttpBuilderClient},
    registry::programs::ProgramSource,
};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

async fn form_fields(mut multipart: Multipart) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let data = field.bytes().await.unwrap();
        fields.insert(name, String::from_utf8_lossy(&data).to_string());
    }
    fields
}

async fn serve(app: Router) -> (String, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("stub server error");
    });
    (format!("http://{}", addr), handle)
}

/// Builder stub: measurement is derived from the submitted fields.
async fn spawn_builder() -> (String, JoinHandle<()>) {
    async fn upload(multipart: Multipart) -> (StatusCode, String) {
        let fields = form_fields(multipart).await;
        match (fields.get("program"), fields.get("SPID"), fields.get("isLinkable")) {
            (Some(program), Some(spid), Some(linkable)) if !spid.is_empty() => {
                if program.contains("syntax error") {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "build failed".to_string());
                }
                if program.contains("no measurement") {
                    return (StatusCode::OK, "\n".to_string());
                }
                (StatusCode::OK, format!("mr-{}-{}-{}\n", program.len(), spid, linkable))
            }
            _ => (StatusCode::BAD_REQUEST, "SPID not specified".to_string()),
        }
    }

    serve(Router::new().route("/upload", post(upload))).await
}

async fn spawn_analyzer() -> (String, JoinHandle<()>) {
    async fn verify(multipart: Multipart) -> (StatusCode, Json<serde_json::Value>) {
        let fields = form_fields(multipart).await;
        let Some(program) = fields.get("file") else {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"Result": "NG", "Error": "file was not sent"})),
            );
        };
        if program.contains("send(") {
            return (StatusCode::OK, Json(json!({"Result": "NG"})));
        }
        (
            StatusCode::OK,
            Json(json!({
                "Result": "OK",
                "ProcessingSpec": {
                    "Input": ["patients.csv"],
                    "Output": ["summary"],
                    "Functions": ["plib.mean", "plib.count"]
                }
            })),
        )
    }

    serve(Router::new().route("/verify", post(verify))).await
}

#[tokio::test]
async fn test_builder_client_returns_trimmed_measurement() {
    let (url, handle) = spawn_builder().await;
    let client = HttpBuilderClient::new(&url, Duration::from_secs(5)).unwrap();

    let measurement = client
        .measure(&ProgramSource::new("print(1)"), &BuildParams::new("SPID01", true))
        .await
        .unwrap();
    assert_eq!(measurement, "mr-8-SPID01-1");

    handle.abort();
}

#[tokio::test]
async fn test_builder_client_surfaces_failures() {
    let (url, handle) = spawn_builder().await;
    let client = HttpBuilderClient::new(&url, Duration::from_secs(5)).unwrap();
    let params = BuildParams::new("SPID01", false);

    let err = client
        .measure(&ProgramSource::new("syntax error"), &params)
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Rejected { status: 500, .. }));

    let err = client
        .measure(&ProgramSource::new("no measurement"), &params)
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::EmptyMeasurement));

    let err = client
        .measure(&ProgramSource::new("print(1)"), &BuildParams::new("", false))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::InvalidParams(_)));

    handle.abort();
}

#[tokio::test]
async fn test_builder_client_unreachable() {
    let client = HttpBuilderClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
    let err = client
        .measure(&ProgramSource::new("print(1)"), &BuildParams::new("SPID01", false))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BuildError::Communication(_) | BuildError::Timeout(_)
    ));
}

#[tokio::test]
async fn test_analyzer_client_parses_declared_flows() {
    let (url, handle) = spawn_analyzer().await;
    let client = HttpAnalyzerClient::new(&url, Duration::from_secs(5)).unwrap();

    let analysis = client
        .analyze(&ProgramSource::new("mean(read('patients.csv'))"))
        .await
        .unwrap();
    assert_eq!(analysis.inputs, vec!["patients.csv"]);
    assert_eq!(analysis.outputs, vec!["summary"]);
    assert_eq!(analysis.called_functions, vec!["plib.mean", "plib.count"]);

    handle.abort();
}

#[tokio::test]
async fn test_analyzer_client_reports_leak() {
    let (url, handle) = spawn_analyzer().await;
    let client = HttpAnalyzerClient::new(&url, Duration::from_secs(5)).unwrap();

    let err = client
        .analyze(&ProgramSource::new("send(read('patients.csv'))"))
        .await
        .unwrap_err();
    assert!(matches!(err, VerificationError::LeakDetected(None)));
    assert_eq!(err.to_string(), "A data leak has been detected");

    handle.abort();
}

/// Stub whose handler never answers within the client timeout.
async fn spawn_hung(path: &str) -> (String, JoinHandle<()>) {
    async fn hang() -> &'static str {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "too late"
    }

    serve(Router::new().route(path, post(hang))).await
}

#[tokio::test]
async fn test_builder_client_times_out() {
    let (url, handle) = spawn_hung("/upload").await;
    let client = HttpBuilderClient::new(&url, Duration::from_millis(300)).unwrap();

    let err = client
        .measure(&ProgramSource::new("print(1)"), &BuildParams::new("SPID01", false))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Timeout(_)), "unexpected error: {err}");

    handle.abort();
}

#[tokio::test]
async fn test_analyzer_client_times_out() {
    let (url, handle) = spawn_hung("/verify").await;
    let client = HttpAnalyzerClient::new(&url, Duration::from_millis(300)).unwrap();

    let err = client
        .analyze(&ProgramSource::new("print(1)"))
        .await
        .unwrap_err();
    assert!(matches!(err, VerificationError::Timeout(_)), "unexpected error: {err}");

    handle.abort();
}
