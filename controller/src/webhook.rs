//! Webhook serves the version conversion endpoint for the provider CRDs.
//!
//! All served versions share a schema, so conversion rewrites `apiVersion`
//! and passes the objects through.

use std::{net::SocketAddr, path::PathBuf};

use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use tower_http::trace::TraceLayer;

use crate::Result;

/// App builds the webhook router.
pub fn app() -> Router {
    Router::new()
        .route("/convert", post(convert))
        .layer(TraceLayer::new_for_http())
}

/// Serve runs the webhook server until cancelled.
///
/// When `certs_dir` holds a `tls.crt`/`tls.key` pair, HTTPS is served;
/// otherwise plain HTTP.
pub async fn serve(
    addr: SocketAddr,
    certs_dir: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = app();
    let pair = certs_dir.map(|d| (d.join("tls.crt"), d.join("tls.key")));
    match pair {
        Some((cert, key)) if cert.exists() && key.exists() => {
            use axum_server::tls_openssl::OpenSSLConfig;
            let config = OpenSSLConfig::from_pem_file(&cert, &key)
                .map_err(|err| std::io::Error::other(err.to_string()))?;
            let handle = axum_server::Handle::new();
            let stop = handle.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                stop.graceful_shutdown(None);
            });
            info!(%addr, "started webhook server (tls)");
            axum_server::bind_openssl(addr, config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            info!(%addr, "started webhook server");
            axum::serve(TcpListener::bind(addr).await?, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await?;
        }
    }
    Ok(())
}

#[instrument(skip_all)]
async fn convert(Json(review): Json<Value>) -> Json<Value> {
    Json(convert_review(review))
}

/// Convert_review answers one ConversionReview.
fn convert_review(review: Value) -> Value {
    let req = match review.get("request") {
        Some(req) => req,
        None => {
            warn!("malformed ConversionReview: no request");
            return conversion_response(Value::Null, Err("no request present".into()));
        }
    };
    let uid = req.get("uid").cloned().unwrap_or(Value::Null);
    let desired = match req.get("desiredAPIVersion").and_then(Value::as_str) {
        Some(v) => v.to_string(),
        None => {
            return conversion_response(uid, Err("no desiredAPIVersion present".into()));
        }
    };
    let objects = req
        .get("objects")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    debug!(desired, objects = objects.len(), "converting");
    let converted: Vec<Value> = objects
        .into_iter()
        .map(|mut o| {
            o["apiVersion"] = json!(desired);
            o
        })
        .collect();
    conversion_response(uid, Ok(converted))
}

fn conversion_response(uid: Value, outcome: std::result::Result<Vec<Value>, String>) -> Value {
    let response = match outcome {
        Ok(converted) => json!({
            "uid": uid,
            "result": {"status": "Success"},
            "convertedObjects": converted,
        }),
        Err(message) => json!({
            "uid": uid,
            "result": {"status": "Failure", "message": message},
        }),
    };
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "ConversionReview",
        "response": response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_rewrites_api_version() {
        let review = json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview",
            "request": {
                "uid": "r-1",
                "desiredAPIVersion": "kubernetes.provider.dev/v1alpha1",
                "objects": [
                    {"apiVersion": "kubernetes.provider.dev/v1alpha2", "kind": "Object",
                     "metadata": {"name": "a"}},
                ],
            },
        });
        let out = convert_review(review);
        assert_eq!(
            out.pointer("/response/result/status").unwrap(),
            &json!("Success")
        );
        assert_eq!(out.pointer("/response/uid").unwrap(), &json!("r-1"));
        assert_eq!(
            out.pointer("/response/convertedObjects/0/apiVersion").unwrap(),
            &json!("kubernetes.provider.dev/v1alpha1")
        );
        assert_eq!(
            out.pointer("/response/convertedObjects/0/metadata/name").unwrap(),
            &json!("a")
        );
    }

    #[test]
    fn malformed_review_fails_cleanly() {
        let out = convert_review(json!({"kind": "ConversionReview"}));
        assert_eq!(
            out.pointer("/response/result/status").unwrap(),
            &json!("Failure")
        );
    }
}
