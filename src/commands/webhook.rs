use std::net::SocketAddr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use base64::Engine;
use kube::{Api, Client};
use tokio::sync::broadcast;
use tracing::{info, warn};

use k8s_openapi::api::core::v1::Pod;
use kube_spread::bookkeeping::Operation;
use kube_spread::handler::SpreadHandler;
use kube_spread::mutate::{InjectedSpread, MATCHED_WORKLOAD_SPREAD_ANNOTATION};

use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};

/* ============================= PROMETHEUS ============================= */

static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_requests_total", "Total admission webhook requests"),
        &["operation", "allowed"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SUBSET_ASSIGNMENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "webhook_subset_assignments_total",
            "Pods assigned to a WorkloadSpread subset by namespace and subset",
        ),
        &["namespace", "subset"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "webhook_request_duration_seconds",
        "Duration of admission webhook request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/* ============================= STATE ============================= */

#[derive(Clone)]
pub(crate) struct WebhookState {
    pub(crate) handler: SpreadHandler,
    pub(crate) client: Client,
    pub(crate) ready: bool,
}

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(addr_str: &str, tls_cert: &str, tls_key: &str) -> Result<()> {
    println!("Starting mutating admission webhook server...\n");
    info!("webhook_starting");

    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    // Validate TLS certificate and key files exist
    print!("  TLS ......................... ");
    validate_tls_files(tls_cert, tls_key)?;
    println!("loaded ({}, {})", tls_cert, tls_key);

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  HTTPS server ................ https://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /mutate .............. Admission review handler");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /readyz .............. Readiness probe");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Admission webhook running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let state = WebhookState {
        handler: SpreadHandler::new(client.clone()),
        client,
        ready: true,
    };

    let tls_cert = tls_cert.to_string();
    let tls_key = tls_key.to_string();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle = tokio::spawn(async move {
        start_https_server(state, http_shutdown, addr, &tls_cert, &tls_key).await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping webhook server...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("webhook_stopped");
    println!("Webhook server stopped.");
    Ok(())
}

/* ============================= TLS ============================= */

fn validate_tls_files(cert_path: &str, key_path: &str) -> Result<()> {
    if !std::path::Path::new(cert_path).exists() {
        anyhow::bail!("TLS certificate file not found: {}", cert_path);
    }
    if !std::path::Path::new(key_path).exists() {
        anyhow::bail!("TLS key file not found: {}", key_path);
    }
    Ok(())
}

/* ============================= HTTPS SERVER ============================= */

pub(crate) fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/mutate", post(admission_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route("/metrics", get(webhook_metrics_handler))
        .with_state(state)
}

async fn start_https_server(
    state: WebhookState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_webhook_router(state);

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn ready_handler(state: WebhookState) -> impl IntoResponse {
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= ADMISSION HANDLER ============================= */

async fn admission_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let review: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "invalid_admission_review");
            return (
                StatusCode::BAD_REQUEST,
                build_admission_response("", true, None, None),
            );
        }
    };

    let request = &review["request"];
    let uid = request["uid"].as_str().unwrap_or("").to_string();
    let operation = request["operation"].as_str().unwrap_or("UNKNOWN").to_string();
    let namespace = request["namespace"].as_str().unwrap_or("default").to_string();
    let resource = request["resource"]["resource"].as_str().unwrap_or("");
    let sub_resource = request["subResource"].as_str().unwrap_or("");

    let outcome = if resource == "pods" && sub_resource == "eviction" && operation == "CREATE" {
        handle_eviction(&state, &namespace, request["name"].as_str().unwrap_or("")).await
    } else if resource == "pods" && sub_resource.is_empty() && operation == "CREATE" {
        handle_create(&state, &namespace, &request["object"]).await
    } else if resource == "pods" && sub_resource.is_empty() && operation == "DELETE" {
        handle_delete(&state, &request["oldObject"]).await
    } else {
        // Not a request this webhook mutates
        AdmissionOutcome::allow()
    };

    WEBHOOK_REQUESTS
        .with_label_values(&[&operation, if outcome.allowed { "true" } else { "false" }])
        .inc();

    if !outcome.allowed {
        info!(
            namespace = %namespace,
            operation = %operation,
            message = outcome.message.as_deref().unwrap_or(""),
            "admission_rejected"
        );
    }

    (
        StatusCode::OK,
        build_admission_response(
            &uid,
            outcome.allowed,
            outcome.message.as_deref(),
            outcome.patch_b64.as_deref(),
        ),
    )
}

struct AdmissionOutcome {
    allowed: bool,
    message: Option<String>,
    patch_b64: Option<String>,
}

impl AdmissionOutcome {
    fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
            patch_b64: None,
        }
    }

    fn reject(message: String) -> Self {
        Self {
            allowed: false,
            message: Some(message),
            patch_b64: None,
        }
    }
}

async fn handle_create(
    state: &WebhookState,
    namespace: &str,
    object: &serde_json::Value,
) -> AdmissionOutcome {
    let mut pod: Pod = match serde_json::from_value(object.clone()) {
        Ok(p) => p,
        Err(e) => {
            // Fail-open: if we can't parse the pod, admit it unchanged
            info!(error = %e, "failed_to_parse_pod");
            return AdmissionOutcome::allow();
        }
    };

    let original = match serde_json::to_value(&pod) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "failed_to_serialize_pod");
            return AdmissionOutcome::allow();
        }
    };

    match state.handler.handle_pod_creation(&mut pod).await {
        Ok(true) => {
            if let Some(subset) = assigned_subset(&pod) {
                SUBSET_ASSIGNMENTS
                    .with_label_values(&[namespace, &subset])
                    .inc();
            }
            match mutation_patch(&original, &pod) {
                Ok(patch_b64) => AdmissionOutcome {
                    allowed: true,
                    message: None,
                    patch_b64,
                },
                Err(e) => AdmissionOutcome::reject(format!("failed to build pod patch: {e}")),
            }
        }
        Ok(false) => AdmissionOutcome::allow(),
        Err(e) => AdmissionOutcome::reject(format!("workloadspread admission failed: {e}")),
    }
}

async fn handle_delete(state: &WebhookState, old_object: &serde_json::Value) -> AdmissionOutcome {
    let pod: Pod = match serde_json::from_value(old_object.clone()) {
        Ok(p) => p,
        Err(e) => {
            info!(error = %e, "failed_to_parse_pod");
            return AdmissionOutcome::allow();
        }
    };

    match state.handler.handle_pod_deletion(&pod, Operation::Delete).await {
        Ok(()) => AdmissionOutcome::allow(),
        Err(e) => AdmissionOutcome::reject(format!("workloadspread accounting failed: {e}")),
    }
}

async fn handle_eviction(state: &WebhookState, namespace: &str, name: &str) -> AdmissionOutcome {
    if name.is_empty() {
        return AdmissionOutcome::allow();
    }

    // Eviction reviews carry no pod object; fetch the pod being evicted.
    let pods: Api<Pod> = Api::namespaced(state.client.clone(), namespace);
    let pod = match pods.get(name).await {
        Ok(p) => p,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return AdmissionOutcome::allow();
        }
        Err(e) => {
            warn!(namespace = %namespace, pod = %name, error = %e, "eviction_pod_lookup_failed");
            return AdmissionOutcome::reject(format!("failed to look up evicted pod: {e}"));
        }
    };

    match state
        .handler
        .handle_pod_deletion(&pod, Operation::Eviction)
        .await
    {
        Ok(()) => AdmissionOutcome::allow(),
        Err(e) => AdmissionOutcome::reject(format!("workloadspread accounting failed: {e}")),
    }
}

/// JSONPatch from the admitted pod to its mutated form, base64-encoded
/// for the AdmissionReview response. `None` when nothing changed.
fn mutation_patch(original: &serde_json::Value, mutated: &Pod) -> Result<Option<String>> {
    let mutated = serde_json::to_value(mutated).context("failed to serialize mutated pod")?;
    let patch = json_patch::diff(original, &mutated);
    if patch.0.is_empty() {
        return Ok(None);
    }
    let bytes = serde_json::to_vec(&patch).context("failed to serialize pod patch")?;
    Ok(Some(base64::engine::general_purpose::STANDARD.encode(bytes)))
}

/// Subset name stamped on the pod during mutation, for metrics labels.
fn assigned_subset(pod: &Pod) -> Option<String> {
    let raw = pod
        .metadata
        .annotations
        .as_ref()?
        .get(MATCHED_WORKLOAD_SPREAD_ANNOTATION)?;
    let injected: InjectedSpread = serde_json::from_str(raw).ok()?;
    Some(injected.subset)
}

fn build_admission_response(
    uid: &str,
    allowed: bool,
    message: Option<&str>,
    patch_b64: Option<&str>,
) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": allowed
        }
    });

    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({
            "message": msg
        });
    }

    if let Some(patch) = patch_b64 {
        response["response"]["patchType"] = serde_json::json!("JSONPatch");
        response["response"]["patch"] = serde_json::json!(patch);
    }

    response.to_string()
}

/* ============================= CERT GENERATION ============================= */

pub fn generate_certs(
    service_name: &str,
    namespace: &str,
    output_dir: &str,
    ip_sans: &[String],
) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs(service_name, namespace, ip_sans)?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    let ca_path = output_path.join("ca.crt");
    let cert_path = output_path.join("tls.crt");
    let key_path = output_path.join("tls.key");

    std::fs::write(&ca_path, &ca_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &key_pem).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Server certificate .......... {}", cert_path.display());
    println!("  Server key .................. {}", key_path.display());
    println!();
    println!("  Service name ................ {service_name}");
    println!("  Namespace ................... {namespace}");
    println!("  SANs:");
    println!("    - {service_name}.{namespace}.svc");
    println!("    - {service_name}.{namespace}.svc.cluster.local");
    for ip in ip_sans {
        println!("    - {ip} (IP)");
    }
    println!();
    println!("TLS certificates generated successfully.");

    Ok(())
}

pub fn generate_self_signed_certs(
    service_name: &str,
    namespace: &str,
    ip_sans: &[String],
) -> Result<(String, String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::net::IpAddr;

    // Generate CA key pair and certificate
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "kube-spread-webhook-ca");
    ca_dn.push(DnType::OrganizationName, "kube-spread");
    ca_params.distinguished_name = ca_dn;

    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("Failed to self-sign CA certificate")?;

    // Generate server key pair and certificate signed by the CA
    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;

    let mut sans = vec![
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc.cluster.local")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
    ];

    for ip_str in ip_sans {
        let ip: IpAddr = ip_str
            .parse()
            .context(format!("Invalid IP address for SAN: {ip_str}"))?;
        sans.push(SanType::IpAddress(ip));
    }

    server_params.subject_alt_names = sans;

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("Failed to sign server certificate")?;

    let ca_pem = ca_cert.pem();
    let cert_pem = server_cert.pem();
    let key_pem = server_key.serialize_pem();

    Ok((ca_pem, cert_pem, key_pem))
}

/* ============================= INSTALL CONFIG ============================= */

pub fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    let yaml = format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: MutatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: mutate.apps.kruise.io
    rules:
      - apiGroups: [""]
        resources: ["pods"]
        apiVersions: ["v1"]
        operations: ["CREATE", "DELETE"]
      - apiGroups: [""]
        resources: ["pods/eviction"]
        apiVersions: ["v1"]
        operations: ["CREATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /mutate
      caBundle: {ca_b64}
    failurePolicy: Ignore
    sideEffects: NoneOnDryRun
    admissionReviewVersions: ["v1"]
    namespaceSelector:
      matchExpressions:
        - key: kubernetes.io/metadata.name
          operator: NotIn
          values: ["kube-system", "kube-public", "kube-node-lease"]
"#
    );

    println!("{yaml}");
    Ok(())
}

/* ============================= TESTS ============================= */
