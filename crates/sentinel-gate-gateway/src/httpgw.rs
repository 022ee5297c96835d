// crates/sentinel-gate-gateway/src/httpgw.rs
// ============================================================================
// Module: HTTP Gateway Ingress
// Description: Forward proxy (with CONNECT), reverse proxy, TLS inspection.
// Purpose: Funnel proxied HTTP traffic through the canonical chain.
// Dependencies: hyper, hyper-util, reqwest, tokio-rustls
// ============================================================================

//! ## Overview
//! The proxy listener speaks plain HTTP/1.1. Absolute-form requests and
//! reverse-proxy requests (matched by path prefix) are translated into
//! `http_request` actions; a `PassThrough` verdict makes the transport layer
//! forward the original request itself. `CONNECT` is admitted through the
//! chain first, then either terminated with a minted per-host leaf (TLS
//! inspection on; every decrypted request goes through the chain too) or
//! tunneled raw (inspection off; the gateway sees the SNI but no content).
//!
//! Security posture: proxied bodies and responses are size-capped, hop-by-hop
//! headers are stripped, and denials carry structured reasons while internal
//! errors stay sanitized; see `Docs/security/threat_model.md`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use sentinel_gate_core::ActionContext;
use sentinel_gate_core::ActionReply;
use sentinel_gate_core::ActionType;
use sentinel_gate_core::CanonicalAction;
use sentinel_gate_core::Destination;
use sentinel_gate_core::GateError;
use sentinel_gate_core::GatewayKind;
use sentinel_gate_core::Protocol;
use sentinel_gate_core::outbound::destination_from_url;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::server::GatewayState;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum proxied request body size.
const MAX_PROXY_BODY: usize = 10 * 1024 * 1024;
/// Hop-by-hop headers stripped when forwarding.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// ============================================================================
// SECTION: Listener
// ============================================================================

/// Serves the proxy listener until the process shuts down.
///
/// # Errors
///
/// Returns an error string when the listener cannot be bound.
pub async fn serve_proxy(state: Arc<GatewayState>, addr: SocketAddr) -> Result<(), String> {
    let listener = TcpListener::bind(addr).await.map_err(|err| err.to_string())?;
    tracing::info!(addr = %addr, "http proxy listening");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "proxy accept failed");
                continue;
            }
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { handle(state, peer.ip(), req).await }
            });
            let served = hyper::server::conn::http1::Builder::new()
                .preserve_header_case(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await;
            if let Err(err) = served {
                tracing::debug!(error = %err, "proxy connection ended");
            }
        });
    }
}

// ============================================================================
// SECTION: Service
// ============================================================================

/// Handles one proxied request.
async fn handle(
    state: Arc<GatewayState>,
    peer_ip: IpAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = if req.method() == Method::CONNECT {
        handle_connect(state, peer_ip, req).await
    } else {
        handle_forward(state, peer_ip, req).await
    };
    Ok(response)
}

/// Extracts the credential from proxy or bearer authorization headers.
fn proxy_credential(req: &Request<Incoming>) -> Option<String> {
    use base64::Engine;
    if let Some(basic) = req
        .headers()
        .get("proxy-authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        && let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(basic)
        && let Ok(text) = String::from_utf8(decoded)
        && let Some((_, key)) = text.split_once(':')
    {
        return Some(key.to_string());
    }
    req.headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(ToString::to_string)
}

/// Maps a gate error to an HTTP proxy response.
fn error_to_response(err: &GateError) -> Response<Full<Bytes>> {
    let (status, body) = match err {
        GateError::Denied(denial) => (
            StatusCode::FORBIDDEN,
            json!({
                "error": denial.reason,
                "code": denial.code.as_str(),
                "rule_name": denial.rule_name,
                "help_text": denial.help_text,
            }),
        ),
        GateError::RateLimited {
            retry_after,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "rate limit exceeded", "retry_after_secs": retry_after.as_secs()}),
        ),
        GateError::Unauthenticated => (
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            json!({"error": "invalid credentials"}),
        ),
        GateError::Internal(_) => {
            (StatusCode::BAD_GATEWAY, json!({"error": "Internal error"}))
        }
        GateError::Timeout => {
            (StatusCode::GATEWAY_TIMEOUT, json!({"error": "Request timeout"}))
        }
    };
    json_response(status, &body)
}

/// Builds a JSON response.
fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", hyper::header::HeaderValue::from_static("application/json"));
    response
}

// ============================================================================
// SECTION: CONNECT
// ============================================================================

/// Admits a CONNECT request and either inspects or tunnels the stream.
async fn handle_connect(
    state: Arc<GatewayState>,
    peer_ip: IpAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let Some(authority) = req.uri().authority().cloned() else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({"error": "CONNECT requires an authority"}),
        );
    };
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);
    let key = proxy_credential(&req);

    let mut action = CanonicalAction::new(
        ActionType::HttpRequest,
        "CONNECT",
        Protocol::Http,
        GatewayKind::HttpGateway,
    );
    let mut dest = Destination {
        port: Some(port),
        scheme: Some("https".to_string()),
        ..Destination::default()
    };
    if host.parse::<IpAddr>().is_ok() {
        dest.ip = Some(host.clone());
    } else {
        dest.domain = Some(host.to_ascii_lowercase());
    }
    action.destination = Some(dest);

    let cx = ActionContext::new(Some(peer_ip), key);
    match state.chain.execute(&cx, action).await {
        Ok(_) => {}
        Err(err) => return error_to_response(&err),
    }

    let inspect = state.tls.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let result = match inspect {
                    Some(authority_ca) => {
                        inspect_stream(state, peer_ip, upgraded, &authority_ca, &host, port).await
                    }
                    None => tunnel_stream(upgraded, &host, port).await,
                };
                if let Err(err) = result {
                    tracing::debug!(error = %err, "connect stream ended");
                }
            }
            Err(err) => tracing::debug!(error = %err, "connect upgrade failed"),
        }
    });
    Response::new(Full::new(Bytes::new()))
}

/// Raw tunnel: bidirectional copy between the client and the destination.
async fn tunnel_stream(
    upgraded: hyper::upgrade::Upgraded,
    host: &str,
    port: u16,
) -> Result<(), String> {
    let mut server = TcpStream::connect((host, port)).await.map_err(|err| err.to_string())?;
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut server)
        .await
        .map_err(|err| err.to_string())?;
    Ok(())
}

/// TLS-terminating inspection: serve decrypted requests through the chain.
async fn inspect_stream(
    state: Arc<GatewayState>,
    peer_ip: IpAddr,
    upgraded: hyper::upgrade::Upgraded,
    authority: &crate::tlsca::TlsAuthority,
    host: &str,
    port: u16,
) -> Result<(), String> {
    let config = authority.server_config_for(host).map_err(|err| err.to_string())?;
    let acceptor = TlsAcceptor::from(config);
    let tls_stream = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|err| err.to_string())?;
    let host = host.to_string();
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        let host = host.clone();
        async move {
            let target = format!(
                "https://{host}:{port}{}",
                req.uri().path_and_query().map_or("/", |pq| pq.as_str())
            );
            let response = forward_through_chain(state, peer_ip, req, &target).await;
            Ok::<_, std::convert::Infallible>(response)
        }
    });
    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
        .map_err(|err| err.to_string())
}

// ============================================================================
// SECTION: Forward / Reverse
// ============================================================================

/// Admits a plain proxied request and forwards it on a pass-through verdict.
async fn handle_forward(
    state: Arc<GatewayState>,
    peer_ip: IpAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let target = if req.uri().authority().is_some() {
        req.uri().to_string()
    } else {
        // Reverse proxy: longest matching path prefix wins.
        let path = req.uri().path().to_string();
        let target = state.http_targets.read().ok().and_then(|targets| {
            targets
                .iter()
                .filter(|target| path.starts_with(&target.path_prefix))
                .max_by_key(|target| target.path_prefix.len())
                .map(|target| {
                    format!(
                        "{}{}",
                        target.upstream.trim_end_matches('/'),
                        req.uri().path_and_query().map_or("/", |pq| pq.as_str())
                    )
                })
        });
        match target {
            Some(target) => target,
            None => {
                return json_response(
                    StatusCode::NOT_FOUND,
                    &json!({"error": "no reverse-proxy target for path"}),
                );
            }
        }
    };
    forward_through_chain(state, peer_ip, req, &target).await
}

/// Runs one HTTP request through the chain and forwards it when admitted.
async fn forward_through_chain(
    state: Arc<GatewayState>,
    peer_ip: IpAddr,
    req: Request<Incoming>,
    target: &str,
) -> Response<Full<Bytes>> {
    let key = proxy_credential(&req);
    let method = req.method().clone();

    let mut action = CanonicalAction::new(
        ActionType::HttpRequest,
        method.as_str(),
        Protocol::Http,
        GatewayKind::HttpGateway,
    );
    action.destination = destination_from_url(target);

    let cx = ActionContext::new(Some(peer_ip), key);
    match state.chain.execute(&cx, action).await {
        Ok(ActionReply::PassThrough | ActionReply::Json(_)) => {}
        Err(err) => return error_to_response(&err),
    }

    // Admitted: the transport forwards the original request itself.
    let (parts, body) = req.into_parts();
    let body = match http_body_util::Limited::new(body, MAX_PROXY_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({"error": "request body exceeds proxy limit"}),
            );
        }
    };

    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "proxy client build failed");
            return json_response(StatusCode::BAD_GATEWAY, &json!({"error": "Internal error"}));
        }
    };
    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return json_response(StatusCode::BAD_REQUEST, &json!({"error": "bad method"}));
        }
    };
    let mut outbound = client.request(reqwest_method, target).body(body.to_vec());
    for (name, value) in &parts.headers {
        let lowered = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lowered.as_str()) || lowered == "host" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name.as_str(), value);
        }
    }
    let upstream_response = match outbound.send().await {
        Ok(response) => response,
        Err(err) if err.is_timeout() => {
            return json_response(
                StatusCode::GATEWAY_TIMEOUT,
                &json!({"error": "Request timeout"}),
            );
        }
        Err(err) => {
            tracing::warn!(error = %err, "proxy forward failed");
            return json_response(StatusCode::BAD_GATEWAY, &json!({"error": "Internal error"}));
        }
    };

    let status = upstream_response.status();
    let headers = upstream_response.headers().clone();
    let mut collected: Vec<u8> = Vec::new();
    let mut stream_response = upstream_response;
    loop {
        match stream_response.chunk().await {
            Ok(Some(chunk)) => {
                if collected.len() + chunk.len() > MAX_PROXY_BODY {
                    return json_response(
                        StatusCode::BAD_GATEWAY,
                        &json!({"error": "Internal error"}),
                    );
                }
                collected.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "proxy response read failed");
                return json_response(StatusCode::BAD_GATEWAY, &json!({"error": "Internal error"}));
            }
        }
    }

    let mut response = Response::new(Full::new(Bytes::from(collected)));
    *response.status_mut() = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK);
    for (name, value) in &headers {
        let lowered = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lowered.as_str()) || lowered == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::try_from(name.as_str()),
            hyper::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}
