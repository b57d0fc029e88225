//! End-to-end coverage of the front server's HTTP surface: registration, dispatch, path
//! passthrough, and teardown, driven over real sockets the way `oprf-service`'s own test suite
//! drives its router (`TestServer::builder().http_transport()` rather than the in-memory
//! transport, since the proxy under test dials a real upstream TCP connection).

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::any;
use axum::{Router, http::Uri};
use axum_test::TestServer;
use futures::{SinkExt, StreamExt};
use http::StatusCode;
use metrics_exporter_prometheus::PrometheusBuilder;
use sessiongate_core::registry::SessionRegistry;
use sessiongate_core::session_id::SessionIdentifier;
use sessiongate_core::upstream::{Credentials, TlsMaterial, UpstreamClientConfig};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

/// Starts a bare upstream server that echoes back the request path and query it received, so
/// tests can assert on exactly what reached it.
async fn start_upstream() -> SocketAddr {
    async fn echo_path(uri: Uri) -> impl IntoResponse {
        (
            StatusCode::OK,
            format!(
                "{}{}",
                uri.path(),
                uri.query().map(|q| format!("?{q}")).unwrap_or_default()
            ),
        )
    }

    let router = Router::new().route("/{*rest}", any(echo_path)).route(
        "/",
        any(|| async { (StatusCode::OK, "/".to_string()) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn start_upstream_with_body(status: StatusCode, body: &'static str) -> SocketAddr {
    async fn handler(State((status, body)): State<(StatusCode, &'static str)>) -> impl IntoResponse {
        (status, body)
    }

    let router = Router::new()
        .route("/{*rest}", any(handler))
        .route("/", any(handler))
        .with_state((status, body));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Starts an upstream that sleeps for `delay` before responding, so tests can race an in-flight
/// request against a concurrent `unregister`.
async fn start_slow_upstream(delay: Duration) -> SocketAddr {
    async fn handler(State(delay): State<Duration>) -> impl IntoResponse {
        tokio::time::sleep(delay).await;
        (StatusCode::OK, "slow-response")
    }

    let router = Router::new()
        .route("/{*rest}", any(handler))
        .route("/", any(handler))
        .with_state(delay);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Starts an upstream that upgrades to a WebSocket and echoes every text frame back, so tests can
/// exercise the splicing path end to end.
async fn start_upstream_ws_echo() -> SocketAddr {
    async fn handler(ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(|mut socket| async move {
            while let Some(Ok(msg)) = socket.next().await {
                match msg {
                    AxumMessage::Text(text) => {
                        if socket.send(AxumMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    AxumMessage::Close(_) => break,
                    _ => {}
                }
            }
        })
    }

    let router = Router::new()
        .route("/{*rest}", any(handler))
        .route("/", any(handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Starts the front server's router on a real socket, for tests that need to drive it with a
/// non-HTTP client (a raw WebSocket handshake) that `axum_test`'s transport cannot perform.
async fn start_front_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn upstream_config(addr: SocketAddr, path: &str) -> UpstreamClientConfig {
    UpstreamClientConfig {
        base_url: format!("http://{addr}{path}").parse().unwrap(),
        tls: TlsMaterial {
            ca_pem: None,
            client_identity: None,
        },
        credentials: Credentials::Anonymous,
    }
}

fn test_server(registry: SessionRegistry) -> TestServer {
    let prometheus_handle = PrometheusBuilder::new().build_recorder().handle();
    let app = sessiongate_core::router(registry, prometheus_handle);
    TestServer::builder()
        .http_transport()
        .build(app)
        .expect("test server should build")
}

#[tokio::test]
async fn healthz_and_readyz_are_always_ok() {
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let server = test_server(registry);

    assert_eq!(server.get("/healthz").await.status_code(), StatusCode::OK);
    assert_eq!(server.get("/readyz").await.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_session_is_404() {
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let server = test_server(registry);

    let response = server.get("/sessiongate/nope/kas/api/v1").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(response.text(), "Session not found");
}

#[tokio::test]
async fn basic_get_reaches_upstream_with_rewritten_path() {
    let upstream_addr = start_upstream().await;
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s1").unwrap();
    registry
        .register(id.clone(), upstream_config(upstream_addr, "/base"))
        .await
        .unwrap();

    let server = test_server(registry);
    let response = server
        .get("/sessiongate/s1/kas/api/v1/namespaces")
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "/base/api/v1/namespaces");
}

#[tokio::test]
async fn empty_rest_maps_to_upstream_base_path() {
    let upstream_addr = start_upstream().await;
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s1").unwrap();
    registry
        .register(id.clone(), upstream_config(upstream_addr, "/base"))
        .await
        .unwrap();

    let server = test_server(registry);
    let response = server.get("/sessiongate/s1/kas").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "/base");
}

#[tokio::test]
async fn query_string_is_preserved_verbatim() {
    let upstream_addr = start_upstream().await;
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s1").unwrap();
    registry
        .register(id.clone(), upstream_config(upstream_addr, "/base"))
        .await
        .unwrap();

    let server = test_server(registry);
    let response = server
        .get("/sessiongate/s1/kas/api/v1/pods?watch=true&limit=10")
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "/base/api/v1/pods?watch=true&limit=10");
}

#[tokio::test]
async fn duplicate_register_keeps_first_sessions_credentials() {
    let first_upstream = start_upstream_with_body(StatusCode::OK, "from-first").await;
    let second_upstream = start_upstream_with_body(StatusCode::OK, "from-second").await;
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s2").unwrap();

    let first_endpoint = registry
        .register(id.clone(), upstream_config(first_upstream, "/base"))
        .await
        .unwrap();
    let second_endpoint = registry
        .register(id.clone(), upstream_config(second_upstream, "/base"))
        .await
        .unwrap();
    assert_eq!(first_endpoint, second_endpoint);
    assert_eq!(registry.len(), 1);

    let server = test_server(registry);
    let response = server.get("/sessiongate/s2/kas/api").await;
    assert_eq!(response.text(), "from-first");
}

#[tokio::test]
async fn unregister_makes_subsequent_requests_404() {
    let upstream_addr = start_upstream().await;
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s3").unwrap();
    registry
        .register(id.clone(), upstream_config(upstream_addr, "/base"))
        .await
        .unwrap();

    let server = test_server(registry.clone());
    assert_eq!(
        server.get("/sessiongate/s3/kas/api/v1").await.status_code(),
        StatusCode::OK
    );

    registry.unregister(&id).await;

    let response = server.get("/sessiongate/s3/kas/api/v1").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(response.text(), "Session not found");
}

#[tokio::test]
async fn upstream_unreachable_is_bad_gateway() {
    // Nothing listens here: a closed loopback port refuses the connection immediately.
    let dead_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s4").unwrap();
    registry
        .register(id.clone(), upstream_config(dead_addr, "/base"))
        .await
        .unwrap();

    let server = test_server(registry);
    let response = server.get("/sessiongate/s4/kas/api").await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    assert!(response.text().contains("s4"));
}

#[tokio::test]
async fn unregister_cancels_a_slow_in_flight_request() {
    let upstream_addr = start_slow_upstream(Duration::from_secs(5)).await;
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s5").unwrap();
    registry
        .register(id.clone(), upstream_config(upstream_addr, "/base"))
        .await
        .unwrap();

    let server = test_server(registry.clone());
    let request = async { server.get("/sessiongate/s5/kas/api/v1/pods").await };
    let unregister = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.unregister(&id).await;
    };

    let (response, _) = tokio::join!(request, unregister);
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn websocket_upgrade_splices_bytes_both_ways() {
    let upstream_addr = start_upstream_ws_echo().await;
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s6").unwrap();
    registry
        .register(id.clone(), upstream_config(upstream_addr, "/base"))
        .await
        .unwrap();

    let prometheus_handle = PrometheusBuilder::new().build_recorder().handle();
    let app = sessiongate_core::router(registry, prometheus_handle);
    let front_addr = start_front_server(app).await;

    let url = format!("ws://{front_addr}/sessiongate/s6/kas/echo");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket handshake through the proxy should succeed");

    ws.send(WsMessage::text("hello")).await.unwrap();
    match ws.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => assert_eq!(text.to_string(), "hello"),
        other => panic!("unexpected message: {other:?}"),
    }

    let _ = ws.close(None).await;
}

#[tokio::test]
async fn unregister_terminates_an_open_websocket_splice() {
    let upstream_addr = start_upstream_ws_echo().await;
    let registry = SessionRegistry::new("https://ingress.example", CancellationToken::new());
    let id = SessionIdentifier::new("s7").unwrap();
    registry
        .register(id.clone(), upstream_config(upstream_addr, "/base"))
        .await
        .unwrap();

    let prometheus_handle = PrometheusBuilder::new().build_recorder().handle();
    let app = sessiongate_core::router(registry.clone(), prometheus_handle);
    let front_addr = start_front_server(app).await;

    let url = format!("ws://{front_addr}/sessiongate/s7/kas/echo");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket handshake through the proxy should succeed");

    ws.send(WsMessage::text("ping")).await.unwrap();
    match ws.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => assert_eq!(text.to_string(), "ping"),
        other => panic!("unexpected message: {other:?}"),
    }

    registry.unregister(&id).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), ws.next()).await;
    match outcome {
        Ok(None) => {}
        Ok(Some(Ok(WsMessage::Close(_)))) => {}
        Ok(Some(Err(_))) => {}
        other => panic!("expected unregister to terminate the splice, got {other:?}"),
    }
}
