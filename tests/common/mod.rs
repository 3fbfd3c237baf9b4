// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use replay_http::proxy::run_proxy;
use replay_http::session::SessionStore;
use replay_http::shutdown::IdleTimer;

pub type TestClient = LegacyClient<HttpConnector, Full<Bytes>>;

// Minimal helper: start run_proxy on a free port and wait until it accepts
pub async fn start_proxy(
    storage_root: &Path,
) -> anyhow::Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
    // Choose a free port by binding then dropping
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let store = SessionStore::new(storage_root, false);
    let timer = Arc::new(IdleTimer::disabled());
    let handle = tokio::spawn(async move {
        let _ = run_proxy(addr, store, timer).await;
    });

    // Wait for server to accept connections
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            anyhow::bail!("timeout waiting for proxy to start");
        }
        if let Ok(mut s) = tokio::net::TcpStream::connect(addr).await {
            let _ = s.shutdown().await;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    Ok((handle, addr))
}

pub fn make_client() -> TestClient {
    LegacyClient::builder(TokioExecutor::new()).build_http()
}

pub async fn send(
    client: &TestClient,
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> anyhow::Result<Response<hyper::body::Incoming>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://{addr}{path}"));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = Full::new(Bytes::from(
        body.map(|b| b.to_vec()).unwrap_or_default(),
    ));
    let req = builder.body(body)?;
    Ok(client.request(req).await?)
}

pub async fn read_body(resp: Response<hyper::body::Incoming>) -> anyhow::Result<Bytes> {
    Ok(resp.into_body().collect().await?.to_bytes())
}

pub fn header_value(resp: &Response<hyper::body::Incoming>, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
