// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::{HttpService, service_fn};
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::drain::DrainWatcher;

/// Budget for a client to finish the TLS handshake, matching the header read timeout.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn http1_server() -> http1::Builder {
    let mut b = http1::Builder::new();
    b.timer(TokioTimer::new())
        .half_close(true)
        .header_read_timeout(Duration::from_secs(2))
        .max_buf_size(8 * 1024);
    b
}

pub fn empty_response(code: hyper::StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::default())
        .expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: hyper::StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("builder with known status code should not fail")
}

/// json_response writes `body` as indented JSON.
pub fn json_response<T: Serialize + ?Sized>(
    code: hyper::StatusCode,
    body: &T,
) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(body) {
        Ok(body) => Response::builder()
            .status(code)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .expect("builder with known status code should not fail"),
        Err(e) => plaintext_response(
            hyper::StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {e}\n"),
        ),
    }
}

/// Server implements a generic HTTP server with the follow behavior:
/// * HTTP/1.1, plaintext or TLS
/// * Draining: once a drain starts, no new connections are accepted and open connections are
///   shut down gracefully.
pub struct Server<S> {
    name: String,
    listener: TcpListener,
    drain_rx: DrainWatcher,
    tls: Option<TlsAcceptor>,
    state: S,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        drain_rx: DrainWatcher,
        s: S,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("{name} server failed to bind {addr}"))?;
        Ok(Server {
            name: name.to_string(),
            listener,
            drain_rx,
            tls: None,
            state: s,
        })
    }

    /// with_tls terminates TLS on every accepted connection.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local address must be ready")
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<Incoming>, SocketAddr) -> R + Send + Sync + 'static,
        R: Future<Output = Response<Full<Bytes>>> + Send + 'static,
    {
        let address = self.address();
        let Server {
            name,
            listener,
            drain_rx,
            tls,
            state,
        } = self;
        let state = Arc::new(state);
        let f = Arc::new(f);
        info!(
            %address,
            component=%name,
            tls=tls.is_some(),
            "listener established",
        );
        tokio::spawn(async move {
            let stop = drain_rx.clone().wait_for_drain();
            tokio::pin!(stop);
            let blocker = loop {
                let (socket, peer) = tokio::select! {
                    blocker = &mut stop => break blocker,
                    res = listener.accept() => match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(component=%name, "failed to accept connection: {e}");
                            continue;
                        }
                    },
                };
                let state = state.clone();
                let f = f.clone();
                let svc = service_fn(move |req| {
                    let resp = f(state.clone(), req, peer);
                    async move { Ok::<_, Infallible>(resp.await) }
                });
                let drain = drain_rx.clone();
                let tls = tls.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    match tls {
                        None => serve_connection(&name, socket, svc, drain).await,
                        Some(acceptor) => {
                            match tokio::time::timeout(
                                TLS_HANDSHAKE_TIMEOUT,
                                acceptor.accept(socket),
                            )
                            .await
                            {
                                Ok(Ok(stream)) => {
                                    serve_connection(&name, stream, svc, drain).await
                                }
                                Ok(Err(e)) => {
                                    warn!(component=%name, %peer, "TLS handshake error: {e}")
                                }
                                Err(_) => {
                                    debug!(component=%name, %peer, "TLS handshake timed out")
                                }
                            }
                        }
                    }
                });
            };
            info!("starting drain of {name} server");
            drop(listener);
            drop(drain_rx);
            drop(blocker);
        });
    }
}

async fn serve_connection<I, Svc>(name: &str, io: I, svc: Svc, drain: DrainWatcher)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    Svc: HttpService<Incoming, ResBody = Full<Bytes>>,
    Svc::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let conn = http1_server().serve_connection(TokioIo::new(io), svc);
    tokio::pin!(conn);
    let drained = drain.wait_for_drain();
    tokio::pin!(drained);
    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(component=%name, "connection closed with error: {e}");
            }
        }
        blocker = &mut drained => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(component=%name, "connection closed with error during drain: {e}");
            }
            drop(blocker);
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;
    use crate::config::TlsFiles;
    use crate::drain;
    use crate::test_helpers::temp_dir;

    #[tokio::test]
    async fn pretty_json() {
        let resp = json_response(
            hyper::StatusCode::CREATED,
            &serde_json::json!({"error": "boom"}),
        );
        assert_eq!(resp.status(), hyper::StatusCode::CREATED);
        assert_eq!(
            resp.headers()[hyper::header::CONTENT_TYPE],
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "{\n  \"error\": \"boom\"\n}");
    }

    #[tokio::test]
    async fn stalled_tls_handshake_does_not_hold_drain() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = temp_dir();
        let files = TlsFiles {
            cert: dir.join("tls.crt"),
            key: dir.join("tls.key"),
        };
        std::fs::write(&files.cert, cert.pem()).unwrap();
        std::fs::write(&files.key, key_pair.serialize_pem()).unwrap();

        let (drain_tx, drain_rx) = drain::new();
        let server = Server::bind("test", "127.0.0.1:0".parse().unwrap(), drain_rx, ())
            .await
            .unwrap()
            .with_tls(crate::tls::acceptor(&files).unwrap());
        let addr = server.address();
        server.spawn(|_, _, _| async { empty_response(hyper::StatusCode::OK) });

        // Connect but never start the handshake.
        let _stalled = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(
            TLS_HANDSHAKE_TIMEOUT + Duration::from_secs(3),
            drain_tx.start_drain_and_wait(),
        )
        .await
        .expect("drain completes once the handshake times out");
    }
}
