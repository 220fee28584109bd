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

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::auth::TokenAuth;
use crate::drain::DrainWatcher;
use crate::hyper_util::{self, json_response};
use crate::issuance::{IssueRequest, Issuer, RequestMeta};

pub const ISSUE_PATH: &str = "/issue";

/// State shared by every API request.
pub struct State {
    pub issuer: Arc<Issuer>,
    pub auth: TokenAuth,
    pub max_body_bytes: usize,
}

pub struct Service {
    s: hyper_util::Server<State>,
}

impl Service {
    pub async fn new(
        addr: SocketAddr,
        state: State,
        drain_rx: DrainWatcher,
    ) -> anyhow::Result<Self> {
        hyper_util::Server::bind("api", addr, drain_rx, state)
            .await
            .map(|s| Service { s })
    }

    pub fn with_tls(self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        Service {
            s: self.s.with_tls(acceptor),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|state, req: Request<Incoming>, peer| async move {
            handle(&state, req, peer).await
        })
    }
}

fn error_response(code: StatusCode, message: impl ToString) -> Response<Full<Bytes>> {
    json_response(code, &json!({ "error": message.to_string() }))
}

/// handle authenticates, then routes a single API request.
pub async fn handle<B>(state: &State, req: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    debug!(method=%req.method(), path=req.uri().path(), %peer, "api request");
    if let Err(e) = state.auth.check(&req) {
        return error_response(StatusCode::UNAUTHORIZED, e);
    }
    if req.uri().path() != ISSUE_PATH {
        return error_response(StatusCode::NOT_FOUND, "not found");
    }
    match *req.method() {
        Method::POST => issue(state, req, peer).await,
        Method::GET => json_response(StatusCode::OK, &state.issuer.audit().snapshot()),
        _ => {
            let mut resp = error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            resp.headers_mut().insert(
                hyper::header::ALLOW,
                hyper::header::HeaderValue::from_static("GET, POST"),
            );
            resp
        }
    }
}

async fn issue<B>(state: &State, req: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(req.into_body(), state.max_body_bytes)
        .collect()
        .await
    {
        Ok(b) => b.to_bytes(),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {e}"),
            );
        }
    };
    let request: IssueRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid request: {e}"));
        }
    };
    match state
        .issuer
        .issue(request, RequestMeta { requester: peer })
        .await
    {
        Ok(record) => json_response(StatusCode::CREATED, &record),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}
