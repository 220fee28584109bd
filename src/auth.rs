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

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::Request;
use hyper::header::{AUTHORIZATION, HeaderName};
use textnonce::TextNonce;
use tracing::info;

// Older clients send the token in a header literally named "Bearer".
static BARE_BEARER: HeaderName = HeaderName::from_static("bearer");

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("API token required")]
    Missing,
    #[error("Invalid API token")]
    Invalid,
}

/// TokenAuth checks the bearer token on API requests.
#[derive(Clone)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    /// from_secret derives the token from a configured secret, or generates one. Either way the
    /// token is the base64 encoding of the secret.
    pub fn from_secret(secret: Option<&str>) -> TokenAuth {
        match secret {
            Some(secret) => TokenAuth {
                token: STANDARD.encode(secret),
            },
            None => {
                let token = STANDARD.encode(TextNonce::new().to_string());
                info!("no API token configured, generated token: {token}");
                TokenAuth { token }
            }
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn check<B>(&self, req: &Request<B>) -> Result<(), Error> {
        let presented = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or_else(|| {
                req.headers()
                    .get(&BARE_BEARER)
                    .and_then(|v| v.to_str().ok())
            })
            .map(str::trim)
            .filter(|t| !t.is_empty());
        match presented {
            None => Err(Error::Missing),
            Some(t) if t == self.token => Ok(()),
            Some(_) => Err(Error::Invalid),
        }
    }
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth").finish_non_exhaustive()
    }
}
