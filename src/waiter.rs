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

use std::time::Duration;

use tracing::{debug, warn};

use crate::authority::{AuthorityClient, Operation, with_timeout};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_ATTEMPTS: u32 = 5;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// PollPolicy bounds how long we wait for the authority to sign a request.
#[derive(serde::Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Fixed delay before each read.
    pub interval: Duration,
    pub attempts: u32,
    /// Timeout for each individual authority call.
    pub call_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            interval: DEFAULT_INTERVAL,
            attempts: DEFAULT_ATTEMPTS,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("certificate for {identity} was not issued after {attempts} attempts")]
    Timeout { identity: String, attempts: u32 },
    #[error("signing request {identity} will not be issued: {reason}")]
    Rejected { identity: String, reason: String },
}

/// wait_for_certificate polls the authority until the request named `identity` carries a
/// certificate. Failed reads are not fatal; they count as an attempt that was not ready.
pub async fn wait_for_certificate(
    identity: &str,
    client: &dyn AuthorityClient,
    policy: &PollPolicy,
) -> Result<Vec<u8>, Error> {
    for attempt in 1..=policy.attempts {
        tokio::time::sleep(policy.interval).await;
        let record = match with_timeout(Operation::Get, policy.call_timeout, client.get(identity))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(identity, attempt, "failed to read signing request: {e}");
                continue;
            }
        };
        if let Some(cert) = record.certificate() {
            debug!(identity, attempt, "certificate issued");
            return Ok(cert.to_vec());
        }
        if let Some(reason) = record.rejection() {
            return Err(Error::Rejected {
                identity: identity.to_string(),
                reason,
            });
        }
        debug!(identity, attempt, "certificate not issued yet");
    }
    Err(Error::Timeout {
        identity: identity.to_string(),
        attempts: policy.attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::authority::mock::{MockAuthority, MockConfig};
    use crate::authority::{AuthorityClient, Usage};
    use crate::csr::CertificateRequestSpec;
    use crate::test_helpers::test_key;

    async fn submitted(cfg: MockConfig) -> Arc<MockAuthority> {
        let ca = Arc::new(MockAuthority::new(cfg).unwrap());
        let request = CertificateRequestSpec {
            user: "alice".to_string(),
            ..Default::default()
        }
        .signing_request(test_key())
        .unwrap();
        let rec = ca
            .submit(&request, "alice-abc", &[Usage::ClientAuth], None)
            .await
            .unwrap();
        ca.approve(&rec).await.unwrap();
        ca
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_last_attempt() {
        let ca = submitted(MockConfig {
            ready_after: 5,
            ..Default::default()
        })
        .await;
        let cert = wait_for_certificate("alice-abc", ca.as_ref(), &PollPolicy::default())
            .await
            .unwrap();
        assert!(cert.starts_with(b"-----BEGIN CERTIFICATE-----"));
        assert_eq!(ca.gets(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready() {
        let ca = submitted(MockConfig {
            never_ready: true,
            ..Default::default()
        })
        .await;
        let start = tokio::time::Instant::now();
        let err = wait_for_certificate("alice-abc", ca.as_ref(), &PollPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::Timeout {
                identity: "alice-abc".to_string(),
                attempts: 5
            }
        );
        assert_eq!(ca.gets(), 5);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_stops_early() {
        let ca = submitted(MockConfig {
            deny: true,
            ..Default::default()
        })
        .await;
        let err = wait_for_certificate("alice-abc", ca.as_ref(), &PollPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
        assert_eq!(ca.gets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_are_not_ready() {
        let ca = submitted(MockConfig::default()).await;
        let err = wait_for_certificate("someone-else", ca.as_ref(), &PollPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 5, .. }));
        assert_eq!(ca.gets(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reads_time_out() {
        let ca = submitted(MockConfig {
            get_delay: Duration::from_secs(60),
            ..Default::default()
        })
        .await;
        let policy = PollPolicy {
            attempts: 3,
            call_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let err = wait_for_certificate("alice-abc", ca.as_ref(), &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 3, .. }));
        assert_eq!(ca.gets(), 3);
    }
}
