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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::csr::MIN_KEY_BITS;
use crate::issuance::MIN_EXPIRATION_SECONDS;
use crate::waiter::PollPolicy;

const LISTEN_ADDR: &str = "LISTEN_ADDR";
const ADMIN_ADDR: &str = "ADMIN_ADDR";
const TLS_CERT_FILE: &str = "TLS_CERT_FILE";
const TLS_KEY_FILE: &str = "TLS_KEY_FILE";
const API_TOKEN: &str = "API_TOKEN";
const CREDENTIAL_DIR: &str = "CREDENTIAL_DIR";
const KEY_SIZE: &str = "KEY_SIZE";
const POLL_INTERVAL: &str = "POLL_INTERVAL";
const POLL_ATTEMPTS: &str = "POLL_ATTEMPTS";
const AUTHORITY_CALL_TIMEOUT: &str = "AUTHORITY_CALL_TIMEOUT";
const DEFAULT_EXPIRATION_SECONDS: &str = "DEFAULT_EXPIRATION_SECONDS";
const FAKE_AUTHORITY: &str = "FAKE_AUTHORITY";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const WORKER_THREADS: &str = "WORKER_THREADS";
const HOME: &str = "HOME";

const DEFAULT_LISTEN_PORT: u16 = 8443;
const DEFAULT_ADMIN_PORT: u16 = 15000;
const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Address of the issuance API.
    pub listen_addr: SocketAddr,
    /// Address of the admin server. Only bound to localhost by default.
    pub admin_addr: SocketAddr,
    /// When set, the issuance API is served over TLS.
    pub tls: Option<TlsFiles>,

    /// Secret the bearer token is derived from; callers present its base64 encoding.
    /// A random token is generated at startup if unset.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,

    /// Scratch directory admin kubeconfigs are written to while a request is served.
    pub credential_dir: PathBuf,
    pub key_bits: usize,
    pub poll: PollPolicy,
    pub default_expiration_seconds: Option<u32>,
    pub max_body_bytes: usize,

    /// If true, then use the builtin fake authority with self-signed certificates.
    pub fake_authority: bool,

    pub termination_grace_period: Duration,

    /// Specify the number of worker threads the Tokio Runtime will use.
    pub num_worker_threads: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("invalid env var {0}={1}: {2}")]
    Invalid(String, String, String),
    #[error("{0} and {1} must be set together")]
    Incomplete(String, String),
}

/// DurationStr wraps a Duration to accept human friendly values such as "100ms" or "10s".
struct DurationStr(Duration);

impl FromStr for DurationStr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(DurationStr)
            .map_err(|e| e.to_string())
    }
}

/// Env looks up configuration values. The process environment in production, a map in tests.
pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl<F: Fn(&str) -> Option<String>> Env for F {
    fn var(&self, key: &str) -> Option<String> {
        self(key)
    }
}

fn parse<T: FromStr>(env: &dyn Env, key: &str) -> Result<Option<T>, Error> {
    match env.var(key) {
        Some(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(key.to_string(), val)),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &dyn Env, key: &str, default: T) -> Result<T, Error> {
    parse(env, key).map(|v| v.unwrap_or(default))
}

fn parse_duration(env: &dyn Env, key: &str, default: Duration) -> Result<Duration, Error> {
    Ok(parse::<DurationStr>(env, key)?.map(|d| d.0).unwrap_or(default))
}

pub fn parse_config() -> Result<Config, Error> {
    construct_config(&ProcessEnv)
}

pub fn construct_config(env: &dyn Env) -> Result<Config, Error> {
    let tls = match (
        empty_to_none(env.var(TLS_CERT_FILE)),
        empty_to_none(env.var(TLS_KEY_FILE)),
    ) {
        (Some(cert), Some(key)) => Some(TlsFiles {
            cert: cert.into(),
            key: key.into(),
        }),
        (None, None) => None,
        _ => {
            return Err(Error::Incomplete(
                TLS_CERT_FILE.to_string(),
                TLS_KEY_FILE.to_string(),
            ));
        }
    };

    let credential_dir = match empty_to_none(env.var(CREDENTIAL_DIR)) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(env.var(HOME).unwrap_or_else(|| ".".to_string()))
            .join(".kube")
            .join("kubecsr"),
    };

    let key_bits = parse_default(env, KEY_SIZE, MIN_KEY_BITS)?;
    if key_bits < MIN_KEY_BITS {
        return Err(Error::Invalid(
            KEY_SIZE.to_string(),
            key_bits.to_string(),
            format!("must be at least {MIN_KEY_BITS}"),
        ));
    }

    let defaults = PollPolicy::default();
    let poll = PollPolicy {
        interval: parse_duration(env, POLL_INTERVAL, defaults.interval)?,
        attempts: parse_default(env, POLL_ATTEMPTS, defaults.attempts)?,
        call_timeout: parse_duration(env, AUTHORITY_CALL_TIMEOUT, defaults.call_timeout)?,
    };
    if poll.attempts == 0 {
        return Err(Error::Invalid(
            POLL_ATTEMPTS.to_string(),
            "0".to_string(),
            "must be at least 1".to_string(),
        ));
    }

    let default_expiration_seconds = parse::<u32>(env, DEFAULT_EXPIRATION_SECONDS)?;
    if let Some(s) = default_expiration_seconds {
        if s < MIN_EXPIRATION_SECONDS {
            return Err(Error::Invalid(
                DEFAULT_EXPIRATION_SECONDS.to_string(),
                s.to_string(),
                format!("must be at least {MIN_EXPIRATION_SECONDS}"),
            ));
        }
    }

    Ok(Config {
        listen_addr: parse_default(
            env,
            LISTEN_ADDR,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_LISTEN_PORT),
        )?,
        // admin API should only be accessible over localhost
        admin_addr: parse_default(
            env,
            ADMIN_ADDR,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_ADMIN_PORT),
        )?,
        tls,
        api_token: empty_to_none(env.var(API_TOKEN)),
        credential_dir,
        key_bits,
        poll,
        default_expiration_seconds,
        max_body_bytes: MAX_BODY_BYTES,
        fake_authority: parse_default(env, FAKE_AUTHORITY, false)?,
        termination_grace_period: parse_duration(
            env,
            TERMINATION_GRACE_PERIOD,
            DEFAULT_DRAIN_DURATION,
        )?,
        num_worker_threads: parse_default(env, WORKER_THREADS, DEFAULT_WORKER_THREADS)?,
    })
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}

#[cfg(test)]
pub mod tests {
    use std::collections::HashMap;

    use matches::assert_matches;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| vars.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = construct_config(&env(&[("HOME", "/home/kubecsr")])).unwrap();
        assert_eq!(cfg.listen_addr, "[::]:8443".parse().unwrap());
        assert_eq!(cfg.admin_addr, "127.0.0.1:15000".parse().unwrap());
        assert_eq!(cfg.tls, None);
        assert_eq!(cfg.api_token, None);
        assert_eq!(
            cfg.credential_dir,
            PathBuf::from("/home/kubecsr/.kube/kubecsr")
        );
        assert_eq!(cfg.key_bits, 2048);
        assert_eq!(cfg.poll.interval, Duration::from_millis(100));
        assert_eq!(cfg.poll.attempts, 5);
        assert_eq!(cfg.poll.call_timeout, Duration::from_secs(10));
        assert_eq!(cfg.default_expiration_seconds, None);
        assert!(!cfg.fake_authority);
        assert_eq!(cfg.termination_grace_period, Duration::from_secs(5));
        assert_eq!(cfg.num_worker_threads, 2);
    }

    #[test]
    fn overrides() {
        let cfg = construct_config(&env(&[
            ("LISTEN_ADDR", "127.0.0.1:9443"),
            ("TLS_CERT_FILE", "/etc/kubecsr/tls.crt"),
            ("TLS_KEY_FILE", "/etc/kubecsr/tls.key"),
            ("API_TOKEN", "c2VjcmV0"),
            ("CREDENTIAL_DIR", "/tmp/creds"),
            ("KEY_SIZE", "4096"),
            ("POLL_INTERVAL", "1s"),
            ("POLL_ATTEMPTS", "30"),
            ("AUTHORITY_CALL_TIMEOUT", "250ms"),
            ("DEFAULT_EXPIRATION_SECONDS", "86400"),
            ("FAKE_AUTHORITY", "true"),
            ("TERMINATION_GRACE_PERIOD", "30s"),
        ]))
        .unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9443".parse().unwrap());
        assert_eq!(
            cfg.tls,
            Some(TlsFiles {
                cert: "/etc/kubecsr/tls.crt".into(),
                key: "/etc/kubecsr/tls.key".into(),
            })
        );
        assert_eq!(cfg.api_token.as_deref(), Some("c2VjcmV0"));
        assert_eq!(cfg.credential_dir, PathBuf::from("/tmp/creds"));
        assert_eq!(cfg.key_bits, 4096);
        assert_eq!(
            cfg.poll,
            PollPolicy {
                interval: Duration::from_secs(1),
                attempts: 30,
                call_timeout: Duration::from_millis(250),
            }
        );
        assert_eq!(cfg.default_expiration_seconds, Some(86400));
        assert!(cfg.fake_authority);
        assert_eq!(cfg.termination_grace_period, Duration::from_secs(30));
    }

    #[test]
    fn invalid() {
        assert_matches!(
            construct_config(&env(&[("POLL_ATTEMPTS", "many")])),
            Err(Error::EnvVar(..))
        );
        assert_matches!(
            construct_config(&env(&[("POLL_INTERVAL", "soon")])),
            Err(Error::EnvVar(..))
        );
        assert_matches!(
            construct_config(&env(&[("KEY_SIZE", "1024")])),
            Err(Error::Invalid(..))
        );
        assert_matches!(
            construct_config(&env(&[("DEFAULT_EXPIRATION_SECONDS", "60")])),
            Err(Error::Invalid(..))
        );
        assert_matches!(
            construct_config(&env(&[("TLS_CERT_FILE", "/etc/kubecsr/tls.crt")])),
            Err(Error::Incomplete(..))
        );
    }

    #[test]
    fn config_dump_hides_token() {
        let cfg = construct_config(&env(&[("API_TOKEN", "c2VjcmV0")])).unwrap();
        let dump = serde_json::to_string(&cfg).unwrap();
        assert!(!dump.contains("c2VjcmV0"));
    }
}
