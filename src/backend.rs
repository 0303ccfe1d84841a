/*
 * SPDX-FileCopyrightText: Copyright (c) 2023, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::consul::ConsulClient;
use crate::trace::*;

use snafu::prelude::*;
use std::{fmt, str::FromStr, time::Duration};
use tokio::sync::mpsc;

const REGISTRY_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Endpoint `{endpoint}` is not of the form host:port"))]
    MalformedEndpoint { endpoint: String },
    #[snafu(display("Endpoint `{endpoint}` has an invalid port"))]
    InvalidPort {
        endpoint: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("Endpoint `{endpoint}` has port 0"))]
    ZeroPort { endpoint: String },
    #[snafu(display("No backend available"))]
    NoBackend,
}

/// A concrete upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.split_once(':').context(MalformedEndpoint { endpoint: s })?;
        ensure!(!host.is_empty(), MalformedEndpoint { endpoint: s });
        let port: u16 = port.parse().context(InvalidPort { endpoint: s })?;
        ensure!(port != 0, ZeroPort { endpoint: s });
        Ok(Self { host: host.to_owned(), port })
    }
}

/// Candidate backend lists, ordered by preference. The proxy consumes one
/// list at startup and pins its first element; producers may keep emitting.
pub type BackendStream = mpsc::Receiver<Vec<HostPort>>;

/// The pinned upstream plus the service principal to authenticate against.
#[derive(Debug, Clone)]
pub struct Backend {
    pub endpoint: HostPort,
    pub spn: String,
}

/// Backend stream for a statically configured `host:port`. Emits a single
/// one-element list, then ends.
pub fn fixed(endpoint: &str) -> Result<BackendStream, Error> {
    let endpoint: HostPort = endpoint.parse()?;
    let (tx, rx) = mpsc::channel(1);
    tx.try_send(vec![endpoint]).ok();
    Ok(rx)
}

/// Backend stream fed from periodic consul health queries. Hosts come from
/// the node's `fqdn` metadata, ports from the service record; only passing
/// instances are reported. Query failures are logged and retried next tick.
pub fn watch_registry(client: ConsulClient, service: String) -> BackendStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            match client.healthy_instances(&service).await {
                Ok(instances) if instances.is_empty() => {
                    tracing::warn!(service, "registry reported no healthy instances")
                }
                Ok(instances) => {
                    tracing::debug!(service, count = instances.len(), "registry reported healthy instances");
                    if tx.send(instances).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    tracing::warn!(error = error.chain(), service, "registry health query failed")
                }
            }
            tokio::time::sleep(REGISTRY_POLL_INTERVAL).await;
        }
    });
    rx
}

/// Awaits the first candidate list and pins its preferred element, deriving
/// the SPN as `<service_type>/<host>`.
pub async fn choose_backend(backends: &mut BackendStream, service_type: &str) -> Result<Backend, Error> {
    let candidates = backends.recv().await.context(NoBackend)?;
    let endpoint = candidates.first().cloned().context(NoBackend)?;
    let spn = format!("{service_type}/{}", endpoint.host);
    Ok(Backend { endpoint, spn })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let hp: HostPort = "nn1.example.com:50070".parse().unwrap();
        assert_eq!(hp.host, "nn1.example.com");
        assert_eq!(hp.port, 50070);
        assert_eq!(hp.to_string(), "nn1.example.com:50070");
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!(matches!("nn1.example.com".parse::<HostPort>(), Err(Error::MalformedEndpoint { .. })));
        assert!(matches!(":50070".parse::<HostPort>(), Err(Error::MalformedEndpoint { .. })));
        assert!(matches!("nn1:http".parse::<HostPort>(), Err(Error::InvalidPort { .. })));
        assert!(matches!("nn1:65536".parse::<HostPort>(), Err(Error::InvalidPort { .. })));
        assert!(matches!("nn1:0".parse::<HostPort>(), Err(Error::ZeroPort { .. })));
    }

    #[tokio::test]
    async fn fixed_emits_one_list_then_ends() {
        let mut stream = fixed("nn1:50070").unwrap();
        assert_eq!(
            stream.recv().await.unwrap(),
            vec![HostPort { host: "nn1".into(), port: 50070 }]
        );
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn fixed_rejects_bad_input() {
        assert!(fixed("not-an-endpoint").is_err());
    }

    #[tokio::test]
    async fn chooses_first_candidate_and_builds_spn() {
        let mut stream = fixed("nn1.example.com:50070").unwrap();
        let backend = choose_backend(&mut stream, "HTTP").await.unwrap();
        assert_eq!(backend.endpoint.to_string(), "nn1.example.com:50070");
        assert_eq!(backend.spn, "HTTP/nn1.example.com");
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let (tx, mut rx) = mpsc::channel::<Vec<HostPort>>(1);
        drop(tx);
        assert!(matches!(choose_backend(&mut rx, "HTTP").await, Err(Error::NoBackend)));
    }
}
