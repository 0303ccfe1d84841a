/*
 * SPDX-FileCopyrightText: Copyright (c) 2023, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::backend::HostPort;

use serde::Deserialize;
use snafu::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to build registry client for `{address}`"))]
    BuildClient { address: String, source: reqwest::Error },
    #[snafu(display("Health query for `{service}` failed"))]
    HealthQuery { service: String, source: reqwest::Error },
}

/// Thin client for the consul health API. Plain HTTP, optionally
/// token-authenticated, as the upstream agent expects.
pub struct ConsulClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl ConsulClient {
    pub fn new(address: &str, token: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder().build().context(BuildClient { address })?;
        Ok(Self {
            http,
            base: format!("http://{address}"),
            token: (!token.is_empty()).then(|| token.to_owned()),
        })
    }

    /// Queries passing instances of `service`. The proxied host is the node's
    /// `fqdn` metadata entry, not its reported address; instances without one
    /// are skipped.
    pub async fn healthy_instances(&self, service: &str) -> Result<Vec<HostPort>, Error> {
        let url = format!("{}/v1/health/service/{service}", self.base);
        let mut request = self.http.get(&url).query(&[("passing", "true")]);
        if let Some(token) = &self.token {
            request = request.header("X-Consul-Token", token);
        }
        let entries: Vec<ServiceEntry> = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(HealthQuery { service })?
            .json()
            .await
            .context(HealthQuery { service })?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry.node.meta.get("fqdn") {
                Some(fqdn) if !fqdn.is_empty() => Some(HostPort {
                    host: fqdn.clone(),
                    port: entry.service.port,
                }),
                _ => {
                    tracing::warn!(node = %entry.node.node, "instance lacks fqdn metadata, skipping");
                    None
                }
            })
            .collect())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    node: NodeEntry,
    service: ServiceRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    node: String,
    #[serde(default)]
    meta: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRecord {
    port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_health_entries() {
        let body = r#"[{
            "Node": {"Node": "nn1", "Address": "10.0.0.1", "Meta": {"fqdn": "nn1.example.com"}},
            "Service": {"ID": "webhdfs", "Port": 50070}
        }, {
            "Node": {"Node": "nn2", "Address": "10.0.0.2", "Meta": {}},
            "Service": {"ID": "webhdfs", "Port": 50070}
        }]"#;
        let entries: Vec<ServiceEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].node.meta.get("fqdn").unwrap(), "nn1.example.com");
        assert_eq!(entries[0].service.port, 50070);
        assert!(entries[1].node.meta.get("fqdn").is_none());
    }
}
