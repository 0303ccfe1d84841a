/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use argh::FromArgs;
use hadoop_proxy::{backend, counters, gss, krb, metrics, proxy, webhdfs};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(FromArgs)]
/// SPNEGO-injecting WebHDFS proxy with a statically configured upstream.
struct Arguments {
    /// listener bind address
    #[argh(option, default = "String::from(\"0.0.0.0:50070\")")]
    addr: String,
    /// host:port for the service to proxy to
    #[argh(option)]
    proxy_service: String,
    /// krb5 config file
    #[argh(option, default = "String::from(\"krb5.conf\")")]
    config: String,
    /// kerberos principal (e.g. alice/host)
    #[argh(option)]
    user: String,
    /// kerberos realm
    #[argh(option)]
    realm: String,
    /// keytab file path
    #[argh(option, default = "String::from(\"krb5.keytab\")")]
    keytab_file: String,
    /// SPN service type
    #[argh(option, default = "String::from(\"HTTP\")")]
    spn_service_type: String,
    /// for WebHDFS, user.name value to force-set
    #[argh(option, default = "String::new()")]
    proper_username: String,
    /// optional address to expose a metrics endpoint
    #[argh(option, default = "String::new()")]
    metrics_addr: String,
    /// turn on debugging
    #[argh(option, default = "true")]
    debug: bool,
}

fn setup_log(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

#[tokio::main]
#[snafu::report]
async fn main() -> Result<(), hadoop_proxy::Error> {
    let args: Arguments = argh::from_env();
    setup_log(args.debug);

    let client = Arc::new(krb::login(&args.user, &args.realm, &args.keytab_file, &args.config)?);
    let mut backends = backend::fixed(&args.proxy_service)?;
    let backend = backend::choose_backend(&mut backends, &args.spn_service_type).await?;
    tracing::info!(upstream = %backend.endpoint, spn = %backend.spn, "selected backend");

    let tokens = Arc::new(gss::SpnegoTokenSource::new(client, backend.spn.clone()));
    tokens.probe().await?;

    let mut proxy = proxy::Proxy::new(backend.endpoint).with_token_source(tokens);
    if !args.proper_username.is_empty() {
        proxy = proxy.with_proper_username(&args.proper_username);
    }
    if !args.metrics_addr.is_empty() {
        let registry = Arc::new(counters::Registry::new());
        let (events, stream) = mpsc::unbounded_channel();
        proxy.register_inspector(webhdfs::tracking_inspector(events));
        tokio::spawn(counters::consume_events(registry.clone(), stream));
        let metrics_addr = args.metrics_addr.clone();
        tokio::spawn(async move {
            if let Err(error) = metrics::serve(&metrics_addr, registry).await {
                tracing::error!(%error, "metrics endpoint failed");
            }
        });
    }

    proxy.listen(&args.addr).await?;
    Ok(())
}
