/*
 * SPDX-FileCopyrightText: Copyright (c) 2023, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use argh::FromArgs;
use hadoop_proxy::{backend::HostPort, proxy};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(FromArgs)]
/// Pass-through variant of the proxy: no Kerberos, no tracking. Useful for
/// smoke-testing the wiring against an unsecured upstream.
struct Arguments {
    /// listener bind address
    #[argh(option, default = "String::from(\"0.0.0.0:50070\")")]
    addr: String,
    /// host:port for the service to proxy to
    #[argh(option)]
    proxy_service: String,
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

    let upstream: HostPort = args.proxy_service.parse()?;
    proxy::Proxy::new(upstream).listen(&args.addr).await?;
    Ok(())
}
