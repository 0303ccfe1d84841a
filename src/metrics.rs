/*
 * SPDX-FileCopyrightText: Copyright (c) 2023, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::counters::Registry;

use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use snafu::prelude::*;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Invalid metrics address `{addr}`"))]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[snafu(display("Metrics server failed"))]
    Serve { source: hyper::Error },
}

/// Serves the counter exposition over plain HTTP: `/metrics` (and
/// `/metrics/`) return the table, anything else points the caller at it.
/// Unauthenticated; runs until the server errors out.
pub async fn serve(addr: &str, registry: Arc<Registry>) -> Result<(), Error> {
    let addr: SocketAddr = addr.parse().context(InvalidAddress { addr })?;
    let make = make_service_fn(move |_| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| respond(req, registry.clone())))
        }
    });

    tracing::info!(%addr, "serving metrics");
    Server::try_bind(&addr)
        .context(Serve)?
        .serve(make)
        .await
        .context(Serve)
}

async fn respond(req: Request<Body>, registry: Arc<Registry>) -> Result<Response<Body>, Infallible> {
    tracing::debug!(path = req.uri().path(), "metrics request");
    let response = match req.uri().path() {
        "/metrics" | "/metrics/" => Response::builder()
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(registry.render())),
        _ => Response::builder().body(Body::from("use /metrics")),
    };
    Ok(response.unwrap_or_else(|_| Response::new(Body::empty())))
}
