/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! TCP-level HTTP reverse proxy that injects SPNEGO authentication on behalf
//! of clients that cannot speak Kerberos themselves. Built for WebHDFS, but
//! the interposer itself is generic: read plain HTTP from a trusted caller,
//! mint a fresh `Negotiate` token, rewrite, forward.

pub mod backend;
pub mod consul;
pub mod counters;
pub mod gss;
pub mod krb;
pub mod metrics;
pub mod parse;
pub mod proxy;
pub mod webhdfs;

pub(crate) mod trace;


use snafu::prelude::*;

pub use backend::HostPort;
pub use proxy::Proxy;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Kerberos login error"), context(false))]
    KerberosLogin { source: krb::Error },
    #[snafu(display("SPNEGO token error"), context(false))]
    SpnegoToken { source: gss::Error },
    #[snafu(display("Backend selection error"), context(false))]
    BackendSelect { source: backend::Error },
    #[snafu(display("Service registry error"), context(false))]
    ServiceRegistry { source: consul::Error },
    #[snafu(display("Proxy engine error"), context(false))]
    ProxyEngine { source: proxy::Error },
    #[snafu(display("Metrics endpoint error"), context(false))]
    MetricsEndpoint { source: metrics::Error },
}
