/*
 * SPDX-FileCopyrightText: Copyright (c) 2023, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::krb::{self, KerberosClient};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use libgssapi::{
    context::{ClientCtx, CtxFlags},
    error::Error as GssError,
    name::Name,
    oid::{Oid, GSS_MECH_KRB5, GSS_MECH_SPNEGO, GSS_NT_KRB5_PRINCIPAL},
};
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::Mutex;

static MECH: &Oid = &GSS_MECH_SPNEGO;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Could not acquire client credential"), context(false))]
    AcquireCredential { source: krb::Error },
    #[snafu(display("Failed to resolve service principal `{spn}`"))]
    InvalidService { spn: String, source: GssError },
    #[snafu(display("Could not initialize security context for `{spn}`"))]
    InitContext { spn: String, source: GssError },
    #[snafu(display("Security context for `{spn}` yielded no token"))]
    EmptyToken { spn: String },
}

/// Anything that can mint a base64 `Negotiate` token for the upstream.
/// The proxy engine only sees this seam.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn negotiate_token(&self) -> Result<String, Error>;
}

/// SPNEGO initiator bound to one service principal.
///
/// The underlying context is not reentrant, so all acquisition is serialised
/// behind the mutex; at most one `InitSecContext` is in flight at any moment.
/// Tokens are not cached: every call runs a fresh single round trip, and the
/// Kerberos library's own ticket cache keeps that affordable.
pub struct SpnegoTokenSource {
    client: Arc<KerberosClient>,
    spn: String,
    initiator: Mutex<()>,
}

impl SpnegoTokenSource {
    pub fn new(client: Arc<KerberosClient>, spn: String) -> Self {
        Self {
            client,
            spn,
            initiator: Mutex::new(()),
        }
    }

    pub fn spn(&self) -> &str {
        &self.spn
    }

    /// Mints and discards one token so a missing service ticket surfaces at
    /// startup rather than on the first proxied request.
    pub async fn probe(&self) -> Result<(), Error> {
        self.negotiate_token().await.map(drop)
    }
}

#[async_trait]
impl TokenSource for SpnegoTokenSource {
    async fn negotiate_token(&self) -> Result<String, Error> {
        let _initiator = self.initiator.lock().await;

        let cred = self.client.acquire()?;
        let service = Name::new(self.spn.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))
            .and_then(|name| name.canonicalize(Some(&GSS_MECH_KRB5)))
            .context(InvalidService { spn: self.spn.as_str() })?;

        tracing::debug!(target = %self.spn, "initializing GSS context");
        let mut ctx = ClientCtx::new(Some(cred), service, CtxFlags::GSS_C_MUTUAL_FLAG, Some(MECH));
        let token = ctx
            .step(None, None)
            .context(InitContext { spn: self.spn.as_str() })?
            .context(EmptyToken { spn: self.spn.as_str() })?;

        Ok(BASE64.encode(&*token))
    }
}
