/*
 * SPDX-FileCopyrightText: Copyright (c) 2023, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use libgssapi::{
    credential::{Cred, CredUsage},
    error::Error as GssError,
    name::Name,
    oid::{OidSet, GSS_MECH_KRB5, GSS_MECH_SPNEGO, GSS_NT_KRB5_PRINCIPAL},
};
use snafu::prelude::*;
use std::{env, fs, io, path::Path};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Cannot read keytab `{path}`"))]
    KeytabUnreadable { path: String, source: io::Error },
    #[snafu(display("Cannot read krb5 configuration `{path}`"))]
    ConfigUnreadable { path: String, source: io::Error },
    #[snafu(display("Failed to resolve principal `{principal}`"))]
    InvalidPrincipal { principal: String, source: GssError },
    #[snafu(display("Failed to acquire credentials for `{principal}`"))]
    BadCredentials { principal: String, source: GssError },
}

/// A logged-in Kerberos initiator identity, bound to a keytab and krb5
/// configuration through the MIT environment. Shared by reference across
/// every SPNEGO token source.
pub struct KerberosClient {
    principal: String,
}

/// Binds the process to `principal@realm` using the given keytab and
/// `krb5.conf`, and validates the login with an initial credential
/// acquisition. An unreadable keytab or configuration is fatal; directives
/// the MIT parser does not know are skipped by the library itself.
pub fn login(user: &str, realm: &str, keytab: &str, config: &str) -> Result<KerberosClient, Error> {
    fs::metadata(Path::new(keytab)).context(KeytabUnreadable { path: keytab })?;
    fs::metadata(Path::new(config)).context(ConfigUnreadable { path: config })?;
    env::set_var("KRB5_CLIENT_KTNAME", keytab);
    env::set_var("KRB5_CONFIG", config);

    let client = KerberosClient {
        principal: format!("{user}@{realm}"),
    };
    client.acquire()?;
    tracing::info!(principal = %client.principal, keytab, "kerberos login succeeded");
    Ok(client)
}

impl KerberosClient {
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Acquires an initiator credential for the bound principal from the
    /// keytab. Tickets are cached inside the library, so repeated calls are
    /// cheap once the TGT is in hand.
    pub fn acquire(&self) -> Result<Cred, Error> {
        let name = Name::new(self.principal.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))
            .context(InvalidPrincipal { principal: self.principal.as_str() })?;

        let mut mechs = OidSet::new().unwrap();
        mechs.add(&GSS_MECH_KRB5).unwrap();
        mechs.add(&GSS_MECH_SPNEGO).unwrap();

        Cred::acquire(Some(&name), None, CredUsage::Initiate, Some(&mechs))
            .context(BadCredentials { principal: self.principal.as_str() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keytab_is_fatal() {
        let err = login("alice/host", "EXAMPLE.COM", "/nonexistent/krb5.keytab", "/etc/hosts");
        assert!(matches!(err, Err(Error::KeytabUnreadable { .. })));
    }

    #[test]
    fn missing_config_is_fatal() {
        let err = login("alice/host", "EXAMPLE.COM", "/etc/hosts", "/nonexistent/krb5.conf");
        assert!(matches!(err, Err(Error::ConfigUnreadable { .. })));
    }
}
