/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::parse::Request;
use crate::proxy::RequestInspector;

use http::Method;
use snafu::prelude::*;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Unhandled WebHDFS HTTP verb {method}"))]
    UnhandledVerb { method: Method },
    #[snafu(display("{verb} request with no op="))]
    MissingOp { verb: Verb },
    #[snafu(display("Unhandled {verb} operation `{op}`"))]
    UnknownOp { verb: Verb, op: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

impl TryFrom<&Method> for Verb {
    type Error = Error;

    fn try_from(method: &Method) -> Result<Self, Self::Error> {
        match method.as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            _ => UnhandledVerb { method: method.clone() }.fail(),
        }
    }
}

/// The closed set of tracked WebHDFS operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    GetFileStatus,
    ListStatus,
    GetContentSummary,
    GetFileChecksum,
    GetHomeDirectory,
    GetDelegationToken,
    Create,
    Mkdirs,
    Rename,
    SetReplication,
    SetOwner,
    SetPermission,
    SetTimes,
    RenewDelegationToken,
    CancelDelegationToken,
    Append,
    Delete,
}

/// One classified request. `op == None` is the invalid marker for a verb
/// that arrived without a usable `op=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub verb: Verb,
    pub op: Option<Operation>,
}

impl Event {
    pub fn operation(verb: Verb, op: Operation) -> Self {
        Self { verb, op: Some(op) }
    }

    pub fn invalid(verb: Verb) -> Self {
        Self { verb, op: None }
    }
}

/// Maps a verb and raw `op=` value to an event. Each verb accepts only its
/// own operations; anything else is unhandled and stays uncounted.
pub fn classify(verb: Verb, op: &str) -> Result<Event, Error> {
    let operation = match (verb, op) {
        (Verb::Get, "OPEN") => Operation::Open,
        (Verb::Get, "GETFILESTATUS") => Operation::GetFileStatus,
        (Verb::Get, "LISTSTATUS") => Operation::ListStatus,
        (Verb::Get, "GETCONTENTSUMMARY") => Operation::GetContentSummary,
        (Verb::Get, "GETFILECHECKSUM") => Operation::GetFileChecksum,
        (Verb::Get, "GETHOMEDIRECTORY") => Operation::GetHomeDirectory,
        (Verb::Get, "GETDELEGATIONTOKEN") => Operation::GetDelegationToken,
        (Verb::Put, "CREATE") => Operation::Create,
        (Verb::Put, "MKDIRS") => Operation::Mkdirs,
        (Verb::Put, "RENAME") => Operation::Rename,
        (Verb::Put, "SETREPLICATION") => Operation::SetReplication,
        (Verb::Put, "SETOWNER") => Operation::SetOwner,
        (Verb::Put, "SETPERMISSION") => Operation::SetPermission,
        (Verb::Put, "SETTIMES") => Operation::SetTimes,
        (Verb::Put, "RENEWDELEGATIONTOKEN") => Operation::RenewDelegationToken,
        (Verb::Put, "CANCELDELEGATIONTOKEN") => Operation::CancelDelegationToken,
        (Verb::Post, "APPEND") => Operation::Append,
        (Verb::Delete, "DELETE") => Operation::Delete,
        _ => return UnknownOp { verb, op }.fail(),
    };
    Ok(Event::operation(verb, operation))
}

/// Classifies one request and pushes the resulting event.
///
/// A verb without `op=` still counts (as the verb's invalid event); an
/// unknown verb or unknown operation emits nothing at all.
pub fn process_request(req: &Request, events: &UnboundedSender<Event>) -> Result<(), Error> {
    let verb = Verb::try_from(&req.method)?;
    let op = req.query_param("op").unwrap_or_default();
    if op.is_empty() {
        events.send(Event::invalid(verb)).ok();
        return MissingOp { verb }.fail();
    }
    let event = classify(verb, &op)?;
    events.send(event).ok();
    Ok(())
}

/// Packages the classifier as a request-inspection callback. Classification
/// failures are logged and never affect forwarding.
pub fn tracking_inspector(events: UnboundedSender<Event>) -> RequestInspector {
    Arc::new(move |req| {
        if let Err(error) = process_request(req, &events) {
            tracing::debug!(%error, "request not tracked");
        }
    })
}
