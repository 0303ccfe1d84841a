/*
 * SPDX-FileCopyrightText: Copyright (c) 2023-2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::backend::HostPort;
use crate::gss::TokenSource;
use crate::parse::{self, RecvBuffer, Request, Response};
use crate::trace::*;

use http::{header, HeaderValue};
use snafu::prelude::*;
use std::{
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::Instrument;

/// Consecutive retriable failures tolerated before the process gives up.
pub const MAX_ERROR_COUNT: u32 = 20;
/// Back-off after a failed token acquisition.
pub const PAUSE_TIME_WHEN_ERROR: Duration = Duration::from_secs(60);
/// Back-off after a failed request parse.
pub const PAUSE_TIME_WHEN_NO_DATA: Duration = Duration::from_millis(300);

const USER_AGENT: &str = "hadoop-proxy/0.1";

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Cannot listen on `{addr}`"))]
    Bind { addr: String, source: io::Error },
    #[snafu(display("Could not accept connection"))]
    Accept { source: io::Error },
    #[snafu(display("Failed to connect to upstream `{upstream}`"))]
    DialUpstream { upstream: String, source: io::Error },
    #[snafu(display("Too many consecutive errors ({count}), giving up"))]
    BudgetExhausted { count: u32 },
}

/// Shared consecutive-failure counter. Every retriable failure charges one
/// unit; a completed round trip resets it. Crossing the limit is fatal for
/// the whole process.
pub struct ErrorBudget {
    errors: AtomicU32,
    limit: u32,
}

impl ErrorBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            errors: AtomicU32::new(0),
            limit,
        }
    }

    pub fn charge(&self) -> Result<(), Error> {
        let count = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        ensure!(count <= self.limit, BudgetExhausted { count });
        Ok(())
    }

    pub fn reset(&self) {
        self.errors.store(0, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    fn exhausted(&self) -> Result<(), Error> {
        let count = self.count();
        ensure!(count <= self.limit, BudgetExhausted { count });
        Ok(())
    }
}

/// Side-effect-only request observer, run on every parsed request in
/// registration order.
pub type RequestInspector = Arc<dyn Fn(&Request) + Send + Sync>;

/// The per-connection proxy engine: accepts plain HTTP/1.x, stamps each
/// request with a fresh `Negotiate` token, and relays bytes both ways to one
/// pinned upstream.
pub struct Proxy {
    upstream: HostPort,
    tokens: Option<Arc<dyn TokenSource>>,
    proper_username: Option<String>,
    inspectors: Vec<RequestInspector>,
    budget: Arc<ErrorBudget>,
    pause_on_error: Duration,
    pause_no_data: Duration,
}

impl Proxy {
    pub fn new(upstream: HostPort) -> Self {
        Self {
            upstream,
            tokens: None,
            proper_username: None,
            inspectors: Vec::new(),
            budget: Arc::new(ErrorBudget::new(MAX_ERROR_COUNT)),
            pause_on_error: PAUSE_TIME_WHEN_ERROR,
            pause_no_data: PAUSE_TIME_WHEN_NO_DATA,
        }
    }

    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Forces the WebHDFS `user.name` query parameter of every forwarded
    /// request to this value, overriding whatever the client sent.
    pub fn with_proper_username(mut self, username: impl Into<String>) -> Self {
        self.proper_username = Some(username.into());
        self
    }

    pub fn register_inspector(&mut self, inspector: RequestInspector) {
        self.inspectors.push(inspector);
    }

    #[cfg(test)]
    pub(crate) fn with_pauses(mut self, on_error: Duration, no_data: Duration) -> Self {
        self.pause_on_error = on_error;
        self.pause_no_data = no_data;
        self
    }

    #[cfg(test)]
    pub(crate) fn budget_handle(&self) -> Arc<ErrorBudget> {
        self.budget.clone()
    }

    pub async fn listen(self, addr: &str) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await.context(Bind { addr })?;
        tracing::info!(addr, upstream = %self.upstream, "proxy listening");
        self.run(listener).await
    }

    /// Accepts connections until a fatal condition: an accept failure, an
    /// upstream dial failure, or an exhausted error budget. The caller turns
    /// the returned error into a non-zero exit.
    pub async fn run(self, listener: TcpListener) -> Result<(), Error> {
        let proxy = Arc::new(self);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (client, peer) = accepted.context(Accept)?;
                    let span = tracing::info_span!("client", %peer);
                    tokio::spawn(handle_client(proxy.clone(), client, fatal_tx.clone()).instrument(span));
                }
                Some(error) = fatal_rx.recv() => return Err(error),
            }
        }
    }
}

async fn handle_client(proxy: Arc<Proxy>, client: TcpStream, fatal: mpsc::Sender<Error>) {
    tracing::debug!("new client");
    if let Err(error) = proxy.budget.exhausted() {
        fatal.send(error).await.ok();
        return;
    }

    let upstream_addr = proxy.upstream.to_string();
    let upstream = match TcpStream::connect(upstream_addr.as_str())
        .await
        .context(DialUpstream { upstream: upstream_addr.as_str() })
    {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::error!(error = error.chain(), "upstream unreachable");
            fatal.send(error).await.ok();
            return;
        }
    };

    match serve_connection(&proxy, client, upstream, &upstream_addr).await {
        Ok(processed) => tracing::info!(processed, "client done"),
        Err(error) => {
            tracing::error!(error = error.chain(), "giving up on client");
            fatal.send(error).await.ok();
        }
    }
}

/// Request loop for one accepted connection. Only fatal errors escape;
/// retriable ones charge the budget, pause, and keep the loop alive.
async fn serve_connection(
    proxy: &Proxy,
    client: TcpStream,
    upstream: TcpStream,
    upstream_addr: &str,
) -> Result<u64, Error> {
    let (client_read, mut client_write) = client.into_split();
    let (upstream_read, mut upstream_write) = upstream.into_split();
    let mut client_read = RecvBuffer::new(client_read);
    let mut upstream_read = RecvBuffer::new(upstream_read);

    let host = HeaderValue::from_str(upstream_addr).expect("endpoint is a valid header value");
    let mut processed: u64 = 0;

    loop {
        let mut request = match Request::read(&mut client_read).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                // peer closed cleanly, which also forgives earlier stumbles
                proxy.budget.reset();
                break;
            }
            Err(error) => {
                tracing::warn!(error = error.chain(), "failed to read request");
                client_read.clear();
                proxy.budget.charge()?;
                tokio::time::sleep(proxy.pause_no_data).await;
                continue;
            }
        };
        tracing::debug!(method = %request.method, target = %request.target, "read request");

        if let Some(tokens) = &proxy.tokens {
            let token = match tokens.negotiate_token().await {
                Ok(token) => token,
                Err(error) => {
                    tracing::warn!(error = error.chain(), "failed to get SPNEGO token");
                    tokio::time::sleep(proxy.pause_on_error).await;
                    proxy.budget.charge()?;
                    continue;
                }
            };
            let value = HeaderValue::from_str(&format!("Negotiate {token}")).expect("token is base64");
            request.headers.insert(header::AUTHORIZATION, value);
        }
        request.headers.insert(header::HOST, host.clone());
        request.headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        if let Some(username) = &proxy.proper_username {
            request.set_query_param("user.name", username);
        }

        if let Err(error) = request.write_proxy(upstream_addr, &mut upstream_write).await {
            tracing::warn!(error = error.chain(), "failed to write request upstream");
            proxy.budget.charge()?;
            break;
        }

        for inspector in &proxy.inspectors {
            inspector(&request);
        }

        let body_len = request.content_length().unwrap_or(0);
        let (sent, received) = tokio::join!(
            copy_request_body(&mut client_read, &mut upstream_write, body_len),
            relay_response(&mut upstream_read, &mut client_write),
        );

        if let Err(error) = sent {
            tracing::warn!(error = error.chain(), "request body copy failed");
            proxy.budget.charge()?;
            break;
        }
        match received {
            Ok(bytes) => tracing::debug!(bytes, "response relayed"),
            Err(error) => {
                tracing::warn!(error = error.chain(), "response relay failed");
                proxy.budget.charge()?;
                break;
            }
        }

        proxy.budget.reset();
        processed += 1;
    }

    Ok(processed)
}

/// Client-to-upstream half: the request head has already been written, so
/// only the declared body remains.
async fn copy_request_body<R, W>(reader: &mut RecvBuffer<R>, writer: &mut W, len: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if len == 0 {
        return Ok(0);
    }
    let mut body = (&mut *reader).take(len);
    tokio::io::copy(&mut body, writer).await
}

/// Upstream-to-client half: parses the response head before relaying it so
/// headers can be rewritten here later, then streams the body through.
async fn relay_response<R, W>(reader: &mut RecvBuffer<R>, writer: &mut W) -> Result<u64, parse::Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let response = Response::read(reader).await?;
    tracing::debug!(status = %response.status, "read upstream response");
    // response.headers is where WWW-Authenticate / Set-Cookie stripping would go
    response.write(writer).await?;

    let copied = match response.content_length() {
        Some(len) => {
            let mut body = (&mut *reader).take(len);
            tokio::io::copy(&mut body, writer).await
        }
        None => tokio::io::copy(reader, writer).await,
    };
    copied.context(parse::Write)
}
