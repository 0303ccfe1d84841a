/*
 * SPDX-FileCopyrightText: Copyright (c) 2023, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use bytes::BytesMut;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use snafu::prelude::*;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Upper bound on an HTTP header section read from either peer.
pub const HEAD_MAX_LENGTH: usize = 8192;

const INITIAL_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("Malformed HTTP request"))]
    MalformedRequest { source: httparse::Error },
    #[snafu(display("Malformed HTTP response"))]
    MalformedResponse { source: httparse::Error },
    #[snafu(display("HTTP header section exceeds {HEAD_MAX_LENGTH} bytes"))]
    HeadTooLarge,
    #[snafu(display("Invalid HTTP method"))]
    BadMethod { source: http::method::InvalidMethod },
    #[snafu(display("Invalid HTTP status code"))]
    BadStatus { source: http::status::InvalidStatusCode },
    #[snafu(display("Peer closed mid-message"))]
    Truncated,
    #[snafu(display("Socket read failed"))]
    Read { source: io::Error },
    #[snafu(display("Socket write failed"))]
    Write { source: io::Error },
}

/// Buffered reader over one half of a proxied connection.
///
/// Header sections are accumulated and parsed in place; once a head has been
/// consumed, the remainder (a message body) reads straight through the
/// `AsyncRead` impl, draining the buffer before touching the inner socket.
pub struct RecvBuffer<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> RecvBuffer<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_len: HEAD_MAX_LENGTH,
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    fn discard(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Drops whatever has been buffered, e.g. an unparseable head.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        (&mut self.inner).take(max as u64).read_buf(&mut self.buf).await
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RecvBuffer<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 || this.buf.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, out);
        }
        let n = this.buf.len().min(out.remaining());
        let chunk = this.buf.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

/// One HTTP/1.x request head as read from a client.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Request target exactly as received (origin-form for reverse-proxy traffic).
    pub target: String,
    pub headers: HeaderMap,
}

impl Request {
    /// Parses a request head from a buffer; `None` while incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, Error> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).context(MalformedRequest)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let method = req.method.context(Truncated)?.parse().context(BadMethod)?;
                let target = req.path.context(Truncated)?.to_owned();
                let headers = collect_headers(req.headers);
                Ok(Some((head_len, Self { method, target, headers })))
            }
        }
    }

    /// Reads one request head, consuming it from `reader`.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly before
    /// sending anything.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut RecvBuffer<R>) -> Result<Option<Self>, Error> {
        loop {
            if let Some((len, request)) = Self::parse(reader.buffer())? {
                reader.discard(len);
                return Ok(Some(request));
            }
            ensure!(!reader.is_full(), HeadTooLarge);
            if reader.fill().await.context(Read)? == 0 {
                ensure!(reader.buffer().is_empty(), Truncated);
                return Ok(None);
            }
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Returns the decoded value of a query-string parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.target.split_once('?')?.1;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Sets a query-string parameter on the request target, replacing any
    /// value the client sent for it.
    pub fn set_query_param(&mut self, name: &str, value: &str) {
        let (path, query) = match self.target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query)),
            None => (self.target.clone(), None),
        };
        let mut pairs: Vec<(String, String)> = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .filter(|(k, _)| k != name)
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        pairs.push((name.to_owned(), value.to_owned()));
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&pairs)
            .finish();
        self.target = format!("{path}?{query}");
    }

    /// Writes the head in proxy wire form: an absolute-URI request line
    /// followed by the current header map.
    pub async fn write_proxy<W: AsyncWrite + Unpin>(&self, upstream: &str, writer: &mut W) -> Result<(), Error> {
        let mut head = Vec::with_capacity(INITIAL_CAPACITY);
        head.extend_from_slice(format!("{} http://{}{} HTTP/1.1\r\n", self.method, upstream, self.target).as_bytes());
        write_headers(&self.headers, &mut head);
        writer.write_all(&head).await.context(Write)
    }
}

/// One HTTP/1.x response head as read from the upstream.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl Response {
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, Error> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).context(MalformedResponse)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let code = res.code.context(Truncated)?;
                let status = StatusCode::from_u16(code).context(BadStatus)?;
                let reason = res.reason.map(ToOwned::to_owned);
                let headers = collect_headers(res.headers);
                Ok(Some((head_len, Self { status, reason, headers })))
            }
        }
    }

    /// Reads one response head, consuming it from `reader`. Unlike requests,
    /// a response is owed: EOF before a complete head is an error.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut RecvBuffer<R>) -> Result<Self, Error> {
        loop {
            if let Some((len, response)) = Self::parse(reader.buffer())? {
                reader.discard(len);
                return Ok(response);
            }
            ensure!(!reader.is_full(), HeadTooLarge);
            ensure!(reader.fill().await.context(Read)? != 0, Truncated);
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Writes the head back out verbatim.
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), Error> {
        let mut head = Vec::with_capacity(INITIAL_CAPACITY);
        head.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason()).as_bytes());
        write_headers(&self.headers, &mut head);
        writer.write_all(&head).await.context(Write)
    }
}

fn collect_headers(parsed: &[httparse::Header]) -> HeaderMap {
    HeaderMap::from_iter(parsed.iter().flat_map(|h| {
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        Some((name, value))
    }))
}

fn write_headers(headers: &HeaderMap, head: &mut Vec<u8>) {
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: &'static [u8]) -> RecvBuffer<Cursor<&'static [u8]>> {
        RecvBuffer::new(Cursor::new(data))
    }

    #[tokio::test]
    async fn reads_request_with_query() {
        let mut r = reader(b"GET /webhdfs/v1/tmp?op=LISTSTATUS&user.name=bob HTTP/1.1\r\nHost: nn\r\n\r\n");
        let req = Request::read(&mut r).await.unwrap().unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.query_param("op").as_deref(), Some("LISTSTATUS"));
        assert_eq!(req.query_param("user.name").as_deref(), Some("bob"));
        assert_eq!(req.headers.get(header::HOST).unwrap(), "nn");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut r = reader(b"");
        assert!(Request::read(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_request_is_an_error() {
        let mut r = reader(b"GET / HTTP/1.1\r\nHost");
        assert!(matches!(Request::read(&mut r).await, Err(Error::Truncated)));
    }

    #[tokio::test]
    async fn garbage_is_a_parse_error() {
        let mut r = reader(b"\x00\x01\x02 nonsense\r\n\r\n");
        assert!(matches!(Request::read(&mut r).await, Err(Error::MalformedRequest { .. })));
    }

    #[test]
    fn partial_head_is_incomplete() {
        assert!(Request::parse(b"GET / HTTP/1.1\r\n").unwrap().is_none());
    }

    #[tokio::test]
    async fn body_reads_through_after_head() {
        let mut r = reader(b"PUT /f?op=CREATE HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        let req = Request::read(&mut r).await.unwrap().unwrap();
        assert_eq!(req.content_length(), Some(5));
        let mut body = Vec::new();
        r.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn set_query_param_overrides_client_value() {
        let mut req = Request {
            method: Method::GET,
            target: "/webhdfs/v1/?op=OPEN&user.name=mallory".to_owned(),
            headers: HeaderMap::new(),
        };
        req.set_query_param("user.name", "alice");
        assert_eq!(req.query_param("user.name").as_deref(), Some("alice"));
        assert_eq!(req.query_param("op").as_deref(), Some("OPEN"));
    }

    #[test]
    fn set_query_param_without_existing_query() {
        let mut req = Request {
            method: Method::GET,
            target: "/webhdfs/v1/tmp".to_owned(),
            headers: HeaderMap::new(),
        };
        req.set_query_param("user.name", "alice");
        assert_eq!(req.target, "/webhdfs/v1/tmp?user.name=alice");
    }

    #[tokio::test]
    async fn writes_absolute_uri_proxy_form() {
        let mut req = Request {
            method: Method::GET,
            target: "/healthz".to_owned(),
            headers: HeaderMap::new(),
        };
        req.headers.insert(header::HOST, HeaderValue::from_static("nn1:50070"));
        let mut out = Vec::new();
        req.write_proxy("nn1:50070", &mut out).await.unwrap();
        let wire = String::from_utf8(out).unwrap();
        assert!(wire.starts_with("GET http://nn1:50070/healthz HTTP/1.1\r\n"));
        assert!(wire.contains("host: nn1:50070\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn reads_and_rewrites_response() {
        let mut r = reader(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        let res = Response::read(&mut r).await.unwrap();
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(res.content_length(), Some(0));
        let mut out = Vec::new();
        res.write(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn response_eof_is_an_error() {
        let mut r = reader(b"HTTP/1.1 200 OK\r\n");
        assert!(matches!(Response::read(&mut r).await, Err(Error::Truncated)));
    }
}
