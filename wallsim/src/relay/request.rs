//! Request line handling of the terminating proxy. Only the first line of the
//! first chunk is ever looked at or rewritten; every other byte is relayed as is.

use std::str::FromStr as _;

use http::uri::Authority;
use http::{Method, Uri};

use super::endpoint::RelayEndpoint;
use crate::error::RelayConnectionError;

const DEFAULT_HTTP_PORT: u16 = 80;

/// Where the terminating proxy has to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `CONNECT host:port`, relayed as an opaque tunnel after the 200 reply.
    Tunnel(RelayEndpoint),
    /// A plain request forwarded with its request target reduced to `path`.
    Origin { endpoint: RelayEndpoint, path: String },
}

/// The request line parsed out of the first chunk received from a client.
#[derive(Debug)]
pub struct ProxyRequest<'a> {
    chunk: &'a [u8],
    method: Method,
    target: &'a str,
    version: &'a str,
    /// Offset of the line terminator (or the end of the chunk).
    line_end: usize,
}

impl<'a> ProxyRequest<'a> {
    pub fn parse(chunk: &'a [u8]) -> Result<Self, RelayConnectionError> {
        if chunk.is_empty() {
            return Err(RelayConnectionError::EmptyRequest);
        }

        let line_end = match chunk.iter().position(|b| *b == b'\n') {
            Some(lf) if lf > 0 && chunk[lf - 1] == b'\r' => lf - 1,
            Some(lf) => lf,
            None => chunk.len(),
        };
        let line = std::str::from_utf8(&chunk[..line_end]).map_err(|_| {
            RelayConnectionError::MalformedRequestLine(
                String::from_utf8_lossy(&chunk[..line_end]).into_owned(),
            )
        })?;
        let malformed = || RelayConnectionError::MalformedRequestLine(line.to_owned());

        let mut parts = line.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| malformed())?;
        if !version.starts_with("HTTP/") {
            return Err(malformed());
        }

        Ok(Self {
            chunk,
            method,
            target,
            version,
            line_end,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        self.target
    }

    pub fn destination(&self) -> Result<Destination, RelayConnectionError> {
        if self.method == Method::CONNECT {
            let authority = Authority::from_str(self.target)
                .map_err(|_| RelayConnectionError::InvalidConnectTarget(self.target.to_owned()))?;
            let port = authority
                .port_u16()
                .ok_or_else(|| RelayConnectionError::InvalidConnectTarget(self.target.to_owned()))?;
            return Ok(Destination::Tunnel(RelayEndpoint::new(authority.host(), port)));
        }

        let invalid = || RelayConnectionError::InvalidAbsoluteUri(self.target.to_owned());

        if self.target.starts_with('/') {
            // Origin form, the destination can only come from the Host header.
            let host = self.host_header().ok_or_else(invalid)?;
            let authority = Authority::from_str(host).map_err(|_| invalid())?;
            return Ok(Destination::Origin {
                endpoint: RelayEndpoint::new(
                    authority.host(),
                    authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
                ),
                path: self.target.to_owned(),
            });
        }

        let uri = if self.target.contains("://") {
            Uri::from_str(self.target)
        } else {
            Uri::from_str(&format!("http://{}", self.target))
        }
        .map_err(|_| invalid())?;
        let authority = uri.authority().ok_or_else(invalid)?;
        // Origin form needs a leading slash even when only a query is given.
        let mut path = match uri.path() {
            "" => "/".to_owned(),
            path => path.to_owned(),
        };
        if let Some(query) = uri.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Destination::Origin {
            endpoint: RelayEndpoint::new(
                authority.host(),
                authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
            ),
            path,
        })
    }

    /// The chunk with its request target replaced by `path`. Everything after
    /// the request line is copied unchanged.
    pub fn rewrite(&self, path: &str) -> Vec<u8> {
        let rest = &self.chunk[self.line_end..];
        let mut out = Vec::with_capacity(self.chunk.len() + path.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(path.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(rest);
        out
    }

    fn host_header(&self) -> Option<&'a str> {
        let chunk: &'a [u8] = self.chunk;
        let header_start = chunk[self.line_end..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|lf| self.line_end + lf + 1)?;

        let mut headers = [httparse::EMPTY_HEADER; 64];
        match httparse::parse_headers(&chunk[header_start..], &mut headers) {
            Ok(httparse::Status::Complete((_, headers))) => headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(str::trim),
            _ => None,
        }
    }
}
