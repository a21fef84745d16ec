//! Minimal `http://` URL handling for the shipped engine.
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use super::TransferError;

const DEFAULT_PORT: u16 = 80;

/// The parts of an `http` URL needed to open a connection and write a request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub target: String,
}

impl Url {
    /// Parse `http://host[:port][/path][?query]`. A missing scheme is read as `http`,
    /// the way curl guesses it. Fragments are dropped.
    pub fn parse(input: &str) -> Result<Self, TransferError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransferError::MalformedUrl("empty url".into()));
        }

        let rest = match input.split_once("://") {
            Some((scheme, rest)) => {
                if !scheme.eq_ignore_ascii_case("http") {
                    return Err(TransferError::UnsupportedProtocol(scheme.to_string()));
                }
                rest
            }
            None => input,
        };

        let rest = rest.split('#').next().unwrap_or_default();
        let split = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, target) = rest.split_at(split);

        // userinfo is not supported, but must not be taken for the host
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        if authority.is_empty() {
            return Err(TransferError::MalformedUrl(format!("no host in '{input}'")));
        }

        let (host, port) = split_host_port(authority)?;
        let target = match target {
            "" => "/".to_string(),
            t if t.starts_with('?') => format!("/{t}"),
            t => t.to_string(),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            target,
        })
    }

    /// Value for the `Host` request header.
    pub fn host_header(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The socket address when the host is an IP literal and needs no lookup.
    pub fn literal_addr(&self) -> Option<SocketAddr> {
        let ip = self.host.parse::<IpAddr>().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }

    /// Every address the host resolves to, in resolver order. Blocks on DNS.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, TransferError> {
        if let Some(addr) = self.literal_addr() {
            return Ok(vec![addr]);
        }

        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| TransferError::CouldntResolveHost(self.host.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(TransferError::CouldntResolveHost(self.host.clone()));
        }
        Ok(addrs)
    }
}

fn split_host_port(authority: &str) -> Result<(&str, u16), TransferError> {
    // [v6]:port
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, after) = stripped
            .split_once(']')
            .ok_or_else(|| TransferError::MalformedUrl(format!("unclosed '[' in '{authority}'")))?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if after.is_empty() => DEFAULT_PORT,
            None => {
                return Err(TransferError::MalformedUrl(format!(
                    "garbage after host in '{authority}'"
                )));
            }
        };
        return Ok((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host, parse_port(port)?)),
        Some(_) => Err(TransferError::MalformedUrl(format!(
            "no host in '{authority}'"
        ))),
        None => Ok((authority, DEFAULT_PORT)),
    }
}

fn parse_port(port: &str) -> Result<u16, TransferError> {
    port.parse::<u16>()
        .map_err(|_| TransferError::MalformedUrl(format!("bad port '{port}'")))
}
