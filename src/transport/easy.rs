use std::{
    io::{self, Read, Write},
    net::TcpStream,
    time::Instant,
};

use log::debug;

use super::{
    EasyHandle, HandleId, ResponseParts, TransferError,
    engine::TransferLimits,
    h1::{self, ResponseParser},
    url::Url,
};
use crate::slot::{HeaderEntry, HeaderList, Method};

const READ_CHUNK: usize = 16 * 1024;

/// Request configuration for one slot of an [`HttpEngine`](super::HttpEngine).
///
/// Also usable on its own: [`EasyHandle::perform`] runs the request on the
/// calling thread with blocking sockets.
#[derive(Debug)]
pub struct HttpEasy {
    id: HandleId,
    url: String,
    method: Method,
    headers: HeaderList,
    body: Vec<u8>,
    limits: TransferLimits,
}

impl HttpEasy {
    pub fn new(id: HandleId) -> Self {
        Self::with_limits(id, TransferLimits::default())
    }

    pub fn with_limits(id: HandleId, limits: TransferLimits) -> Self {
        Self {
            id,
            url: String::new(),
            method: Method::Get,
            headers: HeaderList::unbounded(),
            body: Vec::new(),
            limits,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn headers(&self) -> &[HeaderEntry] {
        self.headers.as_slice()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Connect to the first of the url's addresses that accepts, within the
    /// connect timeout overall.
    fn connect(&self, url: &Url) -> Result<TcpStream, TransferError> {
        let started = Instant::now();
        let timeout = self.limits.connect_timeout;
        let mut last_error = None;

        for addr in url.resolve()? {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(TransferError::Timeout(timeout));
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(TransferError::Timeout(timeout));
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_error = Some(format!("{addr}: {e}"));
                }
            }
        }

        Err(TransferError::CouldntConnect(
            last_error.unwrap_or_else(|| format!("no address to connect to for {}", url.host)),
        ))
    }
}

impl EasyHandle for HttpEasy {
    fn id(&self) -> HandleId {
        self.id
    }

    fn set_url(&mut self, url: &str) {
        self.url.clear();
        self.url.push_str(url);
    }

    fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    fn set_headers(&mut self, headers: &[HeaderEntry]) {
        self.headers.assign(headers);
    }

    fn set_body(&mut self, body: &[u8]) {
        self.body.clear();
        self.body.extend_from_slice(body);
    }

    fn perform(&mut self) -> Result<ResponseParts, TransferError> {
        let url = Url::parse(&self.url)?;
        let started = Instant::now();
        let mut stream = self.connect(&url)?;

        let mut request = Vec::new();
        h1::encode_request(self.method, &url, self.headers(), &self.body, &mut request);
        stream
            .set_write_timeout(self.limits.timeout)
            .and_then(|()| stream.write_all(&request))
            .map_err(|e| TransferError::Send(e.to_string()))?;

        let mut parser = ResponseParser::new(self.limits.max_response);
        let mut buf = vec![0; READ_CHUNK];
        loop {
            if let Some(timeout) = self.limits.timeout {
                let remaining = timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(TransferError::Timeout(timeout));
                }
                stream
                    .set_read_timeout(Some(remaining))
                    .map_err(|e| TransferError::Recv(e.to_string()))?;
            }

            match stream.read(&mut buf) {
                Ok(0) => return parser.finish(),
                Ok(n) => {
                    if let Some(parts) = parser.feed(&buf[..n])? {
                        return Ok(parts);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(TransferError::Recv(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::scripted::{http_response, serve};

    #[test]
    fn blocking_perform_round_trip() {
        let (addr, server) = serve(vec![http_response(200, "pong")]);
        let mut easy = HttpEasy::new(HandleId(1));
        easy.set_url(&format!("http://{addr}/ping"));

        let parts = easy.perform().unwrap();
        assert_eq!(parts.status, 200);
        assert_eq!(parts.body, b"pong");

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("GET /ping HTTP/1.1\r\n"));
    }

    #[test]
    fn blocking_post_sends_body() {
        let (addr, server) = serve(vec![http_response(201, "")]);
        let mut easy = HttpEasy::new(HandleId(1));
        easy.set_url(&format!("http://{addr}/items"));
        easy.set_method(Method::Post);
        easy.set_body(br#"{"a":1}"#);

        assert_eq!(easy.perform().unwrap().status, 201);

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("POST /items HTTP/1.1\r\n"));
        assert!(requests[0].contains("Content-Type: application/json\r\n"));
        assert!(requests[0].ends_with(r#"{"a":1}"#));
    }

    #[test]
    fn blocking_perform_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let limits = TransferLimits {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let mut easy = HttpEasy::with_limits(HandleId(1), limits);
        easy.set_url(&format!("http://{addr}/"));

        assert_eq!(
            easy.perform(),
            Err(TransferError::Timeout(Duration::from_millis(200)))
        );
        drop(listener);
    }

    #[test]
    fn blocking_perform_by_host_name() {
        let (addr, server) = serve(vec![http_response(200, "pong")]);
        let mut easy = HttpEasy::new(HandleId(1));
        easy.set_url(&format!("http://localhost:{}/ping", addr.port()));

        assert_eq!(easy.perform().unwrap().body, b"pong");
        let requests = server.join().unwrap();
        assert!(requests[0].contains(&format!("Host: localhost:{}\r\n", addr.port())));
    }

    #[test]
    fn unresolvable_host_fails_with_resolve_code() {
        let mut easy = HttpEasy::new(HandleId(1));
        easy.set_url("http://does-not-exist.invalid/");
        assert_eq!(easy.perform().unwrap_err().code(), 6);
    }
}
