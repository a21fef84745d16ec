//! Plain HTTP/1.1 engine on top of `mio`.
//!
//! Each transfer owns one non-blocking socket registered with a shared [`Poll`]
//! under the token equal to its handle id. Token 0 is reserved for the [`Waker`].
//! Progress is made in [`TransportEngine::perform`], which walks every live
//! transfer through resolve, connect, send and receive until the socket would block.
//!
//! Host names are looked up on a short-lived resolver thread that hands the
//! addresses back over a channel and wakes the engine, so the thread driving the
//! engine only ever blocks in [`TransportEngine::poll`]. Every resolved address
//! is tried in order until one accepts the connection.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{
        Arc,
        mpsc::{self, Receiver, TryRecvError},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use mio::{Events, Interest, Poll, Registry, Token, Waker, net::TcpStream};

use super::{
    Completion, EasyHandle, HandleId, HttpEasy, ResponseParts, TransferError, TransportEngine,
    TransportError, Wake,
    h1::{self, ResponseParser},
    url::Url,
};
use crate::slot::limits::MAX_RESPONSE_BODY;

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 128;
const READ_CHUNK: usize = 16 * 1024;
const RESOLVER_THREAD: &str = "reqpool-resolve";

/// Per-transfer limits applied by the engine and by [`HttpEasy::perform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    /// Name resolution plus TCP connect.
    pub connect_timeout: Duration,
    /// Whole-transfer timeout, connect included. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Largest decoded response body accepted.
    pub max_response: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            timeout: Some(Duration::from_secs(60)),
            max_response: MAX_RESPONSE_BODY,
        }
    }
}

type Resolved = Result<Vec<SocketAddr>, TransferError>;

/// Look `url` up on a resolver thread. The result arrives on the returned
/// channel, followed by a wake-up of `waker`.
fn spawn_resolver(url: &Url, waker: Arc<Waker>) -> Result<Receiver<Resolved>, TransferError> {
    let (tx, rx) = mpsc::channel();
    let lookup = url.clone();

    thread::Builder::new()
        .name(RESOLVER_THREAD.to_string())
        .spawn(move || {
            // the transfer may have been removed while the lookup ran
            if tx.send(lookup.resolve()).is_ok() {
                if let Err(e) = waker.wake() {
                    warn!("failed to wake engine after resolving {}: {e}", lookup.host);
                }
            }
        })
        .map_err(|e| TransferError::CouldntResolveHost(format!("{}: {e}", url.host)))?;

    Ok(rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolving,
    Connecting,
    Sending,
    Receiving,
}

struct Transfer {
    token: Token,
    host: String,
    phase: Phase,
    resolver: Option<Receiver<Resolved>>,
    /// Addresses not tried yet.
    addrs: VecDeque<SocketAddr>,
    stream: Option<TcpStream>,
    target: Option<SocketAddr>,
    request: Vec<u8>,
    written: usize,
    parser: ResponseParser,
    started: Instant,
    limits: TransferLimits,
}

impl Transfer {
    /// Earliest instant at which this transfer times out.
    fn deadline(&self) -> Option<Instant> {
        let connect = matches!(self.phase, Phase::Resolving | Phase::Connecting)
            .then(|| self.started + self.limits.connect_timeout);
        let total = self.limits.timeout.map(|t| self.started + t);
        match (connect, total) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// `None` while the transfer is still running.
    fn advance(
        &mut self,
        registry: &Registry,
        buf: &mut [u8],
        now: Instant,
    ) -> Option<Result<ResponseParts, TransferError>> {
        self.step(registry, buf, now).transpose()
    }

    fn step(
        &mut self,
        registry: &Registry,
        buf: &mut [u8],
        now: Instant,
    ) -> Result<Option<ResponseParts>, TransferError> {
        let elapsed = now.saturating_duration_since(self.started);
        if let Some(timeout) = self.limits.timeout {
            if elapsed >= timeout {
                return Err(TransferError::Timeout(timeout));
            }
        }
        let connect_expired = elapsed >= self.limits.connect_timeout;

        if self.phase == Phase::Resolving {
            if !self.resolved()? {
                if connect_expired {
                    return Err(TransferError::Timeout(self.limits.connect_timeout));
                }
                return Ok(None);
            }
            self.connect_next(registry, None)?;
        }

        if self.phase == Phase::Connecting {
            match self.connected() {
                Ok(true) => {}
                Ok(false) => {
                    if connect_expired {
                        return Err(TransferError::Timeout(self.limits.connect_timeout));
                    }
                    return Ok(None);
                }
                Err(e) => {
                    let failed = self.describe(&e);
                    debug!("{failed}, trying the next address");
                    self.connect_next(registry, Some(failed))?;
                    return Ok(None);
                }
            }
            trace!("connected to {:?}", self.target);
            self.phase = Phase::Sending;
        }

        if self.phase == Phase::Sending {
            if !self.send()? {
                return Ok(None);
            }
            self.phase = Phase::Receiving;
        }

        self.receive(buf)
    }

    /// `true` once the address list is known.
    fn resolved(&mut self) -> Result<bool, TransferError> {
        let Some(resolver) = &self.resolver else {
            return Ok(true);
        };
        match resolver.try_recv() {
            Ok(addrs) => {
                self.addrs = addrs?.into();
                self.resolver = None;
                trace!("{} resolved to {:?}", self.host, self.addrs);
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => {
                Err(TransferError::CouldntResolveHost(self.host.clone()))
            }
        }
    }

    /// Drop the current socket and start connecting to the next untried address.
    fn connect_next(
        &mut self,
        registry: &Registry,
        mut last_error: Option<String>,
    ) -> Result<(), TransferError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = registry.deregister(&mut stream) {
                warn!("failed to deregister socket for {:?}: {e}", self.target);
            }
        }

        while let Some(addr) = self.addrs.pop_front() {
            self.target = Some(addr);
            let attempt = TcpStream::connect(addr).and_then(|mut stream| {
                registry.register(&mut stream, self.token, Interest::READABLE | Interest::WRITABLE)?;
                Ok(stream)
            });
            match attempt {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.phase = Phase::Connecting;
                    return Ok(());
                }
                Err(e) => {
                    let failed = self.describe(&e);
                    debug!("{failed}");
                    last_error = Some(failed);
                }
            }
        }

        Err(TransferError::CouldntConnect(last_error.unwrap_or_else(|| {
            format!("no address to connect to for {}", self.host)
        })))
    }

    fn describe(&self, e: &io::Error) -> String {
        match self.target {
            Some(addr) => format!("{addr}: {e}"),
            None => e.to_string(),
        }
    }

    fn connected(&self) -> io::Result<bool> {
        let Some(stream) = &self.stream else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns `true` once the whole request is written.
    fn send(&mut self) -> Result<bool, TransferError> {
        let Some(stream) = &mut self.stream else {
            return Err(TransferError::Send("no connection".into()));
        };
        while self.written < self.request.len() {
            match stream.write(&self.request[self.written..]) {
                Ok(0) => return Err(TransferError::Send("connection closed".into())),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::Send(e.to_string())),
            }
        }
        Ok(true)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<ResponseParts>, TransferError> {
        let Some(stream) = &mut self.stream else {
            return Err(TransferError::Recv("no connection".into()));
        };
        loop {
            match stream.read(buf) {
                Ok(0) => return self.parser.finish().map(Some),
                Ok(n) => {
                    if let Some(parts) = self.parser.feed(&buf[..n])? {
                        return Ok(Some(parts));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::Recv(e.to_string())),
            }
        }
    }

    fn close(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = registry.deregister(&mut stream) {
                warn!("failed to deregister socket for {:?}: {e}", self.target);
            }
        }
    }
}

/// The shipped [`TransportEngine`].
pub struct HttpEngine {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    limits: TransferLimits,
    next_id: u64,
    added: HashSet<HandleId>,
    transfers: HashMap<HandleId, Transfer>,
    finished: Vec<Completion>,
    read_buf: Box<[u8]>,
}

impl HttpEngine {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_limits(TransferLimits::default())
    }

    pub fn with_limits(limits: TransferLimits) -> Result<Self, TransportError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            limits,
            next_id: 1,
            added: HashSet::new(),
            transfers: HashMap::new(),
            finished: Vec::new(),
            read_buf: vec![0; READ_CHUNK].into_boxed_slice(),
        })
    }

    /// Number of transfers still running.
    pub fn active(&self) -> usize {
        self.transfers.len()
    }

    /// Parse the url, encode the request and start the lookup. IP literals skip
    /// the resolver thread. Failures here become completions.
    fn open(&self, id: HandleId, easy: &HttpEasy) -> Result<Transfer, TransferError> {
        let url = Url::parse(easy.url())?;
        let (resolver, addrs) = match url.literal_addr() {
            Some(addr) => (None, VecDeque::from([addr])),
            None => (
                Some(spawn_resolver(&url, Arc::clone(&self.waker))?),
                VecDeque::new(),
            ),
        };

        let mut request = Vec::new();
        h1::encode_request(easy.method(), &url, easy.headers(), easy.body(), &mut request);

        Ok(Transfer {
            token: Self::token(id),
            host: url.host,
            phase: Phase::Resolving,
            resolver,
            addrs,
            stream: None,
            target: None,
            request,
            written: 0,
            parser: ResponseParser::new(self.limits.max_response),
            started: Instant::now(),
            limits: self.limits,
        })
    }

    fn token(handle: HandleId) -> Token {
        Token(handle.0 as usize)
    }
}

impl TransportEngine for HttpEngine {
    type Easy = HttpEasy;

    fn create_easy(&mut self) -> Result<HttpEasy, TransportError> {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        Ok(HttpEasy::with_limits(id, self.limits))
    }

    fn add_handle(&mut self, easy: &HttpEasy) -> Result<(), TransportError> {
        let id = easy.id();
        if !self.added.insert(id) {
            return Err(TransportError::AlreadyAdded(id));
        }

        match self.open(id, easy) {
            Ok(transfer) => {
                trace!("transfer {id} started for {}", easy.url());
                self.transfers.insert(id, transfer);
            }
            Err(error) => {
                debug!("transfer {id} failed to start: {error}");
                self.finished.push(Completion {
                    handle: id,
                    result: Err(error),
                });
            }
        }
        Ok(())
    }

    fn remove_handle(&mut self, handle: HandleId) -> Result<(), TransportError> {
        if !self.added.remove(&handle) {
            return Err(TransportError::UnknownHandle(handle));
        }

        if let Some(mut transfer) = self.transfers.remove(&handle) {
            transfer.close(self.poll.registry());
        }
        self.finished.retain(|c| c.handle != handle);
        Ok(())
    }

    fn perform(&mut self) -> Result<usize, TransportError> {
        let now = Instant::now();
        let registry = self.poll.registry();
        let mut done = Vec::new();

        for (&id, transfer) in self.transfers.iter_mut() {
            if let Some(result) = transfer.advance(registry, &mut self.read_buf, now) {
                done.push((id, result));
            }
        }

        for (id, result) in done {
            if let Some(mut transfer) = self.transfers.remove(&id) {
                transfer.close(registry);
            }
            trace!("transfer {id} finished");
            self.finished.push(Completion { handle: id, result });
        }

        Ok(self.transfers.len())
    }

    fn poll(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let timeout = if self.finished.is_empty() {
            let now = Instant::now();
            self.transfers
                .values()
                .filter_map(Transfer::deadline)
                .map(|deadline| deadline.saturating_duration_since(now))
                .fold(timeout, Duration::min)
        } else {
            Duration::ZERO
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }

    fn read_completions(&mut self, out: &mut Vec<Completion>) {
        out.append(&mut self.finished);
    }
}
