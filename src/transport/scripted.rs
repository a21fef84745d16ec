//! In-memory engine and local HTTP server helpers for tests.
use std::{
    collections::{HashMap, HashSet},
    io::{Read, Write},
    net::{SocketAddr, TcpListener},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use super::{
    Completion, EasyHandle, HandleId, ResponseParts, TransferError, TransportEngine,
    TransportError, Wake,
};
use crate::slot::{HeaderEntry, Method};

#[derive(Default)]
struct State {
    responses: HashMap<String, Result<ResponseParts, TransferError>>,
    rejected: HashSet<String>,
    held: HashSet<String>,
    panicking: HashSet<String>,
    create_limit: Option<usize>,
    created: usize,
    active: HashMap<HandleId, (String, bool)>,
    finished: Vec<Completion>,
    added: Vec<HandleId>,
    removed: Vec<HandleId>,
    perform_threads: HashSet<ThreadId>,
    woken: bool,
}

/// Shared control over a [`ScriptedEngine`], kept by the test after the engine
/// moves into the worker.
#[derive(Clone, Default)]
pub(crate) struct Script {
    shared: Arc<(Mutex<State>, Condvar)>,
}

impl Script {
    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.0.lock().unwrap()
    }

    fn notify(&self) {
        self.shared.1.notify_all();
    }

    /// Transfers for `url` complete with this response. Unscripted urls get `200 ok`.
    pub(crate) fn respond(&self, url: &str, status: u16, body: &str) {
        let parts = ResponseParts {
            status,
            headers: vec![HeaderEntry::new("Content-Length", body.len().to_string())],
            body: body.as_bytes().to_vec(),
        };
        self.state().responses.insert(url.to_string(), Ok(parts));
    }

    pub(crate) fn fail(&self, url: &str, error: TransferError) {
        self.state().responses.insert(url.to_string(), Err(error));
    }

    /// `add_handle` refuses transfers for `url`.
    pub(crate) fn reject(&self, url: &str) {
        self.state().rejected.insert(url.to_string());
    }

    /// Transfers for `url` stay in flight until [`Script::release`].
    pub(crate) fn hold(&self, url: &str) {
        self.state().held.insert(url.to_string());
    }

    pub(crate) fn release(&self, url: &str) {
        self.state().held.remove(url);
        self.notify();
    }

    /// `perform` panics while a transfer for `url` is running.
    pub(crate) fn panic_on(&self, url: &str) {
        self.state().panicking.insert(url.to_string());
    }

    /// `create_easy` fails once `n` handles exist.
    pub(crate) fn fail_create_after(&self, n: usize) {
        self.state().create_limit = Some(n);
    }

    pub(crate) fn added(&self) -> Vec<HandleId> {
        self.state().added.clone()
    }

    pub(crate) fn removed(&self) -> Vec<HandleId> {
        self.state().removed.clone()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state().active.len()
    }

    pub(crate) fn perform_threads(&self) -> HashSet<ThreadId> {
        self.state().perform_threads.clone()
    }
}

pub(crate) struct ScriptedEasy {
    id: HandleId,
    script: Script,
    pub(crate) url: String,
    pub(crate) method: Option<Method>,
    pub(crate) headers: Vec<HeaderEntry>,
    pub(crate) body: Vec<u8>,
}

impl EasyHandle for ScriptedEasy {
    fn id(&self) -> HandleId {
        self.id
    }

    fn set_url(&mut self, url: &str) {
        self.url = url.to_string();
    }

    fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    fn set_headers(&mut self, headers: &[HeaderEntry]) {
        self.headers = headers.to_vec();
    }

    fn set_body(&mut self, body: &[u8]) {
        self.body = body.to_vec();
    }

    fn perform(&mut self) -> Result<ResponseParts, TransferError> {
        Script::outcome_from(&self.script.state().responses, &self.url)
    }
}

struct ScriptWaker(Script);

impl Wake for ScriptWaker {
    fn wake(&self) -> Result<(), TransportError> {
        self.0.state().woken = true;
        self.0.notify();
        Ok(())
    }
}

pub(crate) struct ScriptedEngine {
    script: Script,
    next_id: u64,
    waker: Arc<ScriptWaker>,
}

impl ScriptedEngine {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            waker: Arc::new(ScriptWaker(script.clone())),
            script,
            next_id: 1,
        }
    }
}

impl TransportEngine for ScriptedEngine {
    type Easy = ScriptedEasy;

    fn create_easy(&mut self) -> Result<ScriptedEasy, TransportError> {
        let id = HandleId(self.next_id);
        let mut state = self.script.state();
        if state.create_limit.is_some_and(|limit| state.created >= limit) {
            return Err(TransportError::Rejected {
                handle: id,
                reason: "scripted create failure".into(),
            });
        }
        state.created += 1;
        self.next_id += 1;

        Ok(ScriptedEasy {
            id,
            script: self.script.clone(),
            url: String::new(),
            method: None,
            headers: Vec::new(),
            body: Vec::new(),
        })
    }

    fn add_handle(&mut self, easy: &ScriptedEasy) -> Result<(), TransportError> {
        let mut state = self.script.state();
        if state.active.contains_key(&easy.id) {
            return Err(TransportError::AlreadyAdded(easy.id));
        }
        if state.rejected.contains(&easy.url) {
            return Err(TransportError::Rejected {
                handle: easy.id,
                reason: format!("scripted rejection of {}", easy.url),
            });
        }
        state.active.insert(easy.id, (easy.url.clone(), false));
        state.added.push(easy.id);
        Ok(())
    }

    fn remove_handle(&mut self, handle: HandleId) -> Result<(), TransportError> {
        let mut state = self.script.state();
        if state.active.remove(&handle).is_none() {
            return Err(TransportError::UnknownHandle(handle));
        }
        state.removed.push(handle);
        state.finished.retain(|c| c.handle != handle);
        Ok(())
    }

    fn perform(&mut self) -> Result<usize, TransportError> {
        let mut guard = self.script.state();
        let state = &mut *guard;
        state.perform_threads.insert(thread::current().id());

        let panics = state
            .active
            .values()
            .any(|(url, done)| !done && state.panicking.contains(url));
        if panics {
            // unlock first so the script stays usable after the unwind
            drop(guard);
            panic!("scripted engine panic");
        }

        let mut running = 0;
        for (handle, (url, done)) in state.active.iter_mut() {
            if *done {
                continue;
            }
            if state.held.contains(url) {
                running += 1;
                continue;
            }
            *done = true;
            state.finished.push(Completion {
                handle: *handle,
                result: Script::outcome_from(&state.responses, url),
            });
        }
        Ok(running)
    }

    fn poll(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let (lock, cvar) = &*self.script.shared;
        let mut state = lock.lock().unwrap();
        if !state.woken && state.finished.is_empty() {
            state = cvar.wait_timeout(state, timeout).unwrap().0;
        }
        state.woken = false;
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }

    fn read_completions(&mut self, out: &mut Vec<Completion>) {
        out.append(&mut self.script.state().finished);
    }
}

impl Script {
    /// Unscripted urls get `200 ok`.
    fn outcome_from(
        responses: &HashMap<String, Result<ResponseParts, TransferError>>,
        url: &str,
    ) -> Result<ResponseParts, TransferError> {
        responses.get(url).cloned().unwrap_or_else(|| {
            Ok(ResponseParts {
                status: 200,
                headers: Vec::new(),
                body: b"ok".to_vec(),
            })
        })
    }
}

/// `HTTP/1.1` response with a `Content-Length` body.
pub(crate) fn http_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} Test\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{body}",
        body.len()
    )
}

/// Serve one canned response per accepted connection, in order. The join handle
/// returns the raw requests that were received.
pub(crate) fn serve(responses: Vec<String>) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let mut requests = Vec::new();
        for response in responses {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            requests.push(read_request(&mut stream));
            stream.write_all(response.as_bytes()).unwrap();
        }
        requests
    });

    (addr, handle)
}

/// Read one request: the head, then `Content-Length` bytes of body.
fn read_request(stream: &mut impl Read) -> String {
    let mut data = Vec::new();
    let mut buf = [0; 4096];
    loop {
        let n = stream.read(&mut buf).unwrap_or(0);
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&data);
        let Some(end) = text.find("\r\n\r\n") else {
            continue;
        };
        let length = text[..end]
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= end + 4 + length {
            break;
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}
