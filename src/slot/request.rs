use std::{fmt, str::FromStr};

use thiserror::Error;

use super::limits::{
    MAX_HEADER_NAME_LEN, MAX_HEADER_VALUE_LEN, MAX_HEADERS, MAX_REQUEST_BODY, MAX_URL_LEN,
};

/// HTTP methods a slot can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Whether the request body is sent for this method.
    pub fn has_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unsupported method '{0}'")]
pub struct UnknownMethod(String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

/// One `name: value` header line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Header storage that keeps every entry's strings between uses, so refilling it
/// only allocates when a header is longer than any seen before in that position.
#[derive(Debug)]
pub(crate) struct HeaderList {
    entries: Vec<HeaderEntry>,
    len: usize,
    name_max: usize,
    value_max: usize,
}

impl HeaderList {
    /// Names and values are cut to `name_max` and `value_max` bytes.
    pub(crate) fn bounded(count: usize, name_max: usize, value_max: usize) -> Self {
        Self {
            entries: Vec::with_capacity(count),
            len: 0,
            name_max,
            value_max,
        }
    }

    pub(crate) fn unbounded() -> Self {
        Self::bounded(0, usize::MAX, usize::MAX)
    }

    pub(crate) fn as_slice(&self) -> &[HeaderEntry] {
        &self.entries[..self.len]
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    /// Append a copy of `header`. Returns whether the name or value was cut.
    pub(crate) fn push(&mut self, header: &HeaderEntry) -> bool {
        let name = truncate_str(&header.name, self.name_max);
        let value = truncate_str(&header.value, self.value_max);

        if self.len == self.entries.len() {
            self.entries.push(HeaderEntry::default());
        }
        let entry = &mut self.entries[self.len];
        entry.name.clear();
        entry.name.push_str(name);
        entry.value.clear();
        entry.value.push_str(value);
        self.len += 1;

        name.len() < header.name.len() || value.len() < header.value.len()
    }

    /// Replace the contents with `headers`. Returns whether anything was cut.
    pub(crate) fn assign(&mut self, headers: &[HeaderEntry]) -> bool {
        self.clear();
        let mut cut = false;
        for header in headers {
            cut |= self.push(header);
        }
        cut
    }
}

/// Caller supplied description of a request.
///
/// Submitting copies it into the slot's fixed buffers, so the caller keeps
/// ownership and may reuse it immediately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestData {
    pub url: String,
    pub headers: Vec<HeaderEntry>,
    pub body: Option<Vec<u8>>,
}

impl RequestData {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderEntry::new(name, value));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// The request half of a slot. Capacity is reserved once; copies truncate instead of growing.
#[derive(Debug)]
pub(crate) struct RequestBuffer {
    pub(crate) method: Option<Method>,
    pub(crate) url: String,
    pub(crate) headers: HeaderList,
    pub(crate) body: Vec<u8>,
}

impl RequestBuffer {
    pub(crate) fn new() -> Self {
        Self {
            method: None,
            url: String::with_capacity(MAX_URL_LEN),
            headers: HeaderList::bounded(MAX_HEADERS, MAX_HEADER_NAME_LEN, MAX_HEADER_VALUE_LEN),
            body: Vec::with_capacity(MAX_REQUEST_BODY),
        }
    }

    /// Overwrite the buffer with `data`. Returns `true` if any part was truncated.
    pub(crate) fn copy_from(&mut self, method: Method, data: &RequestData) -> bool {
        self.method = Some(method);

        let url = truncate_str(&data.url, MAX_URL_LEN);
        let mut truncated = url.len() < data.url.len();
        self.url.clear();
        self.url.push_str(url);

        self.body.clear();
        if let Some(body) = &data.body {
            let n = body.len().min(MAX_REQUEST_BODY);
            truncated |= n < body.len();
            self.body.extend_from_slice(&body[..n]);
        }

        let kept = data.headers.len().min(MAX_HEADERS);
        truncated |= kept < data.headers.len();
        truncated |= self.headers.assign(&data.headers[..kept]);

        truncated
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character.
pub(crate) fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
