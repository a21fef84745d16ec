//! CLI utilities for reqpool.
//!
//! Parsers used by the `reqpool` binary to turn command line text into request data.
use crate::slot::{HeaderEntry, RequestData};

/// Parse a `Name: value` header argument, curl style.
///
/// # Errors
/// If there is no `:` or the name is empty.
pub fn parse_header(arg: &str) -> Result<HeaderEntry, String> {
    let Some((name, value)) = arg.split_once(':') else {
        return Err(format!("header '{arg}' is not of the form 'Name: value'"));
    };

    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("invalid header name in '{arg}'"));
    }
    Ok(HeaderEntry::new(name, value.trim()))
}

/// Build the request for one URL from the shared command line options.
pub fn request_for(url: &str, headers: &[HeaderEntry], body: Option<&str>) -> RequestData {
    RequestData {
        url: url.to_string(),
        headers: headers.to_vec(),
        body: body.map(|b| b.as_bytes().to_vec()),
    }
}

/// One line summary of a response body for terminal output.
pub fn preview(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim_end();
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
