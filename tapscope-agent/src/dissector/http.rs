//! HTTP/1.x dissector
//!
//! Requests and responses on a connection are paired in order: HTTP/1.x
//! without pipelining reorder guarantees answers requests in the order
//! they were sent. Bodies are framed by `Content-Length` or chunked
//! transfer encoding; a response with neither is read until the
//! connection closes.

use super::{
    preview, Confidence, DissectError, Dissector, DissectorSession, ProtocolDescriptor,
    RegistrationContext,
};
use crate::capture::{CapturedConnection, Peer};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tapscope_common::{ConnectionInfo, Entry};

pub const PROTOCOL_NAME: &str = "http";
const PRIORITY: u32 = 10;

/// Per-peer reassembly limit
const MAX_BUFFERED: usize = 1024 * 1024;
/// Body bytes copied into an entry
const BODY_PREVIEW: usize = 4096;

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

pub fn factory() -> Arc<dyn Dissector> {
    Arc::new(HttpDissector)
}

pub struct HttpDissector;

impl Dissector for HttpDissector {
    fn register(&self, ctx: &mut RegistrationContext) {
        ctx.declare(ProtocolDescriptor::new(
            PROTOCOL_NAME,
            "Hypertext Transfer Protocol -- HTTP/1.x",
            PRIORITY,
        ));
    }

    fn can_dissect(&self, peer: Peer, sample: &[u8]) -> Confidence {
        let line_end = sample
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(sample.len());
        let line = String::from_utf8_lossy(&sample[..line_end]);

        match peer {
            Peer::Client => {
                let method = line.split(' ').next().unwrap_or("");
                if !METHODS.contains(&method) {
                    return Confidence::No;
                }
                if line.ends_with("HTTP/1.1") || line.ends_with("HTTP/1.0") {
                    Confidence::Certain
                } else if line_end == sample.len() {
                    // request line not complete yet
                    Confidence::Maybe
                } else {
                    Confidence::No
                }
            }
            Peer::Server => {
                if line.starts_with("HTTP/1.") {
                    Confidence::Certain
                } else {
                    Confidence::No
                }
            }
        }
    }

    fn session(&self, connection: &CapturedConnection) -> Box<dyn DissectorSession> {
        Box::new(HttpSession::new(connection.info.clone()))
    }
}

struct PendingRequest {
    method: String,
    payload: Value,
    timestamp: DateTime<Utc>,
}

enum Framing {
    Length(usize),
    Chunked,
    UntilClose,
}

struct Head {
    start_line: String,
    headers: Map<String, Value>,
    framing: Framing,
    header_len: usize,
}

struct Message {
    head: Head,
    body: Vec<u8>,
}

pub struct HttpSession {
    info: ConnectionInfo,
    client: Vec<u8>,
    server: Vec<u8>,
    pending: VecDeque<PendingRequest>,
}

impl HttpSession {
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            client: Vec::new(),
            server: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn malformed(peer: Peer, reason: impl Into<String>) -> DissectError {
        DissectError::Malformed {
            protocol: PROTOCOL_NAME.to_string(),
            peer,
            reason: reason.into(),
        }
    }

    fn entry(&self, request: Value, response: Value, timestamp: DateTime<Utc>) -> Entry {
        Entry::new(self.info.clone(), PROTOCOL_NAME, timestamp, request, response)
    }

    fn drain_requests(&mut self, timestamp: DateTime<Utc>) -> Result<(), DissectError> {
        while let Some(message) = next_message(&mut self.client, Peer::Client, false)? {
            let (method, payload) = request_payload(message)?;
            self.pending.push_back(PendingRequest {
                method,
                payload,
                timestamp,
            });
        }
        Ok(())
    }

    fn drain_responses(&mut self, timestamp: DateTime<Utc>) -> Result<Vec<Entry>, DissectError> {
        let mut entries = Vec::new();
        loop {
            let head_request = self
                .pending
                .front()
                .map(|p| p.method == "HEAD")
                .unwrap_or(false);
            let Some(message) = next_message(&mut self.server, Peer::Server, head_request)? else {
                break;
            };
            let response = response_payload(message)?;
            if is_interim(&response) {
                continue;
            }
            entries.push(self.pair(response, timestamp));
        }
        Ok(entries)
    }

    fn pair(&mut self, response: Value, timestamp: DateTime<Utc>) -> Entry {
        match self.pending.pop_front() {
            Some(request) => self.entry(request.payload, response, request.timestamp),
            None => self.entry(Value::Null, response, timestamp),
        }
    }
}

impl DissectorSession for HttpSession {
    fn feed(
        &mut self,
        peer: Peer,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Entry>, DissectError> {
        let buffer = match peer {
            Peer::Client => &mut self.client,
            Peer::Server => &mut self.server,
        };
        if buffer.len() + payload.len() > MAX_BUFFERED {
            return Err(DissectError::BufferOverflow {
                protocol: PROTOCOL_NAME.to_string(),
                peer,
                limit: MAX_BUFFERED,
            });
        }
        buffer.extend_from_slice(payload);

        match peer {
            Peer::Client => {
                self.drain_requests(timestamp)?;
                Ok(Vec::new())
            }
            Peer::Server => self.drain_responses(timestamp),
        }
    }

    fn finish(&mut self) -> Vec<Entry> {
        let mut entries = Vec::new();
        let now = Utc::now();

        // a response delimited by connection close is complete now
        if !self.server.is_empty() {
            if let Ok(Some(head)) = parse_head(&self.server, Peer::Server) {
                if matches!(head.framing, Framing::UntilClose) {
                    let body = self.server.split_off(head.header_len);
                    self.server.clear();
                    if let Ok(response) = response_payload(Message { head, body }) {
                        entries.push(self.pair(response, now));
                    }
                }
            }
        }

        while let Some(request) = self.pending.pop_front() {
            entries.push(self.entry(request.payload, Value::Null, request.timestamp));
        }
        entries
    }
}

fn is_interim(response: &Value) -> bool {
    response["status"]
        .as_u64()
        .map(|s| (100..200).contains(&s) && s != 101)
        .unwrap_or(false)
}

/// Parse one complete message off the front of `buffer`
fn next_message(
    buffer: &mut Vec<u8>,
    peer: Peer,
    bodiless: bool,
) -> Result<Option<Message>, DissectError> {
    let Some(mut head) = parse_head(buffer, peer)? else {
        return Ok(None);
    };
    if bodiless {
        head.framing = Framing::Length(0);
    }

    let rest = &buffer[head.header_len..];
    let (body, consumed) = match head.framing {
        Framing::Length(len) => {
            if rest.len() < len {
                return Ok(None);
            }
            (rest[..len].to_vec(), len)
        }
        Framing::Chunked => match decode_chunked(rest).map_err(|r| HttpSession::malformed(peer, r))? {
            Some(decoded) => decoded,
            None => return Ok(None),
        },
        Framing::UntilClose => return Ok(None),
    };

    let total = head.header_len + consumed;
    buffer.drain(..total);
    Ok(Some(Message { head, body }))
}

fn parse_head(buffer: &[u8], peer: Peer) -> Result<Option<Head>, DissectError> {
    let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buffer[..end])
        .map_err(|_| HttpSession::malformed(peer, "header block is not valid UTF-8"))?;

    let mut lines = text.split("\r\n");
    let start_line = lines.next().unwrap_or("").to_string();

    let mut headers = Map::new();
    let mut content_length = None;
    let mut chunked = false;
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpSession::malformed(peer, format!("bad header line {:?}", line)))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            let len = value.parse::<usize>().map_err(|_| {
                HttpSession::malformed(peer, format!("bad Content-Length {:?}", value))
            })?;
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
        headers.insert(name.to_string(), Value::String(value.to_string()));
    }

    let framing = if chunked {
        Framing::Chunked
    } else if let Some(len) = content_length {
        Framing::Length(len)
    } else if peer == Peer::Client || status_is_bodiless(&start_line) {
        Framing::Length(0)
    } else {
        Framing::UntilClose
    };

    Ok(Some(Head {
        start_line,
        headers,
        framing,
        header_len: end + 4,
    }))
}

fn status_is_bodiless(status_line: &str) -> bool {
    match status_line.split(' ').nth(1).and_then(|s| s.parse::<u16>().ok()) {
        Some(status) => (100..200).contains(&status) || status == 204 || status == 304,
        None => false,
    }
}

/// Decode a chunked body, returning the body and bytes consumed
fn decode_chunked(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, String> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_len) = data[pos..].windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&data[pos..pos + line_len])
            .map_err(|_| "chunk size is not valid UTF-8".to_string())?;
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| format!("bad chunk size {:?}", size_hex))?;
        if size > MAX_BUFFERED {
            return Err(format!("chunk size {} exceeds {} bytes", size, MAX_BUFFERED));
        }
        pos += line_len + 2;

        if size == 0 {
            // skip trailers up to the terminating empty line
            loop {
                let Some(trailer_len) = data[pos..].windows(2).position(|w| w == b"\r\n") else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        let end = pos
            .checked_add(size)
            .ok_or_else(|| "chunk extends past addressable memory".to_string())?;
        if data.len() < end + 2 {
            return Ok(None);
        }
        if &data[end..end + 2] != b"\r\n" {
            return Err("chunk data is not terminated by CRLF".to_string());
        }
        body.extend_from_slice(&data[pos..end]);
        pos = end + 2;
    }
}

fn request_payload(message: Message) -> Result<(String, Value), DissectError> {
    let mut parts = message.head.start_line.splitn(3, ' ');
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpSession::malformed(
            Peer::Client,
            format!("bad request line {:?}", message.head.start_line),
        ));
    };

    let payload = json!({
        "method": method,
        "path": path,
        "version": version,
        "headers": message.head.headers,
        "bodySize": message.body.len(),
        "body": preview(&message.body, BODY_PREVIEW),
    });
    Ok((method.to_string(), payload))
}

fn response_payload(message: Message) -> Result<Value, DissectError> {
    let mut parts = message.head.start_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            HttpSession::malformed(
                Peer::Server,
                format!("bad status line {:?}", message.head.start_line),
            )
        })?;
    let reason = parts.next().unwrap_or("");

    Ok(json!({
        "status": status,
        "reason": reason,
        "version": version,
        "headers": message.head.headers,
        "bodySize": message.body.len(),
        "body": preview(&message.body, BODY_PREVIEW),
    }))
}
