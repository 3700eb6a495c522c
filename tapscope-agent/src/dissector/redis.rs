//! Redis serialization protocol (RESP2) dissector

use super::{
    preview, Confidence, DissectError, Dissector, DissectorSession, ProtocolDescriptor,
    RegistrationContext,
};
use crate::capture::{CapturedConnection, Peer};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tapscope_common::{ConnectionInfo, Entry};

pub const PROTOCOL_NAME: &str = "redis";
const PRIORITY: u32 = 20;

const MAX_BUFFERED: usize = 512 * 1024;
const VALUE_PREVIEW: usize = 1024;
const MAX_DEPTH: usize = 32;

pub fn factory() -> Arc<dyn Dissector> {
    Arc::new(RedisDissector)
}

pub struct RedisDissector;

impl Dissector for RedisDissector {
    fn register(&self, ctx: &mut RegistrationContext) {
        ctx.declare(ProtocolDescriptor::new(
            PROTOCOL_NAME,
            "Redis Serialization Protocol",
            PRIORITY,
        ));
    }

    fn can_dissect(&self, peer: Peer, sample: &[u8]) -> Confidence {
        match (peer, sample) {
            (Peer::Client, [b'*', digit, ..]) if digit.is_ascii_digit() => Confidence::Maybe,
            (Peer::Server, [b'+' | b'-' | b':' | b'$' | b'*', ..]) => Confidence::Maybe,
            _ => Confidence::No,
        }
    }

    fn session(&self, connection: &CapturedConnection) -> Box<dyn DissectorSession> {
        Box::new(RedisSession::new(connection.info.clone()))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Resp {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Resp>>),
}

impl Resp {
    fn as_text(&self) -> String {
        match self {
            Resp::Simple(s) | Resp::Error(s) => s.clone(),
            Resp::Integer(i) => i.to_string(),
            Resp::Bulk(Some(b)) => preview(b, VALUE_PREVIEW),
            Resp::Bulk(None) | Resp::Array(None) => String::new(),
            Resp::Array(Some(items)) => items
                .iter()
                .map(Resp::as_text)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Resp::Simple(s) => json!({ "type": "simple", "value": s }),
            Resp::Error(s) => json!({ "type": "error", "value": s }),
            Resp::Integer(i) => json!({ "type": "integer", "value": i }),
            Resp::Bulk(None) | Resp::Array(None) => json!({ "type": "null", "value": Value::Null }),
            Resp::Bulk(Some(b)) => json!({ "type": "bulk", "value": preview(b, VALUE_PREVIEW) }),
            Resp::Array(Some(items)) => json!({
                "type": "array",
                "value": items.iter().map(Resp::to_json).collect::<Vec<_>>(),
            }),
        }
    }
}

fn find_line(data: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let rel = data.get(from..)?.windows(2).position(|w| w == b"\r\n")?;
    Some((&data[from..from + rel], from + rel + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, String> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| format!("bad integer {:?}", String::from_utf8_lossy(line)))
}

/// Parse one RESP value at `pos`, returning it and the next offset.
///
/// `depth` counts enclosing arrays; nesting past `MAX_DEPTH` is malformed.
fn parse(data: &[u8], pos: usize, depth: usize) -> Result<Option<(Resp, usize)>, String> {
    if depth > MAX_DEPTH {
        return Err(format!("arrays nested deeper than {}", MAX_DEPTH));
    }
    let Some(&marker) = data.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = find_line(data, pos + 1) else {
        return Ok(None);
    };

    match marker {
        b'+' => Ok(Some((
            Resp::Simple(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b'-' => Ok(Some((
            Resp::Error(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b':' => Ok(Some((Resp::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Resp::Bulk(None), next)));
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|&len| len <= MAX_BUFFERED)
                .ok_or_else(|| format!("bulk length {} exceeds {} bytes", len, MAX_BUFFERED))?;
            let end = next + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err("bulk string not terminated by CRLF".to_string());
            }
            Ok(Some((Resp::Bulk(Some(data[next..end].to_vec())), end + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Resp::Array(None), next)));
            }
            if count > MAX_BUFFERED as i64 {
                return Err(format!("array of {} elements exceeds the buffer", count));
            }
            let mut items = Vec::with_capacity(count.min(64) as usize);
            let mut cursor = next;
            for _ in 0..count {
                match parse(data, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Resp::Array(Some(items)), cursor)))
        }
        other => Err(format!("unexpected type marker {:?}", other as char)),
    }
}

fn command_payload(value: &Resp) -> Value {
    match value {
        Resp::Array(Some(items)) if !items.is_empty() => {
            let command = items[0].as_text().to_ascii_uppercase();
            let args: Vec<String> = items[1..].iter().map(Resp::as_text).collect();
            json!({ "command": command, "args": args })
        }
        other => json!({ "command": other.as_text().to_ascii_uppercase(), "args": [] }),
    }
}

/// Parse an inline command (`PING\r\n`) as sent by telnet-style clients
fn parse_inline(data: &[u8]) -> Option<(Resp, usize)> {
    let (line, next) = find_line(data, 0)?;
    let words = String::from_utf8_lossy(line)
        .split_whitespace()
        .map(|w| Resp::Bulk(Some(w.as_bytes().to_vec())))
        .collect();
    Some((Resp::Array(Some(words)), next))
}

struct PendingCommand {
    payload: Value,
    timestamp: DateTime<Utc>,
}

pub struct RedisSession {
    info: ConnectionInfo,
    client: Vec<u8>,
    server: Vec<u8>,
    pending: VecDeque<PendingCommand>,
}

impl RedisSession {
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            client: Vec::new(),
            server: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn entry(&self, request: Value, response: Value, timestamp: DateTime<Utc>) -> Entry {
        Entry::new(self.info.clone(), PROTOCOL_NAME, timestamp, request, response)
    }
}

impl DissectorSession for RedisSession {
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

        let malformed = |reason: String| DissectError::Malformed {
            protocol: PROTOCOL_NAME.to_string(),
            peer,
            reason,
        };

        let mut entries = Vec::new();
        match peer {
            Peer::Client => loop {
                let parsed = match self.client.first() {
                    None => None,
                    Some(b'*') => parse(&self.client, 0, 0).map_err(malformed)?,
                    Some(_) => parse_inline(&self.client),
                };
                let Some((value, consumed)) = parsed else {
                    break;
                };
                self.client.drain(..consumed);
                self.pending.push_back(PendingCommand {
                    payload: command_payload(&value),
                    timestamp,
                });
            },
            Peer::Server => loop {
                let Some((value, consumed)) = parse(&self.server, 0, 0).map_err(malformed)? else {
                    break;
                };
                self.server.drain(..consumed);
                let response = value.to_json();
                let entry = match self.pending.pop_front() {
                    Some(command) => self.entry(command.payload, response, command.timestamp),
                    // pub/sub pushes arrive without a command
                    None => self.entry(Value::Null, response, timestamp),
                };
                entries.push(entry);
            },
        }
        Ok(entries)
    }

    fn finish(&mut self) -> Vec<Entry> {
        let pending: Vec<PendingCommand> = self.pending.drain(..).collect();
        pending
            .into_iter()
            .map(|c| self.entry(c.payload, Value::Null, c.timestamp))
            .collect()
    }
}
