//! # Meta Protocol Codec
//!
//! Purpose: Encode meta-protocol requests and decode their responses without
//! touching any I/O, so the same codec serves the connection loops and the
//! unit tests.
//!
//! ## Design Principles
//!
//! 1. **Closed Command Set**: `Command` is a tagged enum; each variant owns
//!    its request flags and its response mapping.
//! 2. **Incremental Decoding**: `Command::decode` returns `Ok(None)` until a
//!    full response (header plus body) is buffered, and consumes nothing
//!    until then.
//! 3. **Status vs Framing**: A recognized-but-unsuccessful verb resolves the
//!    call with a typed status; a header that cannot be framed is a fault.
//!
//! ## Wire Shapes
//!
//! ```text
//! request : <verb> <key> <flags...>\r\n [<payload>\r\n]
//! response: HD <flags...>\r\n
//!           VA <len> <flags...>\r\n<len bytes>\r\n
//!           EN | NF | EX | NS | MN\r\n
//! ```

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::{ClientError, ClientResult};
use crate::types::{parse_u64, push_ttl, push_u64, Key};

const CRLF: &[u8] = b"\r\n";

/// Direction of an arithmetic command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increment,
    Decrement,
}

impl Direction {
    fn mode(self) -> u8 {
        match self {
            Direction::Increment => b'I',
            Direction::Decrement => b'D',
        }
    }
}

/// Successful response payload.
///
/// `version` is the CAS value echoed by the server (0 when the command does
/// not return one); `value` is the body of a `VA` response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub version: u64,
    pub value: Option<Bytes>,
}

impl Reply {
    /// The read-miss sentinel: version 0, no body.
    pub const fn not_found() -> Self {
        Reply { version: 0, value: None }
    }

    fn version(version: u64) -> Self {
        Reply { version, value: None }
    }
}

/// Result of one fully decoded response: a reply or a protocol status.
pub type Outcome = ClientResult<Reply>;

/// One meta-protocol request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NoOp,
    Set {
        key: Key,
        value: Bytes,
        ttl: Duration,
        version: Option<u64>,
    },
    SetIfMatch {
        key: Key,
        value: Bytes,
        ttl: Duration,
        if_match: u64,
        version: Option<u64>,
    },
    Get {
        key: Key,
        ttl: Option<Duration>,
    },
    Touch {
        key: Key,
        ttl: Duration,
    },
    Delete {
        key: Key,
    },
    DeleteIfMatch {
        key: Key,
        if_match: u64,
    },
    Counter {
        direction: Direction,
        key: Key,
        ttl: Duration,
        version: Option<u64>,
    },
    CounterIfMatch {
        direction: Direction,
        key: Key,
        ttl: Duration,
        if_match: u64,
        version: Option<u64>,
    },
}

impl Command {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::NoOp => "noop",
            Command::Set { .. } => "set",
            Command::SetIfMatch { .. } => "set_if_match",
            Command::Get { .. } => "get",
            Command::Touch { .. } => "touch",
            Command::Delete { .. } => "delete",
            Command::DeleteIfMatch { .. } => "delete_if_match",
            Command::Counter { .. } => "counter",
            Command::CounterIfMatch { .. } => "counter_if_match",
        }
    }

    /// Appends the request bytes, including any payload, to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Command::NoOp => {
                out.extend_from_slice(b"mn");
            }
            Command::Set { key, value, ttl, version } => {
                out.extend_from_slice(b"ms ");
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(b" ");
                push_u64(out, value.len() as u64);
                push_ttl_flag(out, b'T', *ttl);
                push_optional_flag(out, b'E', *version);
                out.extend_from_slice(b" c");
                push_payload(out, value);
                return;
            }
            Command::SetIfMatch { key, value, ttl, if_match, version } => {
                out.extend_from_slice(b"ms ");
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(b" ");
                push_u64(out, value.len() as u64);
                push_ttl_flag(out, b'T', *ttl);
                push_flag(out, b'C', *if_match);
                push_optional_flag(out, b'E', *version);
                out.extend_from_slice(b" c");
                push_payload(out, value);
                return;
            }
            Command::Get { key, ttl } => {
                out.extend_from_slice(b"mg ");
                out.extend_from_slice(key.as_bytes());
                if let Some(ttl) = ttl {
                    push_ttl_flag(out, b'T', *ttl);
                }
                out.extend_from_slice(b" v c");
            }
            Command::Touch { key, ttl } => {
                out.extend_from_slice(b"mg ");
                out.extend_from_slice(key.as_bytes());
                push_ttl_flag(out, b'T', *ttl);
                out.extend_from_slice(b" c");
            }
            Command::Delete { key } => {
                out.extend_from_slice(b"md ");
                out.extend_from_slice(key.as_bytes());
            }
            Command::DeleteIfMatch { key, if_match } => {
                out.extend_from_slice(b"md ");
                out.extend_from_slice(key.as_bytes());
                push_flag(out, b'C', *if_match);
            }
            Command::Counter { direction, key, ttl, version } => {
                out.extend_from_slice(b"ma ");
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(&[b' ', b'M', direction.mode()]);
                // Auto-vivify with an initial value of 1 and the same ttl.
                push_ttl_flag(out, b'N', *ttl);
                out.extend_from_slice(b" J1 D1");
                push_ttl_flag(out, b'T', *ttl);
                push_optional_flag(out, b'E', *version);
                out.extend_from_slice(b" v c");
            }
            Command::CounterIfMatch { direction, key, ttl, if_match, version } => {
                out.extend_from_slice(b"ma ");
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(&[b' ', b'M', direction.mode()]);
                out.extend_from_slice(b" D1");
                push_ttl_flag(out, b'T', *ttl);
                push_flag(out, b'C', *if_match);
                push_optional_flag(out, b'E', *version);
                out.extend_from_slice(b" v c");
            }
        }
        out.extend_from_slice(CRLF);
    }

    /// Decodes this command's response from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; nothing is consumed in
    /// that case. Returns `Ok(Some(outcome))` once the whole response has
    /// been consumed. An `Err` means the stream can no longer be framed.
    pub fn decode(&self, buf: &mut BytesMut) -> ClientResult<Option<Outcome>> {
        let line_end = match find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let header = ResponseHeader::new(&buf[..line_end]);
        let step = self.interpret(&header)?;

        match step {
            Step::Done(outcome) => {
                let _ = buf.split_to(line_end + CRLF.len());
                Ok(Some(outcome))
            }
            Step::Body { len, version } => {
                let body_start = line_end + CRLF.len();
                let needed = body_start
                    .checked_add(len)
                    .and_then(|end| end.checked_add(CRLF.len()))
                    .ok_or_else(|| ClientError::Protocol("value length overflows".into()))?;
                if buf.len() < needed {
                    return Ok(None);
                }
                if &buf[body_start + len..needed] != CRLF {
                    return Err(ClientError::Protocol("value block is not terminated by CRLF".into()));
                }
                let _ = buf.split_to(body_start);
                let value = buf.split_to(len).freeze();
                let _ = buf.split_to(CRLF.len());
                Ok(Some(Ok(Reply { version, value: Some(value) })))
            }
        }
    }

    fn interpret(&self, header: &ResponseHeader<'_>) -> ClientResult<Step> {
        let verb = header.verb();
        let step = match self {
            Command::NoOp => match verb {
                Verb::Mn => Step::Done(Ok(Reply::default())),
                _ => Step::Done(Err(header.unexpected())),
            },
            Command::Set { .. } => match verb {
                Verb::Hd => Step::Done(Ok(Reply::version(header.cas()?))),
                Verb::Ns => Step::Done(Err(ClientError::ServiceUnavailable)),
                _ => Step::Done(Err(header.unexpected())),
            },
            Command::SetIfMatch { .. } => match verb {
                Verb::Hd => Step::Done(Ok(Reply::version(header.cas()?))),
                Verb::Ns => Step::Done(Err(ClientError::ServiceUnavailable)),
                Verb::Ex => Step::Done(Err(ClientError::PreconditionFailed)),
                Verb::Nf => Step::Done(Err(ClientError::NotFound)),
                _ => Step::Done(Err(header.unexpected())),
            },
            Command::Get { .. } => match verb {
                Verb::Va => header.body()?,
                Verb::En => Step::Done(Ok(Reply::not_found())),
                _ => Step::Done(Err(header.unexpected())),
            },
            Command::Touch { .. } => match verb {
                Verb::Hd => Step::Done(Ok(Reply::version(header.cas()?))),
                Verb::En => Step::Done(Ok(Reply::not_found())),
                _ => Step::Done(Err(header.unexpected())),
            },
            // A missing key already satisfies a delete.
            Command::Delete { .. } => match verb {
                Verb::Hd | Verb::Nf => Step::Done(Ok(Reply::default())),
                _ => Step::Done(Err(header.unexpected())),
            },
            Command::DeleteIfMatch { .. } => match verb {
                Verb::Hd | Verb::Nf => Step::Done(Ok(Reply::default())),
                Verb::Ex => Step::Done(Err(ClientError::PreconditionFailed)),
                _ => Step::Done(Err(header.unexpected())),
            },
            // Auto-vivification makes NF unreachable here, so only NS is
            // mapped; EX/NF fall through to the unexpected-header path.
            Command::Counter { .. } => match verb {
                Verb::Va => header.body()?,
                Verb::Ns => Step::Done(Err(ClientError::ServiceUnavailable)),
                _ => Step::Done(Err(header.unexpected())),
            },
            Command::CounterIfMatch { .. } => match verb {
                Verb::Va => header.body()?,
                Verb::Ns => Step::Done(Err(ClientError::ServiceUnavailable)),
                Verb::Ex => Step::Done(Err(ClientError::PreconditionFailed)),
                Verb::Nf => Step::Done(Err(ClientError::NotFound)),
                _ => Step::Done(Err(header.unexpected())),
            },
        };
        Ok(step)
    }
}

enum Step {
    Done(Outcome),
    Body { len: usize, version: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Hd,
    Va,
    En,
    Nf,
    Ex,
    Ns,
    Mn,
    Other,
}

impl Verb {
    fn parse(token: &[u8]) -> Verb {
        const VERBS: [(&[u8], Verb); 7] = [
            (b"HD" as &[u8], Verb::Hd),
            (b"VA" as &[u8], Verb::Va),
            (b"EN" as &[u8], Verb::En),
            (b"NF" as &[u8], Verb::Nf),
            (b"EX" as &[u8], Verb::Ex),
            (b"NS" as &[u8], Verb::Ns),
            (b"MN" as &[u8], Verb::Mn),
        ];
        VERBS
            .iter()
            .find(|(name, _)| token.eq_ignore_ascii_case(name))
            .map(|(_, verb)| *verb)
            .unwrap_or(Verb::Other)
    }
}

/// A response header line without its CRLF.
///
/// Tokens are split on spaces with empty tokens discarded; the first token
/// is the verb, the rest are positional arguments or single-letter flags.
struct ResponseHeader<'a> {
    line: &'a [u8],
}

impl<'a> ResponseHeader<'a> {
    fn new(line: &'a [u8]) -> Self {
        ResponseHeader { line }
    }

    fn tokens(&self) -> impl Iterator<Item = &'a [u8]> {
        self.line.split(|b| *b == b' ').filter(|token| !token.is_empty())
    }

    fn verb(&self) -> Verb {
        self.tokens().next().map(Verb::parse).unwrap_or(Verb::Other)
    }

    fn flag(&self, name: u8) -> Option<&'a [u8]> {
        self.tokens()
            .skip(1)
            .find(|token| token[0] == name)
            .map(|token| &token[1..])
    }

    fn cas(&self) -> ClientResult<u64> {
        self.flag(b'c')
            .and_then(parse_u64)
            .ok_or_else(|| self.malformed("missing or invalid c flag"))
    }

    fn body(&self) -> ClientResult<Step> {
        let len = self
            .tokens()
            .nth(1)
            .and_then(parse_u64)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| self.malformed("missing or invalid value length"))?;
        let version = self.cas()?;
        Ok(Step::Body { len, version })
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(self.line).into_owned()
    }

    fn unexpected(&self) -> ClientError {
        ClientError::InternalServerError { header: self.text() }
    }

    fn malformed(&self, reason: &str) -> ClientError {
        ClientError::Protocol(format!("{}: {:?}", reason, self.text()))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == CRLF)
}

fn push_flag(out: &mut BytesMut, name: u8, value: u64) {
    out.extend_from_slice(&[b' ', name]);
    push_u64(out, value);
}

fn push_optional_flag(out: &mut BytesMut, name: u8, value: Option<u64>) {
    if let Some(value) = value {
        push_flag(out, name, value);
    }
}

fn push_ttl_flag(out: &mut BytesMut, name: u8, ttl: Duration) {
    out.extend_from_slice(&[b' ', name]);
    push_ttl(out, ttl);
}

fn push_payload(out: &mut BytesMut, value: &Bytes) {
    out.extend_from_slice(CRLF);
    out.extend_from_slice(value);
    out.extend_from_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> Key {
        Key::new(text).unwrap()
    }

    fn encoded(command: &Command) -> Vec<u8> {
        let mut out = BytesMut::new();
        command.encode(&mut out);
        out.to_vec()
    }

    fn decode_all(command: &Command, input: &[u8]) -> Outcome {
        let mut buf = BytesMut::from(input);
        let outcome = command.decode(&mut buf).unwrap().expect("complete response");
        assert!(buf.is_empty(), "response not fully consumed");
        outcome
    }

    #[test]
    fn encodes_set() {
        let command = Command::Set {
            key: key("foo"),
            value: Bytes::from_static(b"AB"),
            ttl: Duration::from_secs(5),
            version: None,
        };
        assert_eq!(encoded(&command), b"ms foo 2 T5 c\r\nAB\r\n");
    }

    #[test]
    fn encodes_set_if_match_with_version() {
        let command = Command::SetIfMatch {
            key: key("foo"),
            value: Bytes::from_static(b"xyz"),
            ttl: Duration::from_secs(10),
            if_match: 7,
            version: Some(8),
        };
        assert_eq!(encoded(&command), b"ms foo 3 T10 C7 E8 c\r\nxyz\r\n");
    }

    #[test]
    fn encodes_reads() {
        assert_eq!(encoded(&Command::Get { key: key("foo"), ttl: None }), b"mg foo v c\r\n");
        assert_eq!(
            encoded(&Command::Get { key: key("foo"), ttl: Some(Duration::from_secs(30)) }),
            b"mg foo T30 v c\r\n"
        );
        assert_eq!(
            encoded(&Command::Touch { key: key("foo"), ttl: Duration::from_millis(2500) }),
            b"mg foo T2.5 c\r\n"
        );
        assert_eq!(encoded(&Command::NoOp), b"mn\r\n");
    }

    #[test]
    fn encodes_deletes() {
        assert_eq!(encoded(&Command::Delete { key: key("foo") }), b"md foo\r\n");
        assert_eq!(
            encoded(&Command::DeleteIfMatch { key: key("foo"), if_match: 42 }),
            b"md foo C42\r\n"
        );
    }

    #[test]
    fn encodes_counters() {
        let counter = Command::Counter {
            direction: Direction::Increment,
            key: key("hits"),
            ttl: Duration::from_secs(5),
            version: Some(3),
        };
        assert_eq!(encoded(&counter), b"ma hits MI N5 J1 D1 T5 E3 v c\r\n");

        let guarded = Command::CounterIfMatch {
            direction: Direction::Decrement,
            key: key("hits"),
            ttl: Duration::from_secs(5),
            if_match: 9,
            version: None,
        };
        assert_eq!(encoded(&guarded), b"ma hits MD D1 T5 C9 v c\r\n");
    }

    #[test]
    fn decodes_set_version() {
        let command = Command::Set {
            key: key("foo"),
            value: Bytes::new(),
            ttl: Duration::ZERO,
            version: None,
        };
        assert_eq!(decode_all(&command, b"HD c1\r\n").unwrap(), Reply { version: 1, value: None });
        assert!(matches!(decode_all(&command, b"NS\r\n"), Err(ClientError::ServiceUnavailable)));
    }

    #[test]
    fn decodes_value_block() {
        let command = Command::Get { key: key("foo"), ttl: None };
        let reply = decode_all(&command, b"VA 2 c1\r\nAB\r\n").unwrap();
        assert_eq!(reply.version, 1);
        assert_eq!(reply.value.as_deref(), Some(&b"AB"[..]));
    }

    #[test]
    fn value_block_may_contain_crlf() {
        let command = Command::Get { key: key("foo"), ttl: None };
        let reply = decode_all(&command, b"VA 4 c9\r\n\r\n\r\n\r\n").unwrap();
        assert_eq!(reply.value.as_deref(), Some(&b"\r\n\r\n"[..]));
    }

    #[test]
    fn waits_for_complete_body() {
        let command = Command::Get { key: key("foo"), ttl: None };
        let mut buf = BytesMut::from(&b"VA 5 c3\r\nhel"[..]);
        assert!(command.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 12);

        buf.extend_from_slice(b"lo\r\nHD");
        let reply = command.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(reply.value.as_deref(), Some(&b"hello"[..]));
        assert_eq!(&buf[..], b"HD");
    }

    #[test]
    fn waits_for_header_terminator() {
        let command = Command::NoOp;
        let mut buf = BytesMut::from(&b"MN\r"[..]);
        assert!(command.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        assert!(command.decode(&mut buf).unwrap().unwrap().is_ok());
    }

    #[test]
    fn read_miss_is_sentinel() {
        let get = Command::Get { key: key("gone"), ttl: None };
        assert_eq!(decode_all(&get, b"EN\r\n").unwrap(), Reply::not_found());

        let touch = Command::Touch { key: key("gone"), ttl: Duration::from_secs(1) };
        assert_eq!(decode_all(&touch, b"EN\r\n").unwrap(), Reply::not_found());
    }

    #[test]
    fn delete_treats_not_found_as_success() {
        let delete = Command::Delete { key: key("gone") };
        assert!(decode_all(&delete, b"NF\r\n").is_ok());
        assert!(decode_all(&delete, b"HD\r\n").is_ok());

        let guarded = Command::DeleteIfMatch { key: key("gone"), if_match: 1 };
        assert!(decode_all(&guarded, b"NF\r\n").is_ok());
        assert!(matches!(decode_all(&guarded, b"EX\r\n"), Err(ClientError::PreconditionFailed)));
    }

    #[test]
    fn set_if_match_maps_statuses() {
        let command = Command::SetIfMatch {
            key: key("foo"),
            value: Bytes::new(),
            ttl: Duration::ZERO,
            if_match: 1,
            version: None,
        };
        assert!(matches!(decode_all(&command, b"EX\r\n"), Err(ClientError::PreconditionFailed)));
        assert!(matches!(decode_all(&command, b"NF\r\n"), Err(ClientError::NotFound)));
        assert!(matches!(decode_all(&command, b"NS\r\n"), Err(ClientError::ServiceUnavailable)));
    }

    // The plain counter only maps NS; EX/NF surface as unexpected headers
    // while the CAS-guarded counter maps all three.
    #[test]
    fn counter_status_mapping_is_asymmetric() {
        let counter = Command::Counter {
            direction: Direction::Increment,
            key: key("hits"),
            ttl: Duration::from_secs(1),
            version: None,
        };
        assert!(matches!(decode_all(&counter, b"NS\r\n"), Err(ClientError::ServiceUnavailable)));
        assert!(matches!(
            decode_all(&counter, b"NF\r\n"),
            Err(ClientError::InternalServerError { header }) if header == "NF"
        ));
        assert!(matches!(decode_all(&counter, b"EX\r\n"), Err(ClientError::InternalServerError { .. })));

        let guarded = Command::CounterIfMatch {
            direction: Direction::Increment,
            key: key("hits"),
            ttl: Duration::from_secs(1),
            if_match: 2,
            version: None,
        };
        assert!(matches!(decode_all(&guarded, b"NF\r\n"), Err(ClientError::NotFound)));
        assert!(matches!(decode_all(&guarded, b"EX\r\n"), Err(ClientError::PreconditionFailed)));
        let reply = decode_all(&guarded, b"VA 2 c12\r\n41\r\n").unwrap();
        assert_eq!(reply.version, 12);
        assert_eq!(reply.value.as_deref(), Some(&b"41"[..]));
    }

    #[test]
    fn unknown_verb_keeps_header_text() {
        let outcome = decode_all(&Command::NoOp, b"SERVER_ERROR out of memory\r\n");
        match outcome {
            Err(ClientError::InternalServerError { header }) => {
                assert_eq!(header, "SERVER_ERROR out of memory");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn verbs_are_case_insensitive_and_tokens_skip_blanks() {
        let get = Command::Get { key: key("foo"), ttl: None };
        let reply = decode_all(&get, b"va  2   c5\r\nok\r\n").unwrap();
        assert_eq!(reply.version, 5);
    }

    #[test]
    fn malformed_value_header_is_a_fault() {
        let get = Command::Get { key: key("foo"), ttl: None };
        let mut buf = BytesMut::from(&b"VA x c1\r\n"[..]);
        let err = get.decode(&mut buf).unwrap_err();
        assert!(err.is_transport_fault());
    }

    #[test]
    fn oversized_value_length_is_a_fault() {
        let get = Command::Get { key: key("foo"), ttl: None };
        let mut buf = BytesMut::from(&b"VA 18446744073709551615 c1\r\nAB\r\n"[..]);
        let err = get.decode(&mut buf).unwrap_err();
        assert!(err.is_transport_fault());

        let mut buf = BytesMut::from(&b"VA 18446744073709551616 c1\r\nAB\r\n"[..]);
        assert!(matches!(get.decode(&mut buf), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn unterminated_value_block_is_a_fault() {
        let get = Command::Get { key: key("foo"), ttl: None };
        let mut buf = BytesMut::from(&b"VA 2 c1\r\nABCD"[..]);
        assert!(matches!(get.decode(&mut buf), Err(ClientError::Protocol(_))));
    }
}
