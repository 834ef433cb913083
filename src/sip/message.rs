//! SIP message codec
//!
//! Parses an inbound UDP payload as a SIP request or response and
//! serializes one back out. No I/O, no global state: a pure function pair
//! so it is unit-testable without sockets.

use crate::error::SipError;

/// Header names recognized by this conservative subset of RFC 3261.
/// Anything else lands in `other`, opaque and in the case it was received.
const RECOGNIZED: &[&str] = &[
    "Via",
    "From",
    "To",
    "Call-ID",
    "CSeq",
    "Contact",
    "Content-Type",
    "Content-Length",
    "Expires",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { status: u16, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct Headers {
    pub via: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub call_id: Option<String>,
    pub cseq: Option<String>,
    pub contact: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<String>,
    pub expires: Option<String>,
    /// Headers not in the recognized set, preserved in arrival order with
    /// their original (opaque) name casing.
    pub other: Vec<(String, String)>,
}

impl Headers {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "Via" => self.via = Some(value),
            "From" => self.from = Some(value),
            "To" => self.to = Some(value),
            "Call-ID" => self.call_id = Some(value),
            "CSeq" => self.cseq = Some(value),
            "Contact" => self.contact = Some(value),
            "Content-Type" => self.content_type = Some(value),
            "Content-Length" => self.content_length = Some(value),
            "Expires" => self.expires = Some(value),
            _ => self.other.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "Via" => self.via.as_deref(),
            "From" => self.from.as_deref(),
            "To" => self.to.as_deref(),
            "Call-ID" => self.call_id.as_deref(),
            "CSeq" => self.cseq.as_deref(),
            "Contact" => self.contact.as_deref(),
            "Content-Type" => self.content_type.as_deref(),
            "Content-Length" => self.content_length.as_deref(),
            "Expires" => self.expires.as_deref(),
            other => self
                .other
                .iter()
                .find(|(k, _)| k == other)
                .map(|(_, v)| v.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: Headers,
    pub body: String,
}

impl SipMessage {
    pub fn request(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Request {
                method: method.into(),
                uri: uri.into(),
            },
            headers: Headers::default(),
            body: String::new(),
        }
    }

    pub fn response(status: u16, reason: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Response {
                status,
                reason: reason.into(),
            },
            headers: Headers::default(),
            body: String::new(),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method.as_str()),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    /// Builder-style header setters; used when constructing downstream messages.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw UDP payload into a request or response.
    pub fn parse(datagram: &[u8]) -> Result<Self, SipError> {
        let text = String::from_utf8_lossy(datagram);
        let mut lines = text.split("\r\n");

        let first_line = lines
            .next()
            .ok_or_else(|| SipError::Parse("empty datagram".to_string()))?;

        let start_line = parse_start_line(first_line)?;

        let mut headers = Headers::default();
        let mut body_start_found = false;
        let mut body_lines: Vec<&str> = Vec::new();

        for line in lines.by_ref() {
            if line.is_empty() {
                body_start_found = true;
                break;
            }
            let colon = line
                .find(':')
                .ok_or_else(|| SipError::Parse(format!("header line missing colon: {:?}", line)))?;
            let name = line[..colon].trim().to_string();
            let value = line[colon + 1..].trim().to_string();
            headers.set(&name, value);
        }

        if body_start_found {
            body_lines.extend(lines);
        }

        let body = body_lines.join("\r\n");
        let body = body.trim_end_matches("\r\n").to_string();

        Ok(Self {
            start_line,
            headers,
            body,
        })
    }

    /// Serialize back to wire form: start line, each present header on its
    /// own CRLF line, `Content-Length` when a body is present, a blank
    /// line, then the body.
    pub fn serialize(&self) -> String {
        let mut out = String::new();

        match &self.start_line {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{} {} SIP/2.0\r\n", method, uri));
            }
            StartLine::Response { status, reason } => {
                out.push_str(&format!("SIP/2.0 {} {}\r\n", status, reason));
            }
        }

        let ordered: [(&str, &Option<String>); 8] = [
            ("Via", &self.headers.via),
            ("From", &self.headers.from),
            ("To", &self.headers.to),
            ("Call-ID", &self.headers.call_id),
            ("CSeq", &self.headers.cseq),
            ("Contact", &self.headers.contact),
            ("Content-Type", &self.headers.content_type),
            ("Expires", &self.headers.expires),
        ];

        for (name, value) in ordered {
            if let Some(v) = value {
                out.push_str(&format!("{}: {}\r\n", name, v));
            }
        }

        for (name, value) in &self.headers.other {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }

        if !self.body.is_empty() {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }

        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

fn parse_start_line(line: &str) -> Result<StartLine, SipError> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let status_str = parts
            .next()
            .ok_or_else(|| SipError::Parse(format!("malformed status line: {:?}", line)))?;
        let status: u16 = status_str
            .parse()
            .map_err(|_| SipError::Parse(format!("malformed status code: {:?}", status_str)))?;
        let reason = parts.next().unwrap_or("").to_string();
        return Ok(StartLine::Response { status, reason });
    }

    let mut parts = line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SipError::Parse(format!("malformed request line: {:?}", line)))?;
    let uri = parts
        .next()
        .ok_or_else(|| SipError::Parse(format!("malformed request line: {:?}", line)))?;
    let version = parts.next().unwrap_or("");
    if version != "SIP/2.0" {
        return Err(SipError::Parse(format!(
            "unsupported or missing SIP version: {:?}",
            line
        )));
    }

    Ok(StartLine::Request {
        method: method.to_string(),
        uri: uri.to_string(),
    })
}


/// Property tests for the two invariants spec.md §8 names for the codec:
/// `parse` never panics on arbitrary input, and `parse . serialize` is the
/// identity on messages the codec itself produced.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn method() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("INVITE".to_string()),
            Just("ACK".to_string()),
            Just("BYE".to_string()),
            Just("REGISTER".to_string()),
            Just("CANCEL".to_string()),
        ]
    }

    fn token() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9@:;<>./_-]{1,32}"
    }

    fn body() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "[a-zA-Z0-9=. -]{0,40}",
        ]
    }

    fn well_formed_message() -> impl Strategy<Value = SipMessage> {
        (method(), token(), token(), token(), token(), token(), token(), body()).prop_map(
            |(method, uri, via, from, to, call_id, cseq, body)| {
                SipMessage::request(method, format!("sip:{uri}@host"))
                    .with_header("Via", format!("SIP/2.0/UDP {via}"))
                    .with_header("From", format!("<sip:{from}@host>"))
                    .with_header("To", format!("<sip:{to}@host>"))
                    .with_header("Call-ID", call_id)
                    .with_header("CSeq", format!("1 {cseq}"))
                    .with_body(body)
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        /// Parsing must never panic, regardless of how malformed the datagram is.
        #[test]
        fn prop_parse_never_panics(datagram in ".*") {
            let _ = SipMessage::parse(datagram.as_bytes());
        }

        /// Parsing must never panic on arbitrary raw bytes either, not just
        /// valid UTF-8 text.
        #[test]
        fn prop_parse_never_panics_on_raw_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = SipMessage::parse(&bytes);
        }

        /// Serializing then reparsing a message the codec itself built must
        /// reproduce every recognized header and the body exactly.
        #[test]
        fn prop_round_trip_preserves_recognized_fields(msg in well_formed_message()) {
            let serialized = msg.serialize();
            let reparsed = SipMessage::parse(serialized.as_bytes()).expect("codec-built message must reparse");

            prop_assert_eq!(reparsed.method(), msg.method());
            prop_assert_eq!(reparsed.headers.via, msg.headers.via);
            prop_assert_eq!(reparsed.headers.from, msg.headers.from);
            prop_assert_eq!(reparsed.headers.to, msg.headers.to);
            prop_assert_eq!(reparsed.headers.call_id, msg.headers.call_id);
            prop_assert_eq!(reparsed.headers.cseq, msg.headers.cseq);
            prop_assert_eq!(reparsed.body, msg.body);
        }
    }
}
