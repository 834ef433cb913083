//! Structural validation for SIP URIs, headers, and SDP bodies.
//!
//! Validation never touches the Registrar or Dialog Manager: it only
//! checks that a message is well-formed enough to route. Extension
//! membership is checked against the caller-supplied inclusive range.

use super::message::SipMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSipUri {
    pub number: String,
    pub domain: String,
    pub port: Option<u16>,
}

/// Extract the URI from a `Name <uri>;params` style header value: the
/// content of the first angle-bracketed substring if present, else the
/// trimmed header.
pub fn extract_uri(header_value: &str) -> String {
    if let Some(start) = header_value.find('<') {
        if let Some(end) = header_value[start..].find('>') {
            return header_value[start + 1..start + end].to_string();
        }
    }
    header_value.trim().to_string()
}

/// Parse `sip:(\d+)@host(:port)?(;...)*`. The numeric user part must be
/// in `valid_extension` or this fails with a descriptive message.
pub fn parse_sip_uri(uri: &str, is_valid_extension: impl Fn(&str) -> bool) -> Result<ParsedSipUri, String> {
    let rest = uri
        .strip_prefix("sip:")
        .ok_or_else(|| format!("URI missing sip: scheme: {:?}", uri))?;

    // Strip ;params from the end, keep the user@host(:port) core.
    let core = rest.split(';').next().unwrap_or(rest);

    let at = core
        .find('@')
        .ok_or_else(|| format!("URI missing user part: {:?}", uri))?;
    let number = &core[..at];
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("URI user part is not numeric: {:?}", number));
    }

    let host_port = &core[at + 1..];
    let (domain, port) = match host_port.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| format!("URI port is not numeric: {:?}", port_str))?;
            (host.to_string(), Some(port))
        }
        None => (host_port.to_string(), None),
    };

    if domain.is_empty() {
        return Err(format!("URI missing host: {:?}", uri));
    }

    if !is_valid_extension(number) {
        return Err(format!("extension not in configured range: {}", number));
    }

    Ok(ParsedSipUri {
        number: number.to_string(),
        domain,
        port,
    })
}

fn is_call_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// `[A-Za-z0-9._-]+(@[A-Za-z0-9._-]+)?(-[A-Za-z0-9._-]+)?`
pub fn validate_call_id(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("Call-ID is empty".to_string());
    }
    let (local, rest) = match value.split_once('@') {
        Some((l, r)) => (l, Some(r)),
        None => (value, None),
    };
    if local.is_empty() || !local.chars().all(is_call_id_char) {
        return Err(format!("Call-ID has invalid characters: {:?}", value));
    }
    if let Some(domain) = rest {
        if domain.is_empty() || !domain.chars().all(is_call_id_char) {
            return Err(format!("Call-ID has invalid characters: {:?}", value));
        }
    }
    Ok(())
}

/// `\d+\s+[A-Z]+`
pub fn validate_cseq(value: &str) -> Result<(), String> {
    let mut parts = value.splitn(2, char::is_whitespace);
    let seq = parts.next().unwrap_or("");
    let method = parts.next().map(str::trim).unwrap_or("");
    if seq.is_empty() || !seq.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("CSeq sequence number is invalid: {:?}", value));
    }
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(format!("CSeq method is invalid: {:?}", value));
    }
    Ok(())
}

/// `SIP/2.0/UDP host:port(;params)*`
pub fn validate_via(value: &str) -> Result<(), String> {
    let rest = value
        .strip_prefix("SIP/2.0/UDP ")
        .ok_or_else(|| format!("Via missing SIP/2.0/UDP prefix: {:?}", value))?;
    let host_port = rest.split(';').next().unwrap_or(rest);
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| format!("Via missing port: {:?}", value))?;
    if host.is_empty() {
        return Err(format!("Via missing host: {:?}", value));
    }
    port.parse::<u16>()
        .map_err(|_| format!("Via port is not numeric: {:?}", port))?;
    Ok(())
}

/// SDP must contain at least one line each starting with v=, o=, s=, c=,
/// t=, m=, and the first m= line must be `m=audio <port> ...` with port
/// in `[1024, 65535]`.
pub fn validate_sdp(body: &str) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    for prefix in ["v=", "o=", "s=", "c=", "t=", "m="] {
        if !body.lines().any(|l| l.starts_with(prefix)) {
            errors.push(format!("SDP missing required {} line", prefix));
        }
    }

    if let Some(m_line) = body.lines().find(|l| l.starts_with("m=")) {
        let mut fields = m_line.trim_start_matches("m=").split_whitespace();
        let media_type = fields.next().unwrap_or("");
        if media_type != "audio" {
            errors.push(format!("unsupported media type: {:?}", media_type));
        } else {
            match fields.next().and_then(|p| p.parse::<u32>().ok()) {
                Some(port) if (1024..=65535).contains(&port) => {}
                _ => errors.push("m=audio port out of range [1024, 65535]".to_string()),
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn required_headers(msg: &SipMessage, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .filter(|&&name| msg.headers.get(name).is_none())
        .map(|name| format!("missing required header: {}", name))
        .collect()
}

pub fn validate_register(msg: &SipMessage, is_valid_extension: impl Fn(&str) -> bool) -> Result<(), Vec<String>> {
    let mut errors = required_headers(msg, &["To", "From", "Call-ID", "CSeq", "Contact"]);

    if let (Some(to), Some(from)) = (msg.headers.get("To"), msg.headers.get("From")) {
        let to_uri = parse_sip_uri(&extract_uri(to), &is_valid_extension);
        let from_uri = parse_sip_uri(&extract_uri(from), &is_valid_extension);
        match (&to_uri, &from_uri) {
            (Ok(t), Ok(f)) if t.number != f.number => {
                errors.push("To and From user parts must match on REGISTER".to_string());
            }
            _ => {}
        }
        if let Err(e) = to_uri {
            errors.push(e);
        }
        if let Err(e) = from_uri {
            errors.push(e);
        }
    }

    if let Some(call_id) = msg.headers.get("Call-ID") {
        if let Err(e) = validate_call_id(call_id) {
            errors.push(e);
        }
    }
    if let Some(cseq) = msg.headers.get("CSeq") {
        if let Err(e) = validate_cseq(cseq) {
            errors.push(e);
        }
    }
    if let Some(expires) = msg.headers.get("Expires") {
        match expires.parse::<i64>() {
            Ok(n) if (0..=86400).contains(&n) => {}
            _ => errors.push(format!("Expires out of range [0, 86400]: {:?}", expires)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn validate_invite(msg: &SipMessage, is_valid_extension: impl Fn(&str) -> bool) -> Result<(), Vec<String>> {
    let mut errors = required_headers(msg, &["To", "From", "Call-ID", "CSeq", "Contact"]);

    if let (Some(to), Some(from)) = (msg.headers.get("To"), msg.headers.get("From")) {
        let to_uri = parse_sip_uri(&extract_uri(to), &is_valid_extension);
        let from_uri = parse_sip_uri(&extract_uri(from), &is_valid_extension);
        if let (Ok(t), Ok(f)) = (&to_uri, &from_uri) {
            if t.number == f.number {
                errors.push(format!("self-call rejected: {}", t.number));
            }
        }
        if let Err(e) = to_uri {
            errors.push(e);
        }
        if let Err(e) = from_uri {
            errors.push(e);
        }
    }

    if let Some(call_id) = msg.headers.get("Call-ID") {
        if let Err(e) = validate_call_id(call_id) {
            errors.push(e);
        }
    }
    if let Some(cseq) = msg.headers.get("CSeq") {
        if let Err(e) = validate_cseq(cseq) {
            errors.push(e);
        }
    }

    let is_sdp = msg
        .headers
        .get("Content-Type")
        .map(|ct| ct.contains("application/sdp"))
        .unwrap_or(false);
    if is_sdp {
        if let Err(sdp_errors) = validate_sdp(&msg.body) {
            errors.extend(sdp_errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn validate_bye(msg: &SipMessage, is_valid_extension: impl Fn(&str) -> bool) -> Result<(), Vec<String>> {
    let mut errors = required_headers(msg, &["To", "From", "Call-ID", "CSeq"]);

    for header in ["To", "From"] {
        if let Some(value) = msg.headers.get(header) {
            if let Err(e) = parse_sip_uri(&extract_uri(value), &is_valid_extension) {
                errors.push(e);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
