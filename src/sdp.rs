//! SDP rewriting
//!
//! Rewrites `c=`, `o=`, and `m=audio` lines so the offered media endpoint
//! points at the relay instead of the originating UA. A pure function of
//! `(sdp, server_endpoint)`; idempotent by construction since rewriting
//! twice produces the same output as rewriting once.

/// Rewrite an SDP body to point connection and media lines at
/// `(server_addr, rtp_port)`. Lines that don't match `c=`, `o=`, or the
/// first `m=audio` line pass through unchanged.
pub fn rewrite_sdp(sdp: &str, server_addr: &str, rtp_port: u16) -> String {
    let mut rewritten_m_audio = false;

    sdp.lines()
        .map(|line| {
            if let Some(rewritten) = rewrite_c_line(line, server_addr) {
                return rewritten;
            }
            if let Some(rewritten) = rewrite_o_line(line, server_addr) {
                return rewritten;
            }
            if !rewritten_m_audio {
                if let Some(rewritten) = rewrite_m_audio_line(line, rtp_port) {
                    rewritten_m_audio = true;
                    return rewritten;
                }
            }
            line.to_string()
        })
        .collect::<Vec<_>>()
        .join("\r\n")
        + if sdp.ends_with("\r\n") { "\r\n" } else { "" }
}

fn rewrite_c_line(line: &str, server_addr: &str) -> Option<String> {
    let rest = line.strip_prefix("c=IN IP4 ")?;
    let _old_addr = rest.trim();
    Some(format!("c=IN IP4 {}", server_addr))
}

fn rewrite_o_line(line: &str, server_addr: &str) -> Option<String> {
    let rest = line.strip_prefix("o=")?;
    let mut fields: Vec<&str> = rest.split_whitespace().collect();
    // username sess-id sess-version nettype addrtype unicast-address
    if fields.len() != 6 || fields[3] != "IN" || fields[4] != "IP4" {
        return None;
    }
    fields[5] = server_addr;
    Some(format!("o={}", fields.join(" ")))
}

fn rewrite_m_audio_line(line: &str, rtp_port: u16) -> Option<String> {
    let rest = line.strip_prefix("m=audio ")?;
    let mut fields = rest.splitn(2, ' ');
    let _old_port = fields.next()?;
    let remainder = fields.next().unwrap_or("");
    if remainder.is_empty() {
        Some(format!("m=audio {}", rtp_port))
    } else {
        Some(format!("m=audio {} {}", rtp_port, remainder))
    }
}

/// Extract the port from the first `m=audio <port> ...` line, if any.
pub fn extract_audio_port(sdp: &str) -> Option<u16> {
    sdp.lines()
        .find(|l| l.starts_with("m=audio "))
        .and_then(|l| l.strip_prefix("m=audio "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|p| p.parse().ok())
}
