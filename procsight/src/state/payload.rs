// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Lightweight payload inspection for the send/recv interceptors: pull an
//! HTTP request line out of an outgoing buffer, and the queried name out of
//! a UDP datagram headed for the DNS port. Both parsers give up early and
//! silently on anything that does not look like their protocol; they run on
//! the target's I/O path.

pub const DNS_PORT: u16 = 53;

const HTTP_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT",
];

/// Maximum number of bytes considered when scanning for a request line.
const URL_SCAN_LIMIT: usize = 1024;

/// Extract `METHOD target` from a buffer that starts with an HTTP request
/// line, plus the Host header when one is present in the same buffer.
pub fn extract_url(buf: &[u8]) -> Option<String> {
    let window = &buf[..buf.len().min(URL_SCAN_LIMIT)];
    let line_end = window.iter().position(|&b| b == b'\r' || b == b'\n')?;
    let line = std::str::from_utf8(&window[..line_end]).ok()?;

    let mut parts = line.split(' ');
    let method = parts.next()?;
    if !HTTP_METHODS.contains(&method) {
        return None;
    }
    let target = parts.next()?;
    if target.is_empty() || !parts.next().is_some_and(|v| v.starts_with("HTTP/")) {
        return None;
    }

    match host_header(&window[line_end..]) {
        Some(host) if !target.starts_with("http") => {
            Some(format!("{method} http://{host}{target}"))
        }
        _ => Some(format!("{method} {target}")),
    }
}

fn host_header(rest: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(rest).ok()?;
    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("host") {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Decode the first query name from a DNS request datagram. Compression
/// pointers never appear in the question section of a sane query; a pointer
/// byte aborts the parse.
pub fn dns_query_name(buf: &[u8]) -> Option<String> {
    const HEADER_LEN: usize = 12;
    if buf.len() <= HEADER_LEN {
        return None;
    }
    // QR must be 0 (a query) and QDCOUNT at least 1.
    if buf[2] & 0x80 != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut name = String::new();
    let mut at = HEADER_LEN;
    loop {
        let len = *buf.get(at)? as usize;
        if len == 0 {
            break;
        }
        if len & 0xc0 != 0 || len > 63 {
            return None;
        }
        let label = buf.get(at + 1..at + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        for &b in label {
            if !(b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
                return None;
            }
            name.push(b.to_ascii_lowercase() as char);
        }
        at += 1 + len;
        if name.len() > 253 {
            return None;
        }
    }

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns_query(name: &str) -> Vec<u8> {
        let mut buf = vec![
            0x12, 0x34, // id
            0x01, 0x00, // flags: RD
            0x00, 0x01, // qdcount
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // QTYPE A, QCLASS IN
        buf
    }

    #[test]
    fn decodes_query_names() {
        assert_eq!(
            dns_query_name(&dns_query("example.com")).as_deref(),
            Some("example.com")
        );
        assert_eq!(
            dns_query_name(&dns_query("a.b-c.example.org")).as_deref(),
            Some("a.b-c.example.org")
        );
    }

    #[test]
    fn rejects_responses_and_garbage() {
        let mut response = dns_query("example.com");
        response[2] |= 0x80; // QR = answer
        assert!(dns_query_name(&response).is_none());
        assert!(dns_query_name(b"not dns").is_none());
        assert!(dns_query_name(&[]).is_none());

        let mut compressed = dns_query("example.com");
        compressed[12] = 0xc0;
        assert!(dns_query_name(&compressed).is_none());
    }

    #[test]
    fn extracts_request_lines() {
        assert_eq!(
            extract_url(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").as_deref(),
            Some("GET http://example.com/index.html")
        );
        assert_eq!(
            extract_url(b"POST /api HTTP/1.0\r\n\r\n").as_deref(),
            Some("POST /api")
        );
        assert_eq!(
            extract_url(b"GET http://proxy.example/x HTTP/1.1\r\n").as_deref(),
            Some("GET http://proxy.example/x")
        );
    }

    #[test]
    fn ignores_non_http_buffers() {
        assert!(extract_url(b"\x16\x03\x01\x00\xa5").is_none()); // TLS hello
        assert!(extract_url(b"GETTING STARTED\r\n").is_none());
        assert!(extract_url(b"GET missing-version\r\n").is_none());
        assert!(extract_url(b"").is_none());
    }
}
