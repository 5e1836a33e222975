//! Minimal HTTP/1.1 request construction (§6's "Optional HTTP(S)
//! transport"), for auxiliary uses such as downloading trust anchors
//! over a connection opened through [`crate::dns::tcp`].
//!
//! This is deliberately narrow: building the request line and headers is
//! in scope, a general-purpose HTTP client with response parsing,
//! chunked transfer decoding, or redirect handling is not — callers that
//! need those stream the raw reply bytes themselves.

/// User-Agent sent on every constructed request.
const USER_AGENT: &str = concat!("atlas-outnet/", env!("CARGO_PKG_VERSION"));

/// Builds a minimal `GET` request: request line, `Host`, `User-Agent`,
/// `Connection: close`, and the terminating blank line. `path` must
/// already include the leading `/`.
pub fn build_get_request(host: &str, path: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {ua}\r\nConnection: close\r\n\r\n",
        path = path,
        host = host,
        ua = USER_AGENT,
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_and_headers_are_well_formed() {
        let req = build_get_request("data.iana.org", "/root-anchors/root-anchors.xml");
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("GET /root-anchors/root-anchors.xml HTTP/1.1\r\n"));
        assert!(text.contains("Host: data.iana.org\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
