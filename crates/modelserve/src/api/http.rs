//! Hand-rolled HTTP/1.1 request parsing and response writing.
//!
//! Intentionally minimal: one request per connection, no chunked request
//! bodies, no pipelining, no persistent connections. Every response
//! advertises `Connection: close`.

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A parsed request: method, path, lowercased header names with trimmed
/// values, and the raw body bytes.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

const HEADER_END: &[u8] = b"\r\n\r\n";
const READ_BUF_SIZE: usize = 8192;

/// Read one request's bytes: until the header block plus any
/// `Content-Length` body is buffered, or the peer half-closes.
pub async fn read_request(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(READ_BUF_SIZE);
    let mut chunk = [0u8; READ_BUF_SIZE];

    loop {
        if let Some(head_end) = find_subslice(&buf, HEADER_END) {
            let body_start = head_end + HEADER_END.len();
            let expected = content_length(&buf[..head_end]);
            if buf.len() >= body_start + expected {
                break;
            }
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

/// Split buffered bytes on the blank-line boundary and parse the request
/// line and headers. `None` on malformed input (missing request line, too
/// few tokens).
pub fn parse_request(raw: &[u8]) -> Option<HttpRequest> {
    let (head, body) = match find_subslice(raw, HEADER_END) {
        Some(pos) => (&raw[..pos], raw[pos + HEADER_END.len()..].to_vec()),
        None => (raw, Vec::new()),
    };
    let head = std::str::from_utf8(head).ok()?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.to_lowercase(), value.trim().to_string());
        }
    }

    Some(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        body,
    })
}

/// Write a complete JSON response and flush.
pub async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}

/// Write the response head for a chunked streaming body.
pub async fn write_stream_head(stream: &mut TcpStream, sse: bool) -> std::io::Result<()> {
    let content_type = if sse {
        "text/event-stream"
    } else {
        "application/x-ndjson"
    };
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await
}

/// Write one HTTP chunk: `<hex-length>\r\n<payload>\r\n`.
pub async fn write_chunk(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let head = format!("{:X}\r\n", payload.len());
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(payload).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

/// Terminate a chunked transfer with the zero-length closing chunk.
pub async fn write_final_chunk(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(b"0\r\n\r\n").await?;
    stream.flush().await
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

fn content_length(head: &[u8]) -> usize {
    let Ok(head) = std::str::from_utf8(head) else {
        return 0;
    };
    head.split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_headers_and_body() {
        let raw = b"POST /api/generate HTTP/1.1\r\nHost: localhost\r\nContent-Type:  application/json \r\nAccept: text/event-stream\r\n\r\n{\"model\":\"demo\"}";
        let req = parse_request(raw).unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/generate");
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("accept"), Some("text/event-stream"));
        assert_eq!(req.body, b"{\"model\":\"demo\"}");
    }

    #[test]
    fn header_names_are_lowercased() {
        let raw = b"GET /api/health HTTP/1.1\r\nX-Custom-Header: Value\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.header("x-custom-header"), Some("Value"));
        assert_eq!(req.header("X-Custom-Header"), None);
    }

    #[test]
    fn rejects_too_few_request_line_tokens() {
        assert!(parse_request(b"GET\r\n\r\n").is_none());
        assert!(parse_request(b"").is_none());
    }

    #[test]
    fn request_without_blank_line_has_empty_body() {
        let req = parse_request(b"GET /api/health HTTP/1.1").unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.body.is_empty());
    }

    #[test]
    fn content_length_is_case_insensitive() {
        assert_eq!(content_length(b"POST / HTTP/1.1\r\ncontent-length: 12"), 12);
        assert_eq!(content_length(b"POST / HTTP/1.1\r\nContent-Length: 7"), 7);
        assert_eq!(content_length(b"POST / HTTP/1.1"), 0);
    }
}
