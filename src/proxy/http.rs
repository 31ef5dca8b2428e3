//! HTTP/1.1 plumbing for the proxy.
//!
//! The proxy speaks plain HTTP/1.1 on both legs: requests are parsed into a
//! [`ProxyRequest`] that the router can rewrite (query string, form body,
//! headers), and responses are written back with exact `Content-Length`
//! framing whenever a body was materialized. Chunked bodies are decoded on
//! the request side and preserved on the response side when streaming.

use anyhow::{anyhow, Context, Result};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    TRANSFER_ENCODING,
};
use http::{Method, StatusCode};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::response::ApiError;
use super::{routes, ProxyState};

/// Handle an incoming client connection: parse requests in a keep-alive
/// loop and hand each one to the router.
pub async fn handle_connection(stream: TcpStream, state: Arc<ProxyState>) -> Result<()> {
    let client_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    loop {
        // Read the next request head with an idle timeout.
        let raw = match tokio::time::timeout(
            super::CLIENT_IDLE_TIMEOUT,
            read_http_headers(&mut reader),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(_)) => break,
            Err(_) => {
                debug!("connection idle timeout");
                break;
            }
        };
        if raw.is_empty() {
            // Client closed the connection gracefully.
            break;
        }

        let head = match parse_request_head(&raw) {
            Ok(head) => head,
            Err(e) => {
                debug!(error = %e, "invalid HTTP request");
                break;
            }
        };
        let client_wants_close = head.http10 || wants_close(&head.headers);

        let body = read_body(&mut reader, &head.headers).await?;
        let req = ProxyRequest::new(head.method, &head.target, head.headers, body);

        let keep_alive = routes::handle(&state, req, &mut writer, &client_addr).await?;

        if client_wants_close || !keep_alive {
            break;
        }
    }

    Ok(())
}

/// A fully buffered inbound request, ready for rewriting.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    /// Decoded query parameters in order of appearance.
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn new(method: Method, target: &str, headers: HeaderMap, body: Vec<u8>) -> Self {
        let (path, raw_query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q),
            None => (target.to_string(), ""),
        };
        Self {
            method,
            path,
            query: parse_form(raw_query.as_bytes()),
            headers,
            body,
        }
    }

    /// All values of a query parameter, in order.
    pub fn query_values(&self, name: &str) -> Vec<String> {
        self.query
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn remove_query(&mut self, name: &str) {
        self.query.retain(|(k, _)| k != name);
    }

    /// Replace all occurrences of a parameter with a single value.
    pub fn set_query_value(&mut self, name: &str, value: String) {
        self.remove_query(name);
        self.query.push((name.to_string(), value));
    }

    /// Replace all occurrences of a parameter with the given values.
    pub fn set_query_values(&mut self, name: &str, values: Vec<String>) {
        self.remove_query(name);
        for v in values {
            self.query.push((name.to_string(), v));
        }
    }

    pub fn encoded_query(&self) -> String {
        encode_form(&self.query)
    }

    /// True when the request carries a form-encoded body that the proxy is
    /// allowed to parse (POST only; a GET with a body is forwarded as-is).
    pub fn has_form_body(&self) -> bool {
        if self.method != Method::POST || self.body.is_empty() {
            return false;
        }
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| {
                ct.trim()
                    .to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            })
            .unwrap_or(false)
    }

    pub fn form_pairs(&self) -> Vec<(String, String)> {
        parse_form(&self.body)
    }

    /// Replace the body and keep `Content-Length` in sync.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.headers.remove(TRANSFER_ENCODING);
        self.headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&body.len().to_string()).expect("length is a valid header"),
        );
        self.body = body;
    }

    pub fn set_form(&mut self, pairs: &[(String, String)]) {
        self.set_body(encode_form(pairs).into_bytes());
    }
}

pub fn parse_form(raw: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

pub fn encode_form(pairs: &[(String, String)]) -> String {
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        ser.append_pair(k, v);
    }
    ser.finish()
}

/// Parsed head of an inbound request.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub http10: bool,
    pub headers: HeaderMap,
}

/// Read HTTP headers (up to and including the blank line).
/// Returns the raw bytes including the final `\r\n\r\n`; empty on EOF.
pub async fn read_http_headers<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut headers = Vec::new();

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(headers);
        }

        headers.extend_from_slice(line.as_bytes());

        if line == "\r\n" || line == "\n" {
            break;
        }
        if headers.len() > 64 * 1024 {
            return Err(anyhow!("request head too large"));
        }
    }

    Ok(headers)
}

pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(raw).context("request head is not valid UTF-8")?;
    let mut lines = text.lines();
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;

    let mut parts = request_line.split_whitespace();
    let method: Method = parts
        .next()
        .ok_or_else(|| anyhow!("missing method"))?
        .parse()
        .context("invalid method")?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("missing request target"))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1");

    Ok(RequestHead {
        method,
        target,
        http10: version == "HTTP/1.0",
        headers: parse_header_lines(lines)?,
    })
}

/// Parsed head of an upstream response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
    let text = std::str::from_utf8(raw).context("response head is not valid UTF-8")?;
    let mut lines = text.lines();
    let status_line = lines.next().ok_or_else(|| anyhow!("empty response"))?;

    let code = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed status line: {:?}", status_line))?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| anyhow!("invalid status code: {:?}", code))?;

    Ok(ResponseHead {
        status,
        headers: parse_header_lines(lines)?,
    })
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line: {:?}", line))?;
        let name: HeaderName = name.trim().parse().context("invalid header name")?;
        let value = HeaderValue::from_str(value.trim()).context("invalid header value")?;
        headers.append(name, value);
    }
    Ok(headers)
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

pub fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("close"))
        .unwrap_or(false)
}

/// Read a message body according to its framing headers. Returns an empty
/// body when neither `Content-Length` nor chunked encoding is present.
pub async fn read_body<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    headers: &HeaderMap,
) -> Result<Vec<u8>> {
    if let Some(len) = content_length(headers) {
        read_body_fixed(reader, len).await
    } else if is_chunked(headers) {
        read_body_chunked(reader).await
    } else {
        Ok(Vec::new())
    }
}

/// Read a fixed-length body into a buffer.
pub async fn read_body_fixed<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    length: u64,
) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(length.min(1 << 20) as usize);
    let mut remaining = length;
    let mut buf = [0u8; 8192];

    while remaining > 0 {
        let to_read = std::cmp::min(remaining as usize, buf.len());
        let n = reader.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(anyhow!("unexpected EOF reading body"));
        }
        body.extend_from_slice(&buf[..n]);
        remaining -= n as u64;
    }

    Ok(body)
}

/// Read a chunked body into a buffer, returning the decoded content
/// (without chunk framing).
pub async fn read_body_chunked<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut body = Vec::new();

    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;

        let size_str = size_line.trim();
        let size_hex = size_str.split(';').next().unwrap_or(size_str);
        let chunk_size = usize::from_str_radix(size_hex, 16)
            .with_context(|| format!("invalid chunk size: {}", size_line.trim()))?;

        if chunk_size == 0 {
            // Terminal chunk: consume trailers up to the blank line.
            loop {
                let mut trailer_line = String::new();
                reader.read_line(&mut trailer_line).await?;
                if trailer_line == "\r\n" || trailer_line == "\n" || trailer_line.is_empty() {
                    break;
                }
            }
            break;
        }

        let mut remaining = chunk_size;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let to_read = std::cmp::min(remaining, buf.len());
            let n = reader.read(&mut buf[..to_read]).await?;
            if n == 0 {
                return Err(anyhow!("unexpected EOF in chunk"));
            }
            body.extend_from_slice(&buf[..n]);
            remaining -= n;
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }

    Ok(body)
}

/// Stream a fixed-length body from reader to writer.
pub async fn stream_body_fixed<R, W>(reader: &mut R, writer: &mut W, length: u64) -> Result<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut remaining = length;
    let mut buf = [0u8; 8192];

    while remaining > 0 {
        let to_read = std::cmp::min(remaining as usize, buf.len());
        let n = reader.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(anyhow!("unexpected EOF reading body"));
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        remaining -= n as u64;
    }

    Ok(())
}

/// Stream a chunked body from reader to writer, preserving chunk framing and
/// flushing after each chunk.
pub async fn stream_body_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;

        let size_str = size_line.trim();
        let size_hex = size_str.split(';').next().unwrap_or(size_str);
        let chunk_size = usize::from_str_radix(size_hex, 16)
            .with_context(|| format!("invalid chunk size: {}", size_line.trim()))?;

        writer.write_all(size_line.as_bytes()).await?;

        if chunk_size == 0 {
            loop {
                let mut trailer_line = String::new();
                reader.read_line(&mut trailer_line).await?;
                writer.write_all(trailer_line.as_bytes()).await?;
                if trailer_line == "\r\n" || trailer_line == "\n" || trailer_line.is_empty() {
                    break;
                }
            }
            writer.flush().await?;
            break;
        }

        let mut remaining = chunk_size;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let to_read = std::cmp::min(remaining, buf.len());
            let n = reader.read(&mut buf[..to_read]).await?;
            if n == 0 {
                return Err(anyhow!("unexpected EOF in chunk"));
            }
            writer.write_all(&buf[..n]).await?;
            remaining -= n;
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        writer.write_all(&crlf).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Serialize a response head. `Content-Length` is always set from
/// `body_len`; framing and connection headers are dropped.
pub fn encode_response_head(status: StatusCode, headers: &HeaderMap, body_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == http::header::CONNECTION
        {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body_len).as_bytes());
    out
}

/// Write a fully buffered response.
pub async fn write_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<()> {
    writer
        .write_all(&encode_response_head(status, headers, body.len()))
        .await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a proxy-originated error envelope.
pub async fn write_api_error<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    err: &ApiError,
) -> Result<()> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    write_response(writer, err.status, &headers, &err.to_body()).await
}

/// Decompress a gzip body when the response says it is gzip-encoded.
/// Returns `None` when the body is not gzip or decompression fails.
pub fn decompress_gzip_if_needed(headers: &HeaderMap, body: &[u8]) -> Option<Vec<u8>> {
    let is_gzip = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);

    if !is_gzip || body.is_empty() {
        return None;
    }

    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(body);
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => Some(decompressed),
        Err(e) => {
            tracing::warn!(error = %e, "failed to decompress gzip response");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_http_headers_complete() {
        let data = b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));

        let raw = read_http_headers(&mut reader).await.unwrap();
        let head = parse_request_head(&raw).unwrap();

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/path");
        assert!(!head.http10);
        assert_eq!(head.headers.get("host").unwrap(), "example.com");
    }

    #[tokio::test]
    async fn test_read_chunked_body() {
        let data = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));
        let body = read_body_chunked(&mut reader).await.unwrap();
        assert_eq!(body, b"Wikipedia");
    }

    #[test]
    fn test_parse_response_head() {
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n").unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(content_length(&head.headers), Some(2));
        assert!(!is_chunked(&head.headers));
    }

    #[test]
    fn test_query_parsing_and_rewrite() {
        let mut req = ProxyRequest::new(
            Method::GET,
            "/api/v1/query?query=up&namespace=default&namespace=second",
            HeaderMap::new(),
            Vec::new(),
        );
        assert_eq!(req.path, "/api/v1/query");
        assert_eq!(req.query_values("namespace"), vec!["default", "second"]);

        req.remove_query("namespace");
        assert_eq!(req.encoded_query(), "query=up");

        req.set_query_value("query", r#"up{namespace="default"}"#.to_string());
        assert_eq!(
            req.encoded_query(),
            "query=up%7Bnamespace%3D%22default%22%7D"
        );
    }

    #[test]
    fn test_form_body_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let post = ProxyRequest::new(Method::POST, "/x", headers.clone(), b"query=up".to_vec());
        assert!(post.has_form_body());
        assert_eq!(post.form_pairs(), vec![("query".into(), "up".into())]);

        // A GET with a form body is never parsed.
        let get = ProxyRequest::new(Method::GET, "/x", headers, b"query=up".to_vec());
        assert!(!get.has_form_body());
    }

    #[test]
    fn test_set_body_updates_content_length() {
        let mut req = ProxyRequest::new(Method::POST, "/x", HeaderMap::new(), Vec::new());
        req.set_body(b"hello".to_vec());
        assert_eq!(content_length(&req.headers), Some(5));
    }

    #[test]
    fn test_encode_response_head_sets_length_and_drops_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));

        let head = encode_response_head(StatusCode::OK, &headers, 10);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: application/json\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(!text.contains("999"));
        assert!(!text.to_lowercase().contains("transfer-encoding"));
    }

    #[test]
    fn test_gzip_detection() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"payload").unwrap();
        let gz = enc.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert_eq!(
            decompress_gzip_if_needed(&headers, &gz).as_deref(),
            Some(b"payload".as_ref())
        );
        assert!(decompress_gzip_if_needed(&HeaderMap::new(), &gz).is_none());
    }
}
