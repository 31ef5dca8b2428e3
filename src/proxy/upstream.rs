//! Single-host reverse-proxy transport.
//!
//! Each forwarded request opens its own connection to the configured
//! upstream (`Connection: close` on the upstream leg), optionally wrapped in
//! TLS. Certificate verification can be disabled with a no-op verifier for
//! `--insecure-skip-verify`.

use anyhow::{anyhow, Context, Result};
use http::header::{HeaderMap, HeaderName, CONTENT_LENGTH, HOST};
use http::{Method, StatusCode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

use super::http::{
    content_length, is_chunked, parse_response_head, read_body_chunked, read_body_fixed,
    read_http_headers, ProxyRequest, ResponseHead,
};
use super::response::ApiError;
use super::silences::GettableSilence;

/// Headers that only belong to a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Upstream {
    https: bool,
    /// Authority used for the `Host` header (port only when explicit).
    authority: String,
    /// Address used to open the TCP connection.
    addr: String,
    /// TLS server name (host without port).
    server_name: String,
    base_path: String,
    tls: Option<TlsConnector>,
}

impl Upstream {
    pub fn new(url: &Url, insecure_skip_verify: bool) -> Result<Self> {
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(anyhow!("unsupported upstream scheme {:?}", other)),
        };
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("upstream URL has no host"))?
            .to_string();
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("upstream URL has no port"))?;

        let tls = if https {
            Some(TlsConnector::from(Arc::new(client_config(
                insecure_skip_verify,
            )?)))
        } else {
            None
        };

        Ok(Self {
            https,
            authority,
            addr: format!("{}:{}", host, port),
            server_name: host,
            base_path: url.path().trim_end_matches('/').to_string(),
            tls,
        })
    }

    /// Join the upstream base path with a request path.
    pub fn join_path(&self, path: &str) -> String {
        if self.base_path.is_empty() {
            path.to_string()
        } else {
            format!("{}{}", self.base_path, path)
        }
    }

    async fn connect(&self) -> Result<UpstreamStream> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.addr))?;

        if !self.https {
            return Ok(UpstreamStream::Plain(tcp));
        }

        let connector = self.tls.as_ref().expect("TLS connector present for https");
        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|_| anyhow!("invalid server name: {}", self.server_name))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .context("TLS handshake with upstream failed")?;
        Ok(UpstreamStream::Tls(Box::new(stream)))
    }

    fn encode_request_head(&self, req: &ProxyRequest, client_addr: Option<&str>) -> Vec<u8> {
        let mut target = self.join_path(&req.path);
        let query = req.encoded_query();
        if !query.is_empty() {
            target.push('?');
            target.push_str(&query);
        }

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method, target).as_bytes());
        out.extend_from_slice(format!("Host: {}\r\n", self.authority).as_bytes());

        let xff: HeaderName = HeaderName::from_static("x-forwarded-for");
        for (name, value) in &req.headers {
            if name == HOST || name == CONTENT_LENGTH || name == xff {
                continue;
            }
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        // Append the client to any forwarding chain it arrived with.
        let prior = req
            .headers
            .get(&xff)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(ip) = client_addr.map(strip_port) {
            let chain = match prior {
                Some(p) if !p.is_empty() => format!("{}, {}", p, ip),
                _ => ip.to_string(),
            };
            out.extend_from_slice(format!("X-Forwarded-For: {}\r\n", chain).as_bytes());
        }

        out.extend_from_slice(b"Connection: close\r\n");
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", req.body.len()).as_bytes());
        out
    }

    /// Send a request upstream and return a reader positioned at the start
    /// of the response. Transport failures surface as 502.
    pub async fn start_request(
        &self,
        req: &ProxyRequest,
        client_addr: Option<&str>,
    ) -> Result<BufReader<UpstreamStream>, ApiError> {
        let mut stream = self
            .connect()
            .await
            .map_err(|e| ApiError::bad_gateway(format!("proxy error: {:#}", e)))?;

        let head = self.encode_request_head(req, client_addr);
        let write = async {
            stream.write_all(&head).await?;
            stream.write_all(&req.body).await?;
            stream.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        write
            .await
            .map_err(|e| ApiError::bad_gateway(format!("proxy error: {}", e)))?;

        Ok(BufReader::new(stream))
    }

    /// Send a request upstream and buffer the whole response.
    pub async fn send(
        &self,
        req: &ProxyRequest,
    ) -> Result<(ResponseHead, Vec<u8>), ApiError> {
        let mut reader = self.start_request(req, None).await?;
        let head = read_response_head(&mut reader).await?;
        let body = read_response_body(&mut reader, &head).await?;
        Ok((head, body))
    }

    /// Fetch a silence by id from the Alertmanager upstream.
    pub async fn get_silence(&self, id: &str) -> Result<GettableSilence, ApiError> {
        let req = ProxyRequest::new(
            Method::GET,
            &format!("/api/v2/silence/{}", id),
            HeaderMap::new(),
            Vec::new(),
        );
        let (head, body) = self.send(&req).await?;
        if head.status != StatusCode::OK {
            return Err(ApiError::bad_gateway(format!(
                "proxy error: can't get silence: unexpected status {}",
                head.status
            )));
        }
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_gateway(format!("proxy error: can't decode silence: {}", e)))
    }
}

pub async fn read_response_head(
    reader: &mut BufReader<UpstreamStream>,
) -> Result<ResponseHead, ApiError> {
    let raw = read_http_headers(reader)
        .await
        .map_err(|e| ApiError::bad_gateway(format!("proxy error: {}", e)))?;
    if raw.is_empty() {
        return Err(ApiError::bad_gateway(
            "proxy error: upstream closed connection unexpectedly",
        ));
    }
    parse_response_head(&raw).map_err(|e| ApiError::bad_gateway(format!("proxy error: {}", e)))
}

/// Buffer a response body; when neither length nor chunked framing is
/// present the body runs until EOF (the upstream leg is `Connection: close`).
pub async fn read_response_body(
    reader: &mut BufReader<UpstreamStream>,
    head: &ResponseHead,
) -> Result<Vec<u8>, ApiError> {
    let body = if let Some(len) = content_length(&head.headers) {
        read_body_fixed(reader, len).await
    } else if is_chunked(&head.headers) {
        read_body_chunked(reader).await
    } else {
        let mut body = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(reader, &mut body)
            .await
            .map(|_| body)
            .map_err(Into::into)
    };
    body.map_err(|e| ApiError::bad_gateway(format!("proxy error: {}", e)))
}

fn strip_port(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn client_config(insecure_skip_verify: bool) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .context("failed to set protocol versions")?;

    let config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let root_store =
            RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(config)
}

/// Certificate verifier that accepts any upstream certificate. Installed
/// only when the operator passes `--insecure-skip-verify`.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn upstream(url: &str) -> Upstream {
        Upstream::new(&Url::parse(url).unwrap(), false).unwrap()
    }

    #[test]
    fn test_join_path() {
        let u = upstream("http://prometheus:9090");
        assert_eq!(u.join_path("/api/v1/query"), "/api/v1/query");

        let u = upstream("http://prometheus:9090/prom/");
        assert_eq!(u.join_path("/api/v1/query"), "/prom/api/v1/query");
    }

    #[test]
    fn test_scheme_validation() {
        assert!(Upstream::new(&Url::parse("ftp://x").unwrap(), false).is_err());
        assert!(Upstream::new(&Url::parse("https://x").unwrap(), false).is_ok());
    }

    #[test]
    fn test_request_head_strips_hop_by_hop() {
        let u = upstream("http://prometheus:9090");
        let mut req = ProxyRequest::new(
            Method::GET,
            "/api/v1/query?query=up",
            HeaderMap::new(),
            Vec::new(),
        );
        req.headers
            .insert("connection", HeaderValue::from_static("keep-alive"));
        req.headers
            .insert("accept", HeaderValue::from_static("application/json"));
        req.headers
            .insert("host", HeaderValue::from_static("proxy.example.com"));

        let head = String::from_utf8(u.encode_request_head(&req, Some("10.0.0.9:1234"))).unwrap();
        assert!(head.starts_with("GET /api/v1/query?query=up HTTP/1.1\r\n"));
        assert!(head.contains("Host: prometheus:9090\r\n"));
        assert!(head.contains("accept: application/json\r\n"));
        assert!(head.contains("X-Forwarded-For: 10.0.0.9\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("keep-alive"));
        assert!(!head.contains("proxy.example.com"));
    }
}
