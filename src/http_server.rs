use std::io;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::ops::Deref;
use std::ops::DerefMut;

use bytes::BytesMut;
pub use http::*;
use tungstenite::handshake::derive_accept_key;
use tungstenite::protocol::Role;
use tungstenite::WebSocket;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Minimal blocking HTTP/1.1 server. One request per connection, handled on
/// its own thread by the caller; streaming responses (SSE, WebSocket
/// upgrades) take the stream over entirely.
#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    request_size_limit: Option<usize>,
}

impl HttpServer {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> std::result::Result<Self, BoxError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            request_size_limit: Some(1024 * 1024),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn set_request_size_limit(&mut self, limit: Option<usize>) {
        self.request_size_limit = limit;
    }

    pub fn incoming(&self) -> Incoming {
        Incoming {
            listener: &self.listener,
            request_size_limit: self.request_size_limit,
        }
    }
}

#[derive(Debug)]
pub struct Incoming<'a> {
    listener: &'a TcpListener,
    request_size_limit: Option<usize>,
}

impl Iterator for Incoming<'_> {
    type Item = std::result::Result<HttpRequest, BoxError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.listener.accept() {
            Ok((stream, remote_addr)) => Some(HttpRequest::from_stream(
                stream,
                remote_addr,
                self.request_size_limit,
            )),
            Err(e) => Some(Err(Box::new(e))),
        }
    }
}

#[derive(Debug)]
pub struct HttpRequest {
    stream: TcpStream,
    remote_addr: SocketAddr,
    request: Request<Vec<u8>>,
}

impl HttpRequest {
    fn from_stream(
        mut stream: TcpStream,
        remote_addr: SocketAddr,
        request_size_limit: Option<usize>,
    ) -> std::result::Result<Self, BoxError> {
        let mut buffer = BytesMut::new();
        let mut tmp = [0; 1024];

        loop {
            match stream.read(&mut tmp) {
                Ok(0) => {
                    return Err("Connection closed by client".into());
                }
                Ok(n) => {
                    buffer.extend_from_slice(&tmp[..n]);

                    if let Some(limit) = request_size_limit {
                        if buffer.len() > limit {
                            return Err("Request too large".into());
                        }
                    }

                    if let Some(header_end) = find_header_end(&buffer) {
                        let header_bytes = &buffer[..header_end];
                        let body_start = header_end + 4; // Skip \r\n\r\n

                        let request_line_end = header_bytes
                            .windows(2)
                            .position(|w| w == b"\r\n")
                            .ok_or("Invalid request line")?;

                        let request_line = std::str::from_utf8(&header_bytes[..request_line_end])?;
                        let mut parts = request_line.split_whitespace();
                        let method = parts.next().ok_or("Missing method")?;
                        let uri = parts.next().ok_or("Missing URI")?;
                        let version = parts.next().unwrap_or("HTTP/1.1");

                        let method = method.parse::<Method>()?;
                        let uri = uri.parse::<Uri>()?;
                        let version = match version {
                            "HTTP/1.0" => Version::HTTP_10,
                            "HTTP/1.1" => Version::HTTP_11,
                            _ => return Err("Unsupported HTTP version".into()),
                        };

                        let mut request_builder =
                            Request::builder().method(method).uri(uri).version(version);

                        let headers_start = request_line_end + 2;
                        let headers_bytes = &header_bytes[headers_start..];

                        for header_line in headers_bytes.split(|&b| b == b'\n') {
                            if header_line.is_empty() || header_line == b"\r" {
                                continue;
                            }

                            let header_line = if header_line.ends_with(b"\r") {
                                &header_line[..header_line.len() - 1]
                            } else {
                                header_line
                            };

                            if let Some(colon_pos) = header_line.iter().position(|&b| b == b':') {
                                let name = std::str::from_utf8(&header_line[..colon_pos])?.trim();
                                let value =
                                    std::str::from_utf8(&header_line[colon_pos + 1..])?.trim();
                                request_builder = request_builder.header(name, value);
                            }
                        }

                        let content_length = request_builder
                            .headers_ref()
                            .and_then(|h| h.get("content-length"))
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<usize>().ok());

                        let mut body = Vec::new();
                        if let Some(content_length) = content_length {
                            if content_length > 0 {
                                let mut bytes_read = 0;
                                if body_start < buffer.len() {
                                    let available =
                                        std::cmp::min(content_length, buffer.len() - body_start);
                                    body.extend_from_slice(
                                        &buffer[body_start..body_start + available],
                                    );
                                    bytes_read = available;
                                }

                                while bytes_read < content_length {
                                    let remaining = content_length - bytes_read;
                                    let to_read = std::cmp::min(remaining, tmp.len());
                                    match stream.read(&mut tmp[..to_read]) {
                                        Ok(0) => break,
                                        Ok(n) => {
                                            body.extend_from_slice(&tmp[..n]);
                                            bytes_read += n;
                                        }
                                        Err(e) => return Err(Box::new(e)),
                                    }
                                }
                            }
                        }

                        let request = request_builder.body(body)?;

                        return Ok(HttpRequest {
                            stream,
                            remote_addr,
                            request,
                        });
                    }
                }
                Err(e) => return Err(Box::new(e)),
            }
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Serializes and writes a full response, then closes the connection.
    pub fn respond<T: AsRef<[u8]>>(
        &mut self,
        response: Response<T>,
    ) -> std::result::Result<(), BoxError> {
        let (parts, body) = response.into_parts();
        let body = body.as_ref();

        let reason = parts.status.canonical_reason().unwrap_or("");
        write!(
            self.stream,
            "HTTP/1.1 {} {}\r\n",
            parts.status.as_u16(),
            reason
        )?;
        let mut has_length = false;
        for (name, value) in &parts.headers {
            if *name == header::CONTENT_LENGTH {
                has_length = true;
            }
            self.stream.write_all(name.as_str().as_bytes())?;
            self.stream.write_all(b": ")?;
            self.stream.write_all(value.as_bytes())?;
            self.stream.write_all(b"\r\n")?;
        }
        if !has_length {
            write!(self.stream, "content-length: {}\r\n", body.len())?;
        }
        self.stream.write_all(b"connection: close\r\n\r\n")?;
        self.stream.write_all(body)?;
        self.stream.flush()?;
        Ok(())
    }

    /// True when the request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .headers()
            .get("upgrade")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        upgrade && self.headers().contains_key("sec-websocket-key")
    }

    /// Completes the WebSocket handshake and hands the connection over.
    pub fn upgrade_websocket(mut self) -> std::result::Result<WebSocket<TcpStream>, BoxError> {
        let key = self
            .headers()
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
            .ok_or("missing sec-websocket-key")?;
        let accept = derive_accept_key(key.as_bytes());

        write!(
            self.stream,
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-accept: {accept}\r\n\r\n"
        )?;
        self.stream.flush()?;
        Ok(WebSocket::from_raw_socket(self.stream, Role::Server, None))
    }

    /// Takes over the stream for a server-sent-event response.
    pub fn into_sse(mut self) -> std::result::Result<SseStream, BoxError> {
        self.stream.write_all(
            b"HTTP/1.1 200 OK\r\n\
              content-type: text/event-stream\r\n\
              cache-control: no-cache\r\n\
              connection: keep-alive\r\n\
              access-control-allow-origin: *\r\n\r\n",
        )?;
        self.stream.flush()?;
        Ok(SseStream {
            stream: self.stream,
        })
    }

    /// Takes over the raw stream after writing a plain streaming-response
    /// preamble; used to relay proxied byte streams.
    pub fn into_raw_stream(
        mut self,
        content_type: &str,
    ) -> std::result::Result<TcpStream, BoxError> {
        write!(
            self.stream,
            "HTTP/1.1 200 OK\r\ncontent-type: {content_type}\r\nconnection: close\r\naccess-control-allow-origin: *\r\n\r\n"
        )?;
        self.stream.flush()?;
        Ok(self.stream)
    }
}

impl Deref for HttpRequest {
    type Target = Request<Vec<u8>>;

    fn deref(&self) -> &Self::Target {
        &self.request
    }
}

impl DerefMut for HttpRequest {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.request
    }
}

/// Writes `data:` lines on an upgraded event-stream connection.
pub struct SseStream {
    stream: TcpStream,
}

impl SseStream {
    pub fn write_event(&mut self, data: &str) -> io::Result<()> {
        for line in data.lines() {
            write!(self.stream, "data: {line}\n")?;
        }
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(request_bytes: &[u8]) -> (HttpRequest, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(request_bytes).unwrap();
        client.flush().unwrap();
        let (stream, remote) = listener.accept().unwrap();
        let request = HttpRequest::from_stream(stream, remote, Some(1024 * 1024)).unwrap();
        (request, client)
    }

    #[test]
    fn test_parse_get_request() {
        let (request, _client) =
            roundtrip(b"GET /api/health?probe=1 HTTP/1.1\r\nhost: test\r\n\r\n");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/api/health");
        assert_eq!(request.uri().query(), Some("probe=1"));
        assert_eq!(request.headers().get("host").unwrap(), "test");
    }

    #[test]
    fn test_parse_post_with_body() {
        let (request, _client) = roundtrip(
            b"POST /api/sessions HTTP/1.1\r\ncontent-length: 15\r\n\r\n{\"command\":[]}x",
        );
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.body().len(), 15);
    }

    #[test]
    fn test_respond_writes_status_and_body() {
        let (mut request, mut client) = roundtrip(b"GET / HTTP/1.1\r\n\r\n");
        let response = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("content-type", "application/json")
            .body("{\"error\":\"nope\"}".to_string())
            .unwrap();
        request.respond(response).unwrap();
        drop(request);

        let mut raw = String::new();
        client.read_to_string(&mut raw).unwrap();
        assert!(raw.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(raw.contains("content-type: application/json"));
        assert!(raw.contains("content-length: 16"));
        assert!(raw.ends_with("{\"error\":\"nope\"}"));
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let (request, _client) = roundtrip(
            b"GET /buffers HTTP/1.1\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        assert!(request.is_websocket_upgrade());

        let (request, _client) = roundtrip(b"GET /buffers HTTP/1.1\r\n\r\n");
        assert!(!request.is_websocket_upgrade());
    }

    #[test]
    fn test_websocket_upgrade_accept_key() {
        let (request, mut client) = roundtrip(
            b"GET /buffers HTTP/1.1\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        let _socket = request.upgrade_websocket().unwrap();

        let mut buf = [0u8; 512];
        let n = client.read(&mut buf).unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 101"));
        // RFC 6455's canonical accept value for the sample nonce
        assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_sse_stream_format() {
        let (request, mut client) = roundtrip(b"GET /stream HTTP/1.1\r\n\r\n");
        let mut sse = request.into_sse().unwrap();
        sse.write_event("{\"hello\":1}").unwrap();
        drop(sse);

        let mut raw = String::new();
        client.read_to_string(&mut raw).unwrap();
        assert!(raw.contains("content-type: text/event-stream"));
        assert!(raw.contains("data: {\"hello\":1}\n\n"));
    }
}
