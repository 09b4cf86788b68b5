use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tungstenite::protocol::Message;
use tungstenite::WebSocket;
use tracing::{debug, warn};

use crate::protocol::{BufferClientMessage, BufferServerMessage};
use crate::remotes::RemoteRegistry;
use crate::stream::{StreamHub, StreamMessage};

/// Magic byte opening every binary buffer frame.
pub const BUFFER_MAGIC: u8 = 0xBF;

/// Budget for opening the upstream WebSocket to a remote.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// `[0xBF | u32-le id-length | session id | opaque payload]`
pub fn encode_frame(session_id: &str, payload: &[u8]) -> Vec<u8> {
    let id = session_id.as_bytes();
    let mut frame = Vec::with_capacity(1 + 4 + id.len() + payload.len());
    frame.push(BUFFER_MAGIC);
    frame.extend_from_slice(&(id.len() as u32).to_le_bytes());
    frame.extend_from_slice(id);
    frame.extend_from_slice(payload);
    frame
}

pub fn decode_frame(frame: &[u8]) -> Option<(String, &[u8])> {
    if frame.len() < 5 || frame[0] != BUFFER_MAGIC {
        return None;
    }
    let id_len = u32::from_le_bytes(frame[1..5].try_into().ok()?) as usize;
    if frame.len() < 5 + id_len {
        return None;
    }
    let session_id = std::str::from_utf8(&frame[5..5 + id_len]).ok()?.to_string();
    Some((session_id, &frame[5 + id_len..]))
}

type ClientSocket = Arc<Mutex<WebSocket<TcpStream>>>;

fn send_json(socket: &ClientSocket, message: &BufferServerMessage) -> bool {
    let Ok(text) = serde_json::to_string(message) else {
        return false;
    };
    let mut ws = socket.lock().unwrap_or_else(|e| e.into_inner());
    ws.send(Message::Text(text.into())).is_ok()
}

fn send_binary(socket: &ClientSocket, frame: Vec<u8>) -> bool {
    let mut ws = socket.lock().unwrap_or_else(|e| e.into_inner());
    ws.send(Message::Binary(frame.into())).is_ok()
}

struct LocalPump {
    stop: Arc<AtomicBool>,
}

impl LocalPump {
    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// One shared upstream WebSocket per remote, relaying binary buffer frames
/// from the remote to every local client subscribed to one of its sessions.
struct UpstreamRelay {
    socket: Mutex<WebSocket<TcpStream>>,
    /// session id → (client id, client socket)
    routes: Mutex<HashMap<String, Vec<(u64, ClientSocket)>>>,
}

impl UpstreamRelay {
    fn connect(url: &str, token: &str) -> anyhow::Result<Arc<Self>> {
        let uri: http::Uri = url.parse()?;
        let host = uri.host().ok_or_else(|| anyhow::anyhow!("remote url has no host"))?;
        let port = uri.port_u16().unwrap_or(80);
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect_timeout(
            &addr
                .parse()
                .or_else(|_| {
                    use std::net::ToSocketAddrs;
                    addr.to_socket_addrs()?
                        .next()
                        .ok_or_else(|| std::io::Error::other("unresolvable remote host"))
                })?,
            UPSTREAM_CONNECT_TIMEOUT,
        )?;

        let request = http::Request::builder()
            .uri(format!("ws://{host}:{port}/buffers"))
            .header("Authorization", format!("Bearer {token}"))
            .body(())?;
        let (socket, _response) = tungstenite::client(request, stream)
            .map_err(|err| anyhow::anyhow!("websocket handshake failed: {err}"))?;
        // short read timeouts keep the relay loop responsive without
        // starving writers of the socket lock
        socket
            .get_ref()
            .set_read_timeout(Some(Duration::from_millis(100)))?;

        let relay = Arc::new(Self {
            socket: Mutex::new(socket),
            routes: Mutex::new(HashMap::new()),
        });

        let reader = Arc::clone(&relay);
        std::thread::Builder::new()
            .name("buffer-upstream".to_string())
            .spawn(move || reader.read_loop())?;
        Ok(relay)
    }

    fn read_loop(&self) {
        loop {
            let message = {
                let mut socket = self.socket.lock().unwrap_or_else(|e| e.into_inner());
                socket.read()
            };
            match message {
                Ok(Message::Binary(frame)) => {
                    if let Some((session_id, _payload)) = decode_frame(&frame) {
                        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(clients) = routes.get(&session_id) {
                            for (_, client) in clients {
                                send_binary(client, frame.to_vec());
                            }
                        }
                    }
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(tungstenite::Error::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(Message::Frame(_)) => {}
                Err(err) => {
                    debug!(%err, "upstream buffer socket closed");
                    break;
                }
            }
        }
    }

    fn subscribe(&self, client_id: u64, client: &ClientSocket, session_id: &str) {
        {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            routes
                .entry(session_id.to_string())
                .or_default()
                .push((client_id, Arc::clone(client)));
        }
        self.send_upstream(&BufferClientMessage::Subscribe {
            session_id: session_id.to_string(),
        });
    }

    fn unsubscribe(&self, client_id: u64, session_id: &str) {
        let now_empty = {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(clients) = routes.get_mut(session_id) {
                clients.retain(|(id, _)| *id != client_id);
                if clients.is_empty() {
                    routes.remove(session_id);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if now_empty {
            self.send_upstream(&BufferClientMessage::Unsubscribe {
                session_id: session_id.to_string(),
            });
        }
    }

    fn send_upstream(&self, message: &BufferClientMessage) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        let mut socket = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = socket.send(Message::Text(text.into())) {
            warn!(%err, "failed to talk to upstream buffer socket");
        }
    }
}

/// Serves `/buffers` WebSocket clients: local sessions stream straight from
/// the stream hub as binary frames; sessions owned by a remote are relayed
/// through one shared upstream socket per remote.
pub struct BufferAggregator {
    hub: Arc<StreamHub>,
    registry: Option<Arc<RemoteRegistry>>,
    upstreams: Mutex<HashMap<String, Arc<UpstreamRelay>>>,
    next_client: AtomicU64,
}

impl BufferAggregator {
    pub fn new(hub: Arc<StreamHub>, registry: Option<Arc<RemoteRegistry>>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            registry,
            upstreams: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        })
    }

    /// Runs one client connection to completion. Call from the connection's
    /// own thread.
    pub fn handle_client(&self, socket: WebSocket<TcpStream>) {
        let client_id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let _ = socket.get_ref().set_read_timeout(Some(Duration::from_millis(100)));
        let socket: ClientSocket = Arc::new(Mutex::new(socket));
        send_json(&socket, &BufferServerMessage::Connected { version: 1 });

        let mut local_pumps: HashMap<String, LocalPump> = HashMap::new();
        let mut remote_subscriptions: Vec<(String, String)> = Vec::new(); // (remote id, session id)

        loop {
            let message = {
                let mut ws = socket.lock().unwrap_or_else(|e| e.into_inner());
                ws.read()
            };
            let message = match message {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                Err(_) => break,
            };

            match message {
                Message::Text(text) => {
                    match serde_json::from_str::<BufferClientMessage>(text.as_str()) {
                        Ok(BufferClientMessage::Subscribe { session_id }) => {
                            self.subscribe(
                                client_id,
                                &socket,
                                &session_id,
                                &mut local_pumps,
                                &mut remote_subscriptions,
                            );
                        }
                        Ok(BufferClientMessage::Unsubscribe { session_id }) => {
                            if let Some(pump) = local_pumps.remove(&session_id) {
                                pump.stop();
                            }
                            remote_subscriptions.retain(|(remote_id, sid)| {
                                if sid == &session_id {
                                    self.upstream_unsubscribe(remote_id, client_id, sid);
                                    false
                                } else {
                                    true
                                }
                            });
                        }
                        Ok(BufferClientMessage::Ping) => {
                            send_json(&socket, &BufferServerMessage::Pong);
                        }
                        Ok(BufferClientMessage::Pong) => {}
                        Err(err) => {
                            send_json(
                                &socket,
                                &BufferServerMessage::Error {
                                    message: format!("unrecognized message: {err}"),
                                },
                            );
                        }
                    }
                }
                Message::Ping(payload) => {
                    let mut ws = socket.lock().unwrap_or_else(|e| e.into_inner());
                    let _ = ws.send(Message::Pong(payload));
                }
                Message::Close(_) => break,
                Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        // teardown: stop pumps and propagate unsubscribes upstream
        for (_, pump) in local_pumps {
            pump.stop();
        }
        for (remote_id, session_id) in remote_subscriptions {
            self.upstream_unsubscribe(&remote_id, client_id, &session_id);
        }
        debug!(client_id, "buffer client disconnected");
    }

    fn subscribe(
        &self,
        client_id: u64,
        socket: &ClientSocket,
        session_id: &str,
        local_pumps: &mut HashMap<String, LocalPump>,
        remote_subscriptions: &mut Vec<(String, String)>,
    ) {
        // remote-owned sessions relay through HQ's upstream socket
        if let Some(remote) = self
            .registry
            .as_ref()
            .and_then(|registry| registry.get_by_session_id(session_id))
        {
            match self.upstream_for(&remote.id, &remote.url, &remote.token) {
                Ok(relay) => {
                    relay.subscribe(client_id, socket, session_id);
                    remote_subscriptions.push((remote.id, session_id.to_string()));
                    send_json(
                        socket,
                        &BufferServerMessage::Subscribed {
                            session_id: session_id.to_string(),
                        },
                    );
                }
                Err(err) => {
                    warn!(remote = remote.name, %err, "failed to reach remote buffers");
                    send_json(
                        socket,
                        &BufferServerMessage::Error {
                            message: format!("remote unreachable: {err}"),
                        },
                    );
                }
            }
            return;
        }

        match self.hub.subscribe(session_id) {
            Ok(subscription) => {
                let stop = Arc::new(AtomicBool::new(false));
                let pump_stop = Arc::clone(&stop);
                let pump_socket = Arc::clone(socket);
                let pump_session = session_id.to_string();
                std::thread::spawn(move || {
                    while !pump_stop.load(Ordering::SeqCst) {
                        match subscription.rx.recv_timeout(Duration::from_millis(200)) {
                            Ok(StreamMessage::Line(line)) => {
                                let mut payload = line.into_bytes();
                                payload.push(b'\n');
                                if !send_binary(
                                    &pump_socket,
                                    encode_frame(&pump_session, &payload),
                                ) {
                                    break;
                                }
                            }
                            Ok(StreamMessage::End) => break,
                            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                });
                local_pumps.insert(session_id.to_string(), LocalPump { stop });
                send_json(
                    socket,
                    &BufferServerMessage::Subscribed {
                        session_id: session_id.to_string(),
                    },
                );
            }
            Err(err) => {
                send_json(
                    socket,
                    &BufferServerMessage::Error {
                        message: err.to_string(),
                    },
                );
            }
        }
    }

    fn upstream_for(
        &self,
        remote_id: &str,
        url: &str,
        token: &str,
    ) -> anyhow::Result<Arc<UpstreamRelay>> {
        let mut upstreams = self.upstreams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(relay) = upstreams.get(remote_id) {
            return Ok(Arc::clone(relay));
        }
        let relay = UpstreamRelay::connect(url, token)?;
        upstreams.insert(remote_id.to_string(), Arc::clone(&relay));
        Ok(relay)
    }

    fn upstream_unsubscribe(&self, remote_id: &str, client_id: u64, session_id: &str) {
        let upstreams = self.upstreams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(relay) = upstreams.get(remote_id) {
            relay.unsubscribe(client_id, session_id);
        }
    }
}
