//! Messaging: reliable UDP control (ACK/retry) plus TCP file transfer,
//! the shared receive loop, the waiter table, and the work-queue
//! consumer (spec.md §4.4).

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use socket2::{Domain, Protocol as SockProto, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

use crate::collaborators::{FileTypeSniffer, FilenameSanitizer};
use crate::discovery::{Discovery, PORT};
use crate::error::MessagingError;
use crate::identity::{UserId, BROADCAST};
use crate::peer::PeerTable;
use crate::persistence::HistoryStore;
use crate::wire::{classify, Frame, Header, MessageBody, OpCode, Response, Status};

/// Shared UDP/TCP socket buffer size (spec.md §4.4).
pub const SOCKET_BUF_SIZE: usize = 262_144;
/// Recv buffer for a single UDP datagram.
const UDP_RECV_BUF: usize = 4096;
/// TCP listener backlog (spec.md §4.4).
const TCP_BACKLOG: i32 = 5;
/// File chunk size for the TCP bulk phase (spec.md §4.4.2).
const FILE_CHUNK: usize = 32 * 1024;
/// Log cadence while streaming an inbound file (spec.md §4.4.3).
const LOG_EVERY: u64 = 1024 * 1024;

/// Retry backoff schedule for `_send_and_wait` (spec.md §4.4.1): three
/// attempts total, with these delays between them.
const BACKOFFS: [Duration; 2] = [Duration::from_millis(250), Duration::from_millis(500)];
const MAX_ATTEMPTS: u32 = 3;

/// TTL for receiver-side pending state (file headers awaiting their TCP
/// body, message headers awaiting their UDP body), swept on this cadence
/// (spec.md §4.4, §8 invariant 7).
const PENDING_TTL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// How long the receiver waits for a message body after acking its header.
const BODY_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds the TCP listener used for file bodies, with the same buffer
/// sizes and a backlog of 5 (spec.md §4.4).
pub fn bind_tcp_listener(ip: Ipv4Addr, port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProto::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(SOCKET_BUF_SIZE)?;
    socket.set_send_buffer_size(SOCKET_BUF_SIZE)?;
    socket.bind(&SocketAddr::new(ip.into(), port).into())?;
    socket.listen(TCP_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

struct AckWaiter {
    /// Kept for logging/diagnostics; the Response frame itself carries no
    /// `BodyId` (see SPEC_FULL.md §4.4), so matching is by peer alone.
    bid: u8,
    notify: Arc<Notify>,
}

struct PendingMessageHeader {
    header: Header,
    reply_addr: SocketAddr,
    notify: Arc<Notify>,
    body: AsyncMutex<Option<MessageBody>>,
    created_at: Instant,
}

struct PendingFileHeader {
    header: Header,
    created_at: Instant,
}

/// Bounded inbound work-queue: a ring buffer guarded by an async lock,
/// paired with a `Notify` so the consumer can sleep between pushes.
/// Overflow drops the oldest queued entry (not the newly-arriving one)
/// and logs a warning (spec.md §5 backpressure note).
struct WorkQueue {
    capacity: usize,
    items: AsyncMutex<VecDeque<(UserId, String)>>,
    notify: Notify,
}

impl WorkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: AsyncMutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    async fn push(&self, from: UserId, text: String) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            let evicted = items.pop_front();
            warn!(
                "inbound work-queue full (capacity {}), dropping oldest queued message from {:?} to admit the new one",
                self.capacity,
                evicted.map(|(f, _)| f),
            );
        }
        items.push_back((from, text));
        drop(items);
        self.notify.notify_one();
    }

    /// Pops the oldest item, waiting if the queue is currently empty.
    async fn pop(&self) -> (UserId, String) {
        loop {
            if let Some(item) = self.items.lock().await.pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

pub struct Messaging {
    local_id: UserId,
    socket: Arc<UdpSocket>,
    tcp_listener: Arc<TcpListener>,
    peers: Arc<PeerTable>,
    discovery: Arc<Discovery>,
    history: Arc<dyn HistoryStore>,
    downloads_dir: PathBuf,
    sanitizer: Arc<dyn FilenameSanitizer>,
    sniffer: Arc<dyn FileTypeSniffer>,
    next_bid: AtomicU8,
    acks: AsyncMutex<HashMap<UserId, AckWaiter>>,
    pending_message_headers: AsyncMutex<HashMap<u8, Arc<PendingMessageHeader>>>,
    pending_file_headers: AsyncMutex<HashMap<u8, PendingFileHeader>>,
    work_queue: WorkQueue,
    shutdown: Arc<AtomicBool>,
    /// Whether this node has ever completed a TCP handshake (outbound
    /// connect or inbound accept) — the node-level reachability
    /// heuristic `engine.tcp_ok` (spec.md §6) is read from this.
    tcp_ok: AtomicBool,
}

impl Messaging {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: UserId,
        socket: Arc<UdpSocket>,
        tcp_listener: Arc<TcpListener>,
        peers: Arc<PeerTable>,
        discovery: Arc<Discovery>,
        history: Arc<dyn HistoryStore>,
        downloads_dir: PathBuf,
        sanitizer: Arc<dyn FilenameSanitizer>,
        sniffer: Arc<dyn FileTypeSniffer>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            socket,
            tcp_listener,
            peers,
            discovery,
            history,
            downloads_dir,
            sanitizer,
            sniffer,
            next_bid: AtomicU8::new(rand::random::<u8>()),
            acks: AsyncMutex::new(HashMap::new()),
            pending_message_headers: AsyncMutex::new(HashMap::new()),
            pending_file_headers: AsyncMutex::new(HashMap::new()),
            work_queue: WorkQueue::new(queue_capacity),
            shutdown: Arc::new(AtomicBool::new(false)),
            tcp_ok: AtomicBool::new(false),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Node-level TCP reachability heuristic (spec.md §6 `engine.tcp_ok`):
    /// true once this node has completed at least one TCP handshake,
    /// inbound or outbound.
    pub fn tcp_ok(&self) -> bool {
        self.tcp_ok.load(Ordering::Relaxed)
    }

    fn next_body_id(&self) -> u8 {
        self.next_bid.fetch_add(1, Ordering::Relaxed)
    }

    async fn peer_addr(&self, id: UserId) -> Result<SocketAddr, MessagingError> {
        let peer = self
            .peers
            .get(&id)
            .await
            .ok_or(MessagingError::UnknownPeer(id))?;
        Ok(SocketAddr::new(peer.ip.into(), PORT))
    }

    async fn reply(&self, addr: SocketAddr, status: Status) {
        let response = Response {
            status,
            responder: self.local_id,
        };
        if let Err(e) = self.socket.send_to(&response.encode(), addr).await {
            warn!("failed to send {:?} response to {}: {}", status, addr, e);
        }
    }

    // =====================================================================
    // Sending
    // =====================================================================

    /// `send(recipient, text, timeout)` — spec.md §4.4.1.
    pub async fn send(
        &self,
        recipient: UserId,
        text: &str,
        timeout: Duration,
    ) -> Result<(), MessagingError> {
        let addr = self.peer_addr(recipient).await?;
        let bid = self.next_body_id();

        let header = Header {
            from: self.local_id,
            to: recipient,
            op: OpCode::Message,
            bid,
            body_len: 1 + text.len() as u64,
        };
        self.send_and_wait(&header.encode(), recipient, addr, bid, timeout)
            .await?;

        let body = MessageBody {
            bid,
            payload: text.as_bytes().to_vec(),
        };
        self.send_and_wait(&body.encode(), recipient, addr, bid, timeout)
            .await?;

        self.history
            .append_message(self.local_id, Some(recipient), text.to_string(), Utc::now())
            .map_err(|e| MessagingError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }

    /// `send_file(recipient, bytes, filename, timeout)` — spec.md §4.4.2.
    pub async fn send_file(
        &self,
        recipient: UserId,
        bytes: &[u8],
        filename: &str,
        timeout: Duration,
    ) -> Result<(), MessagingError> {
        let addr = self.peer_addr(recipient).await?;
        let bid = self.next_body_id();

        let header = Header {
            from: self.local_id,
            to: recipient,
            op: OpCode::File,
            bid,
            body_len: bytes.len() as u64,
        };
        self.send_and_wait(&header.encode(), recipient, addr, bid, timeout)
            .await?;

        // Give the receiver time to arm its TCP accept/matching logic.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MessagingError::TransferFailed {
                peer: addr,
                reason: e.to_string(),
            })?;

        // A completed outbound handshake is itself a TCP reachability
        // signal for this peer and for this node generally (spec.md §3,
        // §6), independent of whether the transfer that follows succeeds.
        self.peers.set_tcp_ok(&recipient, true).await;
        self.tcp_ok.store(true, Ordering::Relaxed);

        let preamble_result: Result<(), std::io::Error> = async {
            stream.write_all(&(bid as u64).to_be_bytes()).await?;
            let name_bytes = filename.as_bytes();
            stream
                .write_all(&(name_bytes.len() as u16).to_le_bytes())
                .await?;
            stream.write_all(name_bytes).await?;
            for chunk in bytes.chunks(FILE_CHUNK) {
                stream.write_all(chunk).await?;
            }
            stream.shutdown().await?;
            Ok(())
        }
        .await;

        if let Err(e) = preamble_result {
            return Err(MessagingError::TransferFailed {
                peer: addr,
                reason: e.to_string(),
            });
        }

        let mut resp_buf = [0u8; crate::wire::RESPONSE_LEN];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut resp_buf))
            .await
            .map_err(|_| MessagingError::TransferFailed {
                peer: addr,
                reason: "timed out waiting for completion response".into(),
            })?
            .map_err(|e| MessagingError::TransferFailed {
                peer: addr,
                reason: e.to_string(),
            })?;
        let _ = read;
        let response = Response::decode(&resp_buf)?;
        if response.status != Status::Ok {
            return Err(MessagingError::TransferFailed {
                peer: addr,
                reason: format!("receiver returned {:?}", response.status),
            });
        }

        self.history
            .append_file(
                self.local_id,
                recipient,
                filename.to_string(),
                bytes.len() as u64,
                self.downloads_dir.join(filename),
                Utc::now(),
            )
            .map_err(|e| MessagingError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }

    /// `_send_and_wait` — spec.md §4.4.1: register a waiter, send, wait,
    /// retry with backoff, refresh discovery and fail after the final
    /// attempt.
    async fn send_and_wait(
        &self,
        bytes: &[u8],
        peer_id: UserId,
        addr: SocketAddr,
        bid: u8,
        timeout: Duration,
    ) -> Result<(), MessagingError> {
        let notify = Arc::new(Notify::new());
        {
            let mut acks = self.acks.lock().await;
            acks.insert(
                peer_id,
                AckWaiter {
                    bid,
                    notify: notify.clone(),
                },
            );
        }

        for attempt in 0..MAX_ATTEMPTS {
            self.socket.send_to(bytes, addr).await?;
            let signaled = tokio::time::timeout(timeout, notify.notified())
                .await
                .is_ok();
            if signaled {
                return Ok(());
            }
            if let Some(delay) = BACKOFFS.get(attempt as usize) {
                tokio::time::sleep(*delay).await;
            }
        }

        self.acks.lock().await.remove(&peer_id);
        self.discovery.force_discover().await;
        Err(MessagingError::DeliveryFailed { peer: addr })
    }

    // =====================================================================
    // Receiving: UDP
    // =====================================================================

    pub fn spawn_udp_receiver(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; UDP_RECV_BUF];
            loop {
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let recv = tokio::time::timeout(Duration::from_secs(5), this.socket.recv_from(&mut buf)).await;
                let (len, src) = match recv {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        warn!("udp recv error: {}", e);
                        continue;
                    }
                    Err(_) => continue, // recv timeout: loop back and re-check shutdown
                };
                this.handle_udp_datagram(&buf[..len], src).await;
            }
            debug!("udp_recv worker exiting");
        })
    }

    async fn handle_udp_datagram(&self, data: &[u8], src: SocketAddr) {
        let src_ip = match src.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => return,
        };
        match classify(data.len()) {
            Frame::Response => self.handle_response(data, src_ip).await,
            Frame::Header => self.handle_header(data, src).await,
            Frame::Unknown => self.handle_possible_body(data, src).await,
        }
    }

    async fn handle_response(&self, data: &[u8], src_ip: Ipv4Addr) {
        let response = match Response::decode(data) {
            Ok(r) => r,
            Err(e) => {
                warn!("malformed response from {}: {}", src_ip, e);
                return;
            }
        };
        if response.status != Status::Ok {
            debug!("non-OK response from {}: {:?}", src_ip, response.status);
            return;
        }
        let waiter = self.acks.lock().await.remove(&response.responder);
        match waiter {
            Some(w) => {
                debug!("ACK for bid={} from {}", w.bid, response.responder);
                w.notify.notify_one();
            }
            None => {
                // Either a stale/duplicate ACK (invariant 5: idempotent
                // no-op) or an unsolicited Echo reply for Discovery.
                self.discovery
                    .handle_unmatched_response(response.responder, src_ip)
                    .await;
            }
        }
    }

    async fn handle_header(&self, data: &[u8], src: SocketAddr) {
        let src_ip = match src.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => return,
        };
        let header = match Header::decode(data) {
            Ok(h) => h,
            Err(e) => {
                let preview = hex::encode(&data[..data.len().min(8)]);
                debug!("malformed header from {} ({}): {}", src, preview, e);
                self.reply(src, Status::BadRequest).await;
                return;
            }
        };

        let local_id = self.discovery.local_id();
        if header.from == local_id {
            // Own broadcast looped back (e.g. a directed-broadcast echo);
            // drop before any dispatch or reply, per spec.
            return;
        }
        if header.to != local_id && !header.to.is_broadcast() {
            self.reply(src, Status::BadRequest).await;
            return;
        }

        match header.op {
            OpCode::Echo => {
                self.discovery.handle_echo(header.from, src_ip).await;
            }
            OpCode::Message => self.handle_message_header(header, src).await,
            OpCode::File => self.handle_file_header(header, src).await,
        }
    }

    async fn handle_message_header(&self, header: Header, src: SocketAddr) {
        self.reply(src, Status::Ok).await;

        let entry = Arc::new(PendingMessageHeader {
            header,
            reply_addr: src,
            notify: Arc::new(Notify::new()),
            body: AsyncMutex::new(None),
            created_at: Instant::now(),
        });
        self.pending_message_headers
            .lock()
            .await
            .insert(header.bid, entry.clone());

        let signaled = tokio::time::timeout(BODY_WAIT_TIMEOUT, entry.notify.notified())
            .await
            .is_ok();

        self.pending_message_headers.lock().await.remove(&header.bid);

        if !signaled {
            debug!("timed out waiting for body of bid={}", header.bid);
            return;
        }

        let body = entry.body.lock().await.take();
        let Some(body) = body else { return };

        let expected_payload_len = header.body_len.saturating_sub(1);
        if body.payload.len() as u64 != expected_payload_len {
            self.reply(src, Status::BadRequest).await;
            return;
        }

        self.reply(src, Status::Ok).await;

        let text = String::from_utf8_lossy(&body.payload).into_owned();
        self.work_queue.push(header.from, text).await;
    }

    async fn handle_file_header(&self, header: Header, src: SocketAddr) {
        if header.to.is_broadcast() {
            // Files are unicast only (spec.md §4.4.3, E4).
            self.reply(src, Status::BadRequest).await;
            return;
        }
        self.pending_file_headers.lock().await.insert(
            header.bid,
            PendingFileHeader {
                header,
                created_at: Instant::now(),
            },
        );
        self.reply(src, Status::Ok).await;
    }

    /// A datagram that is neither 25 nor 50 bytes is a candidate body
    /// frame for a pending Message header (see SPEC_FULL.md §4.4 for why
    /// this can't be distinguished from "other lengths: drop silently"
    /// purely by length).
    async fn handle_possible_body(&self, data: &[u8], src: SocketAddr) {
        let body = match MessageBody::decode(data) {
            Ok(b) => b,
            Err(_) => return,
        };
        let pending = self.pending_message_headers.lock().await.get(&body.bid).cloned();
        let Some(entry) = pending else {
            return; // no matching header: drop silently
        };
        if entry.reply_addr != src {
            return;
        }
        *entry.body.lock().await = Some(body);
        entry.notify.notify_one();
    }

    // =====================================================================
    // Receiving: TCP
    // =====================================================================

    pub fn spawn_tcp_acceptor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let accept = tokio::time::timeout(Duration::from_secs(5), this.tcp_listener.accept()).await;
                let (stream, addr) = match accept {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        warn!("tcp accept error: {}", e);
                        continue;
                    }
                    Err(_) => continue,
                };
                let this2 = this.clone();
                tokio::spawn(async move {
                    if let Err(e) = this2.handle_tcp_connection(stream, addr).await {
                        warn!("file transfer from {} failed: {}", addr, e);
                    }
                });
            }
            debug!("tcp_accept worker exiting");
        })
    }

    async fn handle_tcp_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> std::io::Result<()> {
        let mut bid_buf = [0u8; 8];
        if stream.read_exact(&mut bid_buf).await.is_err() {
            return Ok(()); // peer vanished before sending the bid; nothing to ack
        }
        let bid = u64::from_be_bytes(bid_buf) as u8;

        let pending = self.pending_file_headers.lock().await.remove(&bid);
        let Some(pending) = pending else {
            self.send_tcp_response(&mut stream, Status::BadRequest).await;
            return Ok(());
        };

        // The sender dialed us successfully and the `bid` matched a
        // pending header: both this node and that peer have now
        // demonstrated inbound TCP reachability.
        self.peers.set_tcp_ok(&pending.header.from, true).await;
        self.tcp_ok.store(true, Ordering::Relaxed);

        let mut name_len_buf = [0u8; 2];
        if stream.read_exact(&mut name_len_buf).await.is_err() {
            self.send_tcp_response(&mut stream, Status::InternalError).await;
            return Ok(());
        }
        let name_len = u16::from_le_bytes(name_len_buf) as usize;
        let mut name_buf = vec![0u8; name_len];
        if stream.read_exact(&mut name_buf).await.is_err() {
            self.send_tcp_response(&mut stream, Status::InternalError).await;
            return Ok(());
        }
        let raw_filename = String::from_utf8_lossy(&name_buf).into_owned();
        let filename = self.sanitizer.sanitize(&raw_filename);

        let body_len = pending.header.body_len;
        let dest_path = self.downloads_dir.join(&filename);
        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        let mut file = tokio::fs::File::create(&dest_path).await?;

        let mut received: u64 = 0;
        let mut last_logged_mb: u64 = 0;
        let mut chunk = vec![0u8; FILE_CHUNK];
        let mut ok = true;
        while received < body_len {
            let want = FILE_CHUNK.min((body_len - received) as usize);
            match stream.read(&mut chunk[..want]).await {
                Ok(0) => {
                    ok = false; // EOF before body_len bytes
                    break;
                }
                Ok(n) => {
                    file.write_all(&chunk[..n]).await?;
                    received += n as u64;
                    let mb = received / LOG_EVERY;
                    if mb > last_logged_mb {
                        info!("received {} MiB of {} from {}", mb, filename, addr);
                        last_logged_mb = mb;
                    }
                }
                Err(e) => {
                    warn!("tcp read error from {}: {}", addr, e);
                    ok = false;
                    break;
                }
            }
        }

        if !ok || received != body_len {
            self.send_tcp_response(&mut stream, Status::InternalError).await;
            let _ = tokio::fs::remove_file(&dest_path).await;
            return Ok(());
        }

        file.flush().await?;
        drop(file);

        let sniffed = self.sniffer.sniff(&dest_path);
        debug!("sniffed {} as {:?}", filename, sniffed);

        if let Err(e) = self.history.append_file(
            pending.header.from,
            pending.header.to,
            filename,
            body_len,
            dest_path,
            Utc::now(),
        ) {
            warn!("failed to append file history entry: {}", e);
        }

        self.send_tcp_response(&mut stream, Status::Ok).await;
        Ok(())
    }

    async fn send_tcp_response(&self, stream: &mut TcpStream, status: Status) {
        let response = Response {
            status,
            responder: self.local_id,
        };
        if let Err(e) = stream.write_all(&response.encode()).await {
            warn!("failed to write tcp completion response: {}", e);
        }
    }

    // =====================================================================
    // Work-queue consumer + sweeper
    // =====================================================================

    pub fn spawn_work_queue_consumer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let next = tokio::time::timeout(Duration::from_secs(5), this.work_queue.pop()).await;
                let (from, text) = match next {
                    Ok(pair) => pair,
                    Err(_) => continue, // nothing queued within the timeout: recheck shutdown
                };
                if let Err(e) = this.history.append_message(from, None, text, Utc::now()) {
                    warn!("failed to append inbound message to history: {}", e);
                }
            }
            debug!("msg_consumer worker exiting");
        })
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                interval.tick().await;
                if this.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let now = Instant::now();
                this.pending_file_headers
                    .lock()
                    .await
                    .retain(|_, p| now.duration_since(p.created_at) < PENDING_TTL);
                this.pending_message_headers
                    .lock()
                    .await
                    .retain(|_, p| now.duration_since(p.created_at) < PENDING_TTL);
            }
            debug!("pending_sweeper worker exiting");
        })
    }
}
