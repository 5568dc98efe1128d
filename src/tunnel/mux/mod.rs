//! Mux.Cool session engine: many logical sub-connections inside one tunnel.
//!
//! The tunnel task feeds raw chunks into [`feed`]; the engine reassembles
//! frames, routes them to sub-connection tasks, and queues outbound frames
//! on the per-tunnel [`WriteQueue`]. Sub-connection tasks run independently
//! but share this session object for the table, the ended-set, and counters.

pub mod subconn;
pub mod write_queue;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::Sink;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::protocol::mux::{build_end, build_keep, parse_frame, MuxFrame, MuxStatus, Network};
use crate::tunnel::dns::DohClient;
use crate::tunnel::writer::TunnelWriter;

use self::subconn::{run_tcp_sub, SubConn};
pub use self::write_queue::WriteQueue;

/// Frames parsed from a single chunk before the engine yields; a malformed
/// stream cannot spin the parser forever.
const MAX_FRAMES_PER_CHUNK: usize = 1000;

/// Bound on remembered ended/rejected sub ids.
const ENDED_CAP: usize = 256;

/// Recently ended or rejected sub ids. Frames referencing them are
/// swallowed so a stranger Keep gets exactly one End back and End-pongs
/// cannot ping forever. Drops its oldest half when full.
pub struct EndedSet {
    order: VecDeque<u16>,
    set: HashSet<u16>,
}

impl EndedSet {
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    pub fn insert(&mut self, id: u16) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > ENDED_CAP {
            for _ in 0..ENDED_CAP / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    pub fn remove(&mut self, id: u16) {
        if self.set.remove(&id) {
            self.order.retain(|x| *x != id);
        }
    }

    pub fn contains(&self, id: u16) -> bool {
        self.set.contains(&id)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl Default for EndedSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time session counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub total_tcp: u64,
    pub total_udp: u64,
    pub active: u64,
    pub uplink: u64,
    pub downlink: u64,
    pub limit_reached: bool,
}

pub struct MuxSession {
    queue: Arc<WriteQueue>,
    doh: DohClient,
    max_subrequests: u32,
    subs: Mutex<HashMap<u16, SubConn>>,
    ended: Mutex<EndedSet>,
    residue: Mutex<Vec<u8>>,
    started: Instant,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    limit_reached: AtomicBool,
    total_tcp: AtomicU64,
    total_udp: AtomicU64,
    active: AtomicU64,
    uplink: AtomicU64,
    downlink: AtomicU64,
}

impl MuxSession {
    pub fn new(doh: DohClient, max_subrequests: u32) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(WriteQueue::new()),
            doh,
            max_subrequests,
            subs: Mutex::new(HashMap::new()),
            ended: Mutex::new(EndedSet::new()),
            residue: Mutex::new(Vec::new()),
            started: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            limit_reached: AtomicBool::new(false),
            total_tcp: AtomicU64::new(0),
            total_udp: AtomicU64::new(0),
            active: AtomicU64::new(0),
            uplink: AtomicU64::new(0),
            downlink: AtomicU64::new(0),
        })
    }

    pub fn queue(&self) -> Arc<WriteQueue> {
        Arc::clone(&self.queue)
    }

    /// Handle a client End: remove the sub, flush any trailing payload, and
    /// remember the id. The sub task notices its channel closing, shuts the
    /// socket down, and answers with the session's single End frame.
    async fn handle_end(&self, frame: MuxFrame<'_>) {
        let id = frame.sub_id;
        let removed = self.subs.lock().unwrap().remove(&id);
        match removed {
            Some(sub) => {
                sub.closed.store(true, Ordering::Release);
                if let (Some(tx), Some(data)) = (&sub.data_tx, frame.data) {
                    if !data.is_empty() {
                        let _ = tx.send(Bytes::copy_from_slice(data)).await;
                    }
                }
                self.active.fetch_sub(1, Ordering::AcqRel);
                self.ended.lock().unwrap().insert(id);
            }
            None => {
                self.ended.lock().unwrap().insert(id);
            }
        }
    }

    /// Refuse a New: answer End and remember the id as ended.
    fn reject_sub(&self, id: u16) {
        self.push_frame(build_end(id));
        self.ended.lock().unwrap().insert(id);
    }

    /// Remove a sub the sub task finished with. `emit_end` answers the
    /// client for connect failures and clean upstream EOFs; plain write
    /// errors close silently.
    pub(crate) fn finish_sub(&self, id: u16, emit_end: bool) {
        let existed = {
            let mut subs = self.subs.lock().unwrap();
            match subs.remove(&id) {
                Some(sub) => {
                    sub.closed.store(true, Ordering::Release);
                    true
                }
                None => false,
            }
        };
        if existed {
            self.active.fetch_sub(1, Ordering::AcqRel);
            self.ended.lock().unwrap().insert(id);
            if emit_end {
                self.push_frame(build_end(id));
            }
        }
    }

    /// Enqueue an outbound frame; a full queue drops it.
    pub(crate) fn push_frame(&self, frame: Bytes) -> bool {
        let accepted = self.queue.push(frame);
        if !accepted {
            warn!("write queue full, frame dropped");
        }
        accepted
    }

    /// Emit a keep-alive frame and reset the activity clock so the next
    /// nudge waits a full idle period.
    pub fn push_keep_alive(&self) {
        self.push_frame(crate::protocol::mux::build_keep_alive());
        self.touch();
    }

    pub(crate) fn add_uplink(&self, bytes: u64) {
        self.uplink.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_downlink(&self, bytes: u64) {
        self.downlink.fetch_add(bytes, Ordering::Relaxed);
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    /// Session age since the first frame.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// No active subs and quiet past `threshold`.
    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.active.load(Ordering::Acquire) == 0
            && self.last_activity.lock().unwrap().elapsed() > threshold
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_tcp: self.total_tcp.load(Ordering::Acquire),
            total_udp: self.total_udp.load(Ordering::Acquire),
            active: self.active.load(Ordering::Acquire),
            uplink: self.uplink.load(Ordering::Acquire),
            downlink: self.downlink.load(Ordering::Acquire),
            limit_reached: self.limit_reached.load(Ordering::Acquire),
        }
    }

    /// Tear the session down: close every sub, clear bookkeeping, stop the
    /// pump. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<(u16, SubConn)> = self.subs.lock().unwrap().drain().collect();
        self.active.store(0, Ordering::Release);
        for (_, sub) in &drained {
            sub.closed.store(true, Ordering::Release);
        }
        // Dropping the records drops every data_tx; sub tasks unwind.
        drop(drained);
        self.ended.lock().unwrap().clear();
        self.queue.close();
    }

    #[cfg(test)]
    pub(crate) fn ended_contains(&self, id: u16) -> bool {
        self.ended.lock().unwrap().contains(id)
    }

    #[cfg(test)]
    pub(crate) fn has_sub(&self, id: u16) -> bool {
        self.subs.lock().unwrap().contains_key(&id)
    }
}

/// Consume one inbound chunk: reassemble against the residue buffer, parse
/// to exhaustion, dispatch each frame. A malformed frame is tunnel-fatal;
/// a trailing partial frame is kept for the next chunk.
pub async fn feed(session: &Arc<MuxSession>, chunk: &[u8]) -> anyhow::Result<()> {
    session.touch();

    // Fast path: nothing buffered, parse straight off the chunk.
    let buffered = {
        let mut residue = session.residue.lock().unwrap();
        if residue.is_empty() {
            None
        } else {
            residue.extend_from_slice(chunk);
            Some(std::mem::take(&mut *residue))
        }
    };
    let data: &[u8] = buffered.as_deref().unwrap_or(chunk);

    let mut offset = 0;
    for _ in 0..MAX_FRAMES_PER_CHUNK {
        if offset >= data.len() {
            break;
        }
        match parse_frame(&data[offset..]) {
            Ok((frame, consumed)) => {
                if consumed == 0 {
                    anyhow::bail!("mux parser made no progress");
                }
                dispatch(session, frame).await;
                offset += consumed;
            }
            Err(e) if e.is_recoverable() => break,
            Err(e) => return Err(e.into()),
        }
    }
    if offset < data.len() {
        *session.residue.lock().unwrap() = data[offset..].to_vec();
    }
    Ok(())
}

async fn dispatch(session: &Arc<MuxSession>, frame: MuxFrame<'_>) {
    match frame.status {
        MuxStatus::New => handle_new(session, frame).await,
        MuxStatus::Keep => handle_keep(session, frame).await,
        MuxStatus::End => session.handle_end(frame).await,
        MuxStatus::KeepAlive => session.touch(),
    }
}

async fn handle_new(session: &Arc<MuxSession>, frame: MuxFrame<'_>) {
    let id = frame.sub_id;
    // Ids may be reused after an End.
    session.ended.lock().unwrap().remove(id);

    let Some(target) = frame.target else {
        // The parser guarantees a target on New; belt against future
        // status reshuffles.
        session.reject_sub(id);
        return;
    };
    let address = target.address.to_string();
    let initial = frame.data.map(Bytes::copy_from_slice).unwrap_or_default();

    match target.network {
        Network::Tcp => {
            if session.limit_reached.load(Ordering::Acquire)
                || session.total_tcp.load(Ordering::Acquire)
                    >= u64::from(session.max_subrequests)
            {
                session.limit_reached.store(true, Ordering::Release);
                debug!(id, "sub-request budget exhausted, rejecting New");
                session.reject_sub(id);
                return;
            }
            let (data_rx, ready) = {
                let mut subs = session.subs.lock().unwrap();
                if subs.contains_key(&id) {
                    warn!(id, "duplicate New for active sub, ignoring");
                    return;
                }
                let (sub, data_rx) = SubConn::tcp(address.clone(), target.port);
                let ready = Arc::clone(&sub.ready);
                subs.insert(id, sub);
                (data_rx, ready)
            };
            session.total_tcp.fetch_add(1, Ordering::AcqRel);
            session.active.fetch_add(1, Ordering::AcqRel);
            debug!(id, address = %address, port = target.port, "sub connecting");
            tokio::spawn(run_tcp_sub(
                Arc::clone(session),
                id,
                address,
                target.port,
                initial,
                data_rx,
                ready,
            ));
        }
        Network::Udp => {
            // Only DNS rides UDP; everything else is refused up front.
            if target.port != 53 {
                debug!(id, port = target.port, "non-DNS UDP sub rejected");
                session.reject_sub(id);
                return;
            }
            {
                let mut subs = session.subs.lock().unwrap();
                if subs.contains_key(&id) {
                    warn!(id, "duplicate New for active sub, ignoring");
                    return;
                }
                subs.insert(id, SubConn::udp(address, target.port));
            }
            session.total_udp.fetch_add(1, Ordering::AcqRel);
            session.active.fetch_add(1, Ordering::AcqRel);
            if !initial.is_empty() {
                spawn_dns_query(session, id, initial);
            }
        }
    }
}

async fn handle_keep(session: &Arc<MuxSession>, frame: MuxFrame<'_>) {
    let id = frame.sub_id;
    let payload = frame.data.unwrap_or(&[]);

    enum Route {
        Unknown,
        Dropped,
        Dns,
        Tcp(tokio::sync::mpsc::Sender<Bytes>),
    }

    let route = {
        let subs = session.subs.lock().unwrap();
        match subs.get(&id) {
            None => Route::Unknown,
            Some(sub) if sub.closed.load(Ordering::Acquire) => Route::Dropped,
            Some(sub) => match sub.network {
                Network::Udp => Route::Dns,
                Network::Tcp => match &sub.data_tx {
                    Some(tx) => Route::Tcp(tx.clone()),
                    None => Route::Dropped,
                },
            },
        }
    };

    match route {
        Route::Unknown => {
            // One End per stranger id until a New revives it.
            let fresh = {
                let mut ended = session.ended.lock().unwrap();
                if ended.contains(id) {
                    false
                } else {
                    ended.insert(id);
                    true
                }
            };
            if fresh {
                session.push_frame(build_end(id));
            }
        }
        Route::Dropped => {}
        Route::Dns => {
            if !payload.is_empty() {
                spawn_dns_query(session, id, Bytes::copy_from_slice(payload));
            }
        }
        Route::Tcp(tx) => {
            if !payload.is_empty() && tx.send(Bytes::copy_from_slice(payload)).await.is_err() {
                debug!(id, "sub task gone, payload dropped");
            }
        }
    }
}

fn spawn_dns_query(session: &Arc<MuxSession>, id: u16, query: Bytes) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        session.add_uplink(query.len() as u64);
        match session.doh.query(&query).await {
            Ok(body) => {
                if session.push_frame(build_keep(id, &body)) {
                    session.add_downlink(body.len() as u64);
                }
            }
            Err(e) => {
                debug!(id, error = %e, "DoH query failed");
            }
        }
    });
}

/// Drain the write queue into the tunnel writer until the queue closes or
/// the sink dies.
pub async fn run_pump<S>(queue: Arc<WriteQueue>, mut writer: TunnelWriter<S>)
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    loop {
        match queue.pop() {
            Some(frame) => {
                if let Err(e) = writer.send(&frame).await {
                    debug!(error = %e, "tunnel sink failed, stopping pump");
                    queue.close();
                    break;
                }
            }
            None if queue.is_closed() => break,
            None => queue.notified().await,
        }
    }
    writer.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mux::OPT_DATA;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    fn doh() -> DohClient {
        DohClient::new(
            reqwest::Client::new(),
            "https://1.1.1.1/dns-query".to_string(),
        )
    }

    fn new_frame(id: u16, network: u8, ip: [u8; 4], port: u16, data: &[u8]) -> Vec<u8> {
        let meta_len = 4 + 1 + 2 + 1 + 4;
        let option = if data.is_empty() { 0 } else { OPT_DATA };
        let mut buf = Vec::new();
        buf.extend_from_slice(&(meta_len as u16).to_be_bytes());
        buf.extend_from_slice(&id.to_be_bytes());
        buf.push(MuxStatus::New as u8);
        buf.push(option);
        buf.push(network);
        buf.extend_from_slice(&port.to_be_bytes());
        buf.push(1);
        buf.extend_from_slice(&ip);
        if !data.is_empty() {
            buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
            buf.extend_from_slice(data);
        }
        buf
    }

    /// Wait for the next queued frame, parsed.
    async fn next_frame(queue: &WriteQueue) -> (u16, MuxStatus, Option<Vec<u8>>) {
        let frame = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(f) = queue.pop() {
                    return f;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no frame arrived");
        let (parsed, _) = parse_frame(&frame).unwrap();
        (parsed.sub_id, parsed.status, parsed.data.map(|d| d.to_vec()))
    }

    async fn assert_no_frame(queue: &WriteQueue) {
        sleep(Duration::from_millis(50)).await;
        assert!(queue.pop().is_none(), "unexpected frame in queue");
    }

    #[test]
    fn ended_set_halves_on_overflow() {
        let mut set = EndedSet::new();
        for id in 0..=ENDED_CAP as u16 {
            set.insert(id);
        }
        // Oldest half evicted, newest retained.
        assert!(set.len() <= ENDED_CAP / 2 + 1);
        assert!(!set.contains(0));
        assert!(set.contains(ENDED_CAP as u16));
    }

    #[test]
    fn ended_set_remove_and_reinsert() {
        let mut set = EndedSet::new();
        set.insert(7);
        assert!(set.contains(7));
        set.remove(7);
        assert!(!set.contains(7));
        set.insert(7);
        assert!(set.contains(7));
    }

    #[tokio::test]
    async fn stranger_keep_gets_exactly_one_end() {
        let session = MuxSession::new(doh(), 48);
        let queue = session.queue();

        feed(&session, &build_keep(99, b"data")).await.unwrap();
        let (id, status, _) = next_frame(&queue).await;
        assert_eq!((id, status), (99, MuxStatus::End));

        // A second stranger Keep is swallowed.
        feed(&session, &build_keep(99, b"more")).await.unwrap();
        assert_no_frame(&queue).await;
        assert!(session.ended_contains(99));
    }

    #[tokio::test]
    async fn new_keep_end_delivers_ordered_bytes_and_single_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let remote = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let session = MuxSession::new(doh(), 48);
        let queue = session.queue();

        let mut chunk = new_frame(7, 1, [127, 0, 0, 1], port, b"ABC");
        chunk.extend_from_slice(&build_keep(7, b"XYZ"));
        chunk.extend_from_slice(&build_end(7));
        feed(&session, &chunk).await.unwrap();

        let received = timeout(Duration::from_secs(5), remote)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"ABCXYZ");

        // Exactly one End(7) comes back, and nothing after it.
        let (id, status, _) = next_frame(&queue).await;
        assert_eq!((id, status), (7, MuxStatus::End));
        assert_no_frame(&queue).await;

        let stats = session.snapshot();
        assert_eq!(stats.total_tcp, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.uplink, 6);
    }

    #[tokio::test]
    async fn upstream_eof_emits_end_and_removes_sub() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and immediately close: a clean upstream EOF.
            let _ = listener.accept().await;
        });

        let session = MuxSession::new(doh(), 48);
        let queue = session.queue();
        feed(&session, &new_frame(3, 1, [127, 0, 0, 1], port, b""))
            .await
            .unwrap();

        let (id, status, _) = next_frame(&queue).await;
        assert_eq!((id, status), (3, MuxStatus::End));
        assert!(!session.has_sub(3));
        assert!(session.ended_contains(3));
        assert_eq!(session.snapshot().active, 0);
    }

    #[tokio::test]
    async fn remote_bytes_come_back_as_keep_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            use tokio::io::AsyncWriteExt;
            socket.write_all(b"pong").await.unwrap();
            // Hold the socket so no EOF End races the Keep.
            sleep(Duration::from_secs(10)).await;
        });

        let session = MuxSession::new(doh(), 48);
        let queue = session.queue();
        feed(&session, &new_frame(5, 1, [127, 0, 0, 1], port, b"ping"))
            .await
            .unwrap();

        let (id, status, data) = next_frame(&queue).await;
        assert_eq!((id, status), (5, MuxStatus::Keep));
        assert_eq!(data.unwrap(), b"pong");
        assert_eq!(session.snapshot().downlink, 4);
        session.close();
    }

    #[tokio::test]
    async fn budget_rejects_and_sticks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                held.push(socket);
            }
        });

        let session = MuxSession::new(doh(), 2);
        let queue = session.queue();
        for id in [1u16, 2, 3] {
            feed(&session, &new_frame(id, 1, [127, 0, 0, 1], port, b""))
                .await
                .unwrap();
        }

        // The third New is refused before any socket work.
        let (id, status, _) = next_frame(&queue).await;
        assert_eq!((id, status), (3, MuxStatus::End));
        let stats = session.snapshot();
        assert_eq!(stats.total_tcp, 2);
        assert!(stats.limit_reached);
        assert!(session.ended_contains(3));

        // Sticky: id 4 is still refused and the counter stays put.
        feed(&session, &new_frame(4, 1, [127, 0, 0, 1], port, b""))
            .await
            .unwrap();
        let (id, status, _) = next_frame(&queue).await;
        assert_eq!((id, status), (4, MuxStatus::End));
        assert_eq!(session.snapshot().total_tcp, 2);
        session.close();
    }

    #[tokio::test]
    async fn udp_outside_dns_port_is_refused() {
        let session = MuxSession::new(doh(), 48);
        let queue = session.queue();
        feed(&session, &new_frame(9, 2, [1, 1, 1, 1], 5353, b"q"))
            .await
            .unwrap();
        let (id, status, _) = next_frame(&queue).await;
        assert_eq!((id, status), (9, MuxStatus::End));
        assert!(session.ended_contains(9));
        assert_eq!(session.snapshot().total_udp, 0);
    }

    #[tokio::test]
    async fn residue_reassembles_split_frames() {
        let session = MuxSession::new(doh(), 48);
        let queue = session.queue();

        let frame = build_keep(42, b"split-payload");
        let (head, tail) = frame.split_at(5);
        feed(&session, head).await.unwrap();
        assert_no_frame(&queue).await;
        feed(&session, tail).await.unwrap();

        // Stranger Keep → one End once the frame completes.
        let (id, status, _) = next_frame(&queue).await;
        assert_eq!((id, status), (42, MuxStatus::End));
    }

    #[tokio::test]
    async fn malformed_metadata_is_fatal() {
        let session = MuxSession::new(doh(), 48);
        let err = feed(&session, &[0x00, 0x02, 0x00, 0x00]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn new_clears_prior_ended_mark() {
        let session = MuxSession::new(doh(), 48);
        let queue = session.queue();
        feed(&session, &build_keep(11, b"x")).await.unwrap();
        let (id, status, _) = next_frame(&queue).await;
        assert_eq!((id, status), (11, MuxStatus::End));
        assert!(session.ended_contains(11));

        // Reusing the id with a New revives it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            sleep(Duration::from_secs(10)).await;
        });
        feed(&session, &new_frame(11, 1, [127, 0, 0, 1], port, b""))
            .await
            .unwrap();
        assert!(!session.ended_contains(11));
        assert!(session.has_sub(11));
        session.close();
    }

    #[tokio::test]
    async fn idle_detection() {
        let session = MuxSession::new(doh(), 48);
        assert!(!session.is_idle(Duration::from_secs(3600)));
        sleep(Duration::from_millis(20)).await;
        assert!(session.is_idle(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_queue() {
        let session = MuxSession::new(doh(), 48);
        let queue = session.queue();
        session.close();
        session.close();
        assert!(queue.is_closed());
        assert!(!session.push_frame(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn pump_forwards_frames_then_closes() {
        use futures::channel::mpsc as fmpsc;
        use futures_util::StreamExt;

        let queue = Arc::new(WriteQueue::new());
        let (tx, mut rx) = fmpsc::unbounded::<Message>();
        let writer = TunnelWriter::new(tx, vec![0x00, 0x00]);
        let pump = tokio::spawn(run_pump(Arc::clone(&queue), writer));

        queue.push(Bytes::from_static(b"one"));
        queue.push(Bytes::from_static(b"two"));

        let first = rx.next().await.unwrap();
        assert_eq!(
            match first {
                Message::Binary(b) => b,
                other => panic!("unexpected {other:?}"),
            },
            b"\x00\x00one"
        );
        let second = rx.next().await.unwrap();
        assert_eq!(
            match second {
                Message::Binary(b) => b,
                other => panic!("unexpected {other:?}"),
            },
            b"two"
        );

        queue.close();
        timeout(Duration::from_secs(5), pump).await.unwrap().unwrap();
    }
}
