//! A single terminal session: one PTY process, its replay buffer, and the
//! viewers currently attached to it.
//!
//! All buffer mutation and fan-out goes through one mutex, so output
//! events, attach snapshots and geometry changes observe a single total
//! order per session. The PTY reader task is the only output producer,
//! which keeps chunks in arrival order.

use super::buffer::{ReplayBuffer, PAGE_FACTOR};
use super::pty::PtyHandle;
use crate::config::BrokerConfig;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use termcast_core::{CastError, CastResult, ServerMessage};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Outbound queue depth per viewer. Fan-out never waits on a viewer: a
/// full queue drops the chunk for that viewer only.
pub const VIEWER_QUEUE_SIZE: usize = 256;

const PTY_READ_BUFFER_SIZE: usize = 4096;

/// Identifies one viewer transport for the lifetime of its connection.
pub type ConnectionId = u64;

/// A viewer's membership in a session: its connection id plus the sending
/// half of the connection's outbound queue.
pub struct Viewer {
    pub conn: ConnectionId,
    pub tx: mpsc::Sender<ServerMessage>,
}

/// One PTY process paired with its replay buffer and attached viewers.
pub struct Session {
    id: String,
    pty: PtyHandle,
    state: Mutex<SessionState>,
    /// Set once the reader task observes EOF; input and resize report
    /// `ProcessExited` afterwards while the buffer stays queryable.
    exited: AtomicBool,
}

struct SessionState {
    buffer: ReplayBuffer,
    viewers: Vec<Viewer>,
    cols: u16,
    rows: u16,
    last_activity: Instant,
}

impl Session {
    /// Spawn the session's process and start its output reader task.
    pub fn spawn(id: &str, config: &BrokerConfig) -> CastResult<Arc<Self>> {
        let (pty, reader) = PtyHandle::spawn(
            &config.shell,
            &config.shell_args,
            &config.cwd,
            &config.env,
            config.cols,
            config.rows,
        )?;

        let session = Arc::new(Self {
            id: id.to_string(),
            pty,
            state: Mutex::new(SessionState {
                buffer: ReplayBuffer::new(),
                viewers: Vec::new(),
                cols: config.cols,
                rows: config.rows,
                last_activity: Instant::now(),
            }),
            exited: AtomicBool::new(false),
        });

        tokio::spawn(read_output(session.clone(), reader));

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a viewer, sending it the full replay snapshot first (an empty
    /// one counts — the viewer learns the session exists either way).
    ///
    /// Runs under the state lock, so the snapshot is a consistent prefix
    /// of the output stream: no concurrent chunk can land between the
    /// snapshot and the membership insert.
    pub async fn attach(&self, viewer: Viewer) {
        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();

        let snapshot = ServerMessage::new(self.id.clone(), state.buffer.snapshot());
        if let Err(e) = viewer.tx.try_send(snapshot) {
            debug!(session_id = %self.id, conn = viewer.conn, error = %e, "replay delivery failed");
        }

        // Re-attaching from the same connection replaces the old entry.
        state.viewers.retain(|v| v.conn != viewer.conn);
        info!(
            session_id = %self.id,
            conn = viewer.conn,
            viewers = state.viewers.len() + 1,
            "viewer attached"
        );
        state.viewers.push(viewer);
    }

    /// Forward input bytes verbatim to the process. No echo, no
    /// buffering — line editing is the process's own business.
    pub async fn write_input(&self, data: &str) -> CastResult<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(CastError::ProcessExited(self.id.clone()));
        }
        {
            let mut state = self.state.lock().await;
            state.last_activity = Instant::now();
        }
        self.pty.write(data.as_bytes().to_vec()).await
    }

    /// Change the process window geometry. The new geometry only affects
    /// the eviction cap for subsequent output events; nothing already
    /// buffered is trimmed here.
    pub async fn resize(&self, cols: u16, rows: u16) -> CastResult<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(CastError::ProcessExited(self.id.clone()));
        }
        self.pty.resize(cols, rows)?;
        let mut state = self.state.lock().await;
        state.cols = cols;
        state.rows = rows;
        state.last_activity = Instant::now();
        Ok(())
    }

    /// One output chunk from the process: broadcast to every viewer,
    /// append to the replay buffer, evict while over the geometry cap.
    ///
    /// Delivery is fire-and-forget per viewer; a slow or closed queue
    /// loses the chunk without affecting the others or the buffer.
    /// Eviction runs even with no viewers attached, so a detached
    /// session keeps a bounded, recent window for the next attach.
    pub(crate) async fn handle_output(&self, chunk: String) {
        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();

        for viewer in &state.viewers {
            let msg = ServerMessage::new(self.id.clone(), chunk.clone());
            if let Err(e) = viewer.tx.try_send(msg) {
                debug!(
                    session_id = %self.id,
                    conn = viewer.conn,
                    error = %e,
                    "viewer delivery failed"
                );
            }
        }

        let cap = state.cols as usize * state.rows as usize * PAGE_FACTOR;
        state.buffer.push(chunk);
        let evicted = state.buffer.evict_to(cap);
        if evicted > 0 {
            debug!(
                session_id = %self.id,
                evicted,
                retained = state.buffer.len_bytes(),
                "replay buffer trimmed"
            );
        }
    }

    /// Remove a viewer by connection id. Returns whether it was a member.
    pub async fn remove_viewer(&self, conn: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.viewers.len();
        state.viewers.retain(|v| v.conn != conn);
        let removed = state.viewers.len() != before;
        if removed {
            info!(
                session_id = %self.id,
                conn,
                viewers = state.viewers.len(),
                "viewer detached"
            );
        }
        removed
    }

    pub async fn viewer_count(&self) -> usize {
        self.state.lock().await.viewers.len()
    }

    /// Time since the last output, input, resize or attach.
    pub async fn idle_for(&self) -> Duration {
        self.state.lock().await.last_activity.elapsed()
    }

    /// Whether the process has terminated.
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Terminate the process. Only the registry's idle collection calls
    /// this; viewer disconnects never do.
    pub(crate) fn kill(&self) {
        if let Err(e) = self.pty.kill() {
            warn!(session_id = %self.id, error = %e, "failed to kill session process");
        }
    }
}

/// Reader task: the single output producer for one session. Reads the
/// PTY until EOF/error, re-chunking at valid UTF-8 boundaries, and feeds
/// each chunk through `handle_output`.
async fn read_output(session: Arc<Session>, mut reader: Box<dyn Read + Send>) {
    let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let read_result = tokio::task::spawn_blocking(move || {
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await;

        let (returned_reader, returned_buf, result) = match read_result {
            Ok(r) => r,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "PTY read task failed");
                break;
            }
        };
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) => {
                if !pending.is_empty() {
                    let chunk = String::from_utf8_lossy(&pending).into_owned();
                    session.handle_output(chunk).await;
                }
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let boundary = utf8_boundary(&pending);
                if boundary > 0 {
                    let chunk = String::from_utf8_lossy(&pending[..boundary]).into_owned();
                    pending.drain(..boundary);
                    session.handle_output(chunk).await;
                }
            }
            Err(e) => {
                // On Linux the master side reports EIO once the child is
                // gone; treat any error as end-of-stream.
                debug!(session_id = %session.id, error = %e, "PTY read ended");
                break;
            }
        }
    }

    session.exited.store(true, Ordering::SeqCst);
    match session.pty.wait().await {
        Ok(code) => info!(session_id = %session.id, code, "session process exited"),
        Err(e) => warn!(session_id = %session.id, error = %e, "could not reap session process"),
    }
}

/// Length of the longest flushable UTF-8 prefix of `bytes`.
///
/// PTY reads can split a multi-byte sequence across chunks; an incomplete
/// trailing sequence is held back for the next read. Genuinely invalid
/// bytes are flushed as-is and replaced during lossy decoding.
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_some() => bytes.len(),
        Err(e) => e.valid_up_to(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// A config whose "shell" stays quiet on its own (`cat` produces no
    /// output until it is given input), so tests can inject chunks
    /// deterministically through `handle_output`.
    fn quiet_config(cols: u16, rows: u16) -> BrokerConfig {
        BrokerConfig {
            port: 0,
            assets_dir: None,
            idle_timeout: 0,
            shell: "/bin/cat".to_string(),
            shell_args: Vec::new(),
            cwd: PathBuf::from("/"),
            env: HashMap::new(),
            cols,
            rows,
        }
    }

    fn viewer(conn: ConnectionId) -> (Viewer, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE_SIZE);
        (Viewer { conn, tx }, rx)
    }

    #[tokio::test]
    async fn attach_replays_buffered_output_in_order() {
        let session = Session::spawn("abc", &quiet_config(80, 30)).expect("spawn");
        session.handle_output("one ".into()).await;
        session.handle_output("two".into()).await;

        let (v, mut rx) = viewer(1);
        session.attach(v).await;

        let snapshot = rx.recv().await.expect("snapshot");
        assert_eq!(snapshot, ServerMessage::new("abc", "one two"));

        session.handle_output(" three".into()).await;
        let live = rx.recv().await.expect("live chunk");
        assert_eq!(live, ServerMessage::new("abc", " three"));
    }

    #[tokio::test]
    async fn attach_with_empty_buffer_still_sends_snapshot() {
        let session = Session::spawn("empty", &quiet_config(80, 30)).expect("spawn");
        let (v, mut rx) = viewer(1);
        session.attach(v).await;

        let snapshot = rx.recv().await.expect("snapshot");
        assert_eq!(snapshot, ServerMessage::new("empty", ""));
    }

    #[tokio::test]
    async fn one_chunk_fans_out_to_every_viewer() {
        let session = Session::spawn("fan", &quiet_config(80, 30)).expect("spawn");
        let (va, mut rx_a) = viewer(1);
        let (vb, mut rx_b) = viewer(2);
        session.attach(va).await;
        session.attach(vb).await;
        rx_a.recv().await.expect("a snapshot");
        rx_b.recv().await.expect("b snapshot");

        session.handle_output("$ ".into()).await;

        let got_a = rx_a.recv().await.expect("a chunk");
        let got_b = rx_b.recv().await.expect("b chunk");
        assert_eq!(got_a, got_b);
        assert_eq!(got_a, ServerMessage::new("fan", "$ "));
    }

    #[tokio::test]
    async fn detaching_one_viewer_leaves_the_other_untouched() {
        let session = Session::spawn("iso", &quiet_config(80, 30)).expect("spawn");
        let (va, mut rx_a) = viewer(1);
        let (vb, mut rx_b) = viewer(2);
        session.attach(va).await;
        session.attach(vb).await;
        rx_a.recv().await.expect("a snapshot");
        rx_b.recv().await.expect("b snapshot");

        assert!(session.remove_viewer(1).await);
        assert_eq!(session.viewer_count().await, 1);

        session.handle_output("still here".into()).await;
        assert_eq!(
            rx_b.recv().await.expect("b chunk"),
            ServerMessage::new("iso", "still here")
        );
        assert!(rx_a.try_recv().is_err(), "detached viewer gets nothing");
        assert!(!session.is_exited(), "process unaffected by detach");
    }

    #[tokio::test]
    async fn buffer_eviction_is_fifo_under_geometry_cap() {
        // 2 x 2 cells, PAGE_FACTOR screenfuls -> 12-byte cap.
        let session = Session::spawn("evict", &quiet_config(2, 2)).expect("spawn");
        session.handle_output("111111".into()).await;
        session.handle_output("222222".into()).await;
        session.handle_output("333333".into()).await;

        let (v, mut rx) = viewer(1);
        session.attach(v).await;
        let snapshot = rx.recv().await.expect("snapshot");
        assert_eq!(snapshot.data, "222222333333", "oldest chunk evicted first");
    }

    #[tokio::test]
    async fn resize_changes_cap_only_for_later_output() {
        let session = Session::spawn("cap", &quiet_config(80, 30)).expect("spawn");
        session.handle_output("aaaaaaaaaa".into()).await;
        session.handle_output("bbbbbbbbbb".into()).await;
        session.handle_output("cccccccccc".into()).await;

        // Shrink to a 12-byte cap; nothing is trimmed yet.
        session.resize(2, 2).await.expect("resize");
        let (v, mut rx) = viewer(1);
        session.attach(v).await;
        assert_eq!(rx.recv().await.expect("snapshot").data.len(), 30);

        // The next output event evicts lazily under the new cap.
        session.handle_output("dddddd".into()).await;
        let (v2, mut rx2) = viewer(2);
        session.attach(v2).await;
        assert_eq!(rx2.recv().await.expect("snapshot").data, "dddddd");
    }

    #[tokio::test]
    async fn write_after_exit_is_reported() {
        let session = Session::spawn("gone", &quiet_config(80, 30)).expect("spawn");
        session.kill();

        // The reader observes EOF shortly after the kill.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.is_exited() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(session.is_exited(), "process should have exited");

        match session.write_input("ls\n").await {
            Err(CastError::ProcessExited(id)) => assert_eq!(id, "gone"),
            other => panic!("expected ProcessExited, got {other:?}"),
        }
        match session.resize(10, 10).await {
            Err(CastError::ProcessExited(_)) => {}
            other => panic!("expected ProcessExited, got {other:?}"),
        }

        // The session and its buffer stay attachable.
        let (v, mut rx) = viewer(1);
        session.attach(v).await;
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn utf8_boundary_holds_back_split_sequences() {
        // "é" is 0xC3 0xA9; a read ending mid-sequence must not flush it.
        assert_eq!(utf8_boundary(b"abc\xC3"), 3);
        assert_eq!(utf8_boundary(b"abc\xC3\xA9"), 5);
        assert_eq!(utf8_boundary(b"plain"), 5);
        // Truly invalid bytes flush rather than stall the stream.
        assert_eq!(utf8_boundary(b"ab\xFFcd"), 5);
    }
}
