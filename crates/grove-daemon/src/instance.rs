//! Per-instance lifecycle: agent spawn, output fan-out, attach handling.
//!
//! Architecture:
//!
//!   agent (docker exec -it ...) <-- PTY slave
//!             ^  v
//!           PTY master
//!             |
//!       reader thread
//!        |-- appends to the on-disk log
//!        |-- appends to the rolling in-memory buffer
//!        '-- forwards to the attached client connection (if any)
//!
//! The reader thread is the sole producer of instance output; everything
//! else copy-snapshots under the per-instance mutex and never holds it
//! across I/O.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use grove_proto::{read_frame, Frame, InstanceInfo, InstanceState, Response};

use crate::container::agent_exec_args;
use crate::error::{GroveError, Result};
use crate::pty::{kill_group, PtyMaster, PtySession};
use crate::store::{InstanceSnapshot, StateStore};

/// Cap on the rolling in-memory output buffer. When exceeded, the oldest
/// bytes are dropped; the on-disk log keeps everything.
pub const MAX_LOG_BYTES: usize = 1 << 20; // 1 MiB

/// How long an agent must produce no PTY output before its state is
/// presented as WAITING instead of RUNNING. Agents stream continuously
/// while working; silence means they are waiting for a human.
pub const WAITING_IDLE_THRESHOLD: Duration = Duration::from_secs(2);

/// A one-shot synchronisation handle, set exactly once when the agent
/// process has fully exited and its terminal state is recorded.
pub struct Event {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut done = self.done.lock().expect("event poisoned");
        *done = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock().expect("event poisoned");
        while !*done {
            done = self.cv.wait(done).expect("event poisoned");
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

struct AttachedConn {
    stream: UnixStream,
    gen: u64,
}

/// Mutable instance state, guarded by the instance mutex.
struct Shared {
    state: InstanceState,
    pid: i32,
    /// PTY master; `None` once the process has exited.
    pty: Option<Arc<PtyMaster>>,
    container: Option<String>,
    compose_project: Option<String>,
    log_buf: Vec<u8>,
    last_output: Option<Instant>,
    ended_at: Option<DateTime<Utc>>,
    attached: Option<AttachedConn>,
    attach_gen: u64,
    finish_requested: bool,
    killed: bool,
    process_done: Option<Arc<Event>>,
}

/// One supervised agent session: worktree + container + agent process.
pub struct Instance {
    pub id: String,
    pub project: String,
    pub branch: String,
    pub worktree_dir: PathBuf,
    pub log_file: PathBuf,
    pub created_at: DateTime<Utc>,
    store: StateStore,
    shared: Mutex<Shared>,
}

impl Instance {
    /// Create a fresh instance record, before the agent is started.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        project: String,
        branch: String,
        worktree_dir: PathBuf,
        log_file: PathBuf,
        store: StateStore,
        container: String,
        compose_project: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            project,
            branch,
            worktree_dir,
            log_file,
            created_at: Utc::now(),
            store,
            shared: Mutex::new(Shared {
                state: InstanceState::Running,
                pid: 0,
                pty: None,
                container: Some(container),
                compose_project,
                log_buf: Vec::new(),
                last_output: None,
                ended_at: None,
                attached: None,
                attach_gen: 0,
                finish_requested: false,
                killed: false,
                process_done: None,
            }),
        })
    }

    /// Rebuild an instance from a persisted snapshot during reload.
    pub fn from_snapshot(snap: &InstanceSnapshot, log_file: PathBuf, store: StateStore) -> Arc<Self> {
        Arc::new(Self {
            id: snap.id.clone(),
            project: snap.project.clone(),
            branch: snap.branch.clone(),
            worktree_dir: PathBuf::from(&snap.worktree_dir),
            log_file,
            created_at: DateTime::from_timestamp(snap.created_at, 0).unwrap_or_else(Utc::now),
            store,
            shared: Mutex::new(Shared {
                state: snap.state,
                pid: 0,
                pty: None,
                container: if snap.container_id.is_empty() {
                    None
                } else {
                    Some(snap.container_id.clone())
                },
                compose_project: if snap.compose_project.is_empty() {
                    None
                } else {
                    Some(snap.compose_project.clone())
                },
                log_buf: Vec::new(),
                last_output: None,
                ended_at: DateTime::from_timestamp(snap.ended_at, 0).filter(|_| snap.ended_at > 0),
                attached: None,
                attach_gen: 0,
                finish_requested: false,
                killed: false,
                process_done: None,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("instance mutex poisoned")
    }

    /// Current stored state (no idle promotion).
    pub fn state(&self) -> InstanceState {
        self.lock().state
    }

    /// Container exec target and compose project, if any.
    pub fn container(&self) -> (Option<String>, Option<String>) {
        let sh = self.lock();
        (sh.container.clone(), sh.compose_project.clone())
    }

    /// Serialisable snapshot of the public metadata, with idle promotion:
    /// a RUNNING instance that has been silent past the threshold is
    /// presented as WAITING. Promotion is display-only; the stored state
    /// stays RUNNING so it never races the idle timer.
    pub fn info(&self) -> InstanceInfo {
        let sh = self.lock();
        let mut state = sh.state;
        if state == InstanceState::Running {
            if let Some(last) = sh.last_output {
                if last.elapsed() > WAITING_IDLE_THRESHOLD {
                    state = InstanceState::Waiting;
                }
            }
        }
        InstanceInfo {
            id: self.id.clone(),
            project: self.project.clone(),
            state: state.as_str().to_string(),
            branch: self.branch.clone(),
            worktree_dir: self.worktree_dir.to_string_lossy().to_string(),
            created_at: self.created_at.timestamp(),
            ended_at: sh.ended_at.map(|t| t.timestamp()).unwrap_or(0),
            pid: sh.pid,
        }
    }

    /// The record persisted to the state store.
    pub fn snapshot(&self) -> InstanceSnapshot {
        let sh = self.lock();
        InstanceSnapshot {
            id: self.id.clone(),
            project: self.project.clone(),
            branch: self.branch.clone(),
            worktree_dir: self.worktree_dir.to_string_lossy().to_string(),
            created_at: self.created_at.timestamp(),
            ended_at: sh.ended_at.map(|t| t.timestamp()).unwrap_or(0),
            state: sh.state,
            pid: sh.pid,
            container_id: sh.container.clone().unwrap_or_default(),
            compose_project: sh.compose_project.clone().unwrap_or_default(),
        }
    }

    /// Persist the current snapshot, logging on failure.
    pub fn persist(&self) {
        if let Err(e) = self.store.save(&self.snapshot()) {
            warn!(instance = %self.id, error = %e, "failed to persist instance snapshot");
        }
    }

    /// Copy of the rolling output buffer.
    pub fn logs_snapshot(&self) -> Vec<u8> {
        self.lock().log_buf.clone()
    }

    /// Pre-seed the rolling buffer (setup output captured before the agent
    /// started), trimmed to the cap.
    pub fn seed_log_buffer(&self, bytes: &[u8]) {
        let mut sh = self.lock();
        sh.log_buf.extend_from_slice(bytes);
        trim_buffer(&mut sh.log_buf);
    }

    /// Bytes appended since `offset`, for follow loops.
    ///
    /// If the buffer rolled past its cap since the last poll, `offset` may
    /// exceed the buffer length; the follower resets to zero and continues
    /// without attempting to reconstruct the dropped hole.
    pub fn follow_delta(&self, mut offset: usize) -> (Vec<u8>, usize, InstanceState) {
        let sh = self.lock();
        if offset > sh.log_buf.len() {
            offset = 0;
        }
        let delta = sh.log_buf[offset..].to_vec();
        (delta, sh.log_buf.len(), sh.state)
    }

    /// Start the agent process in a fresh PTY and launch the reader thread.
    ///
    /// The agent runs inside the instance container via an interactive
    /// `docker exec`; the PTY lives host-side. `env` is injected into the
    /// container through `-e` flags (and into the docker CLI itself).
    pub fn start_agent(
        self: &Arc<Self>,
        agent_cmd: &str,
        agent_args: &[String],
        env: &[(String, String)],
    ) -> Result<()> {
        let container = self
            .lock()
            .container
            .clone()
            .ok_or_else(|| GroveError::Pty("instance has no container".into()))?;

        let mut full_env: Vec<(String, String)> = env.to_vec();
        full_env.push(("TERM".to_string(), "xterm-256color".to_string()));

        let args = agent_exec_args(&container, &full_env, agent_cmd, agent_args);
        let session = PtySession::spawn("docker", &args, &self.worktree_dir, &full_env)?;

        let done = Arc::new(Event::new());
        {
            let mut sh = self.lock();
            sh.pty = Some(session.master.clone());
            sh.pid = session.pid();
            sh.state = InstanceState::Running;
            sh.last_output = Some(Instant::now());
            sh.process_done = Some(done.clone());
        }

        let inst = Arc::clone(self);
        thread::Builder::new()
            .name(format!("pty-{}", self.id))
            .spawn(move || inst.pty_reader(session, done))
            .map_err(|e| GroveError::Pty(format!("spawn reader thread: {e}")))?;

        Ok(())
    }

    /// Drain the PTY until the agent exits, fanning every chunk out to the
    /// log file, the rolling buffer, and the attached client.
    fn pty_reader(self: Arc<Self>, session: PtySession, done: Arc<Event>) {
        let mut log_fd = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
        {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(instance = %self.id, error = %e, "cannot open log file");
                None
            }
        };

        let master = session.master.clone();
        let mut buf = [0u8; 4096];
        loop {
            let n = match master.read(&mut buf) {
                Ok(0) => break, // slave closed: process exited
                Ok(n) => n,
                Err(e) => {
                    debug!(instance = %self.id, error = %e, "pty read error");
                    break;
                }
            };
            let chunk = &buf[..n];

            if let Some(f) = log_fd.as_mut() {
                let _ = f.write_all(chunk);
            }

            // Buffer append and the forward decision are one critical
            // section, so a snapshotting reader sees either the prefix or
            // prefix+chunk, never an interleaving.
            let conn = {
                let mut sh = self.lock();
                sh.log_buf.extend_from_slice(chunk);
                trim_buffer(&mut sh.log_buf);
                sh.last_output = Some(Instant::now());
                sh.attached
                    .as_ref()
                    .and_then(|a| a.stream.try_clone().ok())
            };
            // The client may have detached or died; that is its problem.
            if let Some(mut conn) = conn {
                let _ = conn.write_all(chunk);
            }
        }

        let exit_code = session.wait().unwrap_or(0);

        let conn = {
            let mut sh = self.lock();
            sh.pty = None;
            sh.ended_at = Some(Utc::now());
            sh.state = if sh.finish_requested {
                InstanceState::Finished
            } else if exit_code == 0 {
                InstanceState::Exited
            } else if sh.killed {
                InstanceState::Killed
            } else {
                InstanceState::Crashed
            };
            sh.attached.take()
        };

        // Unblock the attach handler's frame reader, if one is present.
        if let Some(a) = conn {
            let _ = a.stream.shutdown(Shutdown::Both);
        }

        info!(instance = %self.id, exit_code, state = %self.state(), "agent exited");

        self.persist();
        done.set();
    }

    /// Bridge a client connection to this instance's PTY.
    ///
    /// Replays the rolling buffer, registers the connection as the single
    /// attached client, then reads control frames until the client detaches,
    /// disconnects, or the agent exits (the reader thread shuts the socket
    /// down to unblock us). The caller's thread hosts the frame loop, so
    /// the request handler naturally lives for the attach duration.
    pub fn attach(&self, mut conn: UnixStream) {
        let (replay, master, my_gen) = {
            let mut sh = self.lock();
            if sh.state.is_terminal() {
                drop(sh);
                respond_inline(
                    &mut conn,
                    &Response::error(format!("instance has {}", self.state().as_str().to_lowercase())),
                );
                return;
            }
            if sh.attached.is_some() {
                drop(sh);
                respond_inline(&mut conn, &Response::error("already attached"));
                return;
            }

            let Ok(registered) = conn.try_clone() else {
                return;
            };
            sh.attach_gen += 1;
            let gen = sh.attach_gen;
            sh.attached = Some(AttachedConn {
                stream: registered,
                gen,
            });
            sh.state = InstanceState::Attached;
            (sh.log_buf.clone(), sh.pty.clone(), gen)
        };

        // Replay buffered output so the human sees what the agent has done.
        if !replay.is_empty() {
            let _ = conn.write_all(&replay);
        }

        // The agent may have exited between the handler's precheck and
        // registration; nothing to bridge in that case.
        if master.is_none() {
            self.detach_conn(my_gen);
            let _ = conn.shutdown(Shutdown::Both);
            return;
        }

        loop {
            match read_frame(&mut conn) {
                Ok(Frame::Data(data)) => {
                    let master = self.lock().pty.clone();
                    if let Some(master) = master {
                        let _ = master.write_all(&data);
                    }
                }
                Ok(Frame::Resize(cols, rows)) => {
                    let master = self.lock().pty.clone();
                    if let Some(master) = master {
                        let _ = master.resize(cols, rows);
                    }
                }
                Ok(Frame::Detach) => break,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        debug!(instance = %self.id, error = %e, "attach read");
                    }
                    break;
                }
            }
        }

        self.detach_conn(my_gen);
        let _ = conn.shutdown(Shutdown::Both);
    }

    /// Deregister an attach session if it is still the current one, and
    /// transition back out of ATTACHED. The idle timer may then present the
    /// instance as WAITING.
    fn detach_conn(&self, gen: u64) {
        let mut sh = self.lock();
        let still_mine = sh.attached.as_ref().is_some_and(|a| a.gen == gen);
        if still_mine {
            sh.attached = None;
            if sh.state == InstanceState::Attached {
                sh.state = InstanceState::Running;
            }
        }
    }

    /// Kill the agent process group and close any attached client.
    ///
    /// The reader thread observes the PTY EOF, winds down, and records the
    /// KILLED terminal state. Idempotent; a no-op on dead instances (the
    /// stored pid may have been reused by an unrelated process by then).
    pub fn destroy(&self) {
        let (pid, conn) = {
            let mut sh = self.lock();
            if sh.state.is_terminal() {
                return;
            }
            sh.killed = true;
            (
                sh.pid,
                sh.attached.as_ref().and_then(|a| a.stream.try_clone().ok()),
            )
        };

        kill_group(pid);

        if let Some(conn) = conn {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }

    /// Flag the next terminal transition as FINISHED and return the handle
    /// the caller can wait on for the process to fully exit.
    pub fn mark_finish_requested(&self) -> Option<Arc<Event>> {
        let mut sh = self.lock();
        sh.finish_requested = true;
        sh.process_done.clone()
    }

    /// Direct transition to FINISHED for an already-dead instance.
    pub fn force_finished(&self) {
        let mut sh = self.lock();
        sh.state = InstanceState::Finished;
        if sh.ended_at.is_none() {
            sh.ended_at = Some(Utc::now());
        }
    }

    /// Enter the CHECKING state, refusing terminal instances and
    /// concurrent checks.
    pub fn begin_check(&self) -> Result<()> {
        let mut sh = self.lock();
        if sh.state.is_terminal() {
            return Err(GroveError::Request(format!(
                "cannot check: instance is {}",
                sh.state
            )));
        }
        if sh.state == InstanceState::Checking {
            return Err(GroveError::Request("check already running".into()));
        }
        sh.state = InstanceState::Checking;
        Ok(())
    }

    /// Leave the CHECKING state. Guarded so a concurrent attach that moved
    /// the instance elsewhere is not stomped.
    pub fn end_check(&self) {
        let mut sh = self.lock();
        if sh.state == InstanceState::Checking {
            sh.state = InstanceState::Waiting;
        }
    }

    /// Clear the terminal-state bookkeeping before re-running the agent.
    pub fn reset_for_restart(&self) {
        let mut sh = self.lock();
        sh.ended_at = None;
        sh.finish_requested = false;
        sh.killed = false;
    }
}

/// Drop the oldest bytes once the buffer exceeds its cap.
fn trim_buffer(buf: &mut Vec<u8>) {
    if buf.len() > MAX_LOG_BYTES {
        let excess = buf.len() - MAX_LOG_BYTES;
        buf.drain(..excess);
    }
}

fn respond_inline(conn: &mut UnixStream, resp: &Response) {
    if let Ok(mut json) = serde_json::to_string(resp) {
        json.push('\n');
        let _ = conn.write_all(json.as_bytes());
    }
    let _ = conn.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn test_instance(state: InstanceState) -> Arc<Instance> {
        let dir = tempfile::tempdir().unwrap().keep();
        let inst = Instance::new(
            "1".into(),
            "my-app".into(),
            "feat/x".into(),
            dir.join("worktrees/1"),
            dir.join("logs/1.log"),
            StateStore::new(dir.join("instances")),
            "grove-1".into(),
            None,
        );
        inst.lock().state = state;
        inst
    }

    #[test]
    fn info_promotes_idle_running_to_waiting() {
        let inst = test_instance(InstanceState::Running);
        inst.lock().last_output = Some(Instant::now() - Duration::from_secs(3));
        assert_eq!(inst.info().state, "WAITING");
        // Promotion is display-only.
        assert_eq!(inst.state(), InstanceState::Running);
    }

    #[test]
    fn info_keeps_running_when_output_is_recent() {
        let inst = test_instance(InstanceState::Running);
        inst.lock().last_output = Some(Instant::now());
        assert_eq!(inst.info().state, "RUNNING");
    }

    #[test]
    fn info_reports_non_running_states_verbatim() {
        for state in [
            InstanceState::Exited,
            InstanceState::Crashed,
            InstanceState::Killed,
            InstanceState::Finished,
            InstanceState::Checking,
            InstanceState::Attached,
        ] {
            let inst = test_instance(state);
            inst.lock().last_output = Some(Instant::now() - Duration::from_secs(10));
            assert_eq!(inst.info().state, state.as_str(), "state {state} must not be promoted");
        }
    }

    #[test]
    fn buffer_trims_to_cap_keeping_tail() {
        let inst = test_instance(InstanceState::Running);
        inst.seed_log_buffer(&vec![b'a'; MAX_LOG_BYTES]);
        inst.seed_log_buffer(b"tail-marker");

        let buf = inst.logs_snapshot();
        assert_eq!(buf.len(), MAX_LOG_BYTES);
        assert!(buf.ends_with(b"tail-marker"));
        assert_eq!(buf[0], b'a');
    }

    #[test]
    fn follow_delta_resets_after_rollover() {
        let inst = test_instance(InstanceState::Running);
        inst.seed_log_buffer(b"0123456789");

        let (delta, offset, _) = inst.follow_delta(0);
        assert_eq!(delta, b"0123456789");
        assert_eq!(offset, 10);

        // Simulate a rollover that shrank the buffer below our offset.
        inst.lock().log_buf = b"xyz".to_vec();
        let (delta, offset, _) = inst.follow_delta(10);
        assert_eq!(delta, b"xyz", "follower must reset to zero on a hole");
        assert_eq!(offset, 3);
    }

    #[test]
    fn attach_rejected_on_terminal_instance() {
        let inst = test_instance(InstanceState::Exited);
        let (server, mut client) = UnixStream::pair().unwrap();

        inst.attach(server);

        let mut buf = String::new();
        client.read_to_string(&mut buf).unwrap();
        let resp: Response = serde_json::from_str(buf.trim()).unwrap();
        assert!(!resp.ok);
        assert!(resp.error.contains("has exited"), "got: {}", resp.error);
    }

    #[test]
    fn second_attach_rejected_while_first_is_registered() {
        let inst = test_instance(InstanceState::Running);
        let (first, _first_peer) = UnixStream::pair().unwrap();
        {
            let mut sh = inst.lock();
            sh.attach_gen += 1;
            sh.attached = Some(AttachedConn { stream: first, gen: 1 });
            sh.state = InstanceState::Attached;
        }

        let (server, mut client) = UnixStream::pair().unwrap();
        inst.attach(server);

        let mut buf = String::new();
        client.read_to_string(&mut buf).unwrap();
        let resp: Response = serde_json::from_str(buf.trim()).unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.error, "already attached");
        // The original session is untouched.
        assert_eq!(inst.state(), InstanceState::Attached);
        assert!(inst.lock().attached.is_some());
    }

    #[test]
    fn attach_replays_buffer_and_detaches_cleanly() {
        let inst = test_instance(InstanceState::Running);
        inst.seed_log_buffer(b"earlier output\n");
        // No PTY: the attach should replay, then bail out and restore state.
        let (server, mut client) = UnixStream::pair().unwrap();

        let inst2 = Arc::clone(&inst);
        let handle = thread::spawn(move || inst2.attach(server));

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        handle.join().unwrap();

        assert_eq!(buf, b"earlier output\n");
        assert_eq!(inst.state(), InstanceState::Running);
        assert!(inst.lock().attached.is_none());
    }

    #[test]
    fn destroy_noop_on_terminal_instance() {
        let inst = test_instance(InstanceState::Killed);
        inst.lock().pid = 999_999_999; // would be dangerous if signalled
        inst.destroy();
        assert!(!inst.lock().killed, "terminal destroy must not set the kill flag");
    }

    #[test]
    fn check_transitions_and_guards() {
        let inst = test_instance(InstanceState::Running);
        inst.begin_check().unwrap();
        assert_eq!(inst.state(), InstanceState::Checking);

        let err = inst.begin_check().unwrap_err();
        assert!(err.to_string().contains("already running"));

        inst.end_check();
        assert_eq!(inst.state(), InstanceState::Waiting);

        let dead = test_instance(InstanceState::Finished);
        let err = dead.begin_check().unwrap_err();
        assert!(err.to_string().contains("cannot check"));
    }

    #[test]
    fn end_check_does_not_stomp_other_states() {
        let inst = test_instance(InstanceState::Attached);
        inst.end_check();
        assert_eq!(inst.state(), InstanceState::Attached);
    }

    #[test]
    fn force_finished_sets_ended_at() {
        let inst = test_instance(InstanceState::Crashed);
        inst.force_finished();
        assert_eq!(inst.state(), InstanceState::Finished);
        assert!(inst.lock().ended_at.is_some());
        assert_ne!(inst.info().ended_at, 0);
    }

    #[test]
    fn reset_for_restart_clears_bookkeeping() {
        let inst = test_instance(InstanceState::Killed);
        {
            let mut sh = inst.lock();
            sh.ended_at = Some(Utc::now());
            sh.finish_requested = true;
            sh.killed = true;
        }
        inst.reset_for_restart();
        let sh = inst.lock();
        assert!(sh.ended_at.is_none());
        assert!(!sh.finish_requested);
        assert!(!sh.killed);
    }

    #[test]
    fn snapshot_roundtrips_through_from_snapshot() {
        let inst = test_instance(InstanceState::Crashed);
        {
            let mut sh = inst.lock();
            sh.ended_at = Some(Utc::now());
            sh.pid = 4242;
            sh.compose_project = Some("grove-1".into());
        }
        let snap = inst.snapshot();
        let back = Instance::from_snapshot(
            &snap,
            PathBuf::from("/tmp/logs/1.log"),
            StateStore::new("/tmp/instances"),
        );
        assert_eq!(back.id, inst.id);
        assert_eq!(back.project, inst.project);
        assert_eq!(back.state(), InstanceState::Crashed);
        let (container, compose) = back.container();
        assert_eq!(container.as_deref(), Some("grove-1"));
        assert_eq!(compose.as_deref(), Some("grove-1"));
        assert_eq!(back.info().ended_at, snap.ended_at);
    }

    #[test]
    fn event_signals_waiters() {
        let ev = Arc::new(Event::new());
        let ev2 = Arc::clone(&ev);
        let waiter = thread::spawn(move || ev2.wait());
        thread::sleep(Duration::from_millis(20));
        ev.set();
        waiter.join().unwrap();
        // A second wait returns immediately.
        ev.wait();
    }
}
