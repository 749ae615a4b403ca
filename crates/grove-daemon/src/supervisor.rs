//! The central supervisor: instance registry and request dispatch.
//!
//! Owns the map of live instances and handles every IPC request from the
//! CLI. Each connection carries a single newline-terminated JSON request;
//! the daemon writes a single JSON response and closes, except for attach
//! and logs_follow which keep streaming, and start/finish/check which
//! stream captured or command output after the response line.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::hash::BuildHasher;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use grove_proto::{req, InstanceState, Request, Response};

use crate::container::{
    ensure_agent_installed, exec_in_container, load_env_file, start_container, stop_container,
};
use crate::error::{GroveError, Result};
use crate::instance::Instance;
use crate::project::{
    create_worktree, ensure_main_checkout, load_in_repo_config, load_project, pull_main,
    remove_worktree, validate_branch_name, Project,
};
use crate::sink::{ResilientWriter, SetupSink};
use crate::store::StateStore;

/// Cap on the request line, matching the attach frame cap.
const MAX_REQUEST_LINE: usize = 1 << 20;

/// Poll interval for logs_follow.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(100);

/// Ordered ID alphabet: digits then letters, giving 35 single-character
/// slots before two-character combinations.
const ID_ALPHABET: [char; 35] = [
    '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

struct Registry {
    instances: HashMap<String, Arc<Instance>>,
    /// IDs handed to start pipelines that have not registered yet. Keeps
    /// two concurrent starts from racing to the same ID.
    reserved: HashSet<String>,
}

/// Process-wide supervisor: registry, dispatcher, crash-recovery loader.
pub struct Supervisor {
    root: PathBuf,
    store: StateStore,
    registry: Mutex<Registry>,
}

impl Supervisor {
    /// Build a supervisor rooted at `root`, creating the data layout and
    /// reloading persisted instances. The container runtime preflight is
    /// the binary's job, before this is called.
    pub fn new(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        for sub in ["projects", "instances", "logs"] {
            std::fs::create_dir_all(root.join(sub))
                .map_err(|e| GroveError::Store(format!("create {sub} dir: {e}")))?;
        }

        let sup = Arc::new(Self {
            store: StateStore::new(root.join("instances")),
            root,
            registry: Mutex::new(Registry {
                instances: HashMap::new(),
                reserved: HashSet::new(),
            }),
        });

        if let Err(e) = sup.load_persisted_instances() {
            warn!(error = %e, "could not reload persisted instances");
        }

        Ok(sup)
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// The daemon's Unix socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.root.join("groved.sock")
    }

    fn log_file_for(&self, id: &str) -> PathBuf {
        self.root.join("logs").join(format!("{id}.log"))
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry mutex poisoned")
    }

    fn get_instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.lock_registry().instances.get(id).cloned()
    }

    /// Re-register instances persisted by previous daemon runs.
    ///
    /// Any instance recorded in a live state was orphaned by the previous
    /// daemon's death (its process is gone), so it is reclassified as
    /// CRASHED and re-persisted; terminal states reload verbatim. This is
    /// the recovery oracle: no PID-liveness guessing across restarts.
    fn load_persisted_instances(&self) -> Result<()> {
        let snaps = self.store.load_all()?;
        let mut reg = self.lock_registry();
        for mut snap in snaps {
            let corrected = snap.state.is_live();
            if corrected {
                snap.state = InstanceState::Crashed;
                snap.ended_at = Utc::now().timestamp();
                snap.pid = 0;
            }
            let inst =
                Instance::from_snapshot(&snap, self.log_file_for(&snap.id), self.store.clone());
            if corrected {
                warn!(instance = %snap.id, "reloaded live instance as CRASHED");
                inst.persist();
            }
            reg.instances.insert(snap.id.clone(), inst);
        }
        info!(count = reg.instances.len(), "reloaded persisted instances");
        Ok(())
    }

    /// Reserve the lowest free instance ID.
    ///
    /// Scans single characters first, then pairs, then falls back to random
    /// hex. The reservation is released on pipeline failure or converted
    /// into a registration on success.
    fn allocate_id(&self) -> String {
        let mut reg = self.lock_registry();
        let taken =
            |reg: &Registry, id: &str| reg.instances.contains_key(id) || reg.reserved.contains(id);

        let mut found = None;
        for a in ID_ALPHABET {
            let id = a.to_string();
            if !taken(&reg, &id) {
                found = Some(id);
                break;
            }
        }
        if found.is_none() {
            'outer: for a in ID_ALPHABET {
                for b in ID_ALPHABET {
                    let id = format!("{a}{b}");
                    if !taken(&reg, &id) {
                        found = Some(id);
                        break 'outer;
                    }
                }
            }
        }
        let id = found.unwrap_or_else(|| {
            // 1,260 short IDs exhausted; practically unreachable.
            loop {
                let n = std::collections::hash_map::RandomState::new().hash_one(0u8);
                let id = format!("{:08x}", n as u32);
                if !taken(&reg, &id) {
                    break id;
                }
            }
        });

        reg.reserved.insert(id.clone());
        id
    }

    fn release_reservation(&self, id: &str) {
        self.lock_registry().reserved.remove(id);
    }

    fn register(&self, inst: Arc<Instance>) {
        let mut reg = self.lock_registry();
        reg.reserved.remove(&inst.id);
        reg.instances.insert(inst.id.clone(), inst);
    }

    /// Serve one client connection: read the request line, dispatch, let
    /// the handler decide whether to close immediately or stream.
    pub fn handle_conn(self: &Arc<Self>, mut conn: UnixStream) {
        let line = match read_request_line(&mut conn) {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                respond(&mut conn, &Response::error(format!("bad request: {e}")));
                return;
            }
        };

        let request: Request = match serde_json::from_str(line.trim()) {
            Ok(r) => r,
            Err(e) => {
                respond(&mut conn, &Response::error(format!("bad request: {e}")));
                return;
            }
        };

        match request.kind.as_str() {
            req::PING => respond(&mut conn, &Response::ok()),
            req::START => self.handle_start(&mut conn, &request),
            req::LIST => self.handle_list(&mut conn),
            req::ATTACH => self.handle_attach(conn, &request),
            req::LOGS => self.handle_logs(&mut conn, &request),
            req::LOGS_FOLLOW => self.handle_logs_follow(&mut conn, &request),
            req::STOP => self.handle_stop(&mut conn, &request),
            req::RESTART => self.handle_restart(&mut conn, &request),
            req::DROP => self.handle_drop(&mut conn, &request),
            req::FINISH => self.handle_finish(&mut conn, &request),
            req::CHECK => self.handle_check(&mut conn, &request),
            other => respond(
                &mut conn,
                &Response::error(format!("unknown request type: {other}")),
            ),
        }
    }

    // --- start ---------------------------------------------------------

    fn handle_start(&self, conn: &mut UnixStream, request: &Request) {
        if request.project.is_empty() {
            respond(conn, &Response::error("project name required"));
            return;
        }
        if let Err(e) = validate_branch_name(&request.branch) {
            respond(conn, &Response::error(e.to_string()));
            return;
        }

        let id = self.allocate_id();
        let log_fd = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file_for(&id))
        {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(instance = %id, error = %e, "cannot open instance log");
                None
            }
        };
        let sink = SetupSink::new(log_fd);

        match self.start_pipeline(request, &id, &sink) {
            Ok(inst) => {
                self.register(Arc::clone(&inst));
                inst.persist();
                info!(instance = %id, project = %request.project, branch = %request.branch, "instance started");
                let mut resp = Response::ok();
                resp.instance_id = id;
                respond(conn, &resp);
                // The client consumes the JSON line first, then streams the
                // captured setup output until the connection closes.
                let _ = conn.write_all(&sink.captured());
            }
            Err(resp) => {
                self.release_reservation(&id);
                error!(instance = %id, project = %request.project, error = %resp.error, "start failed");
                respond(conn, &resp);
            }
        }
    }

    /// Steps 2–14 of the start pipeline. Every failure rolls back whatever
    /// earlier stages created, so a failed start never leaves an orphan
    /// worktree or container.
    fn start_pipeline(
        &self,
        request: &Request,
        id: &str,
        sink: &SetupSink,
    ) -> std::result::Result<Arc<Instance>, Response> {
        let mut project =
            load_project(&self.root, &request.project).map_err(|e| Response::error(e.to_string()))?;

        if let Err(e) = ensure_main_checkout(&project, &mut sink.clone()) {
            let mut msg = e.to_string();
            if url_missing_scheme(&project.repo) {
                msg.push_str(&format!(
                    "\n(hint: repo {:?} has no scheme; use https://... or git@...)",
                    project.repo
                ));
            }
            return Err(Response::error(msg));
        }

        if let Err(e) = pull_main(&project, &mut sink.clone()) {
            warn!(project = %request.project, error = %e, "git pull failed; continuing with local state");
        }

        match load_in_repo_config(&mut project) {
            Ok(true) => {}
            Ok(false) => {
                let mut resp =
                    Response::error(format!("no grove.yaml in {}", request.project));
                resp.init_path = project.main_dir().to_string_lossy().to_string();
                return Err(resp);
            }
            Err(e) => return Err(Response::error(e.to_string())),
        }

        let worktree_dir = create_worktree(&project, id, &request.branch, &mut sink.clone())
            .map_err(|e| Response::error(e.to_string()))?;

        let cleanup_worktree = |stage_err: GroveError| {
            remove_worktree(&project.main_dir(), &worktree_dir, &request.branch);
            Response::error(stage_err.to_string())
        };

        let (container, compose_project) =
            match start_container(&project, id, &worktree_dir, sink) {
                Ok(c) => c,
                Err(e) => return Err(cleanup_worktree(e)),
            };

        let cleanup_all = |stage_err: GroveError| {
            stop_container(&container, compose_project.as_deref());
            remove_worktree(&project.main_dir(), &worktree_dir, &request.branch);
            Response::error(stage_err.to_string())
        };

        for cmd in &project.start {
            let _ = writeln!(sink.clone(), "Start: {cmd}");
            if let Err(e) = exec_in_container(&container, cmd, sink) {
                return Err(cleanup_all(GroveError::Container(format!("start {cmd:?}: {e}"))));
            }
        }

        let agent_cmd = if project.agent.command.is_empty() {
            "sh".to_string()
        } else {
            project.agent.command.clone()
        };
        if let Err(e) = ensure_agent_installed(&agent_cmd, &container, sink) {
            return Err(cleanup_all(e));
        }

        let env = self.build_agent_env(&request.agent_env);

        let inst = Instance::new(
            id.to_string(),
            request.project.clone(),
            request.branch.clone(),
            worktree_dir.clone(),
            self.log_file_for(id),
            self.store.clone(),
            container.clone(),
            compose_project.clone(),
        );
        inst.seed_log_buffer(&sink.captured());

        if let Err(e) = inst.start_agent(&agent_cmd, &project.agent.args, &env) {
            return Err(cleanup_all(e));
        }

        Ok(inst)
    }

    /// Agent environment: env file first, request-supplied entries winning
    /// per key.
    fn build_agent_env(&self, agent_env: &HashMap<String, String>) -> Vec<(String, String)> {
        let mut env = load_env_file(&self.root);
        for (key, val) in agent_env {
            match env.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = val.clone(),
                None => env.push((key.clone(), val.clone())),
            }
        }
        env
    }

    // --- snapshots and streams -----------------------------------------

    fn handle_list(&self, conn: &mut UnixStream) {
        let mut infos: Vec<_> = {
            let reg = self.lock_registry();
            reg.instances.values().map(|i| i.info()).collect()
        };
        infos.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut resp = Response::ok();
        resp.instances = infos;
        respond(conn, &resp);
    }

    fn handle_attach(&self, mut conn: UnixStream, request: &Request) {
        let Some(inst) = self.require_instance(&mut conn, request) else {
            return;
        };

        let state = inst.state();
        if state.is_terminal() {
            respond(
                &mut conn,
                &Response::error(format!("instance has {}", state.as_str().to_lowercase())),
            );
            return;
        }

        // Handshake ACK, then the connection switches to streaming mode.
        respond(&mut conn, &Response::ok());

        // Blocks until the client detaches or the agent exits.
        inst.attach(conn);
    }

    fn handle_logs(&self, conn: &mut UnixStream, request: &Request) {
        let Some(inst) = self.require_instance(conn, request) else {
            return;
        };

        let logs = inst.logs_snapshot();
        let mut resp = Response::ok();
        resp.instance_id = inst.id.clone();
        respond(conn, &resp);
        let _ = conn.write_all(&logs);
    }

    fn handle_logs_follow(&self, conn: &mut UnixStream, request: &Request) {
        let Some(inst) = self.require_instance(conn, request) else {
            return;
        };
        respond(conn, &Response::ok());

        let (initial, mut offset, _) = inst.follow_delta(0);
        if !initial.is_empty() && conn.write_all(&initial).is_err() {
            return;
        }

        loop {
            thread::sleep(FOLLOW_INTERVAL);
            let (delta, new_offset, state) = inst.follow_delta(offset);
            offset = new_offset;
            if !delta.is_empty() && conn.write_all(&delta).is_err() {
                return; // client disconnected
            }
            // Exit when the instance is done and the buffer is drained.
            if state.is_terminal() && delta.is_empty() {
                return;
            }
        }
    }

    // --- lifecycle mutations -------------------------------------------

    fn handle_stop(&self, conn: &mut UnixStream, request: &Request) {
        let Some(inst) = self.require_instance(conn, request) else {
            return;
        };
        // The reader thread records KILLED and persists. No-op on
        // already-dead instances.
        inst.destroy();
        respond(conn, &Response::ok());
    }

    fn handle_restart(&self, conn: &mut UnixStream, request: &Request) {
        let Some(inst) = self.require_instance(conn, request) else {
            return;
        };

        let state = inst.state();
        if !state.is_terminal() {
            respond(
                conn,
                &Response::error(format!("cannot restart: instance is {state}")),
            );
            return;
        }

        let mut project = match load_project(&self.root, &inst.project) {
            Ok(p) => p,
            Err(e) => {
                respond(conn, &Response::error(e.to_string()));
                return;
            }
        };

        if let Err(e) = pull_main(&project, &mut std::io::sink()) {
            warn!(project = %inst.project, error = %e, "git pull failed; continuing with local state");
        }

        match load_in_repo_config(&mut project) {
            Ok(true) => {}
            Ok(false) => {
                let mut resp = Response::error(format!("no grove.yaml in {}", inst.project));
                resp.init_path = project.main_dir().to_string_lossy().to_string();
                respond(conn, &resp);
                return;
            }
            Err(e) => {
                respond(conn, &Response::error(e.to_string()));
                return;
            }
        }

        let agent_cmd = if project.agent.command.is_empty() {
            "sh".to_string()
        } else {
            project.agent.command.clone()
        };
        let env = self.build_agent_env(&request.agent_env);

        // Worktree and container are reused; only the agent process is new.
        inst.reset_for_restart();
        if let Err(e) = inst.start_agent(&agent_cmd, &project.agent.args, &env) {
            respond(conn, &Response::error(e.to_string()));
            return;
        }

        inst.persist();
        info!(instance = %inst.id, "instance restarted");
        respond(conn, &Response::ok());
    }

    fn handle_drop(&self, conn: &mut UnixStream, request: &Request) {
        let Some(inst) = self.require_instance(conn, request) else {
            return;
        };

        inst.destroy();

        let (container, compose_project) = inst.container();
        if let Some(container) = container {
            stop_container(&container, compose_project.as_deref());
        }

        // worktree_dir is <project>/worktrees/<id>, so main is a sibling of
        // its parent.
        if let Some(main_dir) = inst
            .worktree_dir
            .parent()
            .and_then(|p| p.parent())
            .map(|p| p.join("main"))
        {
            remove_worktree(&main_dir, &inst.worktree_dir, &inst.branch);
        }

        self.lock_registry().instances.remove(&inst.id);
        self.store.delete(&inst.id);

        info!(instance = %inst.id, "instance dropped");
        respond(conn, &Response::ok());
    }

    fn handle_finish(&self, conn: &mut UnixStream, request: &Request) {
        let Some(inst) = self.require_instance(conn, request) else {
            return;
        };

        let state = inst.state();
        if state.is_terminal() {
            if state != InstanceState::Finished {
                inst.force_finished();
            }
        } else {
            // Ask the reader thread to record FINISHED, kill the agent,
            // then wait for the process to fully wind down.
            let done = inst.mark_finish_requested();
            inst.destroy();
            if let Some(done) = done {
                done.wait();
            }
        }
        inst.persist();

        let finish_commands = {
            let mut commands = Vec::new();
            if let Ok(mut project) = load_project(&self.root, &inst.project) {
                let _ = load_in_repo_config(&mut project);
                commands = project.finish;
            }
            commands
        };

        let mut resp = Response::ok();
        resp.worktree_dir = inst.worktree_dir.to_string_lossy().to_string();
        resp.branch = inst.branch.clone();
        resp.finish_commands = finish_commands.clone();
        respond(conn, &resp);

        // Run the finish commands inside the still-running container. The
        // resilient writer keeps them going even if the client hangs up;
        // their output always reaches the on-disk log.
        let (container, compose_project) = inst.container();
        if let Some(container) = container {
            let writer = self.resilient_writer(&inst.id, conn);
            for cmd in &finish_commands {
                let cmd = substitute_branch(cmd, &inst.branch);
                let _ = writeln!(writer.clone(), "Finish: {cmd}");
                if let Err(e) = exec_in_container(&container, &cmd, &writer) {
                    let _ = writeln!(writer.clone(), "finish command failed: {e}");
                    warn!(instance = %inst.id, error = %e, "finish command failed");
                    break;
                }
            }
            stop_container(&container, compose_project.as_deref());
        }
        info!(instance = %inst.id, "instance finished");
    }

    fn handle_check(&self, conn: &mut UnixStream, request: &Request) {
        let Some(inst) = self.require_instance(conn, request) else {
            return;
        };

        if let Err(e) = inst.begin_check() {
            respond(conn, &Response::error(e.to_string()));
            return;
        }

        let check_commands = match load_project(&self.root, &inst.project) {
            Ok(mut project) => {
                let _ = load_in_repo_config(&mut project);
                project.check
            }
            Err(e) => {
                inst.end_check();
                respond(conn, &Response::error(e.to_string()));
                return;
            }
        };

        let (container, _) = inst.container();
        let Some(container) = container else {
            inst.end_check();
            respond(conn, &Response::error("instance has no container"));
            return;
        };

        respond(conn, &Response::ok());

        // All check commands run concurrently; the shared resilient writer
        // interleaves their output and survives a client disconnect.
        let writer = self.resilient_writer(&inst.id, conn);
        let mut workers = Vec::new();
        for cmd in check_commands {
            let writer = writer.clone();
            let container = container.clone();
            workers.push(thread::spawn(move || {
                let _ = writeln!(writer.clone(), "Check: {cmd}");
                if let Err(e) = exec_in_container(&container, &cmd, &writer) {
                    let _ = writeln!(writer.clone(), "check {cmd:?} failed: {e}");
                }
            }));
        }
        for worker in workers {
            let _ = worker.join();
        }

        inst.end_check();
        info!(instance = %inst.id, "check finished");
    }

    // --- helpers --------------------------------------------------------

    fn require_instance(&self, conn: &mut UnixStream, request: &Request) -> Option<Arc<Instance>> {
        match self.get_instance(&request.instance_id) {
            Some(inst) => Some(inst),
            None => {
                respond(
                    conn,
                    &Response::error(format!("instance not found: {}", request.instance_id)),
                );
                None
            }
        }
    }

    fn resilient_writer(&self, id: &str, conn: &UnixStream) -> ResilientWriter {
        let log_fd = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file_for(id))
            .ok();
        ResilientWriter::new(log_fd, conn.try_clone().ok())
    }
}

/// Substitute the instance branch into a configured command.
pub fn substitute_branch(cmd: &str, branch: &str) -> String {
    cmd.replace("{{branch}}", branch)
}

fn url_missing_scheme(repo: &str) -> bool {
    !repo.is_empty()
        && !repo.contains("://")
        && !repo.starts_with("git@")
        && !PathBuf::from(repo).exists()
}

fn respond(conn: &mut UnixStream, resp: &Response) {
    let Ok(mut json) = serde_json::to_string(resp) else {
        return;
    };
    json.push('\n');
    let _ = conn.write_all(json.as_bytes());
}

/// Read one newline-terminated request line, byte by byte so no stream
/// bytes beyond the newline are consumed (attach frames follow on the same
/// socket). Returns `Ok(None)` when the client closed without sending.
fn read_request_line(conn: &mut UnixStream) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match conn.read(&mut byte) {
            Ok(0) => {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
                if line.len() > MAX_REQUEST_LINE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "request line too long",
                    ));
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}
