//! Docker container runtime.
//!
//! The supervisor talks to Docker exclusively through this module: presence
//! check, per-instance container bring-up (single image or compose with a
//! generated bind-mount overlay), command exec, and teardown. Argument
//! construction is kept in pure functions so tests can inspect the exact
//! command lines without a Docker daemon.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use crate::error::{GroveError, Result};
use crate::project::Project;

/// Check that Docker is reachable by running `docker info`.
///
/// Called once at daemon start; a failure aborts initialisation cleanly.
pub fn validate_docker() -> Result<()> {
    let status = Command::new("docker")
        .arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            GroveError::Container(format!(
                "docker is not available ({e})\nInstall Docker: https://docs.docker.com/get-docker/"
            ))
        })?;
    if !status.success() {
        return Err(GroveError::Container(
            "docker is not available (docker info failed)\nIs the Docker daemon running?".into(),
        ));
    }
    Ok(())
}

/// Start the container (or compose stack) for an instance.
///
/// Returns `(exec_target, compose_project)`; `compose_project` is `None`
/// for the single-image variant.
pub fn start_container<W>(
    p: &Project,
    instance_id: &str,
    worktree_dir: &Path,
    sink: &W,
) -> Result<(String, Option<String>)>
where
    W: Write + Send + Clone + 'static,
{
    if !p.container.compose.is_empty() {
        return start_compose_container(p, instance_id, worktree_dir, sink);
    }
    if p.container.image.is_empty() {
        let grove_yaml = p.main_dir().join("grove.yaml");
        return Err(GroveError::Container(format!(
            "no container configured in {}\nadd a 'container:' section, e.g.:\n\n  container:\n    image: ubuntu:24.04\n",
            grove_yaml.display()
        )));
    }
    start_single_container(p, instance_id, worktree_dir, sink)
}

/// Build the `docker run` arguments for the single-image variant:
///
///   run -d --name grove-<id> -v <worktree>:<workdir> -w <workdir>
///   [-v src:tgt ...] <image> sleep infinity
///
/// The container idles on `sleep infinity` so it outlives individual agent
/// sessions (restart reuses it).
pub fn single_run_args(
    p: &Project,
    instance_id: &str,
    worktree_dir: &Path,
    mounts: &[(PathBuf, String)],
) -> Vec<String> {
    let name = container_name(instance_id);
    let workdir = p.container_workdir();

    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name,
        "-v".to_string(),
        format!("{}:{workdir}", worktree_dir.display()),
        "-w".to_string(),
        workdir.to_string(),
    ];
    for (src, tgt) in mounts {
        args.push("-v".to_string());
        args.push(format!("{}:{tgt}", src.display()));
    }
    args.push(p.container.image.clone());
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

/// The container name for an instance.
pub fn container_name(instance_id: &str) -> String {
    format!("grove-{instance_id}")
}

fn start_single_container<W>(
    p: &Project,
    instance_id: &str,
    worktree_dir: &Path,
    sink: &W,
) -> Result<(String, Option<String>)>
where
    W: Write + Send + Clone + 'static,
{
    let name = container_name(instance_id);
    let mounts = build_mounts(p, &mut sink.clone());
    let args = single_run_args(p, instance_id, worktree_dir, &mounts);

    let mut s = sink.clone();
    let _ = writeln!(s, "Starting container {name} (image: {}) ...", p.container.image);

    let out = Command::new("docker")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| GroveError::Container(format!("run docker: {e}")))?;
    let _ = s.write_all(&out.stdout);
    let _ = s.write_all(&out.stderr);
    if !out.status.success() {
        return Err(GroveError::Container(format!(
            "docker run: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok((name, None))
}

/// Render the compose override file that bind-mounts the worktree (and any
/// extra mounts) into the configured service.
pub fn compose_override_content(
    service: &str,
    workdir: &str,
    worktree_dir: &Path,
    mounts: &[(PathBuf, String)],
) -> String {
    let mut volumes = format!(
        "      - type: bind\n        source: {}\n        target: {workdir}\n",
        worktree_dir.display()
    );
    for (src, tgt) in mounts {
        volumes.push_str(&format!(
            "      - type: bind\n        source: {}\n        target: {tgt}\n",
            src.display()
        ));
    }
    format!("services:\n  {service}:\n    volumes:\n{volumes}")
}

fn start_compose_container<W>(
    p: &Project,
    instance_id: &str,
    worktree_dir: &Path,
    sink: &W,
) -> Result<(String, Option<String>)>
where
    W: Write + Send + Clone + 'static,
{
    let compose_project = container_name(instance_id);
    let service = p.container_service();
    let mounts = build_mounts(p, &mut sink.clone());
    let override_content =
        compose_override_content(service, p.container_workdir(), worktree_dir, &mounts);

    let override_path = std::env::temp_dir().join(format!(
        "grove-compose-override-{compose_project}-{}.yml",
        std::process::id()
    ));
    fs::write(&override_path, override_content)
        .map_err(|e| GroveError::Container(format!("write compose override: {e}")))?;

    let mut s = sink.clone();
    let _ = writeln!(
        s,
        "Starting compose stack {compose_project} (compose: {}, service: {service}) ...",
        p.container.compose
    );

    let override_arg = override_path.to_string_lossy().into_owned();
    let result = run_streaming(
        Command::new("docker").args([
            "compose",
            "-p",
            compose_project.as_str(),
            "-f",
            p.container.compose.as_str(),
            "-f",
            override_arg.as_str(),
            "up",
            "-d",
        ]),
        sink,
    );
    let _ = fs::remove_file(&override_path);
    let status = result.map_err(|e| GroveError::Container(format!("run docker compose: {e}")))?;
    if !status.success() {
        return Err(GroveError::Container("docker compose up failed".into()));
    }

    // Exec target follows the compose container naming convention.
    let target = format!("{compose_project}-{service}-1");
    Ok((target, Some(compose_project)))
}

/// Tear down an instance's container or compose stack. Best-effort.
pub fn stop_container(container: &str, compose_project: Option<&str>) {
    if let Some(compose_project) = compose_project {
        let _ = Command::new("docker")
            .args(["compose", "-p", compose_project, "down", "-v"])
            .stdin(Stdio::null())
            .output();
        return;
    }
    let _ = Command::new("docker")
        .args(["stop", container])
        .stdin(Stdio::null())
        .output();
    let _ = Command::new("docker")
        .args(["rm", container])
        .stdin(Stdio::null())
        .output();
}

/// Run a shell command inside the container, streaming combined output.
pub fn exec_in_container<W>(container: &str, cmd: &str, sink: &W) -> Result<()>
where
    W: Write + Send + Clone + 'static,
{
    let status = run_streaming(
        Command::new("docker").args(["exec", container, "sh", "-c", cmd]),
        sink,
    )
    .map_err(|e| GroveError::Container(format!("run docker exec: {e}")))?;
    if !status.success() {
        return Err(GroveError::Container(format!(
            "exec in container {container} failed ({status})"
        )));
    }
    Ok(())
}

/// Spawn a command with piped stdio and copy both streams to `sink` as they
/// arrive. Returns the exit status.
fn run_streaming<W>(cmd: &mut Command, sink: &W) -> io::Result<std::process::ExitStatus>
where
    W: Write + Send + Clone + 'static,
{
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut copiers = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let mut s = sink.clone();
        copiers.push(thread::spawn(move || {
            let _ = io::copy(&mut out, &mut s);
        }));
    }
    if let Some(mut err) = child.stderr.take() {
        let mut s = sink.clone();
        copiers.push(thread::spawn(move || {
            let _ = io::copy(&mut err, &mut s);
        }));
    }
    let status = child.wait()?;
    for c in copiers {
        let _ = c.join();
    }
    Ok(status)
}

/// The arguments for the interactive agent exec, run under the host PTY:
///
///   exec -it [-e KEY=VAL ...] <container> <agent> [args ...]
pub fn agent_exec_args(
    container: &str,
    env: &[(String, String)],
    agent_cmd: &str,
    agent_args: &[String],
) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "-it".to_string()];
    for (key, val) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={val}"));
    }
    args.push(container.to_string());
    args.push(agent_cmd.to_string());
    args.extend(agent_args.iter().cloned());
    args
}

const CLAUDE_INSTALL_SCRIPT: &str = r#"set -e
node_ok() {
  command -v node >/dev/null 2>&1 || return 1
  major=$(node --version 2>/dev/null | sed 's/v\([0-9]*\).*/\1/')
  [ "${major:-0}" -ge 18 ]
}
if ! node_ok; then
  echo "Installing Node.js 20 LTS..."
  ARCH=$(uname -m)
  case "$ARCH" in
    x86_64)       NODE_ARCH=x64 ;;
    aarch64|arm64) NODE_ARCH=arm64 ;;
    *) echo "unsupported CPU architecture: $ARCH" >&2; exit 1 ;;
  esac
  NODE_URL="https://nodejs.org/dist/v20.11.0/node-v20.11.0-linux-${NODE_ARCH}.tar.gz"
  if command -v apk >/dev/null 2>&1; then
    apk add --no-cache nodejs npm
  elif command -v curl >/dev/null 2>&1; then
    curl -fsSL "$NODE_URL" | tar -xz -C /usr/local --strip-components=1
  elif command -v wget >/dev/null 2>&1; then
    wget -qO- "$NODE_URL" | tar -xz -C /usr/local --strip-components=1
  elif command -v apt-get >/dev/null 2>&1; then
    apt-get update -qq && apt-get install -y -qq curl
    curl -fsSL "$NODE_URL" | tar -xz -C /usr/local --strip-components=1
  else
    echo "Cannot install Node.js: no curl, wget, or apk found in this container." >&2
    echo "Add node installation to 'start:' in grove.yaml" >&2
    exit 1
  fi
fi
npm install -g @anthropic-ai/claude-code
# Symlink into ~/.local/bin so claude can find itself at the path stored in ~/.claude.json
mkdir -p /root/.local/bin
CLAUDE_BIN=$(command -v claude 2>/dev/null || true)
if [ -n "$CLAUDE_BIN" ] && [ ! -e /root/.local/bin/claude ]; then
  ln -sf "$CLAUDE_BIN" /root/.local/bin/claude
fi"#;

const CLAUDE_START_SNIPPET: &str = "  start:\n    - curl -fsSL https://deb.nodesource.com/setup_lts.x | bash -\n    - apt-get install -y nodejs\n    - npm install -g @anthropic-ai/claude-code";

const AIDER_INSTALL_SCRIPT: &str = r#"set -e
if ! command -v pip >/dev/null 2>&1 && ! command -v pip3 >/dev/null 2>&1; then
  if command -v apt-get >/dev/null 2>&1; then
    apt-get update -qq && apt-get install -y -qq python3 python3-pip
  elif command -v apk >/dev/null 2>&1; then
    apk add --no-cache python3 py3-pip
  else
    echo "pip not found and no supported package manager available" >&2
    exit 1
  fi
fi
pip install aider-chat 2>/dev/null || pip3 install aider-chat"#;

const AIDER_START_SNIPPET: &str = "  start:\n    - pip install aider-chat";

/// Ensure the agent binary exists in the container, auto-installing it for
/// known agents. All progress goes to `sink` so it lands in the instance
/// log and the starting client's terminal.
pub fn ensure_agent_installed<W>(agent_cmd: &str, container: &str, sink: &W) -> Result<()>
where
    W: Write + Send + Clone + 'static,
{
    let probe = format!("command -v {agent_cmd} >/dev/null 2>&1");
    let present = Command::new("docker")
        .args(["exec", container, "sh", "-c", probe.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| GroveError::Container(format!("run docker exec: {e}")))?;
    if present.success() {
        return Ok(());
    }

    let (install_script, start_snippet) = match agent_cmd {
        "claude" => (CLAUDE_INSTALL_SCRIPT, CLAUDE_START_SNIPPET),
        "aider" => (AIDER_INSTALL_SCRIPT, AIDER_START_SNIPPET),
        other => {
            return Err(GroveError::Container(format!(
                "agent command {other:?} not found in container {container}\n\
                 install it in your container image or add it to 'start:' in grove.yaml"
            )));
        }
    };

    let mut s = sink.clone();
    let _ = writeln!(
        s,
        "Agent {agent_cmd:?} not found -- auto-installing (this runs once per container)..."
    );
    let status = run_streaming(
        Command::new("docker").args(["exec", container, "sh", "-c", install_script]),
        sink,
    )
    .map_err(|e| GroveError::Container(format!("run docker exec: {e}")))?;
    if !status.success() {
        return Err(GroveError::Container(format!(
            "auto-install of {agent_cmd:?} failed ({status})\n\
             to install it yourself, add to grove.yaml:\n{start_snippet}"
        )));
    }

    let verify = Command::new("docker")
        .args(["exec", container, "sh", "-c", probe.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| GroveError::Container(format!("run docker exec: {e}")))?;
    if !verify.success() {
        return Err(GroveError::Container(format!(
            "auto-install of {agent_cmd:?} appeared to succeed but the command is still not in PATH\n\
             check that the install placed the binary in a directory on $PATH inside the container"
        )));
    }

    let _ = writeln!(s, "Agent {agent_cmd:?} installed successfully.");
    Ok(())
}

/// All `(source, target)` bind-mount pairs for a container: auto-detected
/// agent credentials followed by user-configured mounts.
///
/// Auto-mounts whose source is absent on the host are skipped silently (the
/// agent may not be set up yet); missing user-configured paths warn to the
/// sink but are never fatal.
pub fn build_mounts(p: &Project, sink: &mut impl Write) -> Vec<(PathBuf, String)> {
    let home = home_dir();
    let mut mounts = Vec::new();

    // Claude stores its main config (including auth) at ~/.claude.json,
    // separate from the ~/.claude/ session directory. If only the directory
    // was backed up, restore the newest backup so the bind mount below has
    // a file to apply.
    if p.agent.command == "claude" {
        restore_claude_config_if_missing(&home, sink);
    }

    let mut creds_mounted = 0;
    for (src, tgt) in agent_credential_mounts(&p.agent.command, &home) {
        if src.exists() {
            let _ = writeln!(sink, "Mounting credentials: {} -> {tgt}", src.display());
            mounts.push((src, tgt));
            creds_mounted += 1;
        }
    }
    if p.agent.command == "claude" && creds_mounted == 0 {
        let _ = writeln!(
            sink,
            "Warning: no Claude credentials found on host (~/.claude or ~/.claude.json). Agent will show welcome/login."
        );
    }

    for m in &p.container.mounts {
        let (src, tgt) = resolve_mount_path(m, &home);
        if src.exists() {
            let _ = writeln!(sink, "Mounting: {} -> {tgt}", src.display());
            mounts.push((src, tgt));
        } else {
            let _ = writeln!(sink, "Warning: skipping mount {m:?} -- path not found on host");
        }
    }

    mounts
}

/// Restore `~/.claude.json` from the newest backup in `~/.claude/backups/`
/// when the config file itself is missing. Every step is best-effort: no
/// backups, unreadable files, or a write failure just leave things as they
/// were and the credential warning in [`build_mounts`] covers the rest.
fn restore_claude_config_if_missing(home: &Path, sink: &mut impl Write) {
    let config_path = home.join(".claude.json");
    if config_path.exists() {
        return;
    }
    let backups_dir = home.join(".claude").join("backups");
    let Ok(entries) = fs::read_dir(&backups_dir) else {
        return;
    };
    // Backups carry timestamp suffixes; the last name alphabetically is
    // the newest.
    let mut names: Vec<_> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name())
        .collect();
    names.sort();
    let Some(latest) = names.pop() else {
        return;
    };
    let Ok(data) = fs::read(backups_dir.join(&latest)) else {
        return;
    };

    use std::os::unix::fs::OpenOptionsExt;
    let Ok(mut config) = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&config_path)
    else {
        return;
    };
    if config.write_all(&data).is_err() {
        return;
    }
    let _ = writeln!(
        sink,
        "Restored Claude config from backup: {}",
        latest.to_string_lossy()
    );
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}

/// Credential mount pairs for known agent CLIs.
pub fn agent_credential_mounts(agent_cmd: &str, home: &Path) -> Vec<(PathBuf, String)> {
    match agent_cmd {
        "claude" => vec![
            (home.join(".claude"), "/root/.claude".to_string()),
            (home.join(".claude.json"), "/root/.claude.json".to_string()),
        ],
        "aider" => vec![(home.join(".aider"), "/root/.aider".to_string())],
        _ => Vec::new(),
    }
}

/// Expand a user-specified mount path to `(source, target)`.
///
///   ~      -> (HOME, /root)
///   ~/foo  -> (HOME/foo, /root/foo)
///   /abs   -> (/abs, /abs)
pub fn resolve_mount_path(m: &str, home: &Path) -> (PathBuf, String) {
    if m == "~" {
        return (home.to_path_buf(), "/root".to_string());
    }
    if let Some(rel) = m.strip_prefix("~/") {
        return (home.join(rel), format!("/root/{rel}"));
    }
    (PathBuf::from(m), m.to_string())
}

/// Parse the dotenv-style credentials file at `<root>/env`.
///
/// `KEY=VALUE` per line; `#` comments and blank lines are ignored. An
/// absent file yields an empty map, not an error.
pub fn load_env_file(root: &Path) -> Vec<(String, String)> {
    let mut env = Vec::new();
    let Ok(data) = fs::read_to_string(root.join("env")) else {
        return env;
    };
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        env.push((key.trim().to_string(), val.trim().to_string()));
    }
    debug!(keys = env.len(), "loaded env file");
    env
}
