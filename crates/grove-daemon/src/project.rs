//! Project registrations, in-repo configuration, and git worktrees.
//!
//! A project registration is a `{name, repo}` record at
//! `<root>/projects/<name>/project.yaml`, written by out-of-band CLI
//! commands; the daemon only reads it. Everything else (container settings,
//! start/check/finish commands, the agent) comes from `grove.yaml` at the
//! root of the project's canonical clone and is overlaid field by field.
//!
//! Derived layout per project:
//!
//!   <root>/projects/<name>/
//!     project.yaml      registration
//!     main/             canonical clone
//!     worktrees/<id>/   one directory per live instance

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{GroveError, Result};

/// Container settings for a project, from `grove.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Single container image (e.g. "ruby:3.3"). Mutually exclusive with
    /// `compose` in practice; `compose` wins when both are set.
    #[serde(default)]
    pub image: String,
    /// Path to a docker-compose file, relative to the repo root.
    #[serde(default)]
    pub compose: String,
    /// Compose service to exec into; default "app".
    #[serde(default)]
    pub service: String,
    /// Working directory inside the container; default "/app".
    #[serde(default)]
    pub workdir: String,
    /// Extra host paths to bind-mount; `~/foo` maps to `/root/foo`.
    #[serde(default)]
    pub mounts: Vec<String>,
}

/// The agent command to run inside the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A project: registration plus whatever `grove.yaml` overlaid onto it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub repo: String,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub check: Vec<String>,
    #[serde(default)]
    pub finish: Vec<String>,

    #[serde(default)]
    pub agent: AgentConfig,

    /// `<root>/projects/<name>`; set by the loader, never serialized.
    #[serde(skip)]
    pub data_dir: PathBuf,
}

impl Project {
    /// Working directory to use inside the container.
    pub fn container_workdir(&self) -> &str {
        if self.container.workdir.is_empty() {
            "/app"
        } else {
            &self.container.workdir
        }
    }

    /// Compose service name to exec into.
    pub fn container_service(&self) -> &str {
        if self.container.service.is_empty() {
            "app"
        } else {
            &self.container.service
        }
    }

    /// Path of the canonical checkout.
    pub fn main_dir(&self) -> PathBuf {
        self.data_dir.join("main")
    }

    /// Base directory holding all worktrees for this project.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_dir.join("worktrees")
    }

    /// Worktree path for a specific instance.
    pub fn worktree_dir(&self, instance_id: &str) -> PathBuf {
        self.worktrees_dir().join(instance_id)
    }
}

/// Read the registration from `<root>/projects/<name>/project.yaml`.
///
/// The registration only carries name and repo; all execution config comes
/// from the in-repo `grove.yaml` via [`load_in_repo_config`].
pub fn load_project(root: &Path, name: &str) -> Result<Project> {
    let project_dir = root.join("projects").join(name);
    let yaml_path = project_dir.join("project.yaml");
    let data = match fs::read_to_string(&yaml_path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(GroveError::Project(format!(
                "project {name:?} not found (expected {})",
                yaml_path.display()
            )));
        }
        Err(e) => return Err(GroveError::Project(format!("read project.yaml: {e}"))),
    };

    #[derive(Deserialize)]
    struct Registration {
        #[serde(default)]
        name: String,
        #[serde(default)]
        repo: String,
    }
    let reg: Registration = serde_yaml::from_str(&data)
        .map_err(|e| GroveError::Project(format!("parse project.yaml: {e}")))?;

    let mut p = Project {
        name: reg.name,
        repo: reg.repo,
        data_dir: project_dir,
        ..Project::default()
    };
    if p.name.is_empty() {
        p.name = name.to_string();
    }
    Ok(p)
}

/// Overlay `grove.yaml` from the project's main clone onto `p`.
///
/// Non-empty in-repo fields replace the registration's values; empty or
/// absent fields leave it untouched, so a partial config (say, only
/// `mounts:`) merges instead of wiping.
///
/// Returns `Ok(true)` if the file was found and applied, `Ok(false)` if it
/// does not exist, or an error on a parse failure.
pub fn load_in_repo_config(p: &mut Project) -> Result<bool> {
    let path = p.main_dir().join("grove.yaml");
    let data = match fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(GroveError::Project(format!("read grove.yaml: {e}"))),
    };

    let overlay: Project = serde_yaml::from_str(&data)
        .map_err(|e| GroveError::Project(format!("parse grove.yaml: {e}")))?;

    if !overlay.container.image.is_empty() {
        p.container.image = overlay.container.image;
    }
    if !overlay.container.compose.is_empty() {
        p.container.compose = overlay.container.compose;
    }
    if !overlay.container.service.is_empty() {
        p.container.service = overlay.container.service;
    }
    if !overlay.container.workdir.is_empty() {
        p.container.workdir = overlay.container.workdir;
    }
    if !overlay.container.mounts.is_empty() {
        p.container.mounts = overlay.container.mounts;
    }
    if !overlay.start.is_empty() {
        p.start = overlay.start;
    }
    if !overlay.agent.command.is_empty() {
        p.agent = overlay.agent;
    }
    if !overlay.check.is_empty() {
        p.check = overlay.check;
    }
    if !overlay.finish.is_empty() {
        p.finish = overlay.finish;
    }

    Ok(true)
}

/// Branch names are substituted into shell commands (`{{branch}}`) and git
/// invocations, so anything outside this conservative set is refused before
/// any state is created.
pub fn validate_branch_name(branch: &str) -> Result<()> {
    if branch.is_empty() {
        return Err(GroveError::Request("branch name required".into()));
    }
    if branch.starts_with('-') {
        return Err(GroveError::Request(format!(
            "invalid branch name {branch:?}: may not start with '-'"
        )));
    }
    for ch in branch.chars() {
        if !ch.is_ascii_alphanumeric() && !matches!(ch, '.' | '_' | '/' | '-') {
            return Err(GroveError::Request(format!(
                "invalid branch name {branch:?}: only letters, digits, '.', '_', '/' and '-' are allowed"
            )));
        }
    }
    Ok(())
}

fn run_git(dir: Option<&Path>, args: &[&str]) -> std::io::Result<std::process::Output> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args).output()
}

/// Ensure the canonical checkout exists, cloning if needed.
///
/// No-op when `main/.git` is already present. Clone progress and errors are
/// written to `sink` so a connected client sees them.
pub fn ensure_main_checkout(p: &Project, sink: &mut impl Write) -> Result<()> {
    let main_dir = p.main_dir();
    if main_dir.join(".git").exists() {
        return Ok(());
    }

    if p.repo.is_empty() {
        return Err(GroveError::Project(format!(
            "project {:?} has no repo URL and main checkout does not exist",
            p.name
        )));
    }

    if let Some(parent) = main_dir.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| GroveError::Project(format!("create {}: {e}", parent.display())))?;
    }

    let _ = writeln!(sink, "Cloning {} into {} ...", p.repo, main_dir.display());
    let out = run_git(None, &["clone", &p.repo, &main_dir.to_string_lossy()])
        .map_err(|e| GroveError::Project(format!("run git clone: {e}")))?;
    let _ = sink.write_all(&out.stdout);
    let _ = sink.write_all(&out.stderr);

    if !out.status.success() {
        let detail = String::from_utf8_lossy(&out.stderr);
        let detail = detail.trim();
        if detail.is_empty() {
            return Err(GroveError::Project(format!(
                "git clone {:?} failed ({})",
                p.repo, out.status
            )));
        }
        return Err(GroveError::Project(format!(
            "git clone {:?} failed: {detail}",
            p.repo
        )));
    }
    Ok(())
}

/// Pull the canonical checkout up to date with its remote.
///
/// The error is returned for logging only; callers continue on failure so
/// offline use still works.
pub fn pull_main(p: &Project, sink: &mut impl Write) -> Result<()> {
    let out = run_git(Some(&p.main_dir()), &["pull"])
        .map_err(|e| GroveError::Project(format!("run git pull: {e}")))?;
    let _ = sink.write_all(&out.stdout);
    let _ = sink.write_all(&out.stderr);
    if !out.status.success() {
        return Err(GroveError::Project(format!(
            "git pull: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}

/// Create a git worktree for `instance_id` on `branch`.
///
/// Tries to create the branch (`worktree add -b`); if it already exists,
/// retries checking out the existing branch. Returns the worktree path.
pub fn create_worktree(p: &Project, instance_id: &str, branch: &str, sink: &mut impl Write) -> Result<PathBuf> {
    let main_dir = p.main_dir();
    let worktree_dir = p.worktree_dir(instance_id);

    fs::create_dir_all(p.worktrees_dir())
        .map_err(|e| GroveError::Project(format!("create worktrees dir: {e}")))?;

    let wt = worktree_dir.to_string_lossy().to_string();
    let out = run_git(Some(&main_dir), &["worktree", "add", "-b", branch, &wt])
        .map_err(|e| GroveError::Project(format!("run git worktree add: {e}")))?;
    if out.status.success() {
        let _ = sink.write_all(&out.stdout);
        let _ = sink.write_all(&out.stderr);
        return Ok(worktree_dir);
    }

    // Branch already exists: check it out instead of creating it.
    let out = run_git(Some(&main_dir), &["worktree", "add", &wt, branch])
        .map_err(|e| GroveError::Project(format!("run git worktree add: {e}")))?;
    let _ = sink.write_all(&out.stdout);
    let _ = sink.write_all(&out.stderr);
    if !out.status.success() {
        return Err(GroveError::Project(format!(
            "git worktree add: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(worktree_dir)
}

/// Remove an instance's worktree and delete its branch.
///
/// Both steps are best-effort: a stale or half-removed worktree must never
/// block a drop.
pub fn remove_worktree(main_dir: &Path, worktree_dir: &Path, branch: &str) {
    let _ = run_git(
        Some(main_dir),
        &["worktree", "remove", "--force", &worktree_dir.to_string_lossy()],
    );
    let _ = run_git(Some(main_dir), &["branch", "-D", branch]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_helpers() {
        let p = Project {
            data_dir: PathBuf::from("/data/my-app"),
            ..Project::default()
        };
        assert_eq!(p.main_dir(), PathBuf::from("/data/my-app/main"));
        assert_eq!(p.worktrees_dir(), PathBuf::from("/data/my-app/worktrees"));
        assert_eq!(p.worktree_dir("abc"), PathBuf::from("/data/my-app/worktrees/abc"));
    }

    #[test]
    fn container_defaults() {
        let p = Project::default();
        assert_eq!(p.container_workdir(), "/app");
        assert_eq!(p.container_service(), "app");

        let mut p = Project::default();
        p.container.workdir = "/srv".into();
        p.container.service = "web".into();
        assert_eq!(p.container_workdir(), "/srv");
        assert_eq!(p.container_service(), "web");
    }

    #[test]
    fn load_project_reads_registration_only() {
        let root = tempfile::tempdir().unwrap();
        let project_dir = root.path().join("projects").join("my-app");
        fs::create_dir_all(&project_dir).unwrap();
        // Extra fields in the registration are ignored.
        let yaml = "name: my-app\nrepo: git@github.com:org/my-app.git\nagent:\n  command: claude\n";
        fs::write(project_dir.join("project.yaml"), yaml).unwrap();

        let p = load_project(root.path(), "my-app").unwrap();
        assert_eq!(p.name, "my-app");
        assert_eq!(p.repo, "git@github.com:org/my-app.git");
        assert!(p.agent.command.is_empty(), "registration must not populate agent fields");
        assert_eq!(p.data_dir, project_dir);
    }

    #[test]
    fn load_project_falls_back_to_directory_name() {
        let root = tempfile::tempdir().unwrap();
        let project_dir = root.path().join("projects").join("my-app");
        fs::create_dir_all(&project_dir).unwrap();
        fs::write(project_dir.join("project.yaml"), "repo: git@github.com:org/repo.git\n").unwrap();

        let p = load_project(root.path(), "my-app").unwrap();
        assert_eq!(p.name, "my-app");
    }

    #[test]
    fn load_project_not_found() {
        let root = tempfile::tempdir().unwrap();
        let err = load_project(root.path(), "nonexistent").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn in_repo_config_overlays_nonempty_fields() {
        let data_dir = tempfile::tempdir().unwrap();
        let main_dir = data_dir.path().join("main");
        fs::create_dir_all(&main_dir).unwrap();
        let yaml = "start:\n  - npm install\nagent:\n  command: aider\n  args: []\nfinish:\n  - git push\n";
        fs::write(main_dir.join("grove.yaml"), yaml).unwrap();

        let mut p = Project {
            data_dir: data_dir.path().to_path_buf(),
            ..Project::default()
        };
        p.agent.command = "claude".into();

        let found = load_in_repo_config(&mut p).unwrap();
        assert!(found);
        assert_eq!(p.agent.command, "aider");
        assert_eq!(p.start, vec!["npm install".to_string()]);
        assert_eq!(p.finish, vec!["git push".to_string()]);
    }

    #[test]
    fn in_repo_config_missing_is_signalled_not_fatal() {
        let mut p = Project {
            data_dir: tempfile::tempdir().unwrap().path().to_path_buf(),
            ..Project::default()
        };
        assert!(!load_in_repo_config(&mut p).unwrap());
    }

    #[test]
    fn partial_in_repo_config_does_not_wipe_other_fields() {
        let data_dir = tempfile::tempdir().unwrap();
        let main_dir = data_dir.path().join("main");
        fs::create_dir_all(&main_dir).unwrap();
        fs::write(main_dir.join("grove.yaml"), "start:\n  - make setup\n").unwrap();

        let mut p = Project {
            data_dir: data_dir.path().to_path_buf(),
            ..Project::default()
        };
        p.agent.command = "claude".into();
        p.container.image = "ubuntu:24.04".into();

        load_in_repo_config(&mut p).unwrap();
        assert_eq!(p.start, vec!["make setup".to_string()]);
        assert_eq!(p.agent.command, "claude");
        assert_eq!(p.container.image, "ubuntu:24.04");
    }

    #[test]
    fn empty_overlay_is_identity() {
        let data_dir = tempfile::tempdir().unwrap();
        let main_dir = data_dir.path().join("main");
        fs::create_dir_all(&main_dir).unwrap();
        fs::write(main_dir.join("grove.yaml"), "{}\n").unwrap();

        let mut p = Project {
            data_dir: data_dir.path().to_path_buf(),
            ..Project::default()
        };
        p.agent.command = "claude".into();
        p.container.image = "alpine".into();
        p.start = vec!["true".into()];
        let before = serde_yaml::to_string(&p).unwrap();

        assert!(load_in_repo_config(&mut p).unwrap());
        assert_eq!(serde_yaml::to_string(&p).unwrap(), before);
    }

    #[test]
    fn branch_name_validation() {
        assert!(validate_branch_name("feat/x").is_ok());
        assert!(validate_branch_name("release-1.2.3").is_ok());
        assert!(validate_branch_name("fix_thing").is_ok());

        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("-rf").is_err());
        assert!(validate_branch_name("feat/$(rm -rf /)").is_err());
        assert!(validate_branch_name("a branch").is_err());
        assert!(validate_branch_name("x;y").is_err());
    }

    #[test]
    fn ensure_main_checkout_noop_when_cloned() {
        let data_dir = tempfile::tempdir().unwrap();
        let git_dir = data_dir.path().join("main").join(".git");
        fs::create_dir_all(&git_dir).unwrap();

        let p = Project {
            data_dir: data_dir.path().to_path_buf(),
            ..Project::default()
        };
        let mut sink = Vec::new();
        ensure_main_checkout(&p, &mut sink).unwrap();
        assert!(sink.is_empty(), "no-op should produce no output");
    }

    #[test]
    fn ensure_main_checkout_requires_repo_url() {
        let data_dir = tempfile::tempdir().unwrap();
        let p = Project {
            name: "my-app".into(),
            data_dir: data_dir.path().to_path_buf(),
            ..Project::default()
        };
        let mut sink = Vec::new();
        let err = ensure_main_checkout(&p, &mut sink).unwrap_err();
        assert!(err.to_string().contains("no repo URL"));
    }
}
