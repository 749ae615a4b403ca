//! Project registration management.
//!
//! Registrations are plain files under `<root>/projects/<name>/`; the
//! daemon only ever reads them, so create/list/delete work without a
//! running daemon.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context};

use crate::client;

/// Write a new registration. Refuses to overwrite an existing project.
pub fn create(name: &str, repo: &str) -> anyhow::Result<()> {
    validate_name(name)?;
    let project_dir = client::root_dir().join("projects").join(name);
    let yaml_path = project_dir.join("project.yaml");
    if yaml_path.exists() {
        bail!("project {name:?} already exists ({})", yaml_path.display());
    }
    fs::create_dir_all(&project_dir)
        .with_context(|| format!("create {}", project_dir.display()))?;
    fs::write(&yaml_path, format!("name: {name}\nrepo: {repo}\n"))
        .with_context(|| format!("write {}", yaml_path.display()))?;
    println!("Registered project {name} -> {repo}");
    Ok(())
}

/// Print every registered project.
pub fn list() -> anyhow::Result<()> {
    let projects_dir = client::root_dir().join("projects");
    let mut names: Vec<String> = match fs::read_dir(&projects_dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.path().join("project.yaml").exists())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();

    if names.is_empty() {
        println!("No projects registered. Add one with: grove project create <name> --repo <url>");
        return Ok(());
    }
    for name in names {
        let repo = read_repo(&projects_dir.join(&name).join("project.yaml")).unwrap_or_default();
        println!("{name:<20} {repo}");
    }
    Ok(())
}

/// Delete a registration and all its local data (clone, worktrees).
pub fn delete(name: &str, force: bool) -> anyhow::Result<()> {
    validate_name(name)?;
    let project_dir = client::root_dir().join("projects").join(name);
    if !project_dir.join("project.yaml").exists() {
        bail!("project {name:?} not found");
    }

    if !force {
        print!("Delete project {name} and its local clone and worktrees? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    fs::remove_dir_all(&project_dir)
        .with_context(|| format!("remove {}", project_dir.display()))?;
    println!("Deleted project {name}");
    Ok(())
}

fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        bail!("project name required");
    }
    if name.starts_with('.')
        || name
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
    {
        bail!("invalid project name {name:?}: use letters, digits, '-', '_' and '.'");
    }
    Ok(())
}

fn read_repo(yaml_path: &Path) -> Option<String> {
    let data = fs::read_to_string(yaml_path).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&data).ok()?;
    Some(value.get("repo")?.as_str()?.to_string())
}

/// Boilerplate grove.yaml offered when a project's repo has none.
pub const GROVE_YAML_TEMPLATE: &str = "\
# grove.yaml -- per-repo settings for grove instances.
# Commit this file so every teammate gets the same environment.
container:
  image: ubuntu:24.04
  # or instead of image:
  # compose: docker-compose.yml
  # service: app
  workdir: /app
  # mounts:
  #   - ~/.config/some-tool
start: []
agent:
  command: claude
  args: []
check: []
finish: []
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("my-app").is_ok());
        assert!(validate_name("app_2.0").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(".hidden").is_err());
    }

    #[test]
    fn create_and_list_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        std::env::set_var("GROVE_ROOT", root.path());

        create("my-app", "git@github.com:org/my-app.git").unwrap();
        let yaml_path = root.path().join("projects/my-app/project.yaml");
        assert!(yaml_path.exists());
        assert_eq!(
            read_repo(&yaml_path).as_deref(),
            Some("git@github.com:org/my-app.git")
        );

        // Re-creating the same project is refused.
        assert!(create("my-app", "elsewhere").is_err());

        delete("my-app", true).unwrap();
        assert!(!yaml_path.exists());
    }
}
