//! grove -- parallel AI coding agents in isolated worktree + container
//! sandboxes.
//!
//! Thin client over the groved Unix socket: each subcommand sends one JSON
//! request and renders the response; attach and the log follower keep the
//! connection open and stream.

mod attach;
mod client;
mod projects;

use std::collections::HashMap;
use std::io::Write;

use anyhow::bail;
use clap::{Parser, Subcommand};

use grove_proto::{req, Request};

#[derive(Parser, Debug)]
#[command(name = "grove", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage project registrations
    Project {
        #[command(subcommand)]
        action: ProjectCommands,
    },

    /// Start a new instance of a project on a branch
    Start {
        project: String,
        branch: String,
        /// Do not attach after starting
        #[arg(short = 'd', long)]
        detach: bool,
        /// Extra KEY=VALUE environment for the agent (repeatable)
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },

    /// List instances
    List,

    /// Attach the terminal to an instance (detach: Ctrl-])
    Attach { instance_id: String },

    /// Print an instance's recent output
    Logs {
        instance_id: String,
        /// Keep following new output
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Kill an instance's agent (record is kept; restart brings it back)
    Stop { instance_id: String },

    /// Restart a stopped/crashed/finished instance
    Restart {
        instance_id: String,
        /// Do not attach after restarting
        #[arg(short = 'd', long)]
        detach: bool,
        /// Extra KEY=VALUE environment for the agent (repeatable)
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },

    /// Permanently remove an instance, its worktree, and its branch
    Drop {
        instance_id: String,
        /// Skip the confirmation prompt
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// Run the project's finish commands and tear the instance down
    Finish { instance_id: String },

    /// Run the project's check commands inside the instance container
    Check { instance_id: String },

    /// Check that the daemon is reachable
    Ping,
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// Register a project
    Create {
        name: String,
        /// Git URL (or local path) of the repository
        #[arg(long)]
        repo: String,
    },
    /// List registered projects
    List,
    /// Delete a registration and its local clone and worktrees
    Delete {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short = 'f', long)]
        force: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("grove: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    match Cli::parse().command {
        Commands::Project { action } => match action {
            ProjectCommands::Create { name, repo } => projects::create(&name, &repo),
            ProjectCommands::List => projects::list(),
            ProjectCommands::Delete { name, force } => projects::delete(&name, force),
        },
        Commands::Start {
            project,
            branch,
            detach,
            env,
        } => cmd_start(&project, &branch, detach, &env),
        Commands::List => cmd_list(),
        Commands::Attach { instance_id } => attach::run(&instance_id),
        Commands::Logs {
            instance_id,
            follow,
        } => cmd_logs(&instance_id, follow),
        Commands::Stop { instance_id } => cmd_simple(req::STOP, &instance_id),
        Commands::Restart {
            instance_id,
            detach,
            env,
        } => cmd_restart(&instance_id, detach, &env),
        Commands::Drop { instance_id, force } => cmd_drop(&instance_id, force),
        Commands::Finish { instance_id } => cmd_finish(&instance_id),
        Commands::Check { instance_id } => cmd_check(&instance_id),
        Commands::Ping => {
            client::call(&Request::new(req::PING))?;
            println!("groved is running");
            Ok(())
        }
    }
}

fn parse_env_pairs(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for pair in pairs {
        let Some((key, val)) = pair.split_once('=') else {
            bail!("invalid --env {pair:?}: expected KEY=VALUE");
        };
        env.insert(key.to_string(), val.to_string());
    }
    Ok(env)
}

fn cmd_start(project: &str, branch: &str, detach: bool, env: &[String]) -> anyhow::Result<()> {
    let mut request = Request::new(req::START);
    request.project = project.to_string();
    request.branch = branch.to_string();
    request.agent_env = parse_env_pairs(env)?;

    let mut conn = client::connect()?;
    client::write_request(&mut conn, &request)?;
    let resp = client::read_response(&mut conn)?;
    if !resp.ok {
        if !resp.init_path.is_empty() {
            offer_config_scaffold(&resp.init_path, project)?;
            std::process::exit(1);
        }
        bail!("{}", resp.error);
    }

    // Stream the setup output (clone, container, start commands) the
    // daemon captured during the pipeline.
    client::stream_to_stdout(&mut conn);
    drop(conn);

    println!("\nStarted instance {}", resp.instance_id);

    if !detach {
        attach::run(&resp.instance_id)?;
    }
    Ok(())
}

/// The daemon found no grove.yaml in the project repo. Offer to write a
/// starter file into the main checkout so the user can edit and commit it.
fn offer_config_scaffold(init_path: &str, project: &str) -> anyhow::Result<()> {
    let config_path = std::path::Path::new(init_path).join("grove.yaml");
    eprintln!("grove: project {project} has no grove.yaml in its repository");
    print!("Create a starter {} to edit and commit? [y/N] ", config_path.display());
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if !matches!(answer.trim(), "y" | "Y" | "yes") {
        eprintln!("Add a grove.yaml to the repository root, commit it, and re-run.");
        return Ok(());
    }

    std::fs::write(&config_path, projects::GROVE_YAML_TEMPLATE)?;
    println!("Wrote {}", config_path.display());
    println!("Edit it, commit it to the repository, then re-run: grove start {project} <branch>");
    Ok(())
}

fn cmd_list() -> anyhow::Result<()> {
    let resp = client::call(&Request::new(req::LIST))?;
    if resp.instances.is_empty() {
        println!("No instances. Start one with: grove start <project> <branch>");
        return Ok(());
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    println!("{:<4} {:<18} {:<24} {:<9} {:>6}", "ID", "PROJECT", "BRANCH", "STATE", "AGE");
    for inst in resp.instances {
        let age = if inst.ended_at > 0 {
            client::format_age(inst.ended_at - inst.created_at)
        } else {
            client::format_age(now - inst.created_at)
        };
        println!(
            "{:<4} {:<18} {:<24} {:<9} {:>6}",
            inst.id, inst.project, inst.branch, inst.state, age
        );
    }
    Ok(())
}

fn cmd_logs(instance_id: &str, follow: bool) -> anyhow::Result<()> {
    let kind = if follow { req::LOGS_FOLLOW } else { req::LOGS };
    let mut conn = client::connect()?;
    client::write_request(&mut conn, &Request::for_instance(kind, instance_id))?;
    let resp = client::read_response(&mut conn)?;
    if !resp.ok {
        bail!("{}", resp.error);
    }
    client::stream_to_stdout(&mut conn);
    Ok(())
}

fn cmd_simple(kind: &str, instance_id: &str) -> anyhow::Result<()> {
    client::call(&Request::for_instance(kind, instance_id))?;
    println!("ok");
    Ok(())
}

fn cmd_restart(instance_id: &str, detach: bool, env: &[String]) -> anyhow::Result<()> {
    let mut request = Request::for_instance(req::RESTART, instance_id);
    request.agent_env = parse_env_pairs(env)?;
    client::call(&request)?;
    println!("Restarted instance {instance_id}");
    if !detach {
        attach::run(instance_id)?;
    }
    Ok(())
}

fn cmd_drop(instance_id: &str, force: bool) -> anyhow::Result<()> {
    if !force {
        print!("Permanently remove instance {instance_id}, its worktree, and its branch? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }
    client::call(&Request::for_instance(req::DROP, instance_id))?;
    println!("Dropped instance {instance_id}");
    Ok(())
}

fn cmd_finish(instance_id: &str) -> anyhow::Result<()> {
    let mut conn = client::connect()?;
    client::write_request(&mut conn, &Request::for_instance(req::FINISH, instance_id))?;
    let resp = client::read_response(&mut conn)?;
    if !resp.ok {
        bail!("{}", resp.error);
    }

    println!("Finishing instance {instance_id} (branch {})", resp.branch);
    if !resp.finish_commands.is_empty() {
        client::stream_to_stdout(&mut conn);
    }
    println!("Worktree: {}", resp.worktree_dir);
    Ok(())
}

fn cmd_check(instance_id: &str) -> anyhow::Result<()> {
    let mut conn = client::connect()?;
    client::write_request(&mut conn, &Request::for_instance(req::CHECK, instance_id))?;
    let resp = client::read_response(&mut conn)?;
    if !resp.ok {
        bail!("{}", resp.error);
    }
    client::stream_to_stdout(&mut conn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pair_parsing() {
        let env = parse_env_pairs(&["A=1".into(), "B=x=y".into()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
        assert!(parse_env_pairs(&["NOEQ".into()]).is_err());
    }

    #[test]
    fn cli_parses_core_commands() {
        let cli = Cli::parse_from(["grove", "start", "my-app", "feat/x", "-d", "-e", "K=V"]);
        match cli.command {
            Commands::Start { project, branch, detach, env } => {
                assert_eq!(project, "my-app");
                assert_eq!(branch, "feat/x");
                assert!(detach);
                assert_eq!(env, vec!["K=V".to_string()]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        let cli = Cli::parse_from(["grove", "drop", "1", "-f"]);
        assert!(matches!(cli.command, Commands::Drop { force: true, .. }));

        let cli = Cli::parse_from(["grove", "logs", "1", "-f"]);
        assert!(matches!(cli.command, Commands::Logs { follow: true, .. }));
    }
}
