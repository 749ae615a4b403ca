//! IPC message types and attach-stream framing used between the grove CLI
//! and groved (the daemon) over a Unix domain socket.
//!
//! Normal commands use newline-delimited JSON: the client sends one
//! [`Request`], the daemon sends one [`Response`], then the connection
//! closes. The attach command is special: after the JSON handshake the
//! connection enters a streaming mode where the server sends raw PTY output
//! and the client sends framed control messages (see [`frame`]).

mod frame;

pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_LEN};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Request type strings recognised by the daemon.
pub mod req {
    pub const PING: &str = "ping";
    pub const START: &str = "start";
    pub const LIST: &str = "list";
    pub const ATTACH: &str = "attach";
    pub const LOGS: &str = "logs";
    pub const LOGS_FOLLOW: &str = "logs_follow";
    pub const STOP: &str = "stop";
    pub const RESTART: &str = "restart";
    pub const DROP: &str = "drop";
    pub const FINISH: &str = "finish";
    pub const CHECK: &str = "check";
}

/// Lifecycle state of an instance.
///
/// Wire spelling is the upper-case name (`"RUNNING"` etc.) so persisted
/// snapshots and `list` output stay human-readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Running,
    Waiting,
    Attached,
    Checking,
    Exited,
    Crashed,
    Killed,
    Finished,
}

impl InstanceState {
    /// Terminal states never transition away implicitly.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Exited
                | InstanceState::Crashed
                | InstanceState::Killed
                | InstanceState::Finished
        )
    }

    /// Live states have an agent process behind them.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Running => "RUNNING",
            InstanceState::Waiting => "WAITING",
            InstanceState::Attached => "ATTACHED",
            InstanceState::Checking => "CHECKING",
            InstanceState::Exited => "EXITED",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Killed => "KILLED",
            InstanceState::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON payload sent from the CLI to the daemon.
///
/// All fields except `type` are optional; unknown fields are ignored so old
/// daemons tolerate newer clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    /// Extra environment for the agent process; overrides the daemon's
    /// env file key-by-key.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub agent_env: HashMap<String, String>,
}

impl Request {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    pub fn for_instance(kind: &str, instance_id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            instance_id: instance_id.to_string(),
            ..Self::default()
        }
    }
}

/// A point-in-time snapshot of an instance's public metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub project: String,
    pub state: String,
    pub branch: String,
    pub worktree_dir: String,
    /// Unix timestamp of instance creation.
    pub created_at: i64,
    /// Unix timestamp of process exit; 0 while the agent is live.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ended_at: i64,
    pub pid: i32,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// The JSON payload returned by the daemon for all non-streaming replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceInfo>,

    // Fields used by the finish response.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worktree_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finish_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,

    /// Set when the project's repo has no grove.yaml: the path of the main
    /// checkout where a scaffold could be written. The client interprets
    /// this as permission to offer creating one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub init_path: String,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: message.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip_with_agent_env() {
        let mut req = Request::new(req::START);
        req.project = "my-app".into();
        req.branch = "feat/x".into();
        req.agent_env
            .insert("ANTHROPIC_API_KEY".into(), "sk-test".into());

        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "start");
        assert_eq!(back.project, "my-app");
        assert_eq!(back.agent_env["ANTHROPIC_API_KEY"], "sk-test");
    }

    #[test]
    fn request_unknown_fields_ignored() {
        let req: Request =
            serde_json::from_str(r#"{"type":"ping","future_field":42}"#).unwrap();
        assert_eq!(req.kind, "ping");
        assert!(req.project.is_empty());
        assert!(req.agent_env.is_empty());
    }

    #[test]
    fn response_omits_empty_fields() {
        let json = serde_json::to_string(&Response::ok()).unwrap();
        assert_eq!(json, r#"{"ok":true}"#);

        let json = serde_json::to_string(&Response::error("nope")).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"nope"}"#);
    }

    #[test]
    fn instance_info_ended_at_zero_omitted() {
        let info = InstanceInfo {
            id: "1".into(),
            project: "my-app".into(),
            state: InstanceState::Running.as_str().into(),
            branch: "main".into(),
            worktree_dir: "/tmp/wt".into(),
            created_at: 1_700_000_000,
            ended_at: 0,
            pid: 42,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("ended_at"));

        let back: InstanceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ended_at, 0);
    }

    #[test]
    fn state_wire_spelling() {
        let json = serde_json::to_string(&InstanceState::Running).unwrap();
        assert_eq!(json, r#""RUNNING""#);
        let back: InstanceState = serde_json::from_str(r#""FINISHED""#).unwrap();
        assert_eq!(back, InstanceState::Finished);
    }

    #[test]
    fn terminal_and_live_partition() {
        let live = [
            InstanceState::Running,
            InstanceState::Waiting,
            InstanceState::Attached,
            InstanceState::Checking,
        ];
        let terminal = [
            InstanceState::Exited,
            InstanceState::Crashed,
            InstanceState::Killed,
            InstanceState::Finished,
        ];
        for s in live {
            assert!(s.is_live() && !s.is_terminal(), "{s} should be live");
        }
        for s in terminal {
            assert!(s.is_terminal() && !s.is_live(), "{s} should be terminal");
        }
    }
}
