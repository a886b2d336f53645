//! Shard taxonomy and lifecycle types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datalog::Const;
use crate::vstore::PermissionCapsule;

/// What kind of sub-agent to spawn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardType {
    /// Ephemeral: fresh empty store, dies with the task
    Generalist,
    /// Named persistent specialist; sleeping between tasks, rehydrated
    /// with its read-only knowledge store on spawn
    Specialist(String),
}

impl ShardType {
    /// Parse from a `delegate_task` argument (`/generalist` or a
    /// specialist name).
    pub fn from_const(c: &Const) -> Option<Self> {
        let name = c.as_name()?;
        if name == "generalist" {
            Some(Self::Generalist)
        } else {
            Some(Self::Specialist(name.to_string()))
        }
    }

    /// The `/name` constant for result atoms.
    pub fn to_const(&self) -> Const {
        match self {
            Self::Generalist => Const::name("generalist"),
            Self::Specialist(name) => Const::name(name),
        }
    }

    /// Prompt-template key for this shard type.
    pub fn template_key(&self) -> &str {
        match self {
            Self::Generalist => "generalist",
            Self::Specialist(name) => name,
        }
    }
}

/// Everything needed to spawn one shard.
#[derive(Debug, Clone)]
pub struct ShardSpec {
    /// Generalist or named specialist
    pub shard_type: ShardType,
    /// Task description asserted as the shard's `user_intent`
    pub task: String,
    /// Wall-clock deadline in milliseconds (`None` uses the default)
    pub deadline_ms: Option<u64>,
    /// Requested capsule; must be a subset of the parent's
    pub capsule: PermissionCapsule,
}

impl ShardSpec {
    /// A generalist spec with the default deny-all capsule.
    pub fn generalist(task: impl Into<String>) -> Self {
        Self {
            shard_type: ShardType::Generalist,
            task: task.into(),
            deadline_ms: None,
            capsule: PermissionCapsule::deny_all(),
        }
    }

    /// A specialist spec with the default deny-all capsule.
    pub fn specialist(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            shard_type: ShardType::Specialist(name.into()),
            task: task.into(),
            deadline_ms: None,
            capsule: PermissionCapsule::deny_all(),
        }
    }
}

/// Terminal status of a shard run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    /// `task_complete` derived
    Ok,
    /// Deadline elapsed
    Timeout,
    /// Loop failed (LLM, validation)
    Error,
}

impl ShardStatus {
    /// The `/status` constant for the result atom.
    pub fn to_const(&self) -> Const {
        match self {
            Self::Ok => Const::name("ok"),
            Self::Timeout => Const::name("timeout"),
            Self::Error => Const::name("error"),
        }
    }
}

/// What a completed shard hands back to the parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardOutcome {
    /// Shard identity
    pub shard_id: Uuid,
    /// What was spawned
    pub shard_type: ShardType,
    /// The delegated task
    pub task: String,
    /// Terminal status
    pub status: ShardStatus,
    /// Summary atom content (reason on error/timeout)
    pub summary: String,
}
