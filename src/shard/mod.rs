//! The shard scheduler.
//!
//! Spawns sub-agent kernels under a bounded semaphore, isolates their
//! state, runs each shard's own perceive→evaluate→articulate loop until
//! `task_complete` or deadline, and merges exactly one
//! `delegate_task_result` atom back into the parent. Shard kernels carry
//! no virtual store handle: a shard's only path back into the world is the
//! declared result atom.

pub mod types;

pub use types::{ShardOutcome, ShardSpec, ShardStatus, ShardType};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::articulation::{
    apply_control_packet, parse_response, ParseCaps, PromptAssembler, PromptContext,
};
use crate::datalog::{Const, Fact, Origin, Pattern};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelConfig};
use crate::llm::{CompletionRequest, RetryingClient};
use crate::vstore::PermissionCapsule;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Concurrency cap across all live shards
    pub max_concurrent: usize,
    /// Maximum delegation depth
    pub max_spawn_depth: u32,
    /// Default shard deadline
    pub default_deadline_ms: u64,
    /// Heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Heartbeats older than this trigger forced termination
    pub heartbeat_grace_ms: u64,
    /// Maximum articulation round-trips per shard task
    pub max_loop_iterations: u32,
    /// Baseline schema loaded into every shard kernel
    pub baseline_schema: String,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_spawn_depth: 2,
            default_deadline_ms: 120_000,
            heartbeat_interval_ms: 1_000,
            heartbeat_grace_ms: 5_000,
            max_loop_iterations: 8,
            baseline_schema: String::new(),
        }
    }
}

/// The scheduler: slot semaphore, queue depth, specialist registry.
pub struct ShardScheduler {
    config: ShardConfig,
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    specialists: HashMap<String, String>,
}

impl ShardScheduler {
    /// Create a scheduler.
    pub fn new(config: ShardConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            slots,
            queued: AtomicUsize::new(0),
            specialists: HashMap::new(),
        }
    }

    /// Register a specialist's read-only knowledge store (schema text
    /// loaded into its kernel at spawn).
    pub fn register_specialist(&mut self, name: impl Into<String>, knowledge: impl Into<String>) {
        self.specialists.insert(name.into(), knowledge.into());
    }

    /// Current spawn-queue depth.
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Assert one heartbeat for a shard, retract-then-assert so exactly
    /// one heartbeat per shard ever exists in the parent store.
    pub async fn beat(parent: &Kernel, shard_id: Uuid) -> Result<()> {
        let now_ns = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        parent
            .replace_keyed(
                Fact::new(
                    "shard_heartbeat",
                    vec![Const::name(shard_id.simple().to_string()), Const::Time(now_ns)],
                ),
                1,
                Origin::System,
            )
            .await
    }

    async fn track_queue_depth(&self, parent: &Kernel, depth: usize) {
        let fact = Fact::new("active_shard_queue", vec![Const::Number(depth as i64)]);
        if let Err(e) = parent.replace_keyed(fact, 0, Origin::System).await {
            debug!(error = %e, "queue depth fact not recorded");
        }
    }

    /// Handle a derived `delegate_task(ShardType, TaskDesc, _)`: run the
    /// shard to completion and merge its result into the parent.
    ///
    /// Queuing is implicit: when every slot is taken the call parks on the
    /// semaphore and `active_shard_queue(N)` tracks the depth.
    pub async fn delegate(
        &self,
        parent: &Arc<Kernel>,
        parent_capsule: &PermissionCapsule,
        client: Arc<RetryingClient>,
        spec: ShardSpec,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<ShardOutcome> {
        if depth >= self.config.max_spawn_depth {
            let outcome = ShardOutcome {
                shard_id: Uuid::new_v4(),
                shard_type: spec.shard_type.clone(),
                task: spec.task.clone(),
                status: ShardStatus::Error,
                summary: format!("spawn depth {} exceeds cap", depth),
            };
            self.merge_result(parent, &outcome).await?;
            return Ok(outcome);
        }

        // A shard never widens its capsule past the parent's.
        if !spec.capsule.is_subset_of(parent_capsule) {
            return Err(Error::NotPermitted(
                "shard capsule widens the parent capsule".to_string(),
            ));
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        self.track_queue_depth(parent, self.queue_depth()).await;
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("shard semaphore closed".to_string()))?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.track_queue_depth(parent, self.queue_depth()).await;

        let shard_id = Uuid::new_v4();
        let shard_cancel = cancel.child_token();
        info!(%shard_id, task = %spec.task, "shard spawned");

        let outcome = self
            .run_shard(parent, client, &spec, shard_id, &shard_cancel)
            .await;
        drop(permit);

        // One heartbeat per shard; none after termination.
        let pattern: Pattern = vec![Some(Const::name(shard_id.simple().to_string())), None];
        parent.retract("shard_heartbeat", &pattern).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => ShardOutcome {
                shard_id,
                shard_type: spec.shard_type.clone(),
                task: spec.task.clone(),
                status: ShardStatus::Error,
                summary: e.to_string(),
            },
        };
        self.merge_result(parent, &outcome).await?;
        info!(%shard_id, status = ?outcome.status, "shard merged");
        Ok(outcome)
    }

    async fn run_shard(
        &self,
        parent: &Arc<Kernel>,
        client: Arc<RetryingClient>,
        spec: &ShardSpec,
        shard_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ShardOutcome> {
        // Own kernel, baseline schema only; specialists mount their
        // knowledge store on top in the same load.
        let kernel = Arc::new(Kernel::new(KernelConfig::default()));
        let schema_text = match &spec.shard_type {
            ShardType::Specialist(name) => match self.specialists.get(name) {
                Some(knowledge) => format!("{}\n{}", self.config.baseline_schema, knowledge),
                None => self.config.baseline_schema.clone(),
            },
            ShardType::Generalist => self.config.baseline_schema.clone(),
        };
        kernel.load_schema(&schema_text).await?;

        kernel
            .assert_with_origin(
                Fact::new(
                    "user_intent",
                    vec![
                        Const::name("t0"),
                        Const::name("delegated"),
                        Const::name("exec"),
                        Const::string(spec.task.clone()),
                        Const::string(""),
                    ],
                ),
                Origin::User { turn: 0 },
            )
            .await?;

        // Heartbeat until the loop resolves.
        let heartbeat = {
            let parent = parent.clone();
            let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = Self::beat(&parent, shard_id).await {
                        warn!(error = %e, "heartbeat assert failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            })
        };

        // Watchdog: a heartbeat stale past the grace window forces
        // termination through the same cancellation token.
        let watchdog = {
            let parent = parent.clone();
            let cancel = cancel.clone();
            let grace = Duration::from_millis(self.config.heartbeat_grace_ms.max(1));
            tokio::spawn(async move {
                let pattern: Pattern =
                    vec![Some(Const::name(shard_id.simple().to_string())), None];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(grace / 2) => {}
                    }
                    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
                    let stale = match parent.query("shard_heartbeat", &pattern).await {
                        Ok(beats) => beats
                            .first()
                            .and_then(|f| f.args.get(1))
                            .and_then(|c| match c {
                                Const::Time(ns) => Some(*ns),
                                _ => None,
                            })
                            .map_or(true, |ns| {
                                now_ns.saturating_sub(ns) > grace.as_nanos() as i64
                            }),
                        Err(_) => false,
                    };
                    if stale {
                        warn!(%shard_id, "heartbeat stale past grace window, forcing termination");
                        cancel.cancel();
                        break;
                    }
                }
            })
        };

        let deadline =
            Duration::from_millis(spec.deadline_ms.unwrap_or(self.config.default_deadline_ms));
        let loop_result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Internal("shard cancelled".to_string())),
            r = tokio::time::timeout(
                deadline,
                self.shard_loop(&kernel, &client, spec, shard_id, cancel),
            ) => match r {
                Ok(inner) => inner,
                Err(_) => Ok(None),
            },
        };
        cancel.cancel();
        let _ = heartbeat.await;
        let _ = watchdog.await;

        let outcome = match loop_result {
            Ok(Some(summary)) => ShardOutcome {
                shard_id,
                shard_type: spec.shard_type.clone(),
                task: spec.task.clone(),
                status: ShardStatus::Ok,
                summary,
            },
            Ok(None) => ShardOutcome {
                shard_id,
                shard_type: spec.shard_type.clone(),
                task: spec.task.clone(),
                status: ShardStatus::Timeout,
                summary: format!(
                    "no task_complete within {}ms / {} iterations",
                    deadline.as_millis(),
                    self.config.max_loop_iterations
                ),
            },
            Err(e) => ShardOutcome {
                shard_id,
                shard_type: spec.shard_type.clone(),
                task: spec.task.clone(),
                status: ShardStatus::Error,
                summary: e.to_string(),
            },
        };
        Ok(outcome)
    }

    /// The shard's own OODA loop. Returns the summary when
    /// `task_complete(Summary)` derives, `None` when iterations run out.
    async fn shard_loop(
        &self,
        kernel: &Arc<Kernel>,
        client: &Arc<RetryingClient>,
        spec: &ShardSpec,
        shard_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let assembler = PromptAssembler::new();
        let caps = ParseCaps::default();

        for iteration in 0..self.config.max_loop_iterations {
            kernel.evaluate().await?;

            let complete = kernel.query("task_complete", &vec![]).await?;
            if let Some(fact) = complete.first() {
                let summary = fact
                    .args
                    .first()
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                return Ok(Some(summary));
            }

            let ctx = PromptContext {
                shard_id: shard_id.simple().to_string(),
                shard_type: spec.shard_type.template_key().to_string(),
                session_context: Vec::new(),
                user_intent: Some(spec.task.clone()),
            };
            let prompt = assembler.assemble(kernel, &ctx).await?;
            let raw = client
                .complete(CompletionRequest::new(prompt), cancel)
                .await?;
            let parsed = parse_response(&raw, &caps);
            let stats = apply_control_packet(
                kernel,
                &parsed.envelope.control_packet,
                &parsed.report,
                iteration as u64,
            )
            .await;
            debug!(
                %shard_id,
                iteration,
                applied = stats.applied,
                dropped = stats.dropped,
                "shard articulation applied"
            );
        }
        Ok(None)
    }

    /// Exactly one result atom per delegation.
    async fn merge_result(&self, parent: &Kernel, outcome: &ShardOutcome) -> Result<()> {
        parent
            .assert_with_origin(
                Fact::new(
                    "delegate_task_result",
                    vec![
                        outcome.shard_type.to_const(),
                        Const::string(outcome.task.clone()),
                        outcome.status.to_const(),
                        Const::string(outcome.summary.clone()),
                    ],
                ),
                Origin::Shard {
                    id: outcome.shard_id.simple().to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmConfig, ScriptedClient};

    const PARENT_SCHEMA: &str = "\
        Decl delegate_task_result(S.Type<name>, T.Type<string>, R.Type<name>, M.Type<string>).\n\
        Decl shard_heartbeat(S.Type<name>, T.Type<time>).\n\
        Decl active_shard_queue(N.Type<number>).";

    const SHARD_SCHEMA: &str = "\
        Decl user_intent(I.Type<name>, C.Type<name>, V.Type<name>, T.Type<string>, K.Type<string>).\n\
        Decl task_complete(S.Type<string>).\n\
        Decl shard_prompt_base(S.Type<name>, T.Type<string>).\n\
        Decl injectable_context(S.Type<name>, A.Type<string>).\n\
        Decl note(S.Type<string>).";

    fn scheduler() -> ShardScheduler {
        ShardScheduler::new(ShardConfig {
            baseline_schema: SHARD_SCHEMA.to_string(),
            heartbeat_interval_ms: 20,
            ..ShardConfig::default()
        })
    }

    async fn parent_kernel() -> Arc<Kernel> {
        let kernel = Arc::new(Kernel::new(KernelConfig::default()));
        kernel.load_schema(PARENT_SCHEMA).await.unwrap();
        kernel
    }

    fn completing_client() -> Arc<RetryingClient> {
        // One articulation round that asserts task_complete.
        let raw = r#"{"control_packet": {"mangle_updates": ["task_complete(\"looked into it\")."]}, "surface_response": "done"}"#;
        Arc::new(RetryingClient::new(
            Arc::new(ScriptedClient::always(raw)),
            LlmConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_delegate_merges_single_result() {
        let parent = parent_kernel().await;
        let scheduler = scheduler();
        let outcome = scheduler
            .delegate(
                &parent,
                &PermissionCapsule::deny_all(),
                completing_client(),
                ShardSpec::generalist("investigate flaky test"),
                0,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, ShardStatus::Ok);
        assert_eq!(outcome.summary, "looked into it");

        let results = parent.query("delegate_task_result", &vec![]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].args[2], Const::name("ok"));

        // No orphaned heartbeat after completion.
        let beats = parent.query("shard_heartbeat", &vec![]).await.unwrap();
        assert!(beats.is_empty());
    }

    #[tokio::test]
    async fn test_shard_isolation_before_completion() {
        // A shard's internal asserts never appear in the parent store.
        let parent = parent_kernel().await;
        let scheduler = scheduler();
        let raw = r#"{"control_packet": {"mangle_updates": ["note(\"internal only\")." , "task_complete(\"ok\")."]}, "surface_response": "done"}"#;
        let client = Arc::new(RetryingClient::new(
            Arc::new(ScriptedClient::always(raw)),
            LlmConfig::default(),
        ));
        scheduler
            .delegate(
                &parent,
                &PermissionCapsule::deny_all(),
                client,
                ShardSpec::generalist("t"),
                0,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // `note` never existed in the parent, and only the declared result
        // atom crossed the boundary.
        assert!(parent.query("note", &vec![]).await.is_err());
        assert_eq!(
            parent
                .query("delegate_task_result", &vec![])
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout_result() {
        let parent = parent_kernel().await;
        let scheduler = scheduler();
        // The client never asserts task_complete and stalls on a slow
        // response via retry of a transient error.
        let client = Arc::new(RetryingClient::new(
            Arc::new(ScriptedClient::always(
                r#"{"control_packet": {}, "surface_response": "thinking"}"#,
            )),
            LlmConfig::default(),
        ));
        let spec = ShardSpec {
            deadline_ms: Some(50),
            ..ShardSpec::generalist("never finishes")
        };
        let outcome = scheduler
            .delegate(
                &parent,
                &PermissionCapsule::deny_all(),
                client,
                spec,
                0,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ShardStatus::Timeout);
        let results = parent.query("delegate_task_result", &vec![]).await.unwrap();
        assert_eq!(results[0].args[2], Const::name("timeout"));
    }

    #[tokio::test]
    async fn test_depth_cap_rejects_descendants() {
        let parent = parent_kernel().await;
        let scheduler = scheduler();
        let outcome = scheduler
            .delegate(
                &parent,
                &PermissionCapsule::deny_all(),
                completing_client(),
                ShardSpec::generalist("too deep"),
                10,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ShardStatus::Error);
    }

    #[tokio::test]
    async fn test_capsule_widening_rejected() {
        let parent = parent_kernel().await;
        let scheduler = scheduler();
        let spec = ShardSpec {
            capsule: PermissionCapsule::deny_all().allow_net("example.com"),
            ..ShardSpec::generalist("wants network")
        };
        let err = scheduler
            .delegate(
                &parent,
                &PermissionCapsule::deny_all(),
                completing_client(),
                spec,
                0,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[tokio::test]
    async fn test_concurrent_heartbeats_leave_one_each() {
        let parent = parent_kernel().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut tasks = Vec::new();
        for id in [a, b] {
            let parent = parent.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    ShardScheduler::beat(&parent, id).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let beats = parent.query("shard_heartbeat", &vec![]).await.unwrap();
        assert_eq!(beats.len(), 2);
        let ids: Vec<_> = beats.iter().map(|f| f.args[0].clone()).collect();
        assert!(ids.contains(&Const::name(a.simple().to_string())));
        assert!(ids.contains(&Const::name(b.simple().to_string())));
    }
}
