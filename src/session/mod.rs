//! Sessions and the per-turn loop.
//!
//! A session owns the root kernel and drives each turn through perceive →
//! evaluate → dispatch → articulate → compress. The kernel decides what
//! happens (derived `next_action` and `delegate_task` atoms); the session
//! routes those decisions into the virtual fact store and the shard
//! scheduler, then records the turn's logical residue.

pub mod persist;
pub mod snapshot;

pub use persist::{SessionStore, SCHEMA_VERSION};
pub use snapshot::{HotFact, SessionSnapshot};

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::articulation::{
    apply_control_packet, parse_response, ParseCaps, ParseMethod, PromptAssembler, PromptContext,
};
use crate::context::{
    score_facts, select_within_budget, ActivationConfig, ActivationContext, CompressedTurn,
    CompressorConfig, ContextCompressor, ScoredFact,
};
use crate::datalog::{Const, EvalStats, Fact, Origin};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelConfig};
use crate::llm::{CompletionClient, CompletionRequest, LlmConfig, RetryingClient};
use crate::perception::{Clarification, PerceptionConfig, PerceptionTransducer};
use crate::shard::{ShardConfig, ShardScheduler, ShardSpec, ShardType};
use crate::vstore::{ActionRequest, PermissionCapsule, VirtualFactStore};

/// Declarations every kernel carries: the kernel's own working predicates
/// plus the built-in virtual predicates. Policy rules (who may derive
/// `permitted`) come from the host's trusted boot schema on top of this.
pub const BASELINE_SCHEMA: &str = "\
# kernel working predicates
Decl user_intent(I.Type<name>, C.Type<name>, V.Type<name>, T.Type<string>, K.Type<string>).
Decl focus_resolution(R.Type<string>, P.Type<string>, S.Type<string>, C.Type<float>).
Decl clarification_needed(R.Type<string>, H.Type<string>).
Decl next_action(V.Type<name>, T.Type<string>, A.Type<string>).
Decl execution_result(I.Type<name>, V.Type<name>, S.Type<name>, P.Type<string>).
Decl delegate_task(S.Type<name>, T.Type<string>, P.Type<string>).
Decl delegate_task_result(S.Type<name>, T.Type<string>, R.Type<name>, M.Type<string>).
Decl shard_heartbeat(S.Type<name>, T.Type<time>).
Decl active_shard_queue(N.Type<number>).
Decl task_complete(S.Type<string>).
Decl shard_prompt_base(S.Type<name>, T.Type<string>).
Decl injectable_context(S.Type<name>, A.Type<string>).
Decl constitution_violation(T.Type<number>, H.Type<string>).
# policy predicates (rules only from trusted boot schemas)
Decl permitted(A.Type<name>).
Decl safe_action(A.Type<name>).
Decl admin_override(A.Type<name>).
Decl pending_action(V.Type<name>, T.Type<string>).
# built-in virtual predicates
Decl file_content(P.Type<string>, C.Type<string>).
Decl write_file(P.Type<string>, C.Type<string>, S.Type<name>).
Decl exec_cmd(C.Type<string>, A.Type<string>, O.Type<string>, E.Type<number>).
Decl git_log(R.Type<string>, H.Type<string>, S.Type<string>).
Decl git_commit(R.Type<string>, M.Type<string>, S.Type<name>).
Decl http_request(U.Type<string>, B.Type<string>, S.Type<number>).
Decl mcp_query(T.Type<name>, A.Type<string>, R.Type<string>).
Decl diagnostic(P.Type<string>, S.Type<name>, M.Type<string>).
";

/// Session-wide configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Kernel knobs
    pub kernel: KernelConfig,
    /// Perception knobs
    pub perception: PerceptionConfig,
    /// Compressor knobs
    pub compressor: CompressorConfig,
    /// Activation scoring knobs
    pub activation: ActivationConfig,
    /// Shard scheduler knobs
    pub shards: ShardConfig,
    /// Envelope parse caps
    pub caps: ParseCaps,
    /// LLM wrapper knobs
    pub llm: LlmConfig,
    /// Hot facts persisted per snapshot
    pub hot_fact_limit: usize,
    /// Trusted host schema appended to the baseline
    pub boot_schema: String,
    /// The root kernel's permission capsule
    pub root_capsule: PermissionCapsule,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            perception: PerceptionConfig::default(),
            compressor: CompressorConfig::default(),
            activation: ActivationConfig::default(),
            shards: ShardConfig::default(),
            caps: ParseCaps::default(),
            llm: LlmConfig::default(),
            hot_fact_limit: 64,
            boot_schema: String::new(),
            root_capsule: PermissionCapsule::deny_all(),
        }
    }
}

/// What one turn produced.
#[derive(Debug, Clone)]
pub struct TurnReport {
    /// Turn number
    pub turn: u64,
    /// The user-facing channel; always populated
    pub surface_response: String,
    /// Evaluation stats for the turn's main fixpoint
    pub eval: EvalStats,
    /// Actions dispatched to the virtual fact store
    pub actions_dispatched: usize,
    /// Shards delegated and merged
    pub shards_completed: usize,
    /// Set when perception gated on ambiguity
    pub clarification: Option<Clarification>,
    /// How articulation parsed the LLM output
    pub parse_method: Option<ParseMethod>,
}

/// A session: root kernel, transducer, compressor, scheduler, LLM handle.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    kernel: Arc<Kernel>,
    vstore: Arc<VirtualFactStore>,
    client: Arc<RetryingClient>,
    transducer: PerceptionTransducer,
    assembler: PromptAssembler,
    compressor: ContextCompressor,
    scheduler: ShardScheduler,
    turn: u64,
    dispatched: HashSet<Fact>,
}

impl Session {
    /// Create a fresh session.
    pub async fn new(
        config: SessionConfig,
        completion: Arc<dyn CompletionClient>,
        vstore: Arc<VirtualFactStore>,
    ) -> Result<Self> {
        let client = Arc::new(RetryingClient::new(completion, config.llm.clone()));
        let kernel = Arc::new(Kernel::with_virtual_store(
            config.kernel.clone(),
            vstore.clone(),
        ));
        kernel.set_auto_evaluate(false);
        let schema_text = format!("{}\n{}", BASELINE_SCHEMA, config.boot_schema);
        kernel.load_schema(&schema_text).await?;

        let mut shard_config = config.shards.clone();
        if shard_config.baseline_schema.is_empty() {
            shard_config.baseline_schema = BASELINE_SCHEMA.to_string();
        }

        Ok(Self {
            id: Uuid::new_v4(),
            transducer: PerceptionTransducer::new(config.perception.clone(), client.clone()),
            assembler: PromptAssembler::new(),
            compressor: ContextCompressor::new(config.compressor.clone()),
            scheduler: ShardScheduler::new(shard_config),
            client,
            kernel,
            vstore,
            turn: 0,
            dispatched: HashSet::new(),
            config,
        })
    }

    /// Session identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The root kernel.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Turn counter.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Register a specialist's knowledge store with the scheduler.
    pub fn register_specialist(&mut self, name: impl Into<String>, knowledge: impl Into<String>) {
        self.scheduler.register_specialist(name, knowledge);
    }

    /// Run one full turn against user input.
    pub async fn run_turn(&mut self, input: &str, cancel: &CancellationToken) -> Result<TurnReport> {
        self.turn += 1;
        let turn = self.turn;
        info!(turn, "turn started");

        // Perceive.
        let perceived = self.transducer.transduce(input, turn, cancel).await?;
        if !perceived.atoms.is_empty() {
            self.kernel
                .assert_batch(perceived.atoms.clone(), Origin::User { turn })
                .await?;
        }

        if let Some(clarification) = perceived.clarification {
            // Ambiguity never reaches dispatch: evaluate for bookkeeping
            // and surface the question.
            let eval = self.kernel.evaluate().await.unwrap_or_default();
            let surface = format!(
                "Ambiguous target — did you mean one of: {}?",
                clarification.hypotheses.join(", ")
            );
            self.record_turn(&perceived.atoms, &[], &[]).await;
            return Ok(TurnReport {
                turn,
                surface_response: surface,
                eval,
                actions_dispatched: 0,
                shards_completed: 0,
                clarification: Some(clarification),
                parse_method: None,
            });
        }

        // Evaluate.
        let eval = match self.kernel.evaluate().await {
            Ok(stats) => stats,
            Err(e) => {
                return self.failed_turn(turn, &perceived.atoms, e).await;
            }
        };

        // Dispatch derived actions, in parallel within the turn.
        let (actions_dispatched, result_facts) = self.dispatch_actions(turn, cancel).await?;
        if !result_facts.is_empty() {
            self.kernel
                .assert_batch(result_facts.clone(), Origin::Tool { turn })
                .await?;
            self.kernel.evaluate().await?;
        }

        // Delegate derived shard tasks.
        let shards_completed = self.dispatch_shards(cancel).await?;
        if shards_completed > 0 {
            self.kernel.evaluate().await?;
        }

        // Articulate.
        let (surface, parse_method, control_updates) =
            self.articulate(turn, cancel).await;

        // Compress, prune, advance.
        self.record_turn(&perceived.atoms, &result_facts, &control_updates)
            .await;
        self.kernel.sweep_expired().await;
        self.kernel.bump_generation().await;

        Ok(TurnReport {
            turn,
            surface_response: surface,
            eval,
            actions_dispatched,
            shards_completed,
            clarification: None,
            parse_method: Some(parse_method),
        })
    }

    async fn failed_turn(
        &mut self,
        turn: u64,
        atoms: &[Fact],
        error: Error,
    ) -> Result<TurnReport> {
        warn!(turn, error = %error, "turn evaluation failed");
        let result = Fact::new(
            "execution_result",
            vec![
                Const::name(format!("t{}_eval", turn)),
                Const::name("evaluate"),
                Const::name("error"),
                Const::string(error.to_string()),
            ],
        );
        if let Err(e) = self
            .kernel
            .assert_with_origin(result, Origin::Tool { turn })
            .await
        {
            warn!(error = %e, "could not record evaluation failure");
        }
        self.record_turn(atoms, &[], &[]).await;
        let surface = match &error {
            Error::GasExceeded { limit, .. } => format!(
                "Evaluation stopped: the derived-fact limit of {} was reached. \
                 Narrow the request or raise the gas limit.",
                limit
            ),
            other => format!("This turn failed during evaluation: {}", other),
        };
        Ok(TurnReport {
            turn,
            surface_response: surface,
            eval: EvalStats::default(),
            actions_dispatched: 0,
            shards_completed: 0,
            clarification: None,
            parse_method: None,
        })
    }

    /// Consume derived `next_action` atoms exactly once each and run them
    /// through the gate.
    async fn dispatch_actions(
        &mut self,
        turn: u64,
        cancel: &CancellationToken,
    ) -> Result<(usize, Vec<Fact>)> {
        let derived = self.kernel.query("next_action", &vec![]).await?;
        let fresh: Vec<Fact> = derived
            .into_iter()
            .filter(|f| !self.dispatched.contains(f))
            .collect();
        if fresh.is_empty() {
            return Ok((0, Vec::new()));
        }

        let mut requests = Vec::new();
        for (i, fact) in fresh.iter().enumerate() {
            let Some(verb) = fact.args.first().and_then(|c| c.as_name()) else {
                warn!(fact = %fact, "next_action without a verb name, skipped");
                continue;
            };
            let target = fact.args.get(1).and_then(|c| c.as_str()).unwrap_or_default();
            let extra = fact.args.get(2).and_then(|c| c.as_str()).unwrap_or_default();
            let mut args = vec![Const::string(target)];
            if !extra.is_empty() {
                args.push(Const::string(extra));
            }
            requests.push((
                fact.clone(),
                ActionRequest {
                    id: format!("a{}_{}", turn, i),
                    verb: verb.to_string(),
                    args,
                },
            ));
        }

        let outcomes = join_all(requests.iter().map(|(_, request)| {
            let vstore = self.vstore.clone();
            let kernel = self.kernel.clone();
            async move { vstore.execute_action(request, &*kernel, cancel).await }
        }))
        .await;

        let mut result_facts = Vec::new();
        for ((fact, request), outcome) in requests.iter().zip(outcomes) {
            self.dispatched.insert(fact.clone());
            let payload = outcome
                .detail
                .clone()
                .or_else(|| {
                    outcome
                        .tuples
                        .first()
                        .map(|t| {
                            t.iter()
                                .map(|c| c.to_string())
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                })
                .unwrap_or_default();
            result_facts.push(Fact::new(
                "execution_result",
                vec![
                    Const::name(request.id.clone()),
                    Const::name(request.verb.clone()),
                    outcome.status.clone(),
                    Const::string(payload),
                ],
            ));
        }
        Ok((requests.len(), result_facts))
    }

    /// Consume derived `delegate_task` atoms exactly once each.
    async fn dispatch_shards(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let derived = self.kernel.query("delegate_task", &vec![]).await?;
        let fresh: Vec<Fact> = derived
            .into_iter()
            .filter(|f| !self.dispatched.contains(f))
            .collect();

        let mut completed = 0;
        for fact in fresh {
            self.dispatched.insert(fact.clone());
            let Some(shard_type) = fact.args.first().and_then(ShardType::from_const) else {
                warn!(fact = %fact, "delegate_task without a shard type, skipped");
                continue;
            };
            let task = fact.args.get(1).and_then(|c| c.as_str()).unwrap_or_default();
            let spec = ShardSpec {
                shard_type,
                task: task.to_string(),
                deadline_ms: None,
                capsule: self.config.root_capsule.narrowed_for_shard(),
            };
            self.scheduler
                .delegate(
                    &self.kernel,
                    &self.config.root_capsule,
                    self.client.clone(),
                    spec,
                    0,
                    cancel,
                )
                .await?;
            completed += 1;
        }
        Ok(completed)
    }

    /// The turn's LLM call plus control-packet application. The surface
    /// channel is always populated, including on failure.
    async fn articulate(
        &mut self,
        turn: u64,
        cancel: &CancellationToken,
    ) -> (String, ParseMethod, Vec<String>) {
        let pattern = vec![Some(Const::name(format!("t{}", turn))), None, None, None, None];
        let intent = self
            .kernel
            .query("user_intent", &pattern)
            .await
            .ok()
            .and_then(|facts| facts.first().map(|f| f.to_string()));

        let ctx = PromptContext {
            shard_id: "root".to_string(),
            shard_type: "root".to_string(),
            session_context: self.compressor.context_lines(),
            user_intent: intent,
        };
        let prompt = match self.assembler.assemble(&self.kernel, &ctx).await {
            Ok(prompt) => prompt,
            Err(e) => {
                return (
                    format!("This turn failed while assembling the prompt: {}", e),
                    ParseMethod::Fallback,
                    Vec::new(),
                )
            }
        };

        let raw = match self
            .client
            .complete(CompletionRequest::new(prompt), cancel)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                return (
                    format!("The language model call failed ({}); no actions were taken on its behalf.", e),
                    ParseMethod::Fallback,
                    Vec::new(),
                )
            }
        };

        let parsed = parse_response(&raw, &self.config.caps);
        let stats = apply_control_packet(
            &self.kernel,
            &parsed.envelope.control_packet,
            &parsed.report,
            turn,
        )
        .await;
        if stats.applied > 0 {
            if let Err(e) = self.kernel.evaluate().await {
                warn!(error = %e, "post-control evaluation failed");
            }
        }
        (
            parsed.envelope.surface_response,
            parsed.method,
            parsed.envelope.control_packet.mangle_updates,
        )
    }

    /// Build and record the turn's compressed residue, then maybe fold the
    /// overflow into the rolling summary.
    async fn record_turn(&mut self, atoms: &[Fact], results: &[Fact], updates: &[String]) {
        let mut record = CompressedTurn::new(self.turn);
        for atom in atoms {
            match atom.predicate.as_str() {
                "user_intent" => record.intent = Some(atom.clone()),
                "focus_resolution" => record.focus.push(atom.clone()),
                _ => {}
            }
        }
        record.results = results.to_vec();
        record.control_updates = updates.to_vec();
        self.compressor.record_turn(record);

        if self.compressor.needs_compression() {
            let scored = self.scored_edb().await;
            if let Err(e) = self
                .compressor
                .maybe_compress(Some(self.client.as_ref()), &scored, &CancellationToken::new())
                .await
            {
                warn!(error = %e, "context compression failed");
            }
        }
    }

    async fn scored_edb(&self) -> Vec<ScoredFact> {
        let facts = self.kernel.edb_snapshot().await;
        let ctx = self.activation_context(&facts);
        let scored = score_facts(&facts, &self.config.activation, &ctx);
        select_within_budget(
            scored,
            self.config.activation.threshold,
            self.config.compressor.token_budget,
        )
    }

    fn activation_context(&self, facts: &[(Fact, crate::datalog::FactMeta)]) -> ActivationContext {
        let mut ctx = ActivationContext {
            current_turn: self.turn,
            ..ActivationContext::default()
        };
        for (fact, _) in facts {
            match fact.predicate.as_str() {
                "user_intent" => {
                    if let Some(Const::Name(v)) = fact.args.get(2) {
                        ctx.verb = Some(v.clone());
                    }
                    if let Some(Const::Str(t)) = fact.args.get(3) {
                        if !t.is_empty() {
                            ctx.intent_target = Some(t.clone());
                        }
                    }
                }
                "focus_resolution" => {
                    if let Some(Const::Str(p)) = fact.args.get(1) {
                        ctx.focused.push(p.clone());
                    }
                }
                _ => {}
            }
        }
        ctx
    }

    /// Snapshot the session for persistence.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let mut hot = self.scored_edb().await;
        hot.truncate(self.config.hot_fact_limit.max(1));
        let metas = self.kernel.edb_snapshot().await;
        let hot_facts = hot
            .into_iter()
            .map(|s| {
                let origin = metas
                    .iter()
                    .find(|(f, _)| *f == s.fact)
                    .map(|(_, m)| m.origin.clone())
                    .unwrap_or(Origin::System);
                HotFact {
                    fact: s.fact,
                    origin,
                    score: s.score,
                }
            })
            .collect();
        SessionSnapshot {
            session_id: self.id.to_string(),
            turn_number: self.turn,
            rolling_summary: self.compressor.summary().clone(),
            recent_turns: self.compressor.window().cloned().collect(),
            hot_facts,
        }
    }

    /// Rehydrate a session from a snapshot: validates structurally, then
    /// re-asserts hot facts with their original origins.
    pub async fn restore(
        config: SessionConfig,
        completion: Arc<dyn CompletionClient>,
        vstore: Arc<VirtualFactStore>,
        snapshot: SessionSnapshot,
    ) -> Result<Self> {
        snapshot.validate()?;
        let mut session = Self::new(config, completion, vstore).await?;
        session.id = Uuid::parse_str(&snapshot.session_id)
            .map_err(|e| Error::SessionStorage(format!("bad session id: {}", e)))?;
        session.turn = snapshot.turn_number;
        for hot in &snapshot.hot_facts {
            session
                .kernel
                .assert_with_origin(hot.fact.clone(), hot.origin.clone())
                .await?;
        }
        session.kernel.evaluate().await?;
        session
            .compressor
            .restore(snapshot.rolling_summary, snapshot.recent_turns);
        Ok(session)
    }
}
