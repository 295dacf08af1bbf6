//! Agent command orchestration.
//!
//! An agent command is a stream of tool operations executed strictly in
//! order, soft-committed as it goes: every write is tagged
//! `{isAIGenerated: true, isAIPending: true, aiCommandId}` so all clients see
//! the work in progress. The command then ends one of two ways:
//!
//! - **confirm**: one batch clears `isAIPending` on every object tagged with
//!   the command. Confirming again finds nothing pending and is a no-op.
//! - **rollback**: one batch deletes every still-pending object the command
//!   created and restores pre-existing objects it updated or deleted to their
//!   pre-command values. Objects confirmed under earlier commands are never
//!   touched.
//!
//! Any failure rolls back: a collaborator error, a failed tool step, a
//! `Failed` stream item, a stream that ends without `Completed`, or the
//! caller's cancellation token. The outcome log of the steps that ran is
//! returned either way.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use pinwall_types::{BoardId, BoardObject, CommandId, ObjectId, ObjectKind, ObjectPatch, UserId};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BatchWrite, DocumentStore, ToolRequest, ToolService, ToolStreamItem};
use crate::config::SyncConfig;
use crate::constants::ARRANGE_GAP;
use crate::error::SyncError;
use crate::mutations::DeletePlan;
use crate::store::{ObjectStore, OpSource};
use crate::tools::{
    ArrangeSpec, ClampReport, CreateSpec, ToolCall, UpdateSpec, arrange_grid, clamp_geometry,
};

/// Objects listed in a board-state summary.
const STATE_OBJECT_LIMIT: usize = 200;
/// Text preview length in a board-state summary.
const STATE_TEXT_PREVIEW: usize = 80;

/// What one executed step did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub step: usize,
    pub op: &'static str,
    pub object_ids: Vec<ObjectId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clamps: Vec<ClampReport>,
    /// Board summary returned by `query_state`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
}

impl OperationOutcome {
    fn new(step: usize, op: &'static str, object_ids: Vec<ObjectId>) -> Self {
        Self { step, op, object_ids, clamps: Vec::new(), state: None }
    }
}

/// A confirmed command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReport {
    pub command_id: CommandId,
    pub summary: String,
    pub confirmed: usize,
    pub outcomes: Vec<OperationOutcome>,
}

/// Book-keeping for one running command.
struct CommandRun {
    command_id: CommandId,
    requester: UserId,
    refs: HashMap<String, ObjectId>,
    /// Objects this command created that still exist.
    created: Vec<ObjectId>,
    /// Pre-command values of pre-existing objects this command touched.
    snapshots: BTreeMap<ObjectId, BoardObject>,
    outcomes: Vec<OperationOutcome>,
}

impl CommandRun {
    fn new(command_id: CommandId, requester: UserId) -> Self {
        Self {
            command_id,
            requester,
            refs: HashMap::new(),
            created: Vec::new(),
            snapshots: BTreeMap::new(),
            outcomes: Vec::new(),
        }
    }

    /// A `ref` from an earlier step, else an object id.
    fn resolve(&self, target: &str) -> ObjectId {
        self.refs.get(target).cloned().unwrap_or_else(|| ObjectId::new(target))
    }

    /// Remember the first-seen value of a pre-existing object.
    fn snapshot(&mut self, object: &BoardObject) {
        if !self.created.contains(&object.id) {
            self.snapshots.entry(object.id.clone()).or_insert_with(|| object.clone());
        }
    }
}

/// Runs agent commands against one board.
#[derive(Clone)]
pub struct AgentOrchestrator {
    board: BoardId,
    store: Arc<ObjectStore>,
    docs: Arc<dyn DocumentStore>,
    tools: Arc<dyn ToolService>,
    config: SyncConfig,
}

impl AgentOrchestrator {
    pub fn new(
        board: BoardId,
        store: Arc<ObjectStore>,
        docs: Arc<dyn DocumentStore>,
        tools: Arc<dyn ToolService>,
        config: SyncConfig,
    ) -> Self {
        Self { board, store, docs, tools, config }
    }

    /// Run a prompt under a fresh command id.
    pub async fn run(
        &self,
        requester: &UserId,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<CommandReport, SyncError> {
        self.run_command(CommandId::generate(), requester, prompt, cancel).await
    }

    /// Run a prompt under a caller-chosen command id.
    pub async fn run_command(
        &self,
        command_id: CommandId,
        requester: &UserId,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<CommandReport, SyncError> {
        let mut run = CommandRun::new(command_id.clone(), requester.clone());
        info!(command = %command_id, board = %self.board, "agent command started");

        let request = ToolRequest {
            command_id: command_id.clone(),
            board_id: self.board.clone(),
            requester_id: requester.clone(),
            prompt: prompt.to_string(),
            board_state: self.board_state(),
        };
        let mut stream = match self.tools.execute(request).await {
            Ok(stream) => stream,
            Err(err) => return Err(self.fail(run, format!("tool service: {err}")).await),
        };

        let failure = loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break "aborted by client".to_string(),
                item = stream.next() => item,
            };
            match item {
                Some(ToolStreamItem::Operation(call)) => {
                    let step = run.outcomes.len();
                    let op = call.name();
                    match self.execute_step(&mut run, step, call).await {
                        Ok(outcome) => {
                            debug!(command = %command_id, step, op, "step applied");
                            run.outcomes.push(outcome);
                        }
                        Err(err) => break format!("step {step} ({op}): {err}"),
                    }
                }
                Some(ToolStreamItem::Completed { summary }) => {
                    match self.confirm(&command_id).await {
                        Ok(confirmed) => {
                            info!(command = %command_id, confirmed, "agent command confirmed");
                            return Ok(CommandReport {
                                command_id,
                                summary,
                                confirmed,
                                outcomes: run.outcomes,
                            });
                        }
                        Err(err) => break format!("confirm: {err}"),
                    }
                }
                Some(ToolStreamItem::Failed { message }) => break message,
                None => break "tool stream ended without completion".to_string(),
            }
        };
        Err(self.fail(run, failure).await)
    }

    /// Roll back and build the error returned to the caller.
    async fn fail(&self, run: CommandRun, message: String) -> SyncError {
        warn!(command = %run.command_id, %message, "agent command failed, rolling back");
        let message = match self.rollback_run(&run).await {
            Ok(removed) => {
                let restored = run.snapshots.len();
                info!(command = %run.command_id, removed, restored, "agent command rolled back");
                message
            }
            Err(err) => {
                error!(command = %run.command_id, error = %err, "rollback failed");
                format!("{message}; rollback failed: {err}")
            }
        };
        SyncError::AgentCommand { command_id: run.command_id, message, outcomes: run.outcomes }
    }

    // ------------------------------------------------------------------
    // Confirm / rollback
    // ------------------------------------------------------------------

    /// Clear the pending flag on every object tagged with `command_id`, in one
    /// batch. Returns how many objects were confirmed; zero when nothing is
    /// pending.
    pub async fn confirm(&self, command_id: &CommandId) -> Result<usize, SyncError> {
        let pending: Vec<BoardObject> = self
            .store
            .objects_with_command(command_id)
            .into_iter()
            .filter(|o| o.is_pending_for(command_id))
            .collect();
        if pending.is_empty() {
            debug!(command = %command_id, "nothing pending to confirm");
            return Ok(0);
        }

        let writes = pending
            .iter()
            .map(|o| BatchWrite::Update(o.id.clone(), ObjectPatch::confirm()))
            .collect();
        self.docs.commit_batch(&self.board, writes).await?;

        let count = pending.len();
        let confirmed = pending
            .into_iter()
            .map(|mut o| {
                o.is_ai_pending = false;
                o
            })
            .collect();
        self.store.batch_upsert(confirmed, OpSource::Local);
        Ok(count)
    }

    /// Delete every object still pending under `command_id`. Used when the
    /// in-process record of a command is gone (for example after a restart),
    /// so pre-command values cannot be restored.
    pub async fn rollback(&self, command_id: &CommandId) -> Result<usize, SyncError> {
        let run = CommandRun::new(command_id.clone(), UserId::new(""));
        self.rollback_run(&run).await
    }

    async fn rollback_run(&self, run: &CommandRun) -> Result<usize, SyncError> {
        let command_id = &run.command_id;
        let mut doomed: BTreeSet<ObjectId> = run.created.iter().cloned().collect();
        doomed.extend(
            self.store
                .objects_with_command(command_id)
                .into_iter()
                .filter(|o| o.is_pending_for(command_id) && !run.snapshots.contains_key(&o.id))
                .map(|o| o.id),
        );
        let restores: Vec<BoardObject> = run.snapshots.values().cloned().collect();
        if doomed.is_empty() && restores.is_empty() {
            return Ok(0);
        }

        let mut writes: Vec<BatchWrite> = doomed.iter().cloned().map(BatchWrite::Delete).collect();
        writes.extend(restores.iter().cloned().map(BatchWrite::Set));
        self.docs.commit_batch(&self.board, writes).await?;

        let doomed: Vec<ObjectId> = doomed.into_iter().collect();
        self.store.batch_remove(&doomed, OpSource::Local);
        if !restores.is_empty() {
            self.store.batch_upsert(restores, OpSource::Local);
        }
        Ok(doomed.len())
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    async fn execute_step(
        &self,
        run: &mut CommandRun,
        step: usize,
        call: ToolCall,
    ) -> Result<OperationOutcome, SyncError> {
        match call {
            ToolCall::Create(spec) => self.step_create(run, step, spec).await,
            ToolCall::Update(spec) => self.step_update(run, step, spec).await,
            ToolCall::Delete { target } => self.step_delete(run, step, &target).await,
            ToolCall::Arrange(spec) => self.step_arrange(run, step, spec).await,
            ToolCall::QueryState => {
                let mut outcome = OperationOutcome::new(step, "query_state", Vec::new());
                outcome.state = Some(self.board_state());
                Ok(outcome)
            }
        }
    }

    fn report_clamps(&self, run: &CommandRun, id: &ObjectId, clamps: &[ClampReport]) {
        for clamp in clamps {
            warn!(
                command = %run.command_id,
                object = %id,
                field = clamp.field,
                proposed = clamp.proposed,
                applied = clamp.applied,
                "agent geometry clamped"
            );
        }
    }

    async fn step_create(
        &self,
        run: &mut CommandRun,
        step: usize,
        spec: CreateSpec,
    ) -> Result<OperationOutcome, SyncError> {
        let mut geometry = spec.geometry();
        let clamps = clamp_geometry(spec.kind, &mut geometry, &self.config);

        let mut object =
            BoardObject::new(ObjectId::generate(), spec.kind, geometry).with_text(spec.text);
        if let Some(color) = spec.color {
            object.style.color = color;
        }
        object.parent_frame = spec.parent_frame.as_deref().map(|t| run.resolve(t));
        if spec.kind == ObjectKind::Connector {
            object.connected_to = spec.connect.iter().map(|t| run.resolve(t)).collect();
        }
        object.created_by = Some(run.requester.clone());
        object.z_index = self.store.next_z_index();
        object.tag_pending(&run.command_id);
        object.normalize();
        object.validate()?;

        let id = object.id.clone();
        self.report_clamps(run, &id, &clamps);
        self.store.upsert(object.clone(), OpSource::Local);
        match self.docs.create(&self.board, object).await {
            Ok(committed) => {
                self.store.upsert(committed, OpSource::Remote);
            }
            Err(err) => {
                self.store.remove(&id, OpSource::Local);
                return Err(err.into());
            }
        }

        run.created.push(id.clone());
        if let Some(key) = spec.ref_key {
            run.refs.insert(key, id.clone());
        }
        let mut outcome = OperationOutcome::new(step, "create", vec![id]);
        outcome.clamps = clamps;
        Ok(outcome)
    }

    async fn step_update(
        &self,
        run: &mut CommandRun,
        step: usize,
        spec: UpdateSpec,
    ) -> Result<OperationOutcome, SyncError> {
        let id = run.resolve(&spec.target);
        let current = self.store.get(&id).ok_or_else(|| SyncError::NotFound(id.clone()))?;

        let mut next = current.clone();
        let g = &mut next.geometry;
        let touches_geometry =
            [spec.x, spec.y, spec.width, spec.height, spec.rotation].iter().any(Option::is_some);
        g.x = spec.x.unwrap_or(g.x);
        g.y = spec.y.unwrap_or(g.y);
        g.width = spec.width.unwrap_or(g.width);
        g.height = spec.height.unwrap_or(g.height);
        g.rotation = spec.rotation.unwrap_or(g.rotation);
        let clamps = if touches_geometry {
            clamp_geometry(next.kind, &mut next.geometry, &self.config)
        } else {
            Vec::new()
        };

        let mut patch = ObjectPatch::pending(&run.command_id);
        if touches_geometry {
            patch = patch.merge(ObjectPatch::geometry(&next.geometry));
        }
        if let Some(text) = spec.text {
            next.text = text.clone();
            patch.text = Some(text);
        }
        if let Some(color) = spec.color {
            next.style.color = color.clone();
            patch.color = Some(color);
        }
        if let Some(frame) = spec.parent_frame.as_deref() {
            let frame = run.resolve(frame);
            next.parent_frame = Some(frame.clone());
            patch.parent_frame = Some(Some(frame));
        }
        next.tag_pending(&run.command_id);
        next.normalize();
        next.validate()?;

        self.report_clamps(run, &id, &clamps);
        run.snapshot(&current);
        self.store.upsert(next, OpSource::Local);
        match self.docs.update(&self.board, &id, patch).await {
            Ok(committed) => {
                self.store.upsert(committed, OpSource::Remote);
            }
            Err(err) => {
                self.store.upsert(current, OpSource::Local);
                return Err(err.into());
            }
        }

        let mut outcome = OperationOutcome::new(step, "update", vec![id]);
        outcome.clamps = clamps;
        Ok(outcome)
    }

    async fn step_delete(
        &self,
        run: &mut CommandRun,
        step: usize,
        target: &str,
    ) -> Result<OperationOutcome, SyncError> {
        let id = run.resolve(target);
        let plan =
            DeletePlan::new(&self.store, &id).ok_or_else(|| SyncError::NotFound(id.clone()))?;
        let removed = plan.removed_ids();
        let pending = ObjectPatch::pending(&run.command_id);

        self.store.batch_remove(&removed, OpSource::Local);
        let detached: Vec<BoardObject> = plan
            .detached()
            .into_iter()
            .map(|mut child| {
                child.tag_pending(&run.command_id);
                child
            })
            .collect();
        if !detached.is_empty() {
            self.store.batch_upsert(detached, OpSource::Local);
        }

        if let Err(err) = self.docs.commit_batch(&self.board, plan.writes(Some(&pending))).await {
            plan.restore_local(&self.store);
            return Err(err.into());
        }

        for object in plan.snapshots() {
            run.snapshot(object);
        }
        run.created.retain(|c| !removed.contains(c));
        Ok(OperationOutcome::new(step, "delete", removed))
    }

    async fn step_arrange(
        &self,
        run: &mut CommandRun,
        step: usize,
        spec: ArrangeSpec,
    ) -> Result<OperationOutcome, SyncError> {
        let objects = spec
            .targets
            .iter()
            .map(|t| {
                let id = run.resolve(t);
                self.store.get(&id).ok_or(SyncError::NotFound(id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut clamps = Vec::new();
        let mut writes = Vec::with_capacity(objects.len());
        let mut arranged = Vec::with_capacity(objects.len());
        let layout = arrange_grid(&objects, &spec, ARRANGE_GAP);
        for ((id, mut geometry), previous) in layout.into_iter().zip(&objects) {
            let reports = clamp_geometry(previous.kind, &mut geometry, &self.config);
            self.report_clamps(run, &id, &reports);
            clamps.extend(reports);

            let patch =
                ObjectPatch::geometry(&geometry).merge(ObjectPatch::pending(&run.command_id));
            let mut next = previous.clone();
            patch.apply_to(&mut next);
            writes.push(BatchWrite::Update(id, patch));
            arranged.push(next);
        }

        let ids: Vec<ObjectId> = arranged.iter().map(|o| o.id.clone()).collect();
        self.store.batch_upsert(arranged, OpSource::Local);
        if let Err(err) = self.docs.commit_batch(&self.board, writes).await {
            self.store.batch_upsert(objects, OpSource::Local);
            return Err(err.into());
        }
        for object in &objects {
            run.snapshot(object);
        }

        let mut outcome = OperationOutcome::new(step, "arrange", ids);
        outcome.clamps = clamps;
        Ok(outcome)
    }

    /// Compact description of the board for the tool service and
    /// `query_state`.
    pub fn board_state(&self) -> serde_json::Value {
        let objects = self.store.all();
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        for object in &objects {
            *by_kind.entry(object.kind.to_string()).or_default() += 1;
        }
        let bounds = objects.iter().map(|o| o.bounds()).reduce(|a, b| a.union(&b));
        let listed: Vec<serde_json::Value> = objects
            .iter()
            .take(STATE_OBJECT_LIMIT)
            .map(|o| {
                json!({
                    "id": o.id,
                    "type": o.kind,
                    "x": o.geometry.x,
                    "y": o.geometry.y,
                    "width": o.geometry.width,
                    "height": o.geometry.height,
                    "text": o.text.chars().take(STATE_TEXT_PREVIEW).collect::<String>(),
                    "parentFrame": o.parent_frame,
                })
            })
            .collect();
        json!({
            "objectCount": objects.len(),
            "byKind": by_kind,
            "bounds": bounds,
            "objects": listed,
        })
    }
}
