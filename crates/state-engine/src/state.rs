//! The state: tree shape, cells and the update/apply engine
//!
//! [`State::submit`] is the only way the tree changes. One update runs at a
//! time; a later submit waits for the earlier one to finish. Each update:
//!
//! 1. diffs the edit description against the current shape (a structurally
//!    invalid edit is rejected here and nothing changes),
//! 2. commits the new shape, dropping removed cells and marking every
//!    affected cell pending (values are kept),
//! 3. recomputes affected cells parents-first. Independent cells run
//!    concurrently up to [`EngineConfig::max_concurrent_tasks`]. A cell
//!    whose validated parameters and input value are those of its last
//!    commit keeps that value unless it was refreshed,
//! 4. commits each result as it arrives.
//!
//! A cell whose parameters or input kind are rejected, or whose body fails,
//! ends in the error state with its last committed value intact. Its
//! descendants fail without running until the cell recovers. Cancellation
//! (see [`State::cancel`]) returns unfinished cells to pending.
//!
//! A submit future must be driven to completion. To bound an update in
//! time, race it against a timer that calls [`State::cancel`].

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};

use crate::action::{Action, ActionApply, ActionInstance, ActionOutput};
use crate::builder::{EditDescription, StateBuilder};
use crate::cell::{CellStatus, Derivation, ObjectCell};
use crate::config::EngineConfig;
use crate::context::{CancellationToken, GlobalContext, RuntimeContext};
use crate::error::{Result, StateError, ValidationError};
use crate::events::{BroadcastEventSink, CellWatcher, EventError, EventSink, StateEvent};
use crate::kind::StateObject;
use crate::params::{ParamSchema, ParamValues};
use crate::registry::Registry;
use crate::transformer::{describe_kinds, Transformer};
use crate::tree::{Ref, StateTree, ROOT_REF};
use crate::update::{plan_update, CellFailure, UpdatePlan, UpdateReport};

/// A tree of derived objects and the engine keeping it up to date
pub struct State {
    registry: Arc<Registry>,
    config: EngineConfig,
    global: Arc<GlobalContext>,
    tree: RwLock<StateTree>,
    cells: RwLock<HashMap<Ref, ObjectCell>>,
    /// Serializes updates
    update_lock: tokio::sync::Mutex<()>,
    /// Token of the in-flight (or most recent) update
    cancel: Mutex<CancellationToken>,
    broadcast: Arc<BroadcastEventSink>,
    extra_sink: Option<Arc<dyn EventSink>>,
}

impl State {
    /// Create a state holding only the root cell
    pub fn new(registry: Arc<Registry>) -> Self {
        let config = EngineConfig::default();
        let mut cells = HashMap::new();
        cells.insert(ROOT_REF.to_string(), ObjectCell::root());
        Self {
            registry,
            broadcast: Arc::new(BroadcastEventSink::new(config.event_capacity)),
            config,
            global: Arc::new(GlobalContext::new()),
            tree: RwLock::new(StateTree::new()),
            cells: RwLock::new(cells),
            update_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            extra_sink: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.broadcast = Arc::new(BroadcastEventSink::new(config.event_capacity));
        self.config = config;
        self
    }

    /// Host objects visible to schema functions, predicates and bodies
    pub fn with_global_context(mut self, global: GlobalContext) -> Self {
        self.global = Arc::new(global);
        self
    }

    /// Forward every event to `sink` in addition to the broadcast channel
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.extra_sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn global(&self) -> &GlobalContext {
        &self.global
    }

    /// Start describing an edit
    pub fn build(&self) -> StateBuilder {
        StateBuilder::new()
    }

    /// Snapshot of the tree shape
    pub fn tree(&self) -> StateTree {
        self.tree.read().clone()
    }

    /// Snapshot of one cell
    pub fn cell(&self, cell_ref: &str) -> Option<ObjectCell> {
        self.cells.read().get(cell_ref).cloned()
    }

    /// Snapshot of every cell, root first, parents before children
    pub fn cells(&self) -> Vec<ObjectCell> {
        let order = self.tree.read().topological_order();
        let cells = self.cells.read();
        std::iter::once(ROOT_REF.to_string())
            .chain(order)
            .filter_map(|r| cells.get(&r).cloned())
            .collect()
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateEvent> {
        self.broadcast.subscribe()
    }

    /// Receive the events of one cell
    pub fn watch(&self, cell_ref: impl Into<Ref>) -> CellWatcher {
        self.broadcast.watch(cell_ref)
    }

    /// Request cancellation of the in-flight update.
    ///
    /// Bodies observe it at their next checkpoint. Cells that were running
    /// or not yet started go back to pending with their last value.
    pub fn cancel(&self) {
        let token = self.cancel.lock().clone();
        if !token.is_cancelled() {
            log::info!("Cancellation requested");
            token.cancel();
        }
    }

    /// Apply an edit description and recompute what it affects.
    ///
    /// Returns `Err` only when the edit is structurally invalid, in which
    /// case the state is unchanged. Per-cell problems are reported in the
    /// [`UpdateReport`] and in the cells themselves.
    pub async fn submit(&self, edits: EditDescription) -> Result<UpdateReport> {
        let _guard = self.update_lock.lock().await;
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let plan = {
            let tree = self.tree.read();
            plan_update(&tree, &edits)?
        };

        let update_id = uuid::Uuid::new_v4().to_string();
        let sink: Arc<dyn EventSink> = Arc::new(StateSink {
            broadcast: self.broadcast.clone(),
            extra: self.extra_sink.clone(),
        });
        let mut report = UpdateReport {
            update_id: update_id.clone(),
            removed: plan.removed.clone(),
            ..UpdateReport::default()
        };

        if plan.is_noop() {
            log::debug!("Update {} changes nothing", update_id);
            return Ok(report);
        }

        log::info!(
            "Update {} started: {} affected, {} removed",
            update_id,
            plan.affected.len(),
            plan.removed.len()
        );
        emit(
            sink.as_ref(),
            StateEvent::UpdateStarted {
                update_id: update_id.clone(),
                affected: plan.affected.clone(),
            },
        );
        self.commit_shape(&plan, sink.as_ref());

        self.recompute(&plan, &token, &sink, &mut report).await;

        report.cancelled = token.is_cancelled();
        log::info!(
            "Update {} finished: {} updated, {} reused, {} failed, {} pending",
            update_id,
            report.updated.len(),
            report.reused.len(),
            report.failed.len(),
            report.pending.len()
        );
        emit(
            sink.as_ref(),
            StateEvent::UpdateFinished {
                update_id,
                success: report.is_success(),
            },
        );
        Ok(report)
    }

    /// Install the new shape and reset affected cells to pending
    fn commit_shape(&self, plan: &UpdatePlan, sink: &dyn EventSink) {
        let mut events = Vec::new();
        {
            let mut tree = self.tree.write();
            let mut cells = self.cells.write();
            *tree = plan.tree.clone();

            for cell_ref in &plan.removed {
                cells.remove(cell_ref);
                events.push(StateEvent::CellRemoved {
                    cell_ref: cell_ref.clone(),
                });
            }
            for cell_ref in &plan.affected {
                let Some(instance) = plan.tree.get(cell_ref) else {
                    continue;
                };
                match cells.get_mut(cell_ref) {
                    Some(cell) => {
                        cell.transform = Some(instance.clone());
                        cell.mark(CellStatus::Pending);
                    }
                    None => {
                        cells.insert(cell_ref.clone(), ObjectCell::pending(instance.clone()));
                        events.push(StateEvent::CellCreated {
                            cell_ref: cell_ref.clone(),
                        });
                    }
                }
                events.push(StateEvent::CellStatusChanged {
                    cell_ref: cell_ref.clone(),
                    status: CellStatus::Pending,
                    error: None,
                });
            }
        }
        for event in events {
            emit(sink, event);
        }
    }

    /// Run affected cells parents-first with bounded concurrency
    async fn recompute(
        &self,
        plan: &UpdatePlan,
        token: &CancellationToken,
        sink: &Arc<dyn EventSink>,
        report: &mut UpdateReport,
    ) {
        let affected: HashSet<&str> = plan.affected.iter().map(String::as_str).collect();
        let mut ready: VecDeque<Ref> = plan
            .affected
            .iter()
            .filter(|r| {
                plan.tree
                    .parent(r)
                    .map_or(true, |parent| !affected.contains(parent))
            })
            .cloned()
            .collect();

        let total = plan.affected.len();
        let mut done = 0usize;
        let limit = self.config.concurrency();
        let mut running = FuturesUnordered::new();

        loop {
            while running.len() < limit {
                let Some(cell_ref) = ready.pop_front() else {
                    break;
                };
                match self.prepare(&cell_ref, plan, token) {
                    Step::Run(job) => {
                        self.set_status(&cell_ref, CellStatus::Processing, sink.as_ref());
                        let ctx = RuntimeContext::new(
                            cell_ref.clone(),
                            token.clone(),
                            sink.clone(),
                            self.global.clone(),
                        );
                        running.push(run_job(job, ctx, self.config.catch_panics));
                    }
                    Step::Done(outcome) => {
                        self.finish(&cell_ref, outcome, sink.as_ref(), report);
                        done += 1;
                        self.progress(done, total, sink.as_ref());
                        queue_children(&cell_ref, plan, &affected, &mut ready);
                    }
                }
            }

            let Some((cell_ref, result)) = running.next().await else {
                if ready.is_empty() {
                    break;
                }
                continue;
            };
            self.finish(&cell_ref, result, sink.as_ref(), report);
            done += 1;
            self.progress(done, total, sink.as_ref());
            queue_children(&cell_ref, plan, &affected, &mut ready);
        }
    }

    /// Decide whether a cell can run, and with what input and parameters
    fn prepare(&self, cell_ref: &str, plan: &UpdatePlan, token: &CancellationToken) -> Step {
        let Some(instance) = plan.tree.get(cell_ref) else {
            return Step::Done(Outcome::Pending);
        };

        let (input, parent_version) = {
            let cells = self.cells.read();
            match cells.get(&instance.parent).map(|c| (c.status, c.obj.clone(), c.version)) {
                Some((CellStatus::Ok, Some(obj), version)) => (obj, version),
                Some((CellStatus::Error, _, _)) => {
                    return Step::Done(Outcome::Failed(format!("Parent '{}' failed", instance.parent)));
                }
                _ => return Step::Done(Outcome::Pending),
            }
        };

        if token.is_cancelled() {
            return Step::Done(Outcome::Pending);
        }

        let transformer = &instance.transformer;
        if !self.registry.has_transformer(transformer.id()) {
            let err = ValidationError::UnregisteredTransformer(transformer.id().to_string());
            return Step::Done(Outcome::Failed(StateError::from(err).to_string()));
        }
        if !transformer.accepts(input.kind()) {
            let err = ValidationError::KindMismatch {
                operation: transformer.id().to_string(),
                expected: describe_kinds(&transformer.metadata().from),
                actual: input.kind().id().to_string(),
            };
            return Step::Done(Outcome::Failed(StateError::from(err).to_string()));
        }

        let params = match transformer.schema(&input, &self.global).validate(&instance.params) {
            Ok(params) => params,
            Err(err) => return Step::Done(Outcome::Failed(StateError::from(err).to_string())),
        };
        let derivation = Derivation {
            transformer: transformer.id().to_string(),
            parent: instance.parent.clone(),
            parent_version,
            params,
        };

        if !plan.forced.contains(cell_ref) {
            let cells = self.cells.read();
            if cells.get(cell_ref).is_some_and(|c| c.reusable(&derivation)) {
                return Step::Done(Outcome::Reused);
            }
        }

        Step::Run(Job {
            cell_ref: cell_ref.to_string(),
            transformer: transformer.clone(),
            input,
            derivation,
        })
    }

    fn set_status(&self, cell_ref: &str, status: CellStatus, sink: &dyn EventSink) {
        {
            let mut cells = self.cells.write();
            let Some(cell) = cells.get_mut(cell_ref) else {
                return;
            };
            cell.mark(status);
        }
        emit(
            sink,
            StateEvent::CellStatusChanged {
                cell_ref: cell_ref.to_string(),
                status,
                error: None,
            },
        );
    }

    /// Commit the outcome of one cell
    fn finish(&self, cell_ref: &str, outcome: Outcome, sink: &dyn EventSink, report: &mut UpdateReport) {
        let mut events = Vec::new();
        {
            let mut cells = self.cells.write();
            let Some(cell) = cells.get_mut(cell_ref) else {
                return;
            };
            match outcome {
                Outcome::Committed(obj, derivation) => {
                    cell.commit(obj, Some(derivation));
                    log::debug!("Cell '{}' committed version {}", cell_ref, cell.version);
                    report.updated.push(cell_ref.to_string());
                    events.push(status_event(cell));
                    events.push(StateEvent::CellCommitted {
                        cell_ref: cell_ref.to_string(),
                        version: cell.version,
                    });
                }
                Outcome::Reused => {
                    log::debug!("Cell '{}' inputs unchanged, value kept", cell_ref);
                    cell.mark(CellStatus::Ok);
                    report.reused.push(cell_ref.to_string());
                    events.push(status_event(cell));
                }
                Outcome::Failed(reason) => {
                    log::warn!("Cell '{}' failed: {}", cell_ref, reason);
                    report.failed.push(CellFailure {
                        cell_ref: cell_ref.to_string(),
                        reason: reason.clone(),
                    });
                    cell.fail(reason);
                    events.push(status_event(cell));
                }
                Outcome::Pending => {
                    log::debug!("Cell '{}' left pending", cell_ref);
                    cell.mark(CellStatus::Pending);
                    report.pending.push(cell_ref.to_string());
                    events.push(status_event(cell));
                }
            }
        }
        for event in events {
            emit(sink, event);
        }
    }

    fn progress(&self, done: usize, total: usize, sink: &dyn EventSink) {
        emit(
            sink,
            StateEvent::Progress {
                cell_ref: None,
                message: format!("{}/{} cells", done, total),
            },
        );
    }

    /// Committed value of a cell
    fn object(&self, cell_ref: &str) -> Result<StateObject> {
        let cells = self.cells.read();
        let cell = cells
            .get(cell_ref)
            .ok_or_else(|| StateError::UnknownRef(cell_ref.to_string()))?;
        cell.obj
            .clone()
            .ok_or_else(|| StateError::operation(format!("Cell '{}' has no value yet", cell_ref)))
    }

    /// Actions applicable to the current value of a cell
    pub fn applicable_actions(&self, cell_ref: &str) -> Result<Vec<Arc<Action>>> {
        let object = self.object(cell_ref)?;
        Ok(self
            .registry
            .applicable_actions(&object, &self.global)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Transformers applicable to the current value of a cell
    pub fn applicable_transformers(&self, cell_ref: &str) -> Result<Vec<Arc<Transformer>>> {
        let object = self.object(cell_ref)?;
        Ok(self
            .registry
            .applicable_transformers(&object, &self.global)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Parameter schema of `action` for the current value of a cell
    pub fn action_schema(&self, cell_ref: &str, action: &Action) -> Result<ParamSchema> {
        let object = self.object(cell_ref)?;
        Ok(action.schema(&object, &self.global))
    }

    /// Parameter schema of `transformer` applied to the current value of a cell
    pub fn transformer_schema(&self, cell_ref: &str, transformer: &Transformer) -> Result<ParamSchema> {
        let object = self.object(cell_ref)?;
        Ok(transformer.schema(&object, &self.global))
    }

    /// Run an action against a cell.
    ///
    /// The target's kind, the action's predicate and the parameters are
    /// checked before the body runs. An [`ActionOutput::Edit`] returned by
    /// the body is submitted and reported as [`ActionOutput::Update`].
    pub async fn apply_action(&self, instance: &ActionInstance, target: &str) -> Result<ActionOutput> {
        let action = &instance.action;
        let name = action
            .display()
            .map_or_else(|| action.id().to_string(), |d| d.name.clone());
        let object = self.object(target)?;

        if !action.accepts(object.kind()) {
            return Err(ValidationError::KindMismatch {
                operation: name,
                expected: describe_kinds(action.from()),
                actual: object.kind().id().to_string(),
            }
            .into());
        }
        if !action.is_applicable(&object, &self.global) {
            return Err(ValidationError::NotApplicable {
                operation: name,
                target: target.to_string(),
            }
            .into());
        }
        let params: ParamValues = action.schema(&object, &self.global).validate(&instance.params)?;

        log::debug!("Applying action '{}' to '{}'", name, target);
        let output = action
            .run(ActionApply {
                target,
                object: &object,
                params: &params,
                state: self,
                global: &self.global,
            })
            .await?;

        match output {
            ActionOutput::Edit(edits) => Ok(ActionOutput::Update(self.submit(edits).await?)),
            other => Ok(other),
        }
    }
}

/// Broadcast plus the optional host sink
struct StateSink {
    broadcast: Arc<BroadcastEventSink>,
    extra: Option<Arc<dyn EventSink>>,
}

impl EventSink for StateSink {
    fn send(&self, event: StateEvent) -> std::result::Result<(), EventError> {
        // Having no subscribers is the normal case.
        let _ = self.broadcast.send(event.clone());
        match &self.extra {
            Some(sink) => sink.send(event),
            None => Ok(()),
        }
    }
}

fn emit(sink: &dyn EventSink, event: StateEvent) {
    if let Err(e) = sink.send(event) {
        log::trace!("Event dropped: {}", e);
    }
}

fn status_event(cell: &ObjectCell) -> StateEvent {
    StateEvent::CellStatusChanged {
        cell_ref: cell.cell_ref.clone(),
        status: cell.status,
        error: cell.error.clone(),
    }
}

fn queue_children(cell_ref: &str, plan: &UpdatePlan, affected: &HashSet<&str>, ready: &mut VecDeque<Ref>) {
    for child in plan.tree.children(cell_ref) {
        if affected.contains(child.as_str()) {
            ready.push_back(child.clone());
        }
    }
}

struct Job {
    cell_ref: Ref,
    transformer: Arc<Transformer>,
    input: StateObject,
    derivation: Derivation,
}

enum Step {
    Run(Job),
    Done(Outcome),
}

enum Outcome {
    Committed(StateObject, Derivation),
    /// Validated inputs unchanged since the last commit
    Reused,
    Failed(String),
    Pending,
}

impl Outcome {
    fn of(result: Result<StateObject>, derivation: Derivation) -> Self {
        match result {
            Ok(obj) => Self::Committed(obj, derivation),
            Err(StateError::Cancelled) => Self::Pending,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

async fn run_job(job: Job, ctx: RuntimeContext, catch_panics: bool) -> (Ref, Outcome) {
    let body = job.transformer.apply(&job.input, &job.derivation.params, &ctx);
    let result = if catch_panics {
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(StateError::operation(format!(
                "'{}' panicked: {}",
                job.transformer.id(),
                panic_message(panic.as_ref())
            ))),
        }
    } else {
        body.await
    };
    (job.cell_ref, Outcome::of(result, job.derivation))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionDisplay;
    use crate::events::VecEventSink;
    use crate::kind::ObjectKind;
    use crate::params::ParamDefinition;
    use crate::transformer::{TransformBody, TransformerMetadata};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const NUMBER: ObjectKind = ObjectKind::new("number", "A number");

    struct Fixture {
        state: State,
        load: Arc<Transformer>,
        double: Arc<Transformer>,
        fail: Arc<Transformer>,
        double_calls: Arc<AtomicUsize>,
    }

    fn load() -> Arc<Transformer> {
        Transformer::from_fn(
            TransformerMetadata::new("load", NUMBER).with_label("Load"),
            ParamSchema::new().with("value", ParamDefinition::number(0.0)),
            |_, params| {
                let value = params["value"].as_f64().unwrap_or_default();
                Ok(StateObject::new(NUMBER, "Loaded", value))
            },
        )
    }

    fn double(calls: Arc<AtomicUsize>) -> Arc<Transformer> {
        Transformer::from_fn(
            TransformerMetadata::new("double", NUMBER)
                .from(&[NUMBER])
                .with_label("Double"),
            ParamSchema::new()
                .with("factor", ParamDefinition::numeric(2.0, 0.0, 10.0))
                .with("explode", ParamDefinition::boolean(false)),
            move |input, params| {
                calls.fetch_add(1, Ordering::SeqCst);
                if params["explode"].as_bool() == Some(true) {
                    panic!("exploded");
                }
                let x = input.try_data::<f64>()?;
                let factor = params["factor"].as_f64().unwrap_or(1.0);
                Ok(StateObject::new(NUMBER, "Doubled", x * factor))
            },
        )
    }

    fn fail() -> Arc<Transformer> {
        Transformer::from_fn(
            TransformerMetadata::new("fail", NUMBER).from(&[NUMBER]),
            ParamSchema::new(),
            |_, _| Err(StateError::operation("boom")),
        )
    }

    fn fixture_with(extra: impl FnOnce(&mut Registry)) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let double_calls = Arc::new(AtomicUsize::new(0));
        let load = load();
        let double = double(double_calls.clone());
        let fail = fail();

        let mut registry = Registry::new();
        registry.register_with_action(load.clone()).unwrap();
        registry.register_with_action(double.clone()).unwrap();
        registry.register_transformer(fail.clone()).unwrap();
        extra(&mut registry);

        Fixture {
            state: State::new(Arc::new(registry)),
            load,
            double,
            fail,
            double_calls,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    impl Fixture {
        fn calls(&self) -> usize {
            self.double_calls.load(Ordering::SeqCst)
        }

        fn value(&self, cell_ref: &str) -> Option<f64> {
            self.state.cell(cell_ref).and_then(|c| c.value::<f64>().copied())
        }

        fn status(&self, cell_ref: &str) -> CellStatus {
            self.state.cell(cell_ref).map(|c| c.status).unwrap()
        }

        /// root -> a(load 10) -> b(double 3)
        async fn load_and_double(&self) -> UpdateReport {
            let edits = self
                .state
                .build()
                .to_root()
                .apply_as("a", &self.load, json!({"value": 10}))
                .apply_as("b", &self.double, json!({"factor": 3}))
                .build()
                .unwrap();
            self.state.submit(edits).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_load_then_double() {
        let f = fixture();
        let report = f.load_and_double().await;

        assert!(report.is_success());
        assert_eq!(report.updated, vec!["a", "b"]);
        assert_eq!(f.value("b"), Some(30.0));
        assert_eq!(f.status("b"), CellStatus::Ok);
        assert_eq!(f.state.cell("b").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_param_never_reaches_body() {
        let f = fixture();
        f.load_and_double().await;
        assert_eq!(f.calls(), 1);

        let edits = f.state.build().update("b", json!({"factor": -1})).build().unwrap();
        let report = f.state.submit(edits).await.unwrap();

        assert_eq!(f.calls(), 1);
        assert_eq!(f.status("b"), CellStatus::Error);
        assert_eq!(f.value("b"), Some(30.0));
        let failure = report.failure("b").unwrap();
        assert!(failure.reason.contains("factor"), "{}", failure.reason);
    }

    #[tokio::test]
    async fn test_new_cell_with_bad_params_has_no_value() {
        let f = fixture();
        let edits = f
            .state
            .build()
            .to_root()
            .apply_as("a", &f.load, json!({"value": 1}))
            .apply_as("b", &f.double, json!({"factor": "three"}))
            .build()
            .unwrap();
        f.state.submit(edits).await.unwrap();

        let cell = f.state.cell("b").unwrap();
        assert_eq!(cell.status, CellStatus::Error);
        assert!(cell.obj.is_none());
        assert_eq!(f.calls(), 0);
    }

    #[tokio::test]
    async fn test_failing_sibling_leaves_other_branch_alone() {
        let f = fixture();
        let edits = f
            .state
            .build()
            .to_root()
            .apply_as("a", &f.load, json!({"value": 2}))
            .apply_as("b", &f.double, Value::Null)
            .to("a")
            .apply_as("c", &f.fail, Value::Null)
            .build()
            .unwrap();
        let report = f.state.submit(edits).await.unwrap();

        assert_eq!(f.status("b"), CellStatus::Ok);
        assert_eq!(f.value("b"), Some(4.0));
        assert_eq!(f.status("c"), CellStatus::Error);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].cell_ref, "c");
        assert!(report.failed[0].reason.contains("boom"));
    }

    #[tokio::test]
    async fn test_untouched_cells_are_not_recomputed() {
        let f = fixture();
        let edits = f
            .state
            .build()
            .to_root()
            .apply_as("a", &f.load, json!({"value": 1}))
            .apply_as("b", &f.double, json!({"factor": 2}))
            .to("a")
            .apply_as("c", &f.double, json!({"factor": 4}))
            .build()
            .unwrap();
        f.state.submit(edits).await.unwrap();
        assert_eq!(f.calls(), 2);

        let edits = f.state.build().update("c", json!({"factor": 5})).build().unwrap();
        let report = f.state.submit(edits).await.unwrap();

        assert_eq!(report.updated, vec!["c"]);
        assert_eq!(f.calls(), 3);
        assert_eq!(f.state.cell("b").unwrap().version, 1);
        assert_eq!(f.state.cell("a").unwrap().version, 1);
        assert_eq!(f.value("c"), Some(5.0));
    }

    #[tokio::test]
    async fn test_identical_resubmit_is_noop() {
        let f = fixture();
        f.load_and_double().await;
        let report = f.load_and_double().await;

        assert!(report.updated.is_empty());
        assert!(report.is_success());
        assert_eq!(f.calls(), 1);
        assert_eq!(f.state.cell("b").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_equal_number_spelling_reuses_value() {
        let f = fixture();
        f.load_and_double().await;

        let edits = f.state.build().update("b", json!({"factor": 3.0})).build().unwrap();
        let report = f.state.submit(edits).await.unwrap();

        assert!(report.is_success());
        assert!(report.updated.is_empty());
        assert_eq!(report.reused, vec!["b"]);
        assert_eq!(f.calls(), 1);
        assert_eq!(f.status("b"), CellStatus::Ok);
        assert_eq!(f.state.cell("b").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_explicit_defaults_reuse_value() {
        let f = fixture();
        let edits = f
            .state
            .build()
            .to_root()
            .apply_as("a", &f.load, json!({"value": 1}))
            .apply_as("b", &f.double, Value::Null)
            .apply_as("c", &f.double, Value::Null)
            .build()
            .unwrap();
        f.state.submit(edits).await.unwrap();
        assert_eq!(f.calls(), 2);

        let edits = f
            .state
            .build()
            .update("b", json!({"factor": 2.0, "explode": false}))
            .build()
            .unwrap();
        let report = f.state.submit(edits).await.unwrap();

        assert_eq!(report.reused, vec!["b", "c"]);
        assert_eq!(f.calls(), 2);
        assert_eq!(f.value("c"), Some(4.0));
        assert_eq!(f.state.cell("c").unwrap().version, 1);

        // A refresh recomputes regardless
        let report = f
            .state
            .submit(f.state.build().refresh("b").build().unwrap())
            .await
            .unwrap();
        assert_eq!(report.updated, vec!["b", "c"]);
        assert_eq!(f.calls(), 4);
        assert_eq!(f.state.cell("b").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_delete_removes_exactly_the_subtree() {
        let f = fixture();
        let edits = f
            .state
            .build()
            .to_root()
            .apply_as("a", &f.load, json!({"value": 1}))
            .apply_as("b", &f.double, Value::Null)
            .apply_as("d", &f.double, Value::Null)
            .to("a")
            .apply_as("c", &f.double, Value::Null)
            .build()
            .unwrap();
        f.state.submit(edits).await.unwrap();

        let report = f
            .state
            .submit(f.state.build().delete("b").build().unwrap())
            .await
            .unwrap();

        assert_eq!(report.removed, vec!["b", "d"]);
        assert!(f.state.cell("b").is_none());
        assert!(f.state.cell("d").is_none());
        assert_eq!(f.value("c"), Some(2.0));
        let refs: Vec<String> = f.state.cells().into_iter().map(|c| c.cell_ref).collect();
        assert_eq!(refs, vec![ROOT_REF, "a", "c"]);
    }

    #[tokio::test]
    async fn test_error_is_sticky_until_parent_recovers() {
        let f = fixture();
        let edits = f
            .state
            .build()
            .to_root()
            .apply_as("a", &f.load, json!({"value": 1}))
            .apply_as("x", &f.fail, Value::Null)
            .apply_as("y", &f.double, Value::Null)
            .build()
            .unwrap();
        f.state.submit(edits).await.unwrap();

        assert_eq!(f.status("x"), CellStatus::Error);
        assert_eq!(f.status("y"), CellStatus::Error);
        assert_eq!(f.calls(), 0);
        let reason = f.state.cell("y").unwrap().error.unwrap();
        assert!(reason.contains("'x'"), "{}", reason);

        // Recomputing the parent alone does not help
        let edits = f.state.build().update("a", json!({"value": 2})).build().unwrap();
        f.state.submit(edits).await.unwrap();
        assert_eq!(f.status("y"), CellStatus::Error);
        assert_eq!(f.calls(), 0);

        // Redefining the failing cell does
        let edits = f
            .state
            .build()
            .to("a")
            .apply_as("x", &f.double, Value::Null)
            .build()
            .unwrap();
        let report = f.state.submit(edits).await.unwrap();
        assert!(report.is_success());
        assert_eq!(f.value("x"), Some(4.0));
        assert_eq!(f.value("y"), Some(8.0));
    }

    #[tokio::test]
    async fn test_structural_error_changes_nothing() {
        let f = fixture();
        f.load_and_double().await;
        let before = f.state.tree();

        let edits = f
            .state
            .build()
            .to("missing")
            .apply_as("z", &f.double, Value::Null)
            .build()
            .unwrap();
        assert!(f.state.submit(edits).await.is_err());

        let after = f.state.tree();
        assert_eq!(before.topological_order(), after.topological_order());
        assert!(f.state.cell("z").is_none());
    }

    #[tokio::test]
    async fn test_unregistered_transformer_is_a_cell_error() {
        let f = fixture();
        let stranger = Transformer::from_fn(
            TransformerMetadata::new("stranger", NUMBER),
            ParamSchema::new(),
            |_, _| Ok(StateObject::new(NUMBER, "s", 0.0_f64)),
        );
        let edits = f
            .state
            .build()
            .to_root()
            .apply_as("s", &stranger, Value::Null)
            .build()
            .unwrap();
        let report = f.state.submit(edits).await.unwrap();
        assert!(report.failure("s").unwrap().reason.contains("not registered"));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_a_cell_error() {
        let f = fixture();
        let edits = f
            .state
            .build()
            .to_root()
            .apply_as("b", &f.double, Value::Null)
            .build()
            .unwrap();
        let report = f.state.submit(edits).await.unwrap();
        assert!(report.failure("b").unwrap().reason.contains("does not accept"));
        assert_eq!(f.calls(), 0);
    }

    #[tokio::test]
    async fn test_panicking_body_keeps_last_value() {
        let f = fixture();
        f.load_and_double().await;

        let edits = f
            .state
            .build()
            .update("b", json!({"factor": 3, "explode": true}))
            .build()
            .unwrap();
        let report = f.state.submit(edits).await.unwrap();

        assert!(report.failure("b").unwrap().reason.contains("panicked"));
        assert_eq!(f.status("b"), CellStatus::Error);
        assert_eq!(f.value("b"), Some(30.0));
    }

    /// Holds while `hold` is set, checking for cancellation between waits
    struct Gate {
        started: Arc<Notify>,
        hold: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TransformBody for Gate {
        async fn apply(&self, input: &StateObject, _: &ParamValues, ctx: &RuntimeContext) -> Result<StateObject> {
            self.started.notify_one();
            let x = *input.try_data::<f64>()?;
            while self.hold.load(Ordering::SeqCst) {
                ctx.checkpoint("Waiting").await?;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            ctx.checkpoint("Released").await?;
            Ok(StateObject::new(NUMBER, "Gated", x))
        }
    }

    fn gated() -> (Fixture, Arc<Transformer>, Arc<Notify>, Arc<AtomicBool>) {
        let started = Arc::new(Notify::new());
        let hold = Arc::new(AtomicBool::new(true));
        let gate = Transformer::create(
            TransformerMetadata::new("gate", NUMBER).from(&[NUMBER]),
            Gate {
                started: started.clone(),
                hold: hold.clone(),
            },
        );
        let registered = gate.clone();
        let f = fixture_with(move |r| r.register_transformer(registered).unwrap());
        (f, gate, started, hold)
    }

    #[tokio::test]
    async fn test_cancel_returns_cells_to_pending() {
        let (f, gate, started, hold) = gated();
        f.load_and_double().await;

        let edits = f
            .state
            .build()
            .to("b")
            .apply_as("g", &gate, Value::Null)
            .apply_as("h", &f.double, Value::Null)
            .build()
            .unwrap();
        let (report, _) = tokio::join!(f.state.submit(edits), async {
            started.notified().await;
            f.state.cancel();
        });
        let report = report.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.pending, vec!["g", "h"]);
        assert!(report.failed.is_empty());
        assert_eq!(f.status("g"), CellStatus::Pending);
        assert_eq!(f.status("h"), CellStatus::Pending);
        assert_eq!(f.value("b"), Some(30.0));

        // A refresh completes the interrupted work
        hold.store(false, Ordering::SeqCst);
        let report = f
            .state
            .submit(f.state.build().refresh("g").build().unwrap())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(f.value("g"), Some(30.0));
        assert_eq!(f.value("h"), Some(60.0));
    }

    #[tokio::test]
    async fn test_deadline_via_cancel() {
        let (f, gate, _started, _hold) = gated();
        f.load_and_double().await;

        let edits = f
            .state
            .build()
            .to("a")
            .apply_as("g", &gate, Value::Null)
            .build()
            .unwrap();
        let (report, _) = tokio::join!(f.state.submit(edits), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.state.cancel();
        });

        let report = report.unwrap();
        assert!(report.cancelled);
        assert_eq!(f.status("g"), CellStatus::Pending);
        assert_eq!(f.status("b"), CellStatus::Ok);
    }

    #[tokio::test]
    async fn test_watcher_sees_commit() {
        let f = fixture();
        let mut watcher = f.state.watch("b");
        f.load_and_double().await;

        let mut events = Vec::new();
        while let Some(event) = watcher.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&StateEvent::CellCreated {
            cell_ref: "b".to_string()
        }));
        assert!(events.contains(&StateEvent::CellCommitted {
            cell_ref: "b".to_string(),
            version: 1
        }));
        assert!(events.iter().all(|e| e.cell_ref() == Some("b")));
    }

    #[tokio::test]
    async fn test_host_sink_gets_update_lifecycle() {
        let sink = Arc::new(VecEventSink::new());
        let f = fixture();
        let state = f.state.with_event_sink(sink.clone());
        let edits = state
            .build()
            .to_root()
            .apply_as("a", &f.load, json!({"value": 1}))
            .build()
            .unwrap();
        state.submit(edits).await.unwrap();

        let events = sink.events();
        assert!(matches!(events.first(), Some(StateEvent::UpdateStarted { .. })));
        assert!(matches!(events.get(1), Some(StateEvent::CellCreated { .. })));
        assert!(matches!(
            events.last(),
            Some(StateEvent::UpdateFinished { success: true, .. })
        ));
        let started = events
            .iter()
            .filter(|e| matches!(e, StateEvent::UpdateStarted { .. }))
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_transformer_action_applies_and_submits() {
        let f = fixture();
        f.load_and_double().await;

        let actions = f.state.applicable_actions("a").unwrap();
        let names: Vec<&str> = actions
            .iter()
            .filter_map(|a| a.display().map(|d| d.name.as_str()))
            .collect();
        assert_eq!(names, vec!["Double"]);

        let output = f
            .state
            .apply_action(&actions[0].instance(json!({"factor": 5})), "a")
            .await
            .unwrap();
        let ActionOutput::Update(report) = output else {
            panic!("Expected an update report");
        };
        assert_eq!(report.updated.len(), 1);
        assert_eq!(f.value(&report.updated[0]), Some(50.0));
        assert_eq!(f.state.tree().parent(&report.updated[0]), Some("a"));
    }

    #[tokio::test]
    async fn test_action_rejects_bad_target_and_params() {
        let f = fixture();
        f.load_and_double().await;
        let action = Action::from_transformer(&f.double);

        let err = f
            .state
            .apply_action(&action.instance(Value::Null), ROOT_REF)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Validation(ValidationError::KindMismatch { .. })
        ));

        let err = f
            .state
            .apply_action(&action.instance(json!({"factor": 11})), "a")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Validation(ValidationError::OutOfRange { .. })
        ));
        assert_eq!(f.state.tree().len(), 2);

        let err = f
            .state
            .apply_action(&action.instance(Value::Null), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownRef(_)));
    }

    #[tokio::test]
    async fn test_closure_action_edit_is_submitted() {
        let f = fixture();
        f.load_and_double().await;
        let prune = Action::build(&[NUMBER])
            .with_display(ActionDisplay::new("Prune"))
            .with_applicable(|obj, _| obj.label() == "Doubled")
            .define(|ctx| {
                Ok(ActionOutput::Edit(
                    StateBuilder::new().delete(ctx.target).build()?,
                ))
            });

        let err = f
            .state
            .apply_action(&prune.instance(Value::Null), "a")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Validation(ValidationError::NotApplicable { .. })
        ));

        let output = f
            .state
            .apply_action(&prune.instance(Value::Null), "b")
            .await
            .unwrap();
        assert!(matches!(output, ActionOutput::Update(ref r) if r.removed == vec!["b"]));
        assert!(f.state.cell("b").is_none());
    }

    #[tokio::test]
    async fn test_schema_lookups_use_current_value() {
        let f = fixture();
        f.load_and_double().await;

        let schema = f.state.transformer_schema("a", &f.double).unwrap();
        assert!(schema.get("factor").is_some());
        let action = Action::from_transformer(&f.double);
        assert_eq!(f.state.action_schema("b", &action).unwrap().len(), 2);

        let ids: Vec<String> = f
            .state
            .applicable_transformers("b")
            .unwrap()
            .iter()
            .map(|t| t.id().to_string())
            .collect();
        assert_eq!(ids, vec!["double", "fail"]);
    }

    #[test]
    fn test_sequential_config_runs_siblings_in_order() {
        let f = fixture();
        let state = f.state.with_config(EngineConfig::sequential());
        let edits = state
            .build()
            .to_root()
            .apply_as("a", &f.load, json!({"value": 1}))
            .apply_as("b", &f.double, Value::Null)
            .to("a")
            .apply_as("c", &f.double, Value::Null)
            .build()
            .unwrap();
        let report = tokio_test::block_on(state.submit(edits)).unwrap();
        assert_eq!(report.updated, vec!["a", "b", "c"]);
    }
}
