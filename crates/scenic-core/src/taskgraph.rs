//! Dependency-driven task scheduler with on-disk memoization.
//!
//! A [`TaskGraph`] owns a DAG of named tasks. Each task declares the files it
//! produces, the files it reads, and the tasks it waits on. Before a task body
//! runs, the scheduler compares the task's fingerprint against the completion
//! token left by an earlier run; a match with every target still on disk
//! skips the body.
//!
//! With zero workers nothing runs until [`TaskGraph::join`] or
//! [`TaskGraph::join_all`], which walk the graph in topological order on the
//! calling thread. With `n > 0` workers, tasks are dispatched to a `rayon`
//! pool as soon as their dependencies succeed.
//!
//! A failing task marks every transitive dependent `Cancelled`; those bodies
//! never run. The failure surfaces at every join that depends on it.
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::{Condvar, Mutex};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BoxError, GraphError, SharedError};

type TaskBody = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

// ── Task description ──────────────────────────────────────────────────────────

/// Handle returned by [`TaskGraph::add_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(usize);

/// Everything the scheduler knows about a task besides its body.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// Unique, run-stable task name.
    pub name: String,
    /// Identifier of the operation the body performs.
    pub operation: String,
    /// Arguments that determine the body's output, as JSON.
    pub args: serde_json::Value,
    /// Files the task is responsible for producing.
    pub targets: Vec<PathBuf>,
    /// Files whose content feeds the task's fingerprint.
    pub inputs: Vec<PathBuf>,
    pub dependencies: Vec<TaskHandle>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self { name: name.into(), operation: operation.into(), ..Self::default() }
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn targets<I, P>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.targets.extend(targets.into_iter().map(Into::into));
        self
    }

    pub fn inputs<I, P>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn depends_on(mut self, handles: impl IntoIterator<Item = TaskHandle>) -> Self {
        self.dependencies.extend(handles);
        self
    }

    /// SHA-256 over the operation, the arguments and the target paths.
    /// `serde_json` maps serialize with sorted keys, so equal arguments hash
    /// equally across runs.
    pub fn identity(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.operation.as_bytes());
        h.update([0u8]);
        h.update(self.args.to_string().as_bytes());
        for t in &self.targets {
            h.update([0u8]);
            h.update(t.to_string_lossy().as_bytes());
        }
        hex::encode(h.finalize())
    }
}

/// Identity extended with the path, size and modification time of every
/// input, computed right before the body would run.
fn fingerprint(identity: &str, inputs: &[PathBuf]) -> String {
    let mut h = Sha256::new();
    h.update(identity.as_bytes());
    for input in inputs {
        h.update([0u8]);
        h.update(input.to_string_lossy().as_bytes());
        match fs::metadata(input) {
            Ok(meta) => {
                h.update(meta.len().to_le_bytes());
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                h.update(mtime.to_le_bytes());
            }
            Err(_) => h.update(b"missing"),
        }
    }
    hex::encode(h.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting on dependencies or on a join.
    Pending,
    /// Dispatched to a worker or executing.
    Running,
    /// Body ran and produced every target.
    Done,
    /// Completion token matched; body not run.
    Skipped,
    Failed,
    /// An upstream task failed; body never runs.
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Skipped)
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

// ── Completion tokens ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Token {
    task: String,
    fingerprint: String,
    targets: Vec<PathBuf>,
}

/// Directory of per-task completion tokens. Each task only ever writes its
/// own token, and writes go through a temp file and a rename, so concurrent
/// workers never see a partial token.
#[derive(Debug)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, GraphError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| token_error(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn token_path(&self, task: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(Sha256::digest(task.as_bytes()))))
    }

    /// The stored token matches `fingerprint` and every target exists.
    pub fn is_current(&self, task: &str, fingerprint: &str, targets: &[PathBuf]) -> bool {
        let Ok(bytes) = fs::read(self.token_path(task)) else {
            return false;
        };
        let Ok(token) = serde_json::from_slice::<Token>(&bytes) else {
            return false;
        };
        token.task == task
            && token.fingerprint == fingerprint
            && token.targets == targets
            && targets.iter().all(|t| t.exists())
    }

    pub fn record(&self, task: &str, fingerprint: &str, targets: &[PathBuf]) -> Result<(), GraphError> {
        let token = Token {
            task: task.to_string(),
            fingerprint: fingerprint.to_string(),
            targets: targets.to_vec(),
        };
        let path = self.token_path(task);
        let write = || -> io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            serde_json::to_writer(&mut tmp, &token)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| token_error(&path, e))
    }

    pub fn clear(&self, task: &str) -> Result<(), GraphError> {
        let path = self.token_path(task);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(token_error(&path, e)),
            _ => Ok(()),
        }
    }
}

fn token_error(path: &Path, e: io::Error) -> GraphError {
    GraphError::TokenStore { path: path.to_path_buf(), source: Arc::new(e) }
}

// ── Graph state ───────────────────────────────────────────────────────────────

struct TaskEntry {
    spec: TaskSpec,
    identity: String,
    body: Option<TaskBody>,
    status: TaskStatus,
    error: Option<GraphError>,
}

#[derive(Default)]
struct GraphState {
    tasks: Vec<TaskEntry>,
    /// Edge `a → b` means `b` waits on `a`.
    dag: DiGraphMap<usize, ()>,
    by_name: HashMap<String, usize>,
    by_target: HashMap<PathBuf, usize>,
    /// Tasks handed to the pool that have not settled yet.
    queued: usize,
}

impl GraphState {
    fn deps_succeeded(&self, idx: usize) -> bool {
        self.dag
            .neighbors_directed(idx, Direction::Incoming)
            .all(|d| self.tasks[d].status.is_success())
    }

    /// First dependency that failed or was cancelled.
    fn failed_dep(&self, idx: usize) -> Option<usize> {
        self.dag
            .neighbors_directed(idx, Direction::Incoming)
            .find(|&d| matches!(self.tasks[d].status, TaskStatus::Failed | TaskStatus::Cancelled))
    }

    /// Cancel `idx`, naming the task whose failure started the cascade.
    fn cancel(&mut self, idx: usize, upstream: usize) {
        let upstream = match &self.tasks[upstream].error {
            Some(GraphError::UpstreamFailed { upstream, .. }) => upstream.clone(),
            _ => self.tasks[upstream].spec.name.clone(),
        };
        let entry = &mut self.tasks[idx];
        entry.status = TaskStatus::Cancelled;
        entry.body = None;
        entry.error = Some(GraphError::UpstreamFailed { task: entry.spec.name.clone(), upstream });
    }

    /// Cancel every pending task reachable from `failed`.
    fn cancel_dependents(&mut self, failed: usize) {
        let mut dfs = Dfs::new(&self.dag, failed);
        let mut reached = Vec::new();
        while let Some(n) = dfs.next(&self.dag) {
            if n != failed && self.tasks[n].status == TaskStatus::Pending {
                reached.push(n);
            }
        }
        for n in reached {
            tracing::warn!("cancelling `{}`: upstream `{}` failed", self.tasks[n].spec.name, self.tasks[failed].spec.name);
            self.cancel(n, failed);
        }
    }

    /// Pending dependents of `idx` whose dependencies have all succeeded,
    /// marked running.
    fn claim_ready_dependents(&mut self, idx: usize) -> Vec<usize> {
        let candidates: Vec<usize> = self.dag.neighbors_directed(idx, Direction::Outgoing).collect();
        let mut ready = Vec::new();
        for n in candidates {
            if self.tasks[n].status == TaskStatus::Pending && self.deps_succeeded(n) {
                self.tasks[n].status = TaskStatus::Running;
                ready.push(n);
            }
        }
        ready
    }

    /// Topological order of `roots` and everything they depend on.
    fn plan(&self, roots: &[usize]) -> Vec<usize> {
        let reversed = Reversed(&self.dag);
        let mut needed = HashSet::new();
        for &root in roots {
            let mut dfs = Dfs::new(reversed, root);
            while let Some(n) = dfs.next(reversed) {
                needed.insert(n);
            }
        }
        // Dependencies must exist before a task is added, so insertion order
        // is already topological if the sort ever fails.
        let order = toposort(&self.dag, None).unwrap_or_else(|_| (0..self.tasks.len()).collect());
        order.into_iter().filter(|n| needed.contains(n)).collect()
    }

    fn result_of(&self, idx: usize) -> Result<(), GraphError> {
        match &self.tasks[idx].error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

struct Shared {
    state: Mutex<GraphState>,
    settled: Condvar,
    tokens: TokenStore,
    pooled: bool,
}

/// What a worker needs to run one task without holding the lock.
struct Job {
    name: String,
    identity: String,
    targets: Vec<PathBuf>,
    inputs: Vec<PathBuf>,
    body: Option<TaskBody>,
}

impl Shared {
    fn take_job(&self, idx: usize) -> Job {
        let mut st = self.state.lock();
        let entry = &mut st.tasks[idx];
        Job {
            name: entry.spec.name.clone(),
            identity: entry.identity.clone(),
            targets: entry.spec.targets.clone(),
            inputs: entry.spec.inputs.clone(),
            body: entry.body.take(),
        }
    }

    fn execute(&self, job: Job) -> Result<TaskStatus, GraphError> {
        let fp = fingerprint(&job.identity, &job.inputs);
        if self.tokens.is_current(&job.name, &fp, &job.targets) {
            tracing::debug!("`{}` is up to date, skipping", job.name);
            return Ok(TaskStatus::Skipped);
        }
        self.tokens.clear(&job.name)?;

        let failed = |source: BoxError| GraphError::TaskFailed {
            task: job.name.clone(),
            source: SharedError::from(source),
        };
        let body = job.body.ok_or_else(|| failed(format!("`{}` has no body to run", job.name).into()))?;
        tracing::info!("running `{}`", job.name);
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(failed(e)),
            Err(payload) => return Err(failed(panic_message(payload).into())),
        }

        if let Some(missing) = job.targets.iter().find(|t| !t.exists()) {
            return Err(GraphError::MissingTarget { task: job.name.clone(), target: missing.clone() });
        }
        self.tokens.record(&job.name, &fp, &job.targets)?;
        Ok(TaskStatus::Done)
    }

    /// Record a task's outcome and claim dependents that became ready.
    fn settle(&self, idx: usize, outcome: Result<TaskStatus, GraphError>) -> Vec<usize> {
        let mut st = self.state.lock();
        match outcome {
            Ok(status) => st.tasks[idx].status = status,
            Err(e) => {
                tracing::error!("{e}");
                st.tasks[idx].status = TaskStatus::Failed;
                st.tasks[idx].error = Some(e);
                st.cancel_dependents(idx);
            }
        }
        let ready = if self.pooled {
            let ready = st.claim_ready_dependents(idx);
            st.queued = st.queued + ready.len() - 1;
            ready
        } else {
            Vec::new()
        };
        drop(st);
        self.settled.notify_all();
        ready
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

/// Pool entry point: run one task, then hand newly ready dependents back to
/// the same pool.
fn worker(shared: Arc<Shared>, idx: usize) {
    let job = shared.take_job(idx);
    let outcome = shared.execute(job);
    for next in shared.settle(idx, outcome) {
        let shared = Arc::clone(&shared);
        rayon::spawn(move || worker(shared, next));
    }
}

// ── TaskGraph ─────────────────────────────────────────────────────────────────

pub struct TaskGraph {
    shared: Arc<Shared>,
    pool: Option<rayon::ThreadPool>,
}

impl TaskGraph {
    /// `n_workers == 0` runs every task synchronously inside `join`.
    pub fn new(token_dir: impl Into<PathBuf>, n_workers: usize) -> Result<Self, GraphError> {
        let tokens = TokenStore::open(token_dir)?;
        let pool = if n_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n_workers)
                .thread_name(|i| format!("taskgraph-{i}"))
                .build()
                .map_err(|e| GraphError::WorkerPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        let shared = Shared {
            state: Mutex::new(GraphState::default()),
            settled: Condvar::new(),
            tokens,
            pooled: pool.is_some(),
        };
        Ok(Self { shared: Arc::new(shared), pool })
    }

    pub fn token_dir(&self) -> &Path {
        self.shared.tokens.dir()
    }

    /// Register a task. Re-adding a task under the same name with the same
    /// identity returns the existing handle.
    pub fn add_task<F, E>(&self, spec: TaskSpec, body: F) -> Result<TaskHandle, GraphError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let identity = spec.identity();
        let mut st = self.shared.state.lock();

        if let Some(&existing) = st.by_name.get(&spec.name) {
            return if st.tasks[existing].identity == identity {
                Ok(TaskHandle(existing))
            } else {
                Err(GraphError::DuplicateTask(spec.name))
            };
        }
        if let Some(dep) = spec.dependencies.iter().find(|d| d.0 >= st.tasks.len()) {
            return Err(GraphError::UnknownTask(dep.0));
        }
        for target in &spec.targets {
            if let Some(&owner) = st.by_target.get(target) {
                return Err(GraphError::TargetConflict {
                    target: target.clone(),
                    owner: st.tasks[owner].spec.name.clone(),
                });
            }
        }

        let idx = st.tasks.len();
        st.dag.add_node(idx);
        for dep in &spec.dependencies {
            st.dag.add_edge(dep.0, idx, ());
        }
        st.by_name.insert(spec.name.clone(), idx);
        for target in &spec.targets {
            st.by_target.insert(target.clone(), idx);
        }
        tracing::debug!("added task `{}` ({} dependencies)", spec.name, spec.dependencies.len());
        let body: TaskBody = Box::new(move || body().map_err(Into::<BoxError>::into));
        st.tasks.push(TaskEntry {
            spec,
            identity,
            body: Some(body),
            status: TaskStatus::Pending,
            error: None,
        });

        if let Some(upstream) = st.failed_dep(idx) {
            st.cancel(idx, upstream);
        } else if let Some(pool) = &self.pool {
            if st.deps_succeeded(idx) {
                st.tasks[idx].status = TaskStatus::Running;
                st.queued += 1;
                let shared = Arc::clone(&self.shared);
                pool.spawn(move || worker(shared, idx));
            }
        }
        Ok(TaskHandle(idx))
    }

    /// Run `roots` and their ancestors on the calling thread.
    fn run_inline(&self, roots: &[usize]) {
        let plan = self.shared.state.lock().plan(roots);
        for idx in plan {
            {
                let mut st = self.shared.state.lock();
                if st.tasks[idx].status != TaskStatus::Pending {
                    continue;
                }
                if let Some(upstream) = st.failed_dep(idx) {
                    st.cancel(idx, upstream);
                    continue;
                }
                st.tasks[idx].status = TaskStatus::Running;
            }
            let job = self.shared.take_job(idx);
            let outcome = self.shared.execute(job);
            self.shared.settle(idx, outcome);
        }
    }

    /// Block until `handle` finishes; its error, or the upstream failure
    /// that cancelled it, is returned.
    pub fn join(&self, handle: TaskHandle) -> Result<(), GraphError> {
        if self.shared.state.lock().tasks.len() <= handle.0 {
            return Err(GraphError::UnknownTask(handle.0));
        }
        if self.pool.is_none() {
            self.run_inline(&[handle.0]);
        }
        let mut st = self.shared.state.lock();
        while !st.tasks[handle.0].status.is_finished() {
            self.shared.settled.wait(&mut st);
        }
        st.result_of(handle.0)
    }

    /// Block until every task finishes. Returns the first failure in
    /// insertion order.
    pub fn join_all(&self) -> Result<(), GraphError> {
        if self.pool.is_none() {
            let all: Vec<usize> = (0..self.shared.state.lock().tasks.len()).collect();
            self.run_inline(&all);
        }
        let mut st = self.shared.state.lock();
        while !st.tasks.iter().all(|t| t.status.is_finished()) {
            self.shared.settled.wait(&mut st);
        }
        (0..st.tasks.len()).try_for_each(|idx| st.result_of(idx))
    }

    pub fn status(&self, handle: TaskHandle) -> Option<TaskStatus> {
        self.shared.state.lock().tasks.get(handle.0).map(|t| t.status)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> GraphSummary {
        let st = self.shared.state.lock();
        let mut s = GraphSummary::default();
        for t in &st.tasks {
            match t.status {
                TaskStatus::Pending => s.pending += 1,
                TaskStatus::Running => s.running += 1,
                TaskStatus::Done => s.done += 1,
                TaskStatus::Skipped => s.skipped += 1,
                TaskStatus::Failed => s.failed += 1,
                TaskStatus::Cancelled => s.cancelled += 1,
            }
        }
        s
    }
}

impl Drop for TaskGraph {
    /// Tasks already handed to the pool are allowed to finish.
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        while st.queued > 0 {
            self.shared.settled.wait(&mut st);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn touch(path: &Path, text: &str) -> io::Result<()> {
        fs::write(path, text)
    }

    #[test]
    fn identity_ignores_arg_key_order() {
        let a = TaskSpec::new("t", "op").args(serde_json::json!({"a": 1, "b": [1, 2]}));
        let b = TaskSpec::new("t", "op").args(serde_json::json!({"b": [1, 2], "a": 1}));
        assert_eq!(a.identity(), b.identity());
        let c = TaskSpec::new("t", "op").args(serde_json::json!({"a": 2, "b": [1, 2]}));
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn sync_graph_runs_lazily_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let g = TaskGraph::new(dir.path().join("tokens"), 0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a_out = dir.path().join("a.txt");
        let l = Arc::clone(&log);
        let p = a_out.clone();
        let a = g
            .add_task(TaskSpec::new("a", "write").targets([&a_out]), move || {
                l.lock().push("a");
                touch(&p, "a")
            })
            .unwrap();
        let b_out = dir.path().join("b.txt");
        let l = Arc::clone(&log);
        let p = b_out.clone();
        let b = g
            .add_task(TaskSpec::new("b", "write").targets([&b_out]).depends_on([a]), move || {
                l.lock().push("b");
                touch(&p, "b")
            })
            .unwrap();

        assert_eq!(g.status(b), Some(TaskStatus::Pending));
        assert!(log.lock().is_empty());
        g.join(b).unwrap();
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert_eq!(g.summary(), GraphSummary { done: 2, ..GraphSummary::default() });
    }

    #[test]
    fn duplicate_names_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        let g = TaskGraph::new(dir.path(), 0).unwrap();
        let out = dir.path().join("x");
        let spec = TaskSpec::new("x", "write").targets([&out]);
        let h1 = g.add_task(spec.clone(), || Ok::<(), io::Error>(())).unwrap();
        let h2 = g.add_task(spec, || Ok::<(), io::Error>(())).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(g.len(), 1);

        let changed = TaskSpec::new("x", "write").args(serde_json::json!(1)).targets([&out]);
        assert!(matches!(g.add_task(changed, || Ok::<(), io::Error>(())), Err(GraphError::DuplicateTask(_))));

        let clash = TaskSpec::new("y", "write").targets([&out]);
        assert!(matches!(
            g.add_task(clash, || Ok::<(), io::Error>(())),
            Err(GraphError::TargetConflict { .. })
        ));

        let dangling = TaskSpec::new("z", "noop").depends_on([TaskHandle(42)]);
        assert!(matches!(g.add_task(dangling, || Ok::<(), io::Error>(())), Err(GraphError::UnknownTask(42))));
    }

    #[test]
    fn failure_cancels_transitive_dependents() {
        for workers in [0, 3] {
            let dir = tempfile::tempdir().unwrap();
            let g = TaskGraph::new(dir.path().join("tokens"), workers).unwrap();
            let ran = Arc::new(AtomicUsize::new(0));

            let a = g
                .add_task(TaskSpec::new("a", "fail"), || Err::<(), _>(io::Error::other("boom")))
                .unwrap();
            let b_out = dir.path().join("b.txt");
            let r = Arc::clone(&ran);
            let p = b_out.clone();
            let b = g
                .add_task(TaskSpec::new("b", "write").targets([&b_out]).depends_on([a]), move || {
                    r.fetch_add(1, Ordering::SeqCst);
                    touch(&p, "b")
                })
                .unwrap();
            let r = Arc::clone(&ran);
            let c = g
                .add_task(TaskSpec::new("c", "noop").depends_on([b]), move || {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), io::Error>(())
                })
                .unwrap();

            let err = g.join_all().unwrap_err();
            assert!(matches!(err, GraphError::TaskFailed { ref task, .. } if task == "a"));
            assert!(matches!(g.join(c), Err(GraphError::UpstreamFailed { ref upstream, .. }) if upstream == "a"));
            assert_eq!(g.status(b), Some(TaskStatus::Cancelled));
            assert_eq!(ran.load(Ordering::SeqCst), 0);
            assert!(!b_out.exists());
        }
    }

    #[test]
    fn task_added_after_failure_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let g = TaskGraph::new(dir.path(), 0).unwrap();
        let a = g.add_task(TaskSpec::new("a", "fail"), || Err::<(), _>(io::Error::other("boom"))).unwrap();
        assert!(g.join(a).is_err());
        let b = g.add_task(TaskSpec::new("b", "noop").depends_on([a]), || Ok::<(), io::Error>(())).unwrap();
        assert_eq!(g.status(b), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn missing_target_and_panic_are_failures() {
        let dir = tempfile::tempdir().unwrap();
        let g = TaskGraph::new(dir.path().join("tokens"), 0).unwrap();
        let lazy = g
            .add_task(TaskSpec::new("lazy", "noop").targets([dir.path().join("never")]), || Ok::<(), io::Error>(()))
            .unwrap();
        assert!(matches!(g.join(lazy), Err(GraphError::MissingTarget { .. })));

        let boom = g
            .add_task(TaskSpec::new("boom", "panic"), || -> Result<(), io::Error> { panic!("kaboom") })
            .unwrap();
        let err = g.join(boom).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(g.status(boom), Some(TaskStatus::Failed));
    }

    #[test]
    fn tokens_skip_unchanged_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = dir.path().join("tokens");
        let input = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        touch(&input, "v1").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let run_once = |args: serde_json::Value| {
            let g = TaskGraph::new(&tokens, 2).unwrap();
            let r = Arc::clone(&runs);
            let p = out.clone();
            let spec = TaskSpec::new("copy", "copy").args(args).inputs([&input]).targets([&out]);
            let h = g
                .add_task(spec, move || {
                    r.fetch_add(1, Ordering::SeqCst);
                    touch(&p, "out")
                })
                .unwrap();
            g.join(h).unwrap();
            g.status(h)
        };

        assert_eq!(run_once(serde_json::json!({"k": 1})), Some(TaskStatus::Done));
        assert_eq!(run_once(serde_json::json!({"k": 1})), Some(TaskStatus::Skipped));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert_eq!(run_once(serde_json::json!({"k": 2})), Some(TaskStatus::Done));
        fs::remove_file(&out).unwrap();
        assert_eq!(run_once(serde_json::json!({"k": 2})), Some(TaskStatus::Done));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn pool_respects_dependencies_under_fan_in() {
        let dir = tempfile::tempdir().unwrap();
        let g = TaskGraph::new(dir.path().join("tokens"), 4).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        let mut leaves = Vec::new();
        for i in 0..16 {
            let f = Arc::clone(&finished);
            let h = g
                .add_task(TaskSpec::new(format!("leaf{i}"), "count"), move || {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), io::Error>(())
                })
                .unwrap();
            leaves.push(h);
        }
        let f = Arc::clone(&finished);
        let sink = g
            .add_task(TaskSpec::new("sink", "check").depends_on(leaves), move || {
                if f.load(Ordering::SeqCst) == 16 {
                    Ok(())
                } else {
                    Err(io::Error::other("sink ran before its dependencies"))
                }
            })
            .unwrap();
        g.join(sink).unwrap();
        g.join_all().unwrap();
        assert_eq!(g.summary().done, 17);
    }
}
