use std::fs;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use scenic_core::{GraphError, TaskGraph, TaskSpec, TaskStatus};

#[test]
fn failing_upstream_never_creates_downstream_target() {
    for workers in [0, 1, 4] {
        let dir = tempfile::tempdir().unwrap();
        let graph = TaskGraph::new(dir.path().join("tokens"), workers).unwrap();
        let b_target = dir.path().join("b.out");

        let a = graph
            .add_task(TaskSpec::new("A", "explode"), || Err::<(), _>(io::Error::other("A exploded")))
            .unwrap();
        let path = b_target.clone();
        let b = graph
            .add_task(TaskSpec::new("B", "write").targets([&b_target]).depends_on([a]), move || {
                fs::write(&path, b"never")
            })
            .unwrap();

        let err = graph.join_all().unwrap_err();
        assert!(matches!(err, GraphError::TaskFailed { ref task, .. } if task == "A"), "{err}");
        assert_eq!(graph.status(a), Some(TaskStatus::Failed));
        assert_eq!(graph.status(b), Some(TaskStatus::Cancelled));
        assert!(!b_target.exists(), "B ran with {workers} workers");
    }
}

#[test]
fn diamond_runs_each_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let graph = TaskGraph::new(dir.path().join("tokens"), 3).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let task = |name: &str, deps: Vec<scenic_core::TaskHandle>| {
        let r = Arc::clone(&runs);
        graph
            .add_task(TaskSpec::new(name, "count").depends_on(deps), move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok::<(), io::Error>(())
            })
            .unwrap()
    };
    let top = task("top", vec![]);
    let left = task("left", vec![top]);
    let right = task("right", vec![top]);
    let bottom = task("bottom", vec![left, right]);

    graph.join(bottom).unwrap();
    graph.join_all().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(graph.summary().done, 4);
}

#[test]
fn sync_join_only_runs_what_it_needs() {
    let dir = tempfile::tempdir().unwrap();
    let graph = TaskGraph::new(dir.path().join("tokens"), 0).unwrap();
    let a = graph.add_task(TaskSpec::new("a", "noop"), || Ok::<(), io::Error>(())).unwrap();
    let unrelated = graph.add_task(TaskSpec::new("b", "noop"), || Ok::<(), io::Error>(())).unwrap();

    graph.join(a).unwrap();
    assert_eq!(graph.status(a), Some(TaskStatus::Done));
    assert_eq!(graph.status(unrelated), Some(TaskStatus::Pending));
    graph.join_all().unwrap();
    assert_eq!(graph.status(unrelated), Some(TaskStatus::Done));
}
