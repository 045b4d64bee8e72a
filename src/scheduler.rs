//! The build scheduler: a bounded-concurrency DAG executor over the build
//! graph, with bail (fail-fast) and continue failure modes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::graph::Graph;

/// Whether the first failed node aborts the whole run, or is absorbed so
/// the rest of the buildable graph still gets a chance to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Bail,
    Continue,
}

#[derive(Debug, Clone)]
pub struct NodeResult {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Final report of one scheduler run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub pruned: usize,
    /// Nodes that were never enqueued because a dependency never became
    /// available, paired with the list of dependencies that were missing.
    /// Diagnostic only.
    pub stuck: Vec<(String, Vec<String>)>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drives `selected` nodes of `graph` to completion via `build_fn`, which
/// is invoked once per node and must itself avoid calling a node's build
/// logic before its dependencies' results are known (the scheduler only
/// guarantees ordering, not cache correctness).
pub async fn run<F, Fut>(
    graph: &Graph,
    selected: &HashSet<String>,
    concurrency: usize,
    mode: FailureMode,
    build_fn: F,
) -> Result<RunReport>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let build_fn = Arc::new(build_fn);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let available: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let enqueued: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let failed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let succeeded: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let pruned = Arc::new(Mutex::new(0usize));

    let (tx, mut rx) = mpsc::unbounded_channel::<NodeResult>();
    let mut active: usize = 0;
    let mut bailed_error: Option<String> = None;

    let is_buildable = |id: &str, avail: &HashSet<String>, graph: &Graph| {
        graph
            .nodes
            .get(id)
            .map(|n| n.deps.iter().all(|d| avail.contains(d) || !selected.contains(d)))
            .unwrap_or(false)
    };

    let mut queue: VecDeque<String> = VecDeque::new();
    {
        let avail = available.lock().await;
        for id in selected {
            if is_buildable(id, &avail, graph) {
                queue.push_back(id.clone());
            }
        }
    }
    {
        let mut enq = enqueued.lock().await;
        for id in &queue {
            enq.insert(id.clone());
        }
    }

    loop {
        while let Some(id) = queue.pop_front() {
            if bailed_error.is_some() {
                break;
            }
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            active += 1;
            let tx = tx.clone();
            let build_fn = build_fn.clone();
            let node_id = id.clone();
            eprintln!("{} {}", "building".cyan(), node_id);
            tokio::spawn(async move {
                let result = build_fn(node_id.clone()).await;
                let node_result = match result {
                    Ok(()) => NodeResult {
                        id: node_id,
                        success: true,
                        error: None,
                    },
                    Err(err) => NodeResult {
                        id: node_id,
                        success: false,
                        error: Some(err.to_string()),
                    },
                };
                let _ = tx.send(node_result);
                drop(permit);
            });
        }

        if active == 0 {
            break;
        }

        let Some(result) = rx.recv().await else {
            break;
        };
        active -= 1;

        if result.success {
            eprintln!("{} {}", "built".green(), result.id);
            available.lock().await.insert(result.id.clone());
            succeeded.lock().await.push(result.id.clone());

            let mut avail = available.lock().await;
            let mut enq = enqueued.lock().await;
            for dependent in graph.dependents_of(&result.id) {
                if selected.contains(dependent)
                    && !enq.contains(dependent)
                    && is_buildable(dependent, &avail, graph)
                {
                    enq.insert(dependent.clone());
                    queue.push_back(dependent.clone());
                }
            }
            drop(avail);
            drop(enq);
        } else {
            eprintln!("{} {}: {}", "failed".red(), result.id, result.error.clone().unwrap_or_default());
            failed.lock().await.insert(result.id.clone());

            match mode {
                FailureMode::Bail => {
                    bailed_error = result.error.clone();
                }
                FailureMode::Continue => {
                    let reachable = graph.outgoing_closure(&[result.id.clone()]);
                    let mut enq = enqueued.lock().await;
                    let mut pruned_count = pruned.lock().await;
                    for id in reachable {
                        if id != result.id && enq.insert(id) {
                            *pruned_count += 1;
                        }
                    }
                }
            }
        }

        if active == 0 && queue.is_empty() {
            break;
        }
    }

    if let Some(error) = bailed_error {
        anyhow::bail!(error);
    }

    let enq = enqueued.lock().await;
    let mut stuck = Vec::new();
    if enq.len() < selected.len() {
        let avail = available.lock().await;
        for id in selected {
            if !enq.contains(id) {
                let node = graph.nodes.get(id);
                let missing = node
                    .map(|n| {
                        n.deps
                            .iter()
                            .filter(|d| selected.contains(*d) && !avail.contains(*d))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                stuck.push((id.clone(), missing));
            }
        }
    }

    Ok(RunReport {
        succeeded: succeeded.lock().await.clone(),
        failed: failed.lock().await.iter().cloned().collect(),
        pruned: *pruned.lock().await,
        stuck,
    })
}

/// Default per-resource concurrency when the CLI flag is not given.
pub fn default_concurrency() -> usize {
    4
}
