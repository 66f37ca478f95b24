// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded-parallel task dispatch (C10): fans a batch of sub-agent tasks out
//! over the [`Runner`], capping concurrency with a semaphore the way
//! `sven_tools::Executor` caps its own in-flight audit writes, and notifies a
//! [`UIBroadcaster`] of lifecycle events.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::runner::Runner;
use crate::types::{AgentResult, AgentType};

/// UI notification hook for coordinator-dispatched tasks. All methods are
/// no-ops by default so a caller only overrides what it needs, mirroring
/// `sven_tools::ExecutorCallbacks`.
pub trait UIBroadcaster: Send + Sync {
    fn task_started(&self, task_id: &str, agent_type: &AgentType) {
        let _ = (task_id, agent_type);
    }
    fn task_progress(&self, task_id: &str, description: &str) {
        let _ = (task_id, description);
    }
    fn task_completed(&self, task_id: &str, result: &AgentResult) {
        let _ = (task_id, result);
    }
}

/// A [`UIBroadcaster`] that does nothing, for callers with no UI to drive.
pub struct NullBroadcaster;
impl UIBroadcaster for NullBroadcaster {}

/// One unit of work dispatched through [`Coordinator::run_batch`].
pub struct CoordinatorTask {
    pub task_id: String,
    pub agent_type: AgentType,
    pub prompt: String,
    pub max_turns: Option<u32>,
}

/// Dispatches a batch of [`CoordinatorTask`]s over a shared [`Runner`], never
/// running more than `max_parallel` at once.
pub struct Coordinator {
    runner: Arc<Runner>,
    semaphore: Arc<Semaphore>,
    broadcaster: Arc<dyn UIBroadcaster>,
    dispatched: AtomicU64,
}

impl Coordinator {
    pub fn new(runner: Arc<Runner>, max_parallel: usize, broadcaster: Arc<dyn UIBroadcaster>) -> Self {
        Self {
            runner,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            broadcaster,
            dispatched: AtomicU64::new(0),
        }
    }

    /// Run every task in `tasks` concurrently, bounded by `max_parallel`, and
    /// return results in the same order as the input (not completion order).
    pub async fn run_batch(&self, tasks: Vec<CoordinatorTask>) -> Vec<AgentResult> {
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let semaphore = Arc::clone(&self.semaphore);
            let runner = Arc::clone(&self.runner);
            let broadcaster = Arc::clone(&self.broadcaster);
            self.dispatched.fetch_add(1, Ordering::Relaxed);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("coordinator semaphore never closes");
                broadcaster.task_started(&task.task_id, &task.agent_type);
                debug!(task_id = %task.task_id, agent_type = %task.agent_type, "coordinator: dispatching task");

                let result = runner
                    .run_to_completion(task.agent_type.clone(), task.prompt, task.max_turns)
                    .await;

                broadcaster.task_completed(&task.task_id, &result);
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(AgentResult {
                    agent_id: String::new(),
                    agent_type: AgentType::General,
                    status: crate::types::AgentStatus::Failed,
                    output: String::new(),
                    error: Some(format!("coordinator task panicked: {e}")),
                    duration: std::time::Duration::ZERO,
                    completed: true,
                    tool_usage: Vec::new(),
                    completed_at: chrono::Utc::now(),
                }),
            }
        }
        results
    }

    /// Number of tasks dispatched over this coordinator's lifetime.
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Concurrency permits not currently held by a running task.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentStatus;
    use sven_config::Config;
    use sven_model::MockProvider;
    use std::sync::Mutex as StdMutex;

    fn test_runner() -> Arc<Runner> {
        let model: Arc<dyn sven_model::ModelProvider> = Arc::new(MockProvider::default());
        Arc::new(Runner::new(model, Arc::new(Config::default())))
    }

    struct RecordingBroadcaster {
        started: StdMutex<Vec<String>>,
        completed: StdMutex<Vec<String>>,
    }

    impl RecordingBroadcaster {
        fn new() -> Self {
            Self {
                started: StdMutex::new(Vec::new()),
                completed: StdMutex::new(Vec::new()),
            }
        }
    }

    impl UIBroadcaster for RecordingBroadcaster {
        fn task_started(&self, task_id: &str, _agent_type: &AgentType) {
            self.started.lock().unwrap().push(task_id.to_string());
        }
        fn task_completed(&self, task_id: &str, _result: &AgentResult) {
            self.completed.lock().unwrap().push(task_id.to_string());
        }
    }

    #[tokio::test]
    async fn run_batch_completes_every_task_in_order() {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let coordinator = Coordinator::new(test_runner(), 2, broadcaster.clone());

        let tasks = vec![
            CoordinatorTask {
                task_id: "t1".into(),
                agent_type: AgentType::General,
                prompt: "first".into(),
                max_turns: Some(1),
            },
            CoordinatorTask {
                task_id: "t2".into(),
                agent_type: AgentType::Explore,
                prompt: "second".into(),
                max_turns: Some(1),
            },
        ];

        let results = coordinator.run_batch(tasks).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == AgentStatus::Completed));
        assert_eq!(broadcaster.started.lock().unwrap().len(), 2);
        assert_eq!(broadcaster.completed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dispatched_count_tracks_every_submission() {
        let coordinator = Coordinator::new(test_runner(), 4, Arc::new(NullBroadcaster));
        coordinator
            .run_batch(vec![CoordinatorTask {
                task_id: "only".into(),
                agent_type: AgentType::General,
                prompt: "go".into(),
                max_turns: Some(1),
            }])
            .await;
        assert_eq!(coordinator.dispatched_count(), 1);
    }

    #[tokio::test]
    async fn max_parallel_of_one_still_completes_all() {
        let coordinator = Coordinator::new(test_runner(), 1, Arc::new(NullBroadcaster));
        let tasks = (0..3)
            .map(|i| CoordinatorTask {
                task_id: format!("t{i}"),
                agent_type: AgentType::Explore,
                prompt: format!("task {i}"),
                max_turns: Some(1),
            })
            .collect();
        let results = coordinator.run_batch(tasks).await;
        assert_eq!(results.len(), 3);
    }
}
