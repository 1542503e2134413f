//! 降级模式下的进程内任务记录
//!
//! 只记录，不执行：没有 worker 会消费这里的任务。

use std::collections::HashSet;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::queue::job::{Job, JobSpec, JobStatus, QueueCounts};

#[derive(Debug, Default)]
struct FallbackState {
    jobs: Vec<Job>,
    paused: HashSet<String>,
}

/// 进程内任务列表
#[derive(Debug, Default)]
pub struct FallbackStore {
    state: Mutex<FallbackState>,
}

impl FallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录任务，相同 id 只保留第一次
    pub fn record(&self, queue: &str, payload: JsonValue, spec: &JobSpec) -> Job {
        let mut state = self.state.lock();
        if let Some(existing) = state.jobs.iter().find(|j| j.id == spec.id) {
            return existing.clone();
        }
        let job = Job::new(spec, queue, payload);
        state.jobs.push(job.clone());
        job
    }

    /// 记录的任务都处于等待（或延迟）状态
    pub fn counts(&self, queue: &str) -> QueueCounts {
        let state = self.state.lock();
        let mut counts = QueueCounts::default();
        for job in state.jobs.iter().filter(|j| j.queue == queue) {
            match job.status {
                JobStatus::Delayed => counts.delayed += 1,
                _ => counts.waiting += 1,
            }
        }
        counts
    }

    pub fn jobs(&self, queue: &str) -> Vec<Job> {
        self.state
            .lock()
            .jobs
            .iter()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect()
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.state.lock().jobs.iter().find(|j| j.id == job_id).cloned()
    }

    pub fn set_paused(&self, queue: &str, paused: bool) {
        let mut state = self.state.lock();
        if paused {
            state.paused.insert(queue.to_string());
        } else {
            state.paused.remove(queue);
        }
    }

    pub fn is_paused(&self, queue: &str) -> bool {
        self.state.lock().paused.contains(queue)
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(id: &str, delay: Duration) -> JobSpec {
        JobSpec {
            id: id.into(),
            attempts: 3,
            backoff: Duration::from_secs(5),
            delay,
            keep_completed: 10,
            keep_failed: 10,
        }
    }

    #[test]
    fn test_records_without_executing() {
        let store = FallbackStore::new();
        store.record("entry", JsonValue::Null, &spec("a", Duration::ZERO));
        store.record("entry", JsonValue::Null, &spec("a", Duration::ZERO));
        store.record("entry", JsonValue::Null, &spec("b", Duration::from_secs(1)));
        store.record("discovery", JsonValue::Null, &spec("c", Duration::ZERO));

        let counts = store.counts("entry");
        assert_eq!((counts.waiting, counts.delayed, counts.active), (1, 1, 0));
        assert_eq!(store.len(), 3);
        assert_eq!(store.jobs("discovery").len(), 1);
    }

    #[test]
    fn test_pause_flags_per_queue() {
        let store = FallbackStore::new();
        store.set_paused("entry", true);
        assert!(store.is_paused("entry"));
        assert!(!store.is_paused("discovery"));
        store.set_paused("entry", false);
        assert!(!store.is_paused("entry"));
    }
}
