//! Bounded, append-only history of oneshot/scheduled executions. Evicts by
//! whichever of `max_entries`/`max_age` trims more, and never mutates on read.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone)]
pub struct OneshotExecution {
    pub id: u64,
    pub process_name: String,
    pub instance_id: String,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub error_text: Option<String>,
    pub duration: Duration,
    pub trigger_type: TriggerType,
}

pub struct OneshotHistory {
    max_entries: usize,
    max_age: Duration,
    next_id: Mutex<u64>,
    entries: Mutex<VecDeque<OneshotExecution>>,
}

impl OneshotHistory {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_age,
            next_id: Mutex::new(0),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends one execution record, assigning it the next id, then evicts
    /// whichever of the two bounds removes more entries.
    pub fn record(&self, mut execution: OneshotExecution) -> u64 {
        let id = {
            let mut next_id = self.next_id.lock().unwrap_or_else(|p| p.into_inner());
            let id = *next_id;
            *next_id += 1;
            id
        };
        execution.id = id;

        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push_front(execution);

        while entries.len() > self.max_entries {
            entries.pop_back();
        }
        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        while matches!(entries.back(), Some(e) if e.finished_at < cutoff) {
            entries.pop_back();
        }

        id
    }

    /// Newest-first executions for one process, most recent first.
    pub fn for_process(&self, process_name: &str) -> Vec<OneshotExecution> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.process_name == process_name)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<OneshotExecution> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(process_name: &str, finished_at: SystemTime) -> OneshotExecution {
        OneshotExecution {
            id: 0,
            process_name: process_name.to_string(),
            instance_id: format!("{process_name}-0"),
            started_at: finished_at - Duration::from_secs(1),
            finished_at,
            exit_code: Some(0),
            success: true,
            error_text: None,
            duration: Duration::from_secs(1),
            trigger_type: TriggerType::Scheduled,
        }
    }

    #[test]
    fn newest_first_and_ids_increase() {
        let history = OneshotHistory::new(10, Duration::from_secs(3600));
        let now = SystemTime::now();
        history.record(execution("job", now));
        history.record(execution("job", now + Duration::from_secs(1)));

        let all = history.all();
        assert_eq!(all.len(), 2);
        assert!(all[0].id > all[1].id);
    }

    #[test]
    fn evicts_beyond_max_entries() {
        let history = OneshotHistory::new(2, Duration::from_secs(3600));
        let now = SystemTime::now();
        for i in 0..5 {
            history.record(execution("job", now + Duration::from_secs(i)));
        }
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn evicts_beyond_max_age() {
        let history = OneshotHistory::new(100, Duration::from_secs(5));
        let now = SystemTime::now();
        history.record(execution("job", now - Duration::from_secs(3600)));
        history.record(execution("job", now));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn for_process_filters_by_name() {
        let history = OneshotHistory::new(10, Duration::from_secs(3600));
        let now = SystemTime::now();
        history.record(execution("a", now));
        history.record(execution("b", now));
        assert_eq!(history.for_process("a").len(), 1);
    }
}
