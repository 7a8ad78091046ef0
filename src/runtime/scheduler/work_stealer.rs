//! Work stealing across the sub-regions of a domain.
//!
//! Every worker has a home sub-region. It drains its home queue first and
//! otherwise steals from the other sub-regions' queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use super::queue::TaskQueue;
use super::task::Task;

/// Statistics about work stealing operations.
#[derive(Debug, Default)]
pub struct StealStats {
    /// Number of successful steals.
    pub steal_successes: AtomicUsize,
    /// Number of failed steal attempts.
    pub steal_failures: AtomicUsize,
    /// Total number of steal attempts.
    pub total_attempts: AtomicUsize,
    /// Total tasks stolen.
    pub tasks_stolen: AtomicUsize,
}

impl StealStats {
    /// Record a successful steal.
    #[inline]
    pub fn record_success(
        &self,
        count: usize,
    ) {
        self.steal_successes.fetch_add(1, Ordering::SeqCst);
        self.tasks_stolen.fetch_add(count, Ordering::SeqCst);
        self.total_attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a failed steal attempt.
    #[inline]
    pub fn record_failure(&self) {
        self.steal_failures.fetch_add(1, Ordering::SeqCst);
        self.total_attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// Get success rate as a fraction.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_attempts.load(Ordering::SeqCst);
        if total == 0 {
            return 1.0;
        }
        let successes = self.steal_successes.load(Ordering::SeqCst);
        successes as f64 / total as f64
    }
}

/// Per-sub-region queues plus the stealing policy over them.
#[derive(Debug)]
pub struct WorkStealer {
    /// One queue per sub-region.
    queues: Vec<TaskQueue>,
    /// Tasks moved per successful steal.
    steal_batch: usize,
    /// Capacity used when placing tasks with an affinity hint.
    max_queue_size: usize,
    /// Statistics.
    stats: Arc<StealStats>,
    /// Round-robin cursor for unhinted placement.
    cursor: usize,
}

impl WorkStealer {
    /// Create a stealer over `num_regions` sub-regions.
    pub fn new(
        num_regions: usize,
        steal_batch: usize,
        max_queue_size: usize,
    ) -> Self {
        let num_regions = num_regions.max(1);
        let mut queues = Vec::with_capacity(num_regions);
        for _ in 0..num_regions {
            queues.push(TaskQueue::new());
        }

        Self {
            queues,
            steal_batch: steal_batch.max(1),
            max_queue_size: max_queue_size.max(1),
            stats: Arc::new(StealStats::default()),
            cursor: 0,
        }
    }

    /// Number of sub-regions.
    #[inline]
    pub fn num_regions(&self) -> usize {
        self.queues.len()
    }

    /// Total queued tasks.
    pub fn len(&self) -> usize {
        self.queues.iter().map(TaskQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(TaskQueue::is_empty)
    }

    /// Queued tasks in one sub-region.
    pub fn region_len(
        &self,
        region: usize,
    ) -> usize {
        self.queues.get(region).map(TaskQueue::len).unwrap_or(0)
    }

    /// Choose the sub-region for a new task.
    ///
    /// A hint is honored when the region exists and its queue is below
    /// capacity; otherwise the least-loaded region wins. Without a hint
    /// tasks are spread round-robin.
    pub fn place(
        &mut self,
        hint: Option<usize>,
    ) -> usize {
        if let Some(region) = hint {
            if region < self.queues.len() && self.queues[region].len() < self.max_queue_size {
                return region;
            }
            return self.least_loaded();
        }

        let region = self.cursor % self.queues.len();
        self.cursor = self.cursor.wrapping_add(1);
        region
    }

    fn least_loaded(&self) -> usize {
        self.queues
            .iter()
            .enumerate()
            .min_by_key(|(_, queue)| queue.len())
            .map(|(region, _)| region)
            .unwrap_or(0)
    }

    /// Queue a task, returning the sub-region it landed in.
    pub fn push(
        &mut self,
        task: Arc<Task>,
    ) -> usize {
        let region = self.place(task.affinity());
        self.queues[region].push(task);
        region
    }

    /// Next task for a worker whose home is `home`. The flag tells whether
    /// the task was stolen from another sub-region.
    pub fn pop_for(
        &mut self,
        home: usize,
    ) -> Option<(Arc<Task>, bool)> {
        let home = home % self.queues.len();
        if let Some(task) = self.queues[home].pop_front() {
            return Some((task, false));
        }
        if self.queues.len() == 1 {
            return None;
        }

        let stolen = self.steal_into(home);
        if stolen == 0 {
            self.stats.record_failure();
            return None;
        }
        self.stats.record_success(stolen);
        self.queues[home].pop_front().map(|task| (task, true))
    }

    /// Move up to `steal_batch` tasks from the back of a victim's queue
    /// into `home`.
    fn steal_into(
        &mut self,
        home: usize,
    ) -> usize {
        let num_regions = self.queues.len();
        let start = self.random_victim(home);

        for step in 0..num_regions {
            let victim = (start + step) % num_regions;
            if victim == home || self.queues[victim].is_empty() {
                continue;
            }

            let mut moved = 0;
            while moved < self.steal_batch {
                match self.queues[victim].pop_back() {
                    Some(task) => {
                        self.queues[home].push(task);
                        moved += 1;
                    },
                    None => break,
                }
            }
            return moved;
        }
        0
    }

    /// A random sub-region other than `home`. Needs at least two regions.
    #[inline]
    fn random_victim(
        &self,
        home: usize,
    ) -> usize {
        let num_regions = self.queues.len();
        (home + rand::rng().random_range(1..num_regions)) % num_regions
    }

    /// Get steal statistics.
    #[inline]
    pub fn stats(&self) -> &Arc<StealStats> {
        &self.stats
    }
}
