//! The append-only action log and its commit index.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::action::{Action, LogEntry};

/// Ordered sequence of actions plus the highest index known to be committed.
///
/// Entries are only ever pushed at the current length, so an index, once
/// populated, never changes. Each entry keeps the term it was appended in.
/// The commit index starts at -1 and only moves forward through
/// compare-and-set; it never exceeds the last index.
#[derive(Debug)]
pub struct ActionLog {
    entries: Mutex<Vec<LogEntry>>,
    commit: AtomicI64,
    progress: Notify,
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            commit: AtomicI64::new(-1),
            progress: Notify::new(),
        }
    }

    /// Appends at the next free index and returns that index.
    pub fn append(&self, term: u64, action: Action) -> u64 {
        let index = {
            let mut entries = self.entries.lock();
            let index = entries.len() as u64;
            entries.push(LogEntry {
                index,
                term,
                action,
            });
            index
        };
        self.progress.notify_waiters();
        index
    }

    /// Appends only if `index` is exactly the next free index.
    pub fn append_at(&self, index: u64, term: u64, action: Action) -> bool {
        {
            let mut entries = self.entries.lock();
            if entries.len() as u64 != index {
                return false;
            }
            entries.push(LogEntry {
                index,
                term,
                action,
            });
        }
        self.progress.notify_waiters();
        true
    }

    pub fn len(&self) -> u64 {
        self.entries.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Index of the last entry, or -1 for an empty log.
    pub fn last_index(&self) -> i64 {
        self.len() as i64 - 1
    }

    /// Term of the last entry, or 0 for an empty log.
    pub fn last_term(&self) -> u64 {
        self.entries.lock().last().map_or(0, |e| e.term)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entries.lock().get(index as usize).map(|e| e.term)
    }

    /// Term of the entry just before `index`; 0 when `index` is the first.
    pub fn term_before(&self, index: u64) -> Option<u64> {
        match index.checked_sub(1) {
            Some(prev) => self.term_at(prev),
            None => Some(0),
        }
    }

    pub fn get(&self, index: u64) -> Option<Action> {
        self.entries.lock().get(index as usize).map(|e| e.action.clone())
    }

    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        self.entries.lock().get(index as usize).cloned()
    }

    /// Up to `max` entries starting at `start`.
    pub fn range(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        entries.iter().skip(start as usize).take(max).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.range(0, usize::MAX)
    }

    pub fn commit_index(&self) -> i64 {
        self.commit.load(Ordering::Acquire)
    }

    /// Advances the commit index to `index`, clamped to the last index.
    ///
    /// Concurrent callers never regress it: a proposal at or below the current
    /// value is a no-op. Returns whether the index moved.
    pub fn commit(&self, index: i64) -> bool {
        let target = index.min(self.last_index());
        loop {
            let current = self.commit.load(Ordering::Acquire);
            if target <= current {
                return false;
            }
            if self
                .commit
                .compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.progress.notify_waiters();
                return true;
            }
        }
    }

    /// Wakes every task parked in [`ActionLog::wait_until`] so it re-checks.
    pub fn notify(&self) {
        self.progress.notify_waiters();
    }

    /// Parks until `ready` returns true. Re-checked after every append,
    /// commit or explicit [`ActionLog::notify`].
    pub async fn wait_until(&self, mut ready: impl FnMut(&Self) -> bool) {
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            // Register before checking so a wake between the check and the
            // await is not lost.
            notified.as_mut().enable();
            if ready(self) {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_for_commit(&self, index: i64) {
        self.wait_until(|log| log.commit_index() >= index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn act(n: usize) -> Action {
        Action::new("p", format!("cmd-{n}"))
    }

    #[test]
    fn entries_never_change_once_written() {
        let log = ActionLog::new();
        assert_eq!(log.append(1, act(0)), 0);
        assert_eq!(log.append(1, act(1)), 1);

        // Writing at an occupied or skipped index is refused.
        assert!(!log.append_at(0, 2, act(99)));
        assert!(!log.append_at(5, 2, act(99)));
        assert!(log.append_at(2, 2, act(2)));

        let actions: Vec<_> = log.snapshot().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![act(0), act(1), act(2)]);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(0), Some(1));
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn terms_of_neighbouring_entries() {
        let log = ActionLog::new();
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_before(0), Some(0));
        assert_eq!(log.term_before(1), None);

        log.append(3, act(0));
        log.append(4, act(1));
        assert_eq!(log.term_before(1), Some(3));
        assert_eq!(log.term_before(2), Some(4));
        assert_eq!(log.term_at(2), None);
        assert_eq!(log.entry(1).map(|e| (e.index, e.term)), Some((1, 4)));
    }

    #[test]
    fn commit_is_clamped_and_monotone() {
        let log = ActionLog::new();
        assert_eq!(log.commit_index(), -1);
        assert!(!log.commit(0), "nothing to commit in an empty log");

        for i in 0..4 {
            log.append(1, act(i));
        }
        assert!(log.commit(10));
        assert_eq!(log.commit_index(), 3);
        assert!(!log.commit(1));
        assert_eq!(log.commit_index(), 3);
    }

    #[test]
    fn concurrent_commits_never_regress() {
        let log = Arc::new(ActionLog::new());
        for i in 0..1000 {
            log.append(1, act(i));
        }

        let done = Arc::new(AtomicBool::new(false));
        let observer = {
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut last = -1;
                while !done.load(Ordering::Acquire) {
                    let seen = log.commit_index();
                    assert!(seen >= last, "commit index went from {last} to {seen}");
                    assert!(seen <= log.last_index());
                    last = seen;
                }
            })
        };

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    // Each writer proposes an interleaved, partly descending sequence.
                    for i in (0..1000).rev().step_by(7) {
                        log.commit(((i * (t + 3)) % 1000) as i64);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
        observer.join().unwrap();

        assert!(log.commit_index() >= 900);
    }

    #[tokio::test]
    async fn waiters_wake_on_commit() {
        let log = Arc::new(ActionLog::new());
        log.append(1, act(0));
        log.append(1, act(1));

        let waiter = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.wait_for_commit(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        log.commit(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
