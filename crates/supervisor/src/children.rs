use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::process::{Child, Command};

/// Pids of children that have a dedicated waiter.
///
/// PID 1 must reap every orphan that gets re-parented to it, but must leave
/// children it spawned itself to their own `wait()`. Spawning and reaping
/// both happen under the table lock, so a supervised child is always
/// registered before the reaper can observe it exiting.
#[derive(Debug, Clone, Default)]
pub struct ChildTable {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl ChildTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u32>> {
        // Recover from a poisoned mutex: the set itself is always consistent.
        self.pids.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn `command` and register its pid atomically.
    pub fn spawn(&self, command: &mut Command) -> io::Result<Child> {
        let mut pids = self.lock();
        let child = command.spawn()?;
        if let Some(pid) = child.id() {
            pids.insert(pid);
        }
        Ok(child)
    }

    /// Forget `pid` once its waiter has collected it.
    pub fn release(&self, pid: u32) {
        self.lock().remove(&pid);
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `reap` for every candidate pid that is not supervised, holding
    /// the lock throughout. Returns how many `reap` calls reported success.
    pub fn reap_unsupervised<I, F>(&self, candidates: I, mut reap: F) -> usize
    where
        I: IntoIterator<Item = u32>,
        F: FnMut(u32) -> bool,
    {
        let pids = self.lock();
        candidates
            .into_iter()
            .filter(|pid| !pids.contains(pid))
            .filter(|pid| reap(*pid))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_child_is_registered_until_released() {
        let table = ChildTable::new();
        let mut child = table.spawn(Command::new("true").kill_on_drop(true)).unwrap();
        let pid = child.id().unwrap();
        assert!(table.contains(pid));
        child.wait().await.unwrap();
        table.release(pid);
        assert!(table.is_empty());
    }

    #[test]
    fn reaper_skips_supervised_pids() {
        let table = ChildTable::new();
        table.lock().insert(42);
        let mut reaped = Vec::new();
        let count = table.reap_unsupervised([41, 42, 43], |pid| {
            reaped.push(pid);
            pid != 43
        });
        assert_eq!(reaped, vec![41, 43]);
        assert_eq!(count, 1);
    }
}
