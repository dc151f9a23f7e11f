//! Close bookkeeping: a counter of live tasks that `close` awaits.
//!
//! Every task a chirp instance spawns holds a [`TaskGuard`]; the guard decrements on
//!  drop, whether the task finished or was aborted. Closing waits until the count
//!  reaches zero, at which point every socket and buffer the tasks held is gone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::error;

pub(crate) struct TaskGate {
    active: AtomicUsize,
    zero: Notify,
}

impl TaskGate {
    pub fn new() -> Arc<TaskGate> {
        Arc::new(TaskGate {
            active: AtomicUsize::new(0),
            zero: Notify::new(),
        })
    }

    pub fn enter(self: &Arc<Self>) -> TaskGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        TaskGuard { gate: self.clone() }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until every guard has been dropped.
    pub async fn closed(&self) {
        loop {
            let notified = self.zero.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct TaskGuard {
    gate: Arc<TaskGate>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let prev = self
            .gate
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        match prev {
            Ok(1) => self.gate.zero.notify_waiters(),
            Ok(_) => {}
            Err(_) => {
                debug_assert!(false, "task gate dropped below zero");
                error!("task gate dropped below zero");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_closed_resolves_immediately_without_guards() {
        let gate = TaskGate::new();
        gate.closed().await;
    }

    #[tokio::test]
    async fn test_closed_waits_for_all_guards() {
        let gate = TaskGate::new();
        let g1 = gate.enter();
        let g2 = gate.enter();
        assert_eq!(gate.active(), 2);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.closed().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(g1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(g2);
        waiter.await.unwrap();
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn test_guard_drop_on_task_abort() {
        let gate = TaskGate::new();
        let guard = gate.enter();
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;

        task.abort();
        let _ = task.await;
        gate.closed().await;
    }
}
