//! Cancellable one-shot timers that report back to the engine inbox
//!
//! A timer is a spawned task that sleeps and then enqueues a command. The
//! engine keeps the returned handle next to the state it belongs to; replacing
//! or dropping the handle aborts the task. A timer whose command was already
//! queued when it was superseded is recognised by its id and ignored. Ids are
//! allocated by the owner of the timers and must not repeat within it.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

/// Handle to a scheduled timer; aborts the timer task when dropped
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Disarm the timer
    pub fn cancel(mut self) {
        self.disarm();
    }

    fn disarm(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Schedule `make_command(id)` to be delivered to `inbox` after `delay`
///
/// The timer only holds a weak sender, so a pending timer never keeps a
/// stopped engine alive.
pub fn schedule<C, F>(
    inbox: &UnboundedSender<C>,
    id: u64,
    delay: Duration,
    make_command: F,
) -> TimerHandle
where
    C: Send + 'static,
    F: FnOnce(u64) -> C + Send + 'static,
{
    let weak = inbox.downgrade();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inbox) = weak.upgrade() {
            let _ = inbox.send(make_command(id));
        }
    });
    TimerHandle {
        id,
        abort: Some(task.abort_handle()),
    }
}

/// True when `slot` holds the timer with `id`; clears the slot in that case
pub fn take_if_current(slot: &mut Option<TimerHandle>, id: u64) -> bool {
    match slot {
        Some(handle) if handle.id == id => {
            // Already fired, nothing left to abort
            if let Some(mut handle) = slot.take() {
                handle.abort = None;
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = schedule(&tx, 1, Duration::from_millis(100), |id| id);

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.recv().await, Some(handle.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let handle = schedule(&tx, 1, Duration::from_millis(50), |id| id);
        drop(handle);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_id_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel::<u64>();
        let first = schedule(&tx, 1, Duration::from_secs(1), |id| id);
        let stale_id = first.id();
        drop(first);

        let mut slot = Some(schedule(&tx, 2, Duration::from_secs(1), |id| id));
        assert!(!take_if_current(&mut slot, stale_id));
        assert!(slot.is_some());

        let current = slot.as_ref().map(TimerHandle::id).unwrap();
        assert!(take_if_current(&mut slot, current));
        assert!(slot.is_none());
    }
}
