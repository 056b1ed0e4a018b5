//! # Hashed-Wheel Timer
//!
//! Purpose: a cancelable delayed-task scheduler driving TTL expiry and TCC
//! timeouts. Single-writer: every mutation (add, cancel, tick) happens on
//! one dedicated thread, reached only through channels, so the wheel's
//! slot lists and the cancellation index need no lock of their own.
//!
//! ## Design Principles
//! 1. **One Thread, Three Channels**: add/cancel/tick are the only ways in;
//!    this removes all data-structure locking at the cost of one hop per op.
//! 2. **O(1) Cancellation**: a key→(slot, cursor) index lets `cancel` unlink
//!    a task without scanning its slot's list.
//! 3. **Panic Isolation**: a callback that panics is caught so one bad task
//!    doesn't take down the timer thread.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    key: String,
    circle: u64,
    callback: Option<Callback>,
}

enum Command {
    Add { key: String, delay: Duration, callback: Callback },
    Cancel { key: String },
    Shutdown,
}

/// Handle to a running hashed-wheel timer; cloneable, drop-safe (the thread
/// keeps running until `shutdown` is called or the handle count hits zero
/// and a `Shutdown` is sent explicitly).
#[derive(Clone)]
pub struct TimerHandle {
    tx: Sender<Command>,
}

impl TimerHandle {
    /// Schedules `callback` to run after `delay`. Re-adding an existing
    /// `key` first cancels the prior task (the writer thread processes
    /// `Add` by cancelling any existing entry under that key).
    pub fn schedule(&self, key: impl Into<String>, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Command::Add { key: key.into(), delay, callback: Box::new(callback) });
    }

    pub fn cancel(&self, key: impl Into<String>) {
        let _ = self.tx.send(Command::Cancel { key: key.into() });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Owns the wheel's background thread; drop joins it.
pub struct TimeWheel {
    handle: TimerHandle,
    join: Option<JoinHandle<()>>,
}

impl TimeWheel {
    /// `interval` is the tick period (spec default 1s), `slot_count` the
    /// number of wheel slots (spec default 3600).
    pub fn start(interval: Duration, slot_count: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Command>();

        let join = std::thread::spawn(move || {
            let mut slots: Vec<Vec<Task>> = (0..slot_count).map(|_| Vec::new()).collect();
            let mut index: HashMap<String, (usize, usize)> = HashMap::new();
            let mut position = 0usize;

            loop {
                match rx.recv_timeout(interval) {
                    Ok(Command::Add { key, delay, callback }) => {
                        if let Some((slot, cursor)) = index.remove(&key) {
                            remove_from_slot(&mut slots[slot], cursor);
                            reindex_slot(&slots[slot], slot, &mut index);
                        }
                        let ticks = (delay.as_millis() / interval.as_millis().max(1)).max(1) as u64;
                        let slot = (position as u64 + ticks) as usize % slot_count;
                        let circle = ticks / slot_count as u64;
                        slots[slot].push(Task { key: key.clone(), circle, callback: Some(callback) });
                        let cursor = slots[slot].len() - 1;
                        index.insert(key, (slot, cursor));
                    }
                    Ok(Command::Cancel { key }) => {
                        if let Some((slot, cursor)) = index.remove(&key) {
                            remove_from_slot(&mut slots[slot], cursor);
                            reindex_slot(&slots[slot], slot, &mut index);
                        }
                    }
                    Ok(Command::Shutdown) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        position = (position + 1) % slot_count;
                        let due: Vec<Task> = {
                            let slot = &mut slots[position];
                            let mut due = Vec::new();
                            let mut remaining = Vec::new();
                            for mut task in slot.drain(..) {
                                if task.circle > 0 {
                                    task.circle -= 1;
                                    remaining.push(task);
                                } else {
                                    due.push(task);
                                }
                            }
                            *slot = remaining;
                            due
                        };
                        reindex_slot(&slots[position], position, &mut index);
                        for mut task in due {
                            index.remove(&task.key);
                            if let Some(cb) = task.callback.take() {
                                let _ = panic::catch_unwind(AssertUnwindSafe(cb));
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        TimeWheel { handle: TimerHandle { tx }, join: Some(join) }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn remove_from_slot(slot: &mut Vec<Task>, cursor: usize) {
    if cursor < slot.len() {
        slot.remove(cursor);
    }
}

fn reindex_slot(slot: &[Task], slot_idx: usize, index: &mut HashMap<String, (usize, usize)>) {
    for (cursor, task) in slot.iter().enumerate() {
        index.insert(task.key.clone(), (slot_idx, cursor));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_after_delay() {
        let wheel = TimeWheel::start(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        wheel.handle().schedule("k", Duration::from_millis(20), move || {
            flag.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_prevents_firing() {
        let wheel = TimeWheel::start(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        wheel.handle().schedule("k", Duration::from_millis(50), move || {
            flag.store(true, Ordering::SeqCst);
        });
        wheel.handle().cancel("k");
        std::thread::sleep(Duration::from_millis(200));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn readding_key_replaces_prior_task() {
        let wheel = TimeWheel::start(Duration::from_millis(10), 16);
        let first_fired = Arc::new(AtomicBool::new(false));
        let second_fired = Arc::new(AtomicBool::new(false));
        let f1 = Arc::clone(&first_fired);
        wheel.handle().schedule("k", Duration::from_millis(30), move || {
            f1.store(true, Ordering::SeqCst);
        });
        let f2 = Arc::clone(&second_fired);
        wheel.handle().schedule("k", Duration::from_millis(30), move || {
            f2.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(200));
        assert!(!first_fired.load(Ordering::SeqCst));
        assert!(second_fired.load(Ordering::SeqCst));
    }
}
