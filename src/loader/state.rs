//! Per-batch completion tracking.
//!
//! Every outcome is recorded under one lock: writing the slot, bumping the
//! completed count, checking it against the target and settling whether the
//! batch fires or was cancelled happen as a single step, so two outcomes
//! reported at the same instant can never both observe the final count, and a
//! cancel arriving after the final outcome cannot undo it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Fired,
    Cancelled,
}

/// Cancellation state shared by a batch's tasks, its `BatchHandle` and the
/// loader's registry.
///
/// The token stops queued resolutions early; the lifecycle decides, once,
/// whether the batch delivers its items.
#[derive(Debug)]
pub(crate) struct BatchControl {
    token: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl BatchControl {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            lifecycle: Mutex::new(Lifecycle::Running),
        }
    }

    /// Control for a batch that completed before it was handed out.
    pub fn fired(token: CancellationToken) -> Self {
        Self {
            token,
            lifecycle: Mutex::new(Lifecycle::Fired),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the batch unless its final outcome has already been recorded.
    ///
    /// Returns true if this call cancelled it.
    pub fn cancel(&self) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Running {
                return false;
            }
            *lifecycle = Lifecycle::Cancelled;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        match *self.lifecycle.lock() {
            Lifecycle::Running => self.token.is_cancelled(),
            Lifecycle::Fired => false,
            Lifecycle::Cancelled => true,
        }
    }

    /// True while the batch can still either fire or be cancelled.
    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Running && !self.token.is_cancelled()
    }

    /// Decide the batch's fate. Returns true if it fires.
    ///
    /// A token cancelled from outside (loader shutdown, a dropped `load`
    /// future) counts as a cancel if it lands before this call.
    fn settle(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Running {
            *lifecycle = if self.token.is_cancelled() {
                Lifecycle::Cancelled
            } else {
                Lifecycle::Fired
            };
        }
        *lifecycle == Lifecycle::Fired
    }
}

/// Output position reserved for one input handle.
#[derive(Debug)]
enum Slot<T> {
    Unset,
    Present(T),
    Absent,
}

/// What recording a single outcome did to the batch.
pub(crate) enum Progress<T, F> {
    /// More outcomes are still outstanding.
    Pending { completed: usize, total: usize },
    /// This outcome was the last one. The caller owns the callback and the
    /// ordered items and must invoke it outside the lock.
    Complete(Completion<T, F>),
    /// This outcome was the last one but the batch had been cancelled. The
    /// callback must be dropped without being called.
    Discarded(Completion<T, F>),
    /// The slot had already reported, or the index was out of range.
    Ignored,
}

pub(crate) struct Completion<T, F> {
    pub items: Vec<T>,
    pub on_complete: F,
    pub resolved: usize,
    pub dropped: usize,
}

impl<T, F: FnOnce(Vec<T>)> Completion<T, F> {
    pub fn fire(self) {
        (self.on_complete)(self.items)
    }
}

struct Inner<T, F> {
    slots: Vec<Slot<T>>,
    completed: usize,
    fired: bool,
    on_complete: Option<F>,
}

/// Transient state owned by exactly one batch.
pub(crate) struct BatchState<T, F> {
    total: usize,
    control: Arc<BatchControl>,
    inner: Mutex<Inner<T, F>>,
}

impl<T, F> BatchState<T, F> {
    pub fn new(total: usize, on_complete: F, control: Arc<BatchControl>) -> Self {
        let mut slots = Vec::with_capacity(total);
        slots.resize_with(total, || Slot::Unset);
        Self {
            total,
            control,
            inner: Mutex::new(Inner {
                slots,
                completed: 0,
                fired: false,
                on_complete: Some(on_complete),
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    #[cfg(test)]
    pub fn completed(&self) -> usize {
        self.inner.lock().completed
    }

    #[cfg(test)]
    pub fn is_fired(&self) -> bool {
        self.inner.lock().fired
    }

    /// Record the outcome for input `index`.
    pub fn record(&self, index: usize, outcome: Option<T>) -> Progress<T, F> {
        let mut inner = self.inner.lock();

        if inner.fired {
            return Progress::Ignored;
        }
        match inner.slots.get(index) {
            Some(Slot::Unset) => {}
            _ => return Progress::Ignored,
        }

        inner.slots[index] = match outcome {
            Some(item) => Slot::Present(item),
            None => Slot::Absent,
        };
        inner.completed += 1;

        if inner.completed < self.total {
            return Progress::Pending {
                completed: inner.completed,
                total: self.total,
            };
        }

        inner.fired = true;
        let Some(on_complete) = inner.on_complete.take() else {
            return Progress::Ignored;
        };

        let mut items = Vec::with_capacity(self.total);
        let mut dropped = 0;
        for slot in std::mem::take(&mut inner.slots) {
            match slot {
                Slot::Present(item) => items.push(item),
                Slot::Absent => dropped += 1,
                Slot::Unset => {}
            }
        }

        let completion = Completion {
            resolved: items.len(),
            dropped,
            items,
            on_complete,
        };
        if self.control.settle() {
            Progress::Complete(completion)
        } else {
            Progress::Discarded(completion)
        }
    }
}
