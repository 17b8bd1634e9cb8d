//! Lazily populated table entries shared by scope containers and the
//! governance table.
//!
//! A slot is empty until its first poll, which starts the work that
//! populates it. Polls that arrive while the work is pending register a
//! wake-up instead of starting it again. Each start is stamped with a
//! generation so a settlement that arrives after the slot moved on (timed
//! out, failed, reset) is recognised as stale.

use std::mem;

use crate::error::Failure;
use crate::wake::Resume;

#[derive(Debug)]
pub(crate) enum SlotState<T> {
    Empty,
    Pending { generation: u64, waiters: Vec<Resume> },
    Ready(T),
}

#[derive(Debug)]
pub(crate) enum Poll<T> {
    Ready(T),
    /// Someone else is populating the slot; the wake-up was registered.
    Waiting,
    /// The caller must start populating the slot and settle it with this
    /// generation. Its wake-up was registered too.
    Start(u64),
}

#[derive(Debug)]
pub(crate) enum Settled<T> {
    Accepted {
        waiters: Vec<Resume>,
        outcome: Result<T, Failure>,
    },
    /// The generation no longer matches; the value is handed back.
    Stale(Result<T, Failure>),
}

#[derive(Debug)]
pub(crate) struct LazySlot<T> {
    state: SlotState<T>,
    generation: u64,
}

impl<T> Default for LazySlot<T> {
    fn default() -> Self {
        Self {
            state: SlotState::Empty,
            generation: 0,
        }
    }
}

impl<T: Clone> LazySlot<T> {
    pub(crate) fn poll(&mut self, make_resume: impl FnOnce() -> Resume) -> Poll<T> {
        match &mut self.state {
            SlotState::Ready(value) => Poll::Ready(value.clone()),
            SlotState::Pending { waiters, .. } => {
                waiters.push(make_resume());
                Poll::Waiting
            }
            SlotState::Empty => {
                self.generation += 1;
                self.state = SlotState::Pending {
                    generation: self.generation,
                    waiters: vec![make_resume()],
                };
                Poll::Start(self.generation)
            }
        }
    }

    /// Settles a pending slot. Success makes it ready; failure empties it so
    /// the next poll starts over.
    pub(crate) fn settle(&mut self, generation: u64, outcome: Result<T, Failure>) -> Settled<T> {
        match &self.state {
            SlotState::Pending { generation: g, .. } if *g == generation => {}
            _ => return Settled::Stale(outcome),
        }

        let next = match &outcome {
            Ok(value) => SlotState::Ready(value.clone()),
            Err(_) => SlotState::Empty,
        };
        match mem::replace(&mut self.state, next) {
            SlotState::Pending { waiters, .. } => Settled::Accepted { waiters, outcome },
            _ => Settled::Accepted {
                waiters: Vec::new(),
                outcome,
            },
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.state, SlotState::Ready(_))
    }

    pub(crate) fn generation(&self) -> Option<u64> {
        match &self.state {
            SlotState::Pending { generation, .. } => Some(*generation),
            _ => None,
        }
    }

    /// Empties the slot, returning what it held.
    pub(crate) fn reset(&mut self) -> SlotState<T> {
        mem::replace(&mut self.state, SlotState::Empty)
    }
}
