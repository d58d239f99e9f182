//! Typed signals with synchronous and loop-queued delivery.
//!
//! A [`Signal`] holds a list of slots keyed by nothing but registration
//! order. `connect` runs the slot synchronously on the emitting thread;
//! `connect_queued` hands the argument to a target event loop instead: the
//! signal side keeps only a channel sender and a waker, the loop side keeps
//! the slot and pumps the channel after each poll turn. Delivery is in order
//! per (signal, loop) pair, arguments are cloned at emit time, and emissions
//! toward an exited loop are silently discarded.

use std::cell::RefCell;

use crate::event_loop::LoopHandle;

type Slot<T> = Box<dyn Fn(&T)>;

pub struct Signal<T> {
    slots: RefCell<Vec<Slot<T>>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
        }
    }

    /// Synchronous delivery on the emitter's thread.
    pub fn connect(&self, slot: impl Fn(&T) + 'static) {
        self.slots.borrow_mut().push(Box::new(slot));
    }

    pub fn emit(&self, arg: &T) {
        for slot in self.slots.borrow().iter() {
            slot(arg);
        }
    }
}

impl<T: Clone + 'static> Signal<T> {
    /// Deliver on the loop behind `handle`. The slot stays on the loop
    /// thread; emissions only clone the argument into a channel and wake
    /// the loop.
    pub fn connect_queued(&self, handle: &LoopHandle, slot: impl Fn(T) + 'static) {
        let (tx, rx) = crossbeam_channel::unbounded::<T>();
        let drain_ok = handle
            .add_drain(move || loop {
                match rx.try_recv() {
                    Ok(arg) => slot(arg),
                    Err(crossbeam_channel::TryRecvError::Empty) => return true,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => return false,
                }
            })
            .is_ok();
        if !drain_ok {
            return;
        }

        let sender = handle.sender();
        self.connect(move |arg: &T| {
            if !sender.exited() && tx.send(arg.clone()).is_ok() {
                sender.wake();
            }
        });
    }
}
