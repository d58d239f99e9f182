//! Single-threaded I/O reactor with a cross-thread call queue.
//!
//! Sources are file-descriptor-bearing objects dispatched on the loop
//! thread. Other threads reach the loop through [`LoopSender::queue`], which
//! wakes the poll via a [`mio::Waker`]; queued calls run in FIFO order after
//! fd dispatch. [`LoopHandle`] is the loop-thread side: it registers sources
//! and the drains that back queued signal delivery.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::warn;

const WAKE: Token = Token(0);

/// Readiness bits handed to a source on dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// An object the loop watches: a file descriptor plus a dispatch callback.
pub trait EventSource {
    fn raw_fd(&self) -> RawFd;
    fn dispatch(&mut self, readiness: Readiness) -> Result<()>;
}

type QueuedCall = Box<dyn FnOnce() + Send>;

/// Loop-side pump for queued signal delivery. Returns false once drained
/// and disconnected, which removes it.
type Drain = Box<dyn FnMut() -> bool>;

struct Shared {
    registry: Registry,
    sources: HashMap<Token, Rc<RefCell<dyn EventSource>>>,
    drains: Vec<Drain>,
    next_token: usize,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    shared: Rc<RefCell<Shared>>,
    calls: Receiver<QueuedCall>,
    sender: LoopSender,
}

/// Cheap clonable handle for wiring on the loop thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Weak<RefCell<Shared>>,
    sender: LoopSender,
}

/// Thread-safe face of the loop: queue calls, wake it, ask it to exit.
#[derive(Clone)]
pub struct LoopSender {
    calls: Sender<QueuedCall>,
    waker: Arc<Waker>,
    exit: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().context("failed to create poll")?;
        let waker = Waker::new(poll.registry(), WAKE).context("failed to create waker")?;
        let registry = poll
            .registry()
            .try_clone()
            .context("failed to clone poll registry")?;
        let (tx, rx) = crossbeam_channel::unbounded();

        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            shared: Rc::new(RefCell::new(Shared {
                registry,
                sources: HashMap::new(),
                drains: Vec::new(),
                next_token: 1,
            })),
            calls: rx,
            sender: LoopSender {
                calls: tx,
                waker: Arc::new(waker),
                exit: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Rc::downgrade(&self.shared),
            sender: self.sender.clone(),
        }
    }

    pub fn sender(&self) -> LoopSender {
        self.sender.clone()
    }

    /// Block until [`LoopSender::exit`] is observed.
    pub fn run(&mut self) -> Result<()> {
        while !self.sender.exit.load(Ordering::SeqCst) {
            self.dispatch(None)?;
        }
        Ok(())
    }

    /// One poll iteration: fd dispatch, then queued calls and drains.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e).context("poll failed"),
        }

        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE {
                continue;
            }
            let source = self.shared.borrow().sources.get(&token).cloned();
            if let Some(source) = source {
                let readiness = Readiness {
                    readable: event.is_readable() || event.is_read_closed(),
                    writable: event.is_writable(),
                };
                if let Err(e) = source.borrow_mut().dispatch(readiness) {
                    warn!("event source error: {e:#}");
                }
            }
        }

        self.run_pending();
        Ok(())
    }

    /// Build a loop inside its own thread, let `setup` register sources
    /// there, then run it. Pending queued calls are dropped at exit.
    pub fn run_in_thread<F>(setup: F) -> Result<LoopThread>
    where
        F: FnOnce(&EventLoop) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let join = std::thread::Builder::new()
            .name("glint-loop".into())
            .spawn(move || -> Result<()> {
                let mut event_loop = EventLoop::new()?;
                setup(&event_loop)?;
                // Hand the sender out only once setup is done, so callers
                // never race the loop's own wiring.
                tx.send(event_loop.sender()).ok();
                event_loop.run()
            })
            .context("failed to spawn event loop thread")?;

        let sender = rx
            .recv()
            .context("event loop thread exited before starting")?;
        Ok(LoopThread { sender, join })
    }

    fn run_pending(&mut self) {
        // Exit drops whatever is still queued.
        if self.sender.exit.load(Ordering::SeqCst) {
            return;
        }
        while let Ok(call) = self.calls.try_recv() {
            call();
        }
        let mut drains = std::mem::take(&mut self.shared.borrow_mut().drains);
        drains.retain_mut(|drain| drain());
        self.shared.borrow_mut().drains.extend(drains.drain(..));
    }
}

impl LoopHandle {
    fn shared(&self) -> Result<Rc<RefCell<Shared>>> {
        match self.shared.upgrade() {
            Some(shared) => Ok(shared),
            None => bail!("event loop is gone"),
        }
    }

    /// Watch a source. Readable interest is implied; pass `writable` for
    /// sources with pending output.
    pub fn register_source(
        &self,
        source: Rc<RefCell<dyn EventSource>>,
        writable: bool,
    ) -> Result<Token> {
        let shared = self.shared()?;
        let mut shared = shared.borrow_mut();
        let token = Token(shared.next_token);
        shared.next_token += 1;

        let fd = source.borrow().raw_fd();
        shared
            .registry
            .register(&mut SourceFd(&fd), token, interest(writable))
            .context("failed to register event source")?;
        shared.sources.insert(token, source);
        Ok(token)
    }

    pub fn reregister_source(&self, token: Token, writable: bool) -> Result<()> {
        let shared = self.shared()?;
        let shared = shared.borrow();
        let source = match shared.sources.get(&token) {
            Some(source) => source,
            None => bail!("unknown event source token {token:?}"),
        };
        let fd = source.borrow().raw_fd();
        shared
            .registry
            .reregister(&mut SourceFd(&fd), token, interest(writable))
            .context("failed to reregister event source")
    }

    pub fn unregister_source(&self, token: Token) -> Result<()> {
        let shared = self.shared()?;
        let mut shared = shared.borrow_mut();
        if let Some(source) = shared.sources.remove(&token) {
            let fd = source.borrow().raw_fd();
            shared
                .registry
                .deregister(&mut SourceFd(&fd))
                .context("failed to deregister event source")?;
        }
        Ok(())
    }

    /// Attach a queued-delivery pump; runs after fd dispatch each turn.
    pub fn add_drain(&self, drain: impl FnMut() -> bool + 'static) -> Result<()> {
        self.shared()?.borrow_mut().drains.push(Box::new(drain));
        Ok(())
    }

    pub fn sender(&self) -> LoopSender {
        self.sender.clone()
    }

    pub fn queue(&self, call: impl FnOnce() + Send + 'static) {
        self.sender.queue(call);
    }
}

impl LoopSender {
    /// Run a closure on the loop thread. FIFO, safe from any thread. Calls
    /// queued after exit are silently discarded.
    pub fn queue(&self, call: impl FnOnce() + Send + 'static) {
        if self.exit.load(Ordering::SeqCst) {
            return;
        }
        if self.calls.send(Box::new(call)).is_ok() {
            self.wake();
        }
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake event loop: {e}");
        }
    }

    /// Idempotent; observed on the next wakeup.
    pub fn exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
        self.waker.wake().ok();
    }

    pub fn exited(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }
}

fn interest(writable: bool) -> Interest {
    if writable {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// A loop running in its own thread.
pub struct LoopThread {
    sender: LoopSender,
    join: std::thread::JoinHandle<Result<()>>,
}

impl LoopThread {
    pub fn sender(&self) -> LoopSender {
        self.sender.clone()
    }

    pub fn join(self) -> Result<()> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => bail!("event loop thread panicked"),
        }
    }
}
