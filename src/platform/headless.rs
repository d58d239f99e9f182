//! Headless platform: a timer-driven virtual window.
//!
//! Announces one virtual window at startup and ticks `draw` from a timerfd
//! at the configured frame rate. Render devices are headless and share the
//! platform's virtual output size, so a resize is observed by the
//! compositor on its next frame like a real windowing backend.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::event_loop::{EventSource, LoopHandle, Readiness};
use crate::platform::{Platform, PlatformEvents};
use crate::render::headless::{HeadlessDevice, SizeHandle};
use crate::render::RenderDevice;

pub struct HeadlessPlatform {
    events: Rc<PlatformEvents>,
    size: SizeHandle,
}

impl HeadlessPlatform {
    pub fn new(handle: &LoopHandle, width: i32, height: i32, frame_rate: u32) -> Result<Rc<Self>> {
        let events = Rc::new(PlatformEvents::new());

        let interval = Duration::from_nanos(1_000_000_000 / u64::from(frame_rate.max(1)));
        let timer = FrameTimer::new(interval).context("failed to create frame timer")?;

        let source = Rc::new(RefCell::new(TickSource {
            timer,
            events: events.clone(),
        }));
        handle.register_source(source, false)?;

        info!("headless platform: {width}x{height} at {frame_rate} Hz");
        Ok(Rc::new(Self {
            events,
            size: Rc::new(Cell::new((width, height))),
        }))
    }

    /// Emit `window_ready`; call once the compositor is wired.
    pub fn announce_window(&self) {
        self.events.window_ready.emit(&());
    }

    /// Resize the virtual output; picked up on the next frame.
    pub fn resize(&self, width: i32, height: i32) {
        self.size.set((width, height));
    }
}

impl Platform for HeadlessPlatform {
    fn events(&self) -> &PlatformEvents {
        &self.events
    }

    fn create_render_device(&self) -> Result<Box<dyn RenderDevice>> {
        Ok(Box::new(HeadlessDevice::with_shared(
            self.size.clone(),
            Rc::default(),
        )))
    }
}

/// Non-blocking interval timerfd.
struct FrameTimer {
    fd: RawFd,
}

impl FrameTimer {
    fn new(interval: Duration) -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let tick = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: tick,
            it_value: tick,
        };
        let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd })
    }

    /// Consume the expiration counter; coalesced ticks still mean one draw.
    fn drain(&self) {
        let mut expirations = 0u64;
        unsafe {
            libc::read(
                self.fd,
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for FrameTimer {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

struct TickSource {
    timer: FrameTimer,
    events: Rc<PlatformEvents>,
}

impl EventSource for TickSource {
    fn raw_fd(&self) -> RawFd {
        self.timer.fd
    }

    fn dispatch(&mut self, _readiness: Readiness) -> Result<()> {
        self.timer.drain();
        self.events.draw.emit(&());
        Ok(())
    }
}
