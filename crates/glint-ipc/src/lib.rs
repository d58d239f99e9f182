//! glint wire protocol
//!
//! Shared packet types for communication between the glint compositor and
//! its clients over a local stream socket. The encoding is a fixed binary
//! layout (see [`wire`]); the shared-memory registration packet carries its
//! file descriptor out-of-band as `SCM_RIGHTS` ancillary data, never in the
//! byte stream.

pub mod wire;

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use wire::{Reader, WireError, Writer};

/// Socket path for compositor IPC.
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    PathBuf::from(runtime_dir).join("glint.sock")
}

/// Stable operation codes. Requests count up from 1, notifications from 32.
pub mod op {
    pub const REGISTER_SURFACE_FILE: u32 = 1;
    pub const REGISTER_SURFACE_SHM: u32 = 2;
    pub const UNREGISTER_SURFACE: u32 = 3;
    pub const SET_SURFACE_POSITION: u32 = 4;
    pub const SET_SURFACE_STRATA: u32 = 5;
    pub const SET_SURFACE_ALPHA: u32 = 6;
    pub const ADD_SURFACE_DAMAGE: u32 = 7;
    pub const KEY_DOWN_REQUEST: u32 = 8;
    pub const KEY_UP_REQUEST: u32 = 9;
    pub const ECHO: u32 = 10;

    pub const DISPLAY_SIZE: u32 = 32;
    pub const POINTER_DOWN: u32 = 33;
    pub const POINTER_UP: u32 = 34;
    pub const POINTER_MOTION: u32 = 35;
    pub const BUTTON_PRESS: u32 = 36;
    pub const BUTTON_RELEASE: u32 = 37;
    pub const CURSOR_MOTION: u32 = 38;
    pub const KEY_DOWN: u32 = 39;
    pub const KEY_UP: u32 = 40;
    pub const SOUND_START: u32 = 41;
    pub const SOUND_DATA: u32 = 42;
    pub const SOUND_STOP: u32 = 43;
}

/// File descriptor received with a packet. Shared so packets stay cheap to
/// clone on their way through the signal layer; the mapping side dups it.
pub type SharedFd = Arc<OwnedFd>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("packet requires a file descriptor and none arrived")]
    FdMissing,
}

/// One framed message, either direction.
#[derive(Debug, Clone)]
pub enum Packet {
    // Client -> server.
    RegisterSurfaceFile { name: String, path: String, width: u32, height: u32 },
    RegisterSurfaceShm { name: String, width: u32, height: u32, fd: SharedFd },
    UnregisterSurface { name: String },
    SetSurfacePosition { name: String, x1: i32, y1: i32, x2: i32, y2: i32 },
    SetSurfaceStrata { name: String, strata: i32 },
    SetSurfaceAlpha { name: String, alpha: f32 },
    AddSurfaceDamage { name: String, x1: i32, y1: i32, x2: i32, y2: i32 },
    KeyDownRequest { code: i32 },
    KeyUpRequest { code: i32 },
    Echo { bytes: Vec<u8> },

    // Server -> clients.
    DisplaySize { width: u32, height: u32 },
    PointerDown { surface: String, slot: i32, x: i32, y: i32 },
    PointerUp { surface: String, slot: i32, x: i32, y: i32 },
    PointerMotion { surface: String, slot: i32, x: i32, y: i32 },
    ButtonPress { surface: String, button: i32, x: i32, y: i32 },
    ButtonRelease { surface: String, button: i32, x: i32, y: i32 },
    CursorMotion { surface: String, x: i32, y: i32 },
    KeyDown { code: i32 },
    KeyUp { code: i32 },
    SoundStart,
    SoundData { bytes: Vec<u8> },
    SoundStop,
}

impl Packet {
    pub fn opcode(&self) -> u32 {
        match self {
            Packet::RegisterSurfaceFile { .. } => op::REGISTER_SURFACE_FILE,
            Packet::RegisterSurfaceShm { .. } => op::REGISTER_SURFACE_SHM,
            Packet::UnregisterSurface { .. } => op::UNREGISTER_SURFACE,
            Packet::SetSurfacePosition { .. } => op::SET_SURFACE_POSITION,
            Packet::SetSurfaceStrata { .. } => op::SET_SURFACE_STRATA,
            Packet::SetSurfaceAlpha { .. } => op::SET_SURFACE_ALPHA,
            Packet::AddSurfaceDamage { .. } => op::ADD_SURFACE_DAMAGE,
            Packet::KeyDownRequest { .. } => op::KEY_DOWN_REQUEST,
            Packet::KeyUpRequest { .. } => op::KEY_UP_REQUEST,
            Packet::Echo { .. } => op::ECHO,
            Packet::DisplaySize { .. } => op::DISPLAY_SIZE,
            Packet::PointerDown { .. } => op::POINTER_DOWN,
            Packet::PointerUp { .. } => op::POINTER_UP,
            Packet::PointerMotion { .. } => op::POINTER_MOTION,
            Packet::ButtonPress { .. } => op::BUTTON_PRESS,
            Packet::ButtonRelease { .. } => op::BUTTON_RELEASE,
            Packet::CursorMotion { .. } => op::CURSOR_MOTION,
            Packet::KeyDown { .. } => op::KEY_DOWN,
            Packet::KeyUp { .. } => op::KEY_UP,
            Packet::SoundStart => op::SOUND_START,
            Packet::SoundData { .. } => op::SOUND_DATA,
            Packet::SoundStop => op::SOUND_STOP,
        }
    }

    /// Encode into a complete frame, length prefix included. The shm fd is
    /// not serialized; the sender attaches it as ancillary data.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.opcode());
        match self {
            Packet::RegisterSurfaceFile { name, path, width, height } => {
                w.put_str(name);
                w.put_str(path);
                w.put_u32(*width);
                w.put_u32(*height);
            }
            Packet::RegisterSurfaceShm { name, width, height, fd: _ } => {
                w.put_str(name);
                w.put_u32(*width);
                w.put_u32(*height);
            }
            Packet::UnregisterSurface { name } => w.put_str(name),
            Packet::SetSurfacePosition { name, x1, y1, x2, y2 }
            | Packet::AddSurfaceDamage { name, x1, y1, x2, y2 } => {
                w.put_str(name);
                w.put_i32(*x1);
                w.put_i32(*y1);
                w.put_i32(*x2);
                w.put_i32(*y2);
            }
            Packet::SetSurfaceStrata { name, strata } => {
                w.put_str(name);
                w.put_i32(*strata);
            }
            Packet::SetSurfaceAlpha { name, alpha } => {
                w.put_str(name);
                w.put_f32(*alpha);
            }
            Packet::KeyDownRequest { code }
            | Packet::KeyUpRequest { code }
            | Packet::KeyDown { code }
            | Packet::KeyUp { code } => w.put_i32(*code),
            Packet::Echo { bytes } | Packet::SoundData { bytes } => w.put_bytes(bytes),
            Packet::DisplaySize { width, height } => {
                w.put_u32(*width);
                w.put_u32(*height);
            }
            Packet::PointerDown { surface, slot, x, y }
            | Packet::PointerUp { surface, slot, x, y }
            | Packet::PointerMotion { surface, slot, x, y } => {
                w.put_str(surface);
                w.put_i32(*slot);
                w.put_i32(*x);
                w.put_i32(*y);
            }
            Packet::ButtonPress { surface, button, x, y }
            | Packet::ButtonRelease { surface, button, x, y } => {
                w.put_str(surface);
                w.put_i32(*button);
                w.put_i32(*x);
                w.put_i32(*y);
            }
            Packet::CursorMotion { surface, x, y } => {
                w.put_str(surface);
                w.put_i32(*x);
                w.put_i32(*y);
            }
            Packet::SoundStart | Packet::SoundStop => {}
        }
        w.into_frame()
    }

    /// Decode a frame body (opcode + payload). Packets that require an
    /// out-of-band file descriptor take the oldest one queued for the
    /// connection.
    pub fn decode(body: &[u8], fds: &mut VecDeque<OwnedFd>) -> Result<Packet, ProtocolError> {
        let mut r = Reader::new(body);
        let opcode = r.u32()?;
        let packet = match opcode {
            op::REGISTER_SURFACE_FILE => Packet::RegisterSurfaceFile {
                name: r.string()?,
                path: r.string()?,
                width: r.u32()?,
                height: r.u32()?,
            },
            op::REGISTER_SURFACE_SHM => {
                let name = r.string()?;
                let width = r.u32()?;
                let height = r.u32()?;
                let fd = fds.pop_front().ok_or(ProtocolError::FdMissing)?;
                Packet::RegisterSurfaceShm { name, width, height, fd: Arc::new(fd) }
            }
            op::UNREGISTER_SURFACE => Packet::UnregisterSurface { name: r.string()? },
            op::SET_SURFACE_POSITION => Packet::SetSurfacePosition {
                name: r.string()?,
                x1: r.i32()?,
                y1: r.i32()?,
                x2: r.i32()?,
                y2: r.i32()?,
            },
            op::SET_SURFACE_STRATA => Packet::SetSurfaceStrata {
                name: r.string()?,
                strata: r.i32()?,
            },
            op::SET_SURFACE_ALPHA => Packet::SetSurfaceAlpha {
                name: r.string()?,
                alpha: r.f32()?,
            },
            op::ADD_SURFACE_DAMAGE => Packet::AddSurfaceDamage {
                name: r.string()?,
                x1: r.i32()?,
                y1: r.i32()?,
                x2: r.i32()?,
                y2: r.i32()?,
            },
            op::KEY_DOWN_REQUEST => Packet::KeyDownRequest { code: r.i32()? },
            op::KEY_UP_REQUEST => Packet::KeyUpRequest { code: r.i32()? },
            op::ECHO => Packet::Echo { bytes: r.bytes()? },
            op::DISPLAY_SIZE => Packet::DisplaySize {
                width: r.u32()?,
                height: r.u32()?,
            },
            op::POINTER_DOWN | op::POINTER_UP | op::POINTER_MOTION => {
                let surface = r.string()?;
                let slot = r.i32()?;
                let x = r.i32()?;
                let y = r.i32()?;
                match opcode {
                    op::POINTER_DOWN => Packet::PointerDown { surface, slot, x, y },
                    op::POINTER_UP => Packet::PointerUp { surface, slot, x, y },
                    _ => Packet::PointerMotion { surface, slot, x, y },
                }
            }
            op::BUTTON_PRESS | op::BUTTON_RELEASE => {
                let surface = r.string()?;
                let button = r.i32()?;
                let x = r.i32()?;
                let y = r.i32()?;
                if opcode == op::BUTTON_PRESS {
                    Packet::ButtonPress { surface, button, x, y }
                } else {
                    Packet::ButtonRelease { surface, button, x, y }
                }
            }
            op::CURSOR_MOTION => Packet::CursorMotion {
                surface: r.string()?,
                x: r.i32()?,
                y: r.i32()?,
            },
            op::KEY_DOWN => Packet::KeyDown { code: r.i32()? },
            op::KEY_UP => Packet::KeyUp { code: r.i32()? },
            op::SOUND_START => Packet::SoundStart,
            op::SOUND_DATA => Packet::SoundData { bytes: r.bytes()? },
            op::SOUND_STOP => Packet::SoundStop,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(packet)
    }
}
