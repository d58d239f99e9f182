//! Platform port: the contract between a windowing backend and the
//! compositor.
//!
//! A platform owns the native display and window and tells the compositor
//! about them through signals; the compositor pulls a render device while a
//! window is up. Input arrives in display-space coordinates.

pub mod headless;

use anyhow::Result;

use crate::render::RenderDevice;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy)]
pub struct PointerEvent {
    pub slot: i32,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ButtonEvent {
    pub button: i32,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct CursorEvent {
    pub x: i32,
    pub y: i32,
}

/// Lifecycle and input signals a platform emits toward the compositor.
#[derive(Default)]
pub struct PlatformEvents {
    /// A native window exists; `create_render_device` is now valid.
    pub window_ready: Signal<()>,
    /// The native window is going away; textures and the device must drop.
    pub window_lost: Signal<()>,
    /// The native display is going away; implies `window_lost`.
    pub display_lost: Signal<()>,
    /// Frame tick.
    pub draw: Signal<()>,

    pub pointer_down: Signal<PointerEvent>,
    pub pointer_up: Signal<PointerEvent>,
    pub pointer_motion: Signal<PointerEvent>,
    pub button_press: Signal<ButtonEvent>,
    pub button_release: Signal<ButtonEvent>,
    pub cursor_motion: Signal<CursorEvent>,
    pub key_down: Signal<i32>,
    pub key_up: Signal<i32>,
}

impl PlatformEvents {
    pub fn new() -> Self {
        Self::default()
    }
}

pub trait Platform {
    fn events(&self) -> &PlatformEvents;

    /// Build the render device for the current native window. Only valid
    /// between `window_ready` and `window_lost`.
    fn create_render_device(&self) -> Result<Box<dyn RenderDevice>>;
}
