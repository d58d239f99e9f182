//! The compositor: frame loop, packet dispatch and input broadcast.
//!
//! All state lives on the event-loop thread behind `Rc<RefCell<_>>`;
//! platform and server signals are wired with queued slots, so every
//! mutation runs between poll turns and a draw tick never observes a
//! half-applied packet.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use glint_ipc::{Packet, SharedFd};
use tracing::{debug, error, info, warn};

use crate::event_loop::{LoopHandle, LoopSender};
use crate::input::hit_test;
use crate::platform::{ButtonEvent, CursorEvent, Platform, PointerEvent};
use crate::registry::{Rect, Surface, SurfaceRegistry};
use crate::render::{RenderDevice, QUAD_FLOATS};
use crate::server::{ConnectionId, IpcServer};
use crate::shm::PixelBuffer;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, Default)]
pub struct CompositorOptions {
    /// Re-broadcast `echo` payloads to every client. Debug affordance,
    /// off by default.
    pub echo_broadcast: bool,
    /// Upload every surface in full on every frame.
    pub force_full_upload: bool,
}

pub struct Compositor {
    registry: SurfaceRegistry,
    server: IpcServer,
    platform: Rc<dyn Platform>,
    device: Option<Box<dyn RenderDevice>>,
    surface_size: (i32, i32),
    /// Scratch vertex data reused for every quad; never reallocated.
    plane: [f32; QUAD_FLOATS],
    redraw: bool,
    options: CompositorOptions,
    loop_sender: LoopSender,
    /// Emitted after every presented frame.
    pub frame: Signal<()>,
}

impl Compositor {
    pub fn new(
        platform: Rc<dyn Platform>,
        server: IpcServer,
        loop_sender: LoopSender,
        options: CompositorOptions,
    ) -> Rc<RefCell<Self>> {
        let mut plane = [0.0f32; QUAD_FLOATS];
        // Static parts of the strip: z = 0 everywhere, UVs per corner:
        // (0,0) (1,0) (0,1) (1,1).
        plane[8] = 1.0;
        plane[14] = 1.0;
        plane[18] = 1.0;
        plane[19] = 1.0;

        Rc::new(RefCell::new(Self {
            registry: SurfaceRegistry::new(),
            server,
            platform,
            device: None,
            surface_size: (0, 0),
            plane,
            redraw: false,
            options,
            loop_sender,
            frame: Signal::new(),
        }))
    }

    /// Connect platform and server signals; all handlers run queued on the
    /// loop behind `handle`.
    pub fn wire(compositor: &Rc<RefCell<Self>>, handle: &LoopHandle) {
        let platform = compositor.borrow().platform.clone();
        let events = platform.events();

        let c = compositor.clone();
        events
            .window_ready
            .connect_queued(handle, move |_| c.borrow_mut().window_ready());
        let c = compositor.clone();
        events
            .window_lost
            .connect_queued(handle, move |_| c.borrow_mut().window_lost());
        let c = compositor.clone();
        events
            .display_lost
            .connect_queued(handle, move |_| c.borrow_mut().window_lost());
        let c = compositor.clone();
        events
            .draw
            .connect_queued(handle, move |_| c.borrow_mut().draw());

        let c = compositor.clone();
        events
            .pointer_down
            .connect_queued(handle, move |e| c.borrow_mut().pointer_down(e));
        let c = compositor.clone();
        events
            .pointer_up
            .connect_queued(handle, move |e| c.borrow_mut().pointer_up(e));
        let c = compositor.clone();
        events
            .pointer_motion
            .connect_queued(handle, move |e| c.borrow_mut().pointer_motion(e));
        let c = compositor.clone();
        events
            .button_press
            .connect_queued(handle, move |e| c.borrow_mut().button_press(e));
        let c = compositor.clone();
        events
            .button_release
            .connect_queued(handle, move |e| c.borrow_mut().button_release(e));
        let c = compositor.clone();
        events
            .cursor_motion
            .connect_queued(handle, move |e| c.borrow_mut().cursor_motion(e));
        let c = compositor.clone();
        events
            .key_down
            .connect_queued(handle, move |code| c.borrow_mut().key_down(code));
        let c = compositor.clone();
        events
            .key_up
            .connect_queued(handle, move |code| c.borrow_mut().key_up(code));

        let server = compositor.borrow().server.clone();
        let c = compositor.clone();
        server
            .connected()
            .connect_queued(handle, move |id| c.borrow_mut().client_connected(id));
        let c = compositor.clone();
        server
            .packets()
            .connect_queued(handle, move |(id, packet)| {
                c.borrow_mut().handle_packet(id, packet)
            });
    }

    pub fn display_size(&self) -> (i32, i32) {
        self.surface_size
    }

    // ---- window lifecycle -------------------------------------------------

    fn window_ready(&mut self) {
        // A second window without an intervening teardown replaces the
        // device; textures must not outlive the one that made them.
        self.window_lost();
        match self.platform.create_render_device() {
            Ok(mut device) => {
                let (width, height) = device.surface_size();
                device.set_viewport(width, height);
                self.surface_size = (width, height);
                self.server.broadcast(&Packet::DisplaySize {
                    width: width as u32,
                    height: height as u32,
                });
                self.device = Some(device);
                self.redraw = true;
                info!("window up ({width}x{height})");
            }
            Err(e) => {
                // Renderer bring-up failures are fatal for the compositor.
                error!("failed to initialize renderer: {e:#}");
                self.loop_sender.exit();
            }
        }
    }

    /// Textures go before the device; surfaces stay registered and upload
    /// in full on the next window.
    fn window_lost(&mut self) {
        if let Some(mut device) = self.device.take() {
            for surface in self.registry.iter_mut() {
                surface.destroy_texture(device.as_mut());
            }
            info!("window down, renderer released");
        }
    }

    // ---- frame ------------------------------------------------------------

    fn draw(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let device = device.as_mut();

        let (width, height) = device.surface_size();
        if (width, height) != self.surface_size {
            self.surface_size = (width, height);
            device.set_viewport(width, height);
            self.server.broadcast(&Packet::DisplaySize {
                width: width as u32,
                height: height as u32,
            });
        }

        if self.options.force_full_upload {
            for surface in self.registry.iter_mut() {
                let full = Rect::new(
                    0,
                    0,
                    surface.buffer().width() as i32,
                    surface.buffer().height() as i32,
                );
                surface.add_damage(full);
            }
        }

        let mut redraw = std::mem::take(&mut self.redraw) | self.registry.take_dirty();
        for surface in self.registry.iter_mut() {
            redraw |= surface.update_texture(device);
        }
        if !redraw {
            return;
        }

        device.clear();
        for surface in self.registry.iter() {
            let Some(texture) = surface.texture() else {
                continue;
            };
            write_quad(&mut self.plane, surface.position(), width, height);
            device.draw_quad(texture.id, &self.plane, surface.alpha());
        }
        device.present();
        self.frame.emit(&());
    }

    // ---- clients ----------------------------------------------------------

    fn client_connected(&mut self, id: ConnectionId) {
        if self.device.is_some() {
            let (width, height) = self.surface_size;
            self.server.send(
                id,
                &Packet::DisplaySize {
                    width: width as u32,
                    height: height as u32,
                },
            );
        }
    }

    fn handle_packet(&mut self, id: ConnectionId, packet: Packet) {
        match packet {
            Packet::RegisterSurfaceFile { name, path, width, height } => {
                self.register_file(id, name, path, width, height);
            }
            Packet::RegisterSurfaceShm { name, width, height, fd } => {
                self.register_shm(id, name, width, height, fd);
            }
            Packet::UnregisterSurface { name } => self.registry.remove(&name),
            Packet::SetSurfacePosition { name, x1, y1, x2, y2 } => {
                self.registry.set_position(&name, Rect::new(x1, y1, x2, y2));
            }
            Packet::SetSurfaceStrata { name, strata } => {
                self.registry.set_strata(&name, strata);
            }
            Packet::SetSurfaceAlpha { name, alpha } => {
                self.registry.set_alpha(&name, alpha);
            }
            Packet::AddSurfaceDamage { name, x1, y1, x2, y2 } => {
                self.registry.add_damage(&name, Rect::new(x1, y1, x2, y2));
            }
            Packet::KeyDownRequest { code } => {
                self.server.broadcast(&Packet::KeyDown { code });
            }
            Packet::KeyUpRequest { code } => {
                self.server.broadcast(&Packet::KeyUp { code });
            }
            Packet::Echo { bytes } => {
                if self.options.echo_broadcast {
                    self.server.broadcast(&Packet::Echo { bytes });
                } else {
                    debug!("client {id}: echo dropped (disabled)");
                }
            }
            other => {
                debug!("client {id}: unexpected opcode {}", other.opcode());
            }
        }
    }

    fn register_file(
        &mut self,
        id: ConnectionId,
        name: String,
        path: String,
        width: u32,
        height: u32,
    ) {
        if name.is_empty() {
            warn!("client {id}: surface name is empty");
            return;
        }
        match PixelBuffer::open_file(Path::new(&path), width, height) {
            Ok(buffer) => self.registry.insert(Surface::new(name, buffer)),
            Err(e) => warn!("client {id}: failed to register [{name}]: {e:#}"),
        }
    }

    fn register_shm(
        &mut self,
        id: ConnectionId,
        name: String,
        width: u32,
        height: u32,
        fd: SharedFd,
    ) {
        if name.is_empty() {
            warn!("client {id}: surface name is empty");
            return;
        }
        let buffer = fd
            .try_clone()
            .map_err(anyhow::Error::from)
            .and_then(|fd| PixelBuffer::from_fd(fd, width, height));
        match buffer {
            Ok(buffer) => self.registry.insert(Surface::new(name, buffer)),
            Err(e) => warn!("client {id}: failed to register [{name}]: {e:#}"),
        }
    }

    // ---- input ------------------------------------------------------------

    fn pointer_down(&mut self, event: PointerEvent) {
        if let Some((surface, (x, y))) = hit_test(&self.registry, event.x, event.y) {
            let surface = surface.name().to_string();
            self.server.broadcast(&Packet::PointerDown {
                surface,
                slot: event.slot,
                x,
                y,
            });
        }
    }

    fn pointer_up(&mut self, event: PointerEvent) {
        if let Some((surface, (x, y))) = hit_test(&self.registry, event.x, event.y) {
            let surface = surface.name().to_string();
            self.server.broadcast(&Packet::PointerUp {
                surface,
                slot: event.slot,
                x,
                y,
            });
        }
    }

    fn pointer_motion(&mut self, event: PointerEvent) {
        if let Some((surface, (x, y))) = hit_test(&self.registry, event.x, event.y) {
            let surface = surface.name().to_string();
            self.server.broadcast(&Packet::PointerMotion {
                surface,
                slot: event.slot,
                x,
                y,
            });
        }
    }

    fn button_press(&mut self, event: ButtonEvent) {
        if let Some((surface, (x, y))) = hit_test(&self.registry, event.x, event.y) {
            let surface = surface.name().to_string();
            self.server.broadcast(&Packet::ButtonPress {
                surface,
                button: event.button,
                x,
                y,
            });
        }
    }

    fn button_release(&mut self, event: ButtonEvent) {
        if let Some((surface, (x, y))) = hit_test(&self.registry, event.x, event.y) {
            let surface = surface.name().to_string();
            self.server.broadcast(&Packet::ButtonRelease {
                surface,
                button: event.button,
                x,
                y,
            });
        }
    }

    fn cursor_motion(&mut self, event: CursorEvent) {
        if let Some((surface, (x, y))) = hit_test(&self.registry, event.x, event.y) {
            let surface = surface.name().to_string();
            self.server
                .broadcast(&Packet::CursorMotion { surface, x, y });
        }
    }

    /// Key events carry no coordinates and broadcast unconditionally.
    fn key_down(&mut self, code: i32) {
        self.server.broadcast(&Packet::KeyDown { code });
    }

    fn key_up(&mut self, code: i32) {
        self.server.broadcast(&Packet::KeyUp { code });
    }
}

/// Map a display-pixel rectangle into the NDC strip vertices. Y flips:
/// display grows downward, NDC grows upward.
fn write_quad(plane: &mut [f32; QUAD_FLOATS], position: &Rect, width: i32, height: i32) {
    let x1 = 2.0 * position.x1 as f32 / width as f32 - 1.0;
    let y1 = 1.0 - 2.0 * position.y1 as f32 / height as f32;
    let x2 = 2.0 * position.x2 as f32 / width as f32 - 1.0;
    let y2 = 1.0 - 2.0 * position.y2 as f32 / height as f32;

    plane[0] = x1;
    plane[1] = y1;
    plane[5] = x2;
    plane[6] = y1;
    plane[10] = x1;
    plane[11] = y2;
    plane[15] = x2;
    plane[16] = y2;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::platform::PlatformEvents;
    use crate::render::headless::{DeviceStats, HeadlessDevice, SizeHandle};
    use crate::render::TextureId;
    use anyhow::Result;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::fs::File;
    use std::io::{Read, Write as IoWrite};
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::time::Duration;

    struct TestPlatform {
        events: PlatformEvents,
        size: SizeHandle,
        stats: Rc<RefCell<DeviceStats>>,
    }

    impl TestPlatform {
        fn new(width: i32, height: i32) -> Rc<Self> {
            Rc::new(Self {
                events: PlatformEvents::new(),
                size: Rc::new(Cell::new((width, height))),
                stats: Rc::default(),
            })
        }
    }

    impl Platform for TestPlatform {
        fn events(&self) -> &PlatformEvents {
            &self.events
        }

        fn create_render_device(&self) -> Result<Box<dyn RenderDevice>> {
            Ok(Box::new(HeadlessDevice::with_shared(
                self.size.clone(),
                self.stats.clone(),
            )))
        }
    }

    struct Fixture {
        event_loop: EventLoop,
        compositor: Rc<RefCell<Compositor>>,
        platform: Rc<TestPlatform>,
        path: PathBuf,
        scratch: Vec<PathBuf>,
    }

    impl Fixture {
        fn new(tag: &str) -> Self {
            let event_loop = EventLoop::new().unwrap();
            let handle = event_loop.handle();
            let path = std::env::temp_dir()
                .join(format!("glint-comp-{}-{tag}.sock", std::process::id()));
            let server = IpcServer::bind(&path, handle.clone()).unwrap();
            let platform = TestPlatform::new(800, 600);

            let compositor = Compositor::new(
                platform.clone(),
                server,
                event_loop.sender(),
                CompositorOptions::default(),
            );
            Compositor::wire(&compositor, &handle);

            Self {
                event_loop,
                compositor,
                platform,
                path,
                scratch: Vec::new(),
            }
        }

        fn pump(&mut self, turns: usize) {
            for _ in 0..turns {
                self.event_loop
                    .dispatch(Some(Duration::from_millis(20)))
                    .unwrap();
            }
        }

        fn pixel_file(&mut self, tag: &str, width: u32, height: u32, pixels: &[u8]) -> String {
            let path = std::env::temp_dir().join(format!(
                "glint-comp-{}-{tag}.pixels",
                std::process::id()
            ));
            let mut file = File::create(&path).unwrap();
            assert_eq!(pixels.len(), (width * height * 4) as usize);
            file.write_all(pixels).unwrap();
            self.scratch.push(path.clone());
            path.to_string_lossy().into_owned()
        }

        fn register(&mut self, name: &str, tag: &str, width: u32, height: u32) {
            let pixels = vec![0xffu8; (width * height * 4) as usize];
            let path = self.pixel_file(tag, width, height, &pixels);
            self.compositor.borrow_mut().handle_packet(
                1,
                Packet::RegisterSurfaceFile {
                    name: name.into(),
                    path,
                    width,
                    height,
                },
            );
        }

        fn texture_of(&self, name: &str) -> TextureId {
            self.compositor
                .borrow()
                .registry
                .get(name)
                .unwrap()
                .texture()
                .unwrap()
                .id
        }

        fn read_packet(client: &mut UnixStream) -> Packet {
            client
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            let mut len = [0u8; 4];
            client.read_exact(&mut len).unwrap();
            let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
            client.read_exact(&mut body).unwrap();
            let mut fds = VecDeque::new();
            Packet::decode(&body, &mut fds).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_file(&self.path).ok();
            for path in &self.scratch {
                std::fs::remove_file(path).ok();
            }
        }
    }

    #[test]
    fn test_register_and_draw_uploads_once() {
        let mut fx = Fixture::new("draw");
        let pixels: Vec<u8> = [
            [0x00, 0x00, 0xff, 0xff], // red
            [0x00, 0xff, 0x00, 0xff], // green
            [0xff, 0x00, 0x00, 0xff], // blue
            [0xff, 0xff, 0xff, 0xff], // white
        ]
        .concat();
        let path = fx.pixel_file("quad", 2, 2, &pixels);

        {
            let mut compositor = fx.compositor.borrow_mut();
            compositor.window_ready();
            compositor.handle_packet(
                1,
                Packet::RegisterSurfaceFile {
                    name: "a".into(),
                    path,
                    width: 2,
                    height: 2,
                },
            );
            compositor.handle_packet(
                1,
                Packet::SetSurfacePosition { name: "a".into(), x1: 0, y1: 0, x2: 2, y2: 2 },
            );
            compositor.handle_packet(
                1,
                Packet::AddSurfaceDamage { name: "a".into(), x1: 0, y1: 0, x2: 2, y2: 2 },
            );
            compositor.draw();
        }

        let stats = fx.platform.stats.borrow();
        assert_eq!(stats.uploads.len(), 1);
        assert_eq!(stats.uploads[0].bytes, 16);
        assert_eq!(stats.presents, 1);
        drop(stats);

        // Redraw flag is clear: a second tick does nothing.
        fx.compositor.borrow_mut().draw();
        let stats = fx.platform.stats.borrow();
        assert_eq!(stats.uploads.len(), 1);
        assert_eq!(stats.presents, 1);
    }

    #[test]
    fn test_strata_change_reorders_draws() {
        let mut fx = Fixture::new("strata");
        fx.compositor.borrow_mut().window_ready();
        fx.register("a", "sa", 2, 2);
        fx.register("b", "sb", 2, 2);
        {
            let mut compositor = fx.compositor.borrow_mut();
            compositor.handle_packet(
                1,
                Packet::SetSurfacePosition { name: "a".into(), x1: 0, y1: 0, x2: 800, y2: 600 },
            );
            compositor.handle_packet(
                1,
                Packet::SetSurfacePosition { name: "b".into(), x1: 0, y1: 0, x2: 800, y2: 600 },
            );
            compositor.handle_packet(
                1,
                Packet::SetSurfaceStrata { name: "b".into(), strata: 1 },
            );
            compositor.draw();
        }

        let (a, b) = (fx.texture_of("a"), fx.texture_of("b"));
        {
            let stats = fx.platform.stats.borrow();
            let order: Vec<TextureId> = stats.draws.iter().map(|d| d.id).collect();
            assert_eq!(order, vec![a, b]);
        }

        fx.platform.stats.borrow_mut().draws.clear();
        {
            let mut compositor = fx.compositor.borrow_mut();
            compositor.handle_packet(
                1,
                Packet::SetSurfaceStrata { name: "a".into(), strata: 2 },
            );
            compositor.draw();
        }
        let stats = fx.platform.stats.borrow();
        let order: Vec<TextureId> = stats.draws.iter().map(|d| d.id).collect();
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn test_alpha_gates_blending_per_quad() {
        let mut fx = Fixture::new("alpha");
        fx.compositor.borrow_mut().window_ready();
        fx.register("a", "aa", 2, 2);
        fx.register("b", "ab", 2, 2);
        {
            let mut compositor = fx.compositor.borrow_mut();
            compositor.handle_packet(
                1,
                Packet::SetSurfacePosition { name: "a".into(), x1: 0, y1: 0, x2: 800, y2: 600 },
            );
            compositor.handle_packet(
                1,
                Packet::SetSurfacePosition { name: "b".into(), x1: 0, y1: 0, x2: 800, y2: 600 },
            );
            compositor.handle_packet(
                1,
                Packet::SetSurfaceAlpha { name: "a".into(), alpha: 0.5 },
            );
            compositor.draw();
        }

        let a = fx.texture_of("a");
        let stats = fx.platform.stats.borrow();
        for draw in &stats.draws {
            if draw.id == a {
                assert_eq!(draw.alpha, 0.5);
            } else {
                assert_eq!(draw.alpha, 1.0);
            }
        }
    }

    #[test]
    fn test_quad_vertices_cover_ndc() {
        let mut fx = Fixture::new("ndc");
        fx.compositor.borrow_mut().window_ready();
        fx.register("a", "na", 2, 2);
        {
            let mut compositor = fx.compositor.borrow_mut();
            compositor.handle_packet(
                1,
                Packet::SetSurfacePosition { name: "a".into(), x1: 0, y1: 0, x2: 800, y2: 600 },
            );
            compositor.draw();
        }

        let stats = fx.platform.stats.borrow();
        let v = &stats.draws[0].vertices;
        // Full-display rectangle maps to the full NDC square, Y flipped.
        assert_eq!((v[0], v[1]), (-1.0, 1.0));
        assert_eq!((v[5], v[6]), (1.0, 1.0));
        assert_eq!((v[10], v[11]), (-1.0, -1.0));
        assert_eq!((v[15], v[16]), (1.0, -1.0));
        // UVs: (0,0) (1,0) (0,1) (1,1).
        assert_eq!((v[3], v[4]), (0.0, 0.0));
        assert_eq!((v[8], v[9]), (1.0, 0.0));
        assert_eq!((v[13], v[14]), (0.0, 1.0));
        assert_eq!((v[18], v[19]), (1.0, 1.0));
    }

    #[test]
    fn test_resize_broadcasts_once() {
        let mut fx = Fixture::new("resize");
        fx.compositor.borrow_mut().window_ready();

        let mut client = UnixStream::connect(&fx.path).unwrap();
        fx.pump(2);

        // Connect-time notification carries the current size.
        match Fixture::read_packet(&mut client) {
            Packet::DisplaySize { width, height } => assert_eq!((width, height), (800, 600)),
            other => panic!("wrong packet: {other:?}"),
        }

        fx.platform.size.set((1024, 768));
        fx.register("a", "ra", 2, 2);
        fx.compositor.borrow_mut().draw();
        fx.pump(2);

        match Fixture::read_packet(&mut client) {
            Packet::DisplaySize { width, height } => assert_eq!((width, height), (1024, 768)),
            other => panic!("wrong packet: {other:?}"),
        }

        // Exactly one notification per change: the next draw is silent.
        fx.compositor.borrow_mut().draw();
        fx.pump(2);
        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut probe = [0u8; 1];
        assert!(client.read_exact(&mut probe).is_err());
    }

    #[test]
    fn test_pointer_routing_end_to_end() {
        let mut fx = Fixture::new("pointer");
        fx.compositor.borrow_mut().window_ready();
        fx.register("a", "pa", 100, 100);
        fx.register("b", "pb", 100, 100);
        {
            let mut compositor = fx.compositor.borrow_mut();
            compositor.handle_packet(
                1,
                Packet::SetSurfacePosition { name: "a".into(), x1: 0, y1: 0, x2: 100, y2: 100 },
            );
            compositor.handle_packet(
                1,
                Packet::SetSurfacePosition { name: "b".into(), x1: 50, y1: 50, x2: 150, y2: 150 },
            );
            compositor.handle_packet(
                1,
                Packet::SetSurfaceStrata { name: "b".into(), strata: 1 },
            );
        }

        let mut client = UnixStream::connect(&fx.path).unwrap();
        fx.pump(2);
        match Fixture::read_packet(&mut client) {
            Packet::DisplaySize { .. } => {}
            other => panic!("wrong packet: {other:?}"),
        }

        fx.compositor
            .borrow_mut()
            .pointer_down(PointerEvent { slot: 0, x: 60, y: 60 });
        fx.pump(2);
        match Fixture::read_packet(&mut client) {
            Packet::PointerDown { surface, slot, x, y } => {
                assert_eq!(surface, "b");
                assert_eq!((slot, x, y), (0, 10, 10));
            }
            other => panic!("wrong packet: {other:?}"),
        }

        fx.compositor
            .borrow_mut()
            .pointer_down(PointerEvent { slot: 0, x: 10, y: 10 });
        fx.pump(2);
        match Fixture::read_packet(&mut client) {
            Packet::PointerDown { surface, .. } => assert_eq!(surface, "a"),
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frame_then_valid_unregister() {
        use glint_ipc::wire::Writer;

        let mut fx = Fixture::new("malformed");
        fx.register("a", "ma", 2, 2);
        assert!(fx.compositor.borrow().registry.get("a").is_some());

        let mut client = UnixStream::connect(&fx.path).unwrap();
        fx.pump(2);

        let mut bogus = Writer::new();
        bogus.put_u32(0xfeed_face);
        client.write_all(&bogus.into_frame()).unwrap();
        client
            .write_all(&Packet::UnregisterSurface { name: "a".into() }.encode())
            .unwrap();
        fx.pump(2);

        assert!(fx.compositor.borrow().registry.get("a").is_none());
        assert_eq!(fx.compositor.borrow().server.connection_count(), 1);
    }

    #[test]
    fn test_key_requests_rebroadcast() {
        let mut fx = Fixture::new("keys");
        let mut client = UnixStream::connect(&fx.path).unwrap();
        fx.pump(2);

        client
            .write_all(&Packet::KeyDownRequest { code: 30 }.encode())
            .unwrap();
        fx.pump(2);
        match Fixture::read_packet(&mut client) {
            Packet::KeyDown { code } => assert_eq!(code, 30),
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn test_echo_is_gated() {
        let mut fx = Fixture::new("echo");
        let mut client = UnixStream::connect(&fx.path).unwrap();
        fx.pump(2);

        // Disabled by default: nothing comes back.
        client
            .write_all(&Packet::Echo { bytes: vec![1, 2, 3] }.encode())
            .unwrap();
        fx.pump(2);
        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut probe = [0u8; 1];
        assert!(client.read_exact(&mut probe).is_err());

        fx.compositor.borrow_mut().options.echo_broadcast = true;
        client
            .write_all(&Packet::Echo { bytes: vec![4, 5] }.encode())
            .unwrap();
        fx.pump(2);
        match Fixture::read_packet(&mut client) {
            Packet::Echo { bytes } => assert_eq!(bytes, vec![4, 5]),
            other => panic!("wrong packet: {other:?}"),
        }
    }

    #[test]
    fn test_surfaces_survive_disconnect() {
        let mut fx = Fixture::new("survive");
        let client = UnixStream::connect(&fx.path).unwrap();
        fx.pump(2);

        fx.register("a", "va", 2, 2);
        drop(client);
        fx.pump(2);

        // Disconnect cleanup is intentionally absent: a restarted client
        // re-registers under the same name and replaces the surface.
        assert_eq!(fx.compositor.borrow().server.connection_count(), 0);
        assert!(fx.compositor.borrow().registry.get("a").is_some());
    }

    #[test]
    fn test_window_teardown_keeps_surfaces() {
        let mut fx = Fixture::new("teardown");
        fx.compositor.borrow_mut().window_ready();
        fx.register("a", "ta", 2, 2);
        fx.compositor.borrow_mut().draw();
        assert!(fx.compositor.borrow().registry.get("a").unwrap().texture().is_some());

        fx.compositor.borrow_mut().window_lost();
        {
            let compositor = fx.compositor.borrow();
            let surface = compositor.registry.get("a").unwrap();
            assert!(surface.texture().is_none());
        }

        // New window: the surface re-uploads in full.
        fx.platform.stats.borrow_mut().uploads.clear();
        fx.compositor.borrow_mut().window_ready();
        fx.compositor.borrow_mut().draw();
        let stats = fx.platform.stats.borrow();
        assert_eq!(stats.uploads.len(), 1);
        assert_eq!(stats.uploads[0].bytes, 16);
    }
}
