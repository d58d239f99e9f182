//! Virtual render device for displayless runs and tests.
//!
//! Implements the full [`RenderDevice`] contract against an in-memory
//! output whose size can change from outside (the headless platform's
//! virtual resize, or a test). Every upload, draw and present is recorded.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::{RenderDevice, TextureId, QUAD_FLOATS};

/// Shared virtual output size.
pub type SizeHandle = Rc<Cell<(i32, i32)>>;

#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub id: TextureId,
    pub y: u32,
    pub rows: u32,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DrawRecord {
    pub id: TextureId,
    pub alpha: f32,
    pub vertices: [f32; QUAD_FLOATS],
}

#[derive(Debug, Default)]
pub struct DeviceStats {
    pub uploads: Vec<UploadRecord>,
    pub draws: Vec<DrawRecord>,
    pub clears: usize,
    pub presents: usize,
    pub viewport: (i32, i32),
}

pub struct HeadlessDevice {
    size: SizeHandle,
    stats: Rc<RefCell<DeviceStats>>,
    textures: HashMap<TextureId, (u32, u32)>,
    next_texture: u32,
}

impl HeadlessDevice {
    pub fn new(width: i32, height: i32) -> Self {
        Self::with_shared(Rc::new(Cell::new((width, height))), Rc::default())
    }

    pub fn with_shared(size: SizeHandle, stats: Rc<RefCell<DeviceStats>>) -> Self {
        Self {
            size,
            stats,
            textures: HashMap::new(),
            next_texture: 1,
        }
    }

    pub fn stats(&self) -> Rc<RefCell<DeviceStats>> {
        self.stats.clone()
    }
}

impl RenderDevice for HeadlessDevice {
    fn surface_size(&mut self) -> (i32, i32) {
        self.size.get()
    }

    fn set_viewport(&mut self, width: i32, height: i32) {
        self.stats.borrow_mut().viewport = (width, height);
    }

    fn create_texture(&mut self) -> TextureId {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(id, (0, 0));
        id
    }

    fn resize_texture(&mut self, id: TextureId, width: u32, height: u32) {
        if let Some(dims) = self.textures.get_mut(&id) {
            *dims = (width, height);
        }
    }

    fn upload_rows(&mut self, id: TextureId, _width: u32, y: u32, rows: u32, pixels: &[u8]) {
        self.stats.borrow_mut().uploads.push(UploadRecord {
            id,
            y,
            rows,
            bytes: pixels.len(),
        });
    }

    fn delete_texture(&mut self, id: TextureId) {
        self.textures.remove(&id);
    }

    fn clear(&mut self) {
        self.stats.borrow_mut().clears += 1;
    }

    fn draw_quad(&mut self, id: TextureId, vertices: &[f32; QUAD_FLOATS], alpha: f32) {
        self.stats.borrow_mut().draws.push(DrawRecord {
            id,
            alpha,
            vertices: *vertices,
        });
    }

    fn present(&mut self) {
        self.stats.borrow_mut().presents += 1;
    }
}
