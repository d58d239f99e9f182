//! Surface registry: named, strata-ordered, damage-tracked.

use tracing::debug;

use crate::render::{RenderDevice, TextureId};
use crate::shm::PixelBuffer;

/// Axis-aligned rectangle, corners in pixels, half-open in both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Inclusive on all edges; this is the hit-testing convention.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    /// Coordinate-wise min/max union.
    pub fn union(&self, other: Rect) -> Rect {
        Rect {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    pub fn clamp_to(&self, width: i32, height: i32) -> Rect {
        Rect {
            x1: self.x1.clamp(0, width),
            y1: self.y1.clamp(0, height),
            x2: self.x2.clamp(0, width),
            y2: self.y2.clamp(0, height),
        }
    }
}

/// GPU texture shadowing a surface's pixels. Created lazily on the first
/// frame, destroyed on window teardown.
#[derive(Debug, Clone, Copy)]
pub struct TextureState {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
}

pub struct Surface {
    name: String,
    buffer: PixelBuffer,
    position: Rect,
    strata: i32,
    alpha: f32,
    damage: Option<Rect>,
    texture: Option<TextureState>,
}

impl Surface {
    pub fn new(name: String, buffer: PixelBuffer) -> Self {
        Self {
            name,
            buffer,
            position: Rect::default(),
            strata: 0,
            alpha: 1.0,
            damage: None,
            texture: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn position(&self) -> &Rect {
        &self.position
    }

    pub fn strata(&self) -> i32 {
        self.strata
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn damage(&self) -> Option<Rect> {
        self.damage
    }

    pub fn texture(&self) -> Option<TextureState> {
        self.texture
    }

    /// Union the damage rectangle in, clamped to the buffer bounds.
    pub fn add_damage(&mut self, rect: Rect) {
        let rect = rect.clamp_to(self.buffer.width() as i32, self.buffer.height() as i32);
        if rect.is_empty() {
            return;
        }
        self.damage = Some(match self.damage {
            Some(damage) => damage.union(rect),
            None => rect,
        });
    }

    /// Bring the texture in line with the pixel buffer. Returns true when
    /// anything was uploaded, i.e. the frame needs a redraw.
    pub fn update_texture(&mut self, device: &mut dyn RenderDevice) -> bool {
        let (width, height) = (self.buffer.width(), self.buffer.height());

        let texture = self.texture.get_or_insert_with(|| TextureState {
            id: device.create_texture(),
            width: 0,
            height: 0,
        });

        if texture.width != width || texture.height != height {
            device.resize_texture(texture.id, width, height);
            texture.width = width;
            texture.height = height;
            self.damage = Some(Rect::new(0, 0, width as i32, height as i32));
        }

        if let Some(damage) = self.damage.take() {
            // Full-width band covering the damaged rows; X extents are
            // intentionally discarded at upload.
            let y = damage.y1 as u32;
            let rows = damage.height() as u32;
            device.upload_rows(texture.id, width, y, rows, self.buffer.rows(y, rows));
            return true;
        }
        false
    }

    pub fn destroy_texture(&mut self, device: &mut dyn RenderDevice) {
        if let Some(texture) = self.texture.take() {
            device.delete_texture(texture.id);
        }
    }
}

/// All registered surfaces, kept in draw order: ascending strata, insertion
/// order breaking ties.
#[derive(Default)]
pub struct SurfaceRegistry {
    surfaces: Vec<Surface>,
    dirty: bool,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a surface. A pre-existing surface with the same name is
    /// destroyed first.
    pub fn insert(&mut self, surface: Surface) {
        self.remove(surface.name());
        debug!("surface [{}] registered", surface.name());
        self.surfaces.push(surface);
        self.sort();
        self.dirty = true;
    }

    /// Remove every surface with this name; absence is fine.
    pub fn remove(&mut self, name: &str) {
        let before = self.surfaces.len();
        self.surfaces.retain(|s| s.name() != name);
        if self.surfaces.len() != before {
            debug!("surface [{name}] unregistered");
            self.dirty = true;
        }
    }

    pub fn set_position(&mut self, name: &str, rect: Rect) {
        if let Some(surface) = self.find_mut(name) {
            surface.position = rect;
            self.dirty = true;
            debug!(
                "surface [{name}]: position changed ({} {} {} {})",
                rect.x1, rect.y1, rect.x2, rect.y2
            );
        }
    }

    pub fn set_strata(&mut self, name: &str, strata: i32) {
        if let Some(surface) = self.find_mut(name) {
            surface.strata = strata;
            self.sort();
            self.dirty = true;
            debug!("surface [{name}]: strata changed");
        }
    }

    pub fn set_alpha(&mut self, name: &str, alpha: f32) {
        if let Some(surface) = self.find_mut(name) {
            surface.alpha = alpha.clamp(0.0, 1.0);
            self.dirty = true;
            debug!("surface [{name}]: alpha changed");
        }
    }

    /// Enlarge a surface's damage. Does not mark the registry dirty; the
    /// upload path reports dirtiness on the next frame.
    pub fn add_damage(&mut self, name: &str, rect: Rect) {
        if let Some(surface) = self.find_mut(name) {
            surface.add_damage(rect);
        }
    }

    /// True once since the last call if any operation changed what a frame
    /// would draw.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.name() == name)
    }

    /// Draw order.
    pub fn iter(&self) -> impl Iterator<Item = &Surface> {
        self.surfaces.iter()
    }

    /// Draw order, mutable; for texture updates.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Surface> {
        self.surfaces.iter_mut()
    }

    /// Hit-test order: topmost first.
    pub fn iter_topmost_first(&self) -> impl Iterator<Item = &Surface> {
        self.surfaces.iter().rev()
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Surface> {
        let found = self.surfaces.iter_mut().find(|s| s.name() == name);
        if found.is_none() {
            debug!("surface [{name}]: not registered");
        }
        found
    }

    fn sort(&mut self) {
        // Stable: insertion order survives within a stratum.
        self.surfaces.sort_by_key(|s| s.strata);
    }
}
