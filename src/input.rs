//! Display-to-surface input transforms.
//!
//! Hit-testing walks surfaces topmost-first; the first surface whose
//! position rectangle contains the point (edges inclusive) claims the
//! event and the coordinates are rescaled into its pixel space.

use crate::registry::{Rect, Surface, SurfaceRegistry};

/// Rescale display coordinates into surface-local pixels, or None when the
/// point lies outside the rectangle.
pub fn surface_local(
    position: &Rect,
    buffer_width: u32,
    buffer_height: u32,
    x: i32,
    y: i32,
) -> Option<(i32, i32)> {
    if position.is_empty() || !position.contains(x, y) {
        return None;
    }
    Some((
        (x - position.x1) * buffer_width as i32 / position.width(),
        (y - position.y1) * buffer_height as i32 / position.height(),
    ))
}

/// The topmost surface containing the point, with its local coordinates.
pub fn hit_test(registry: &SurfaceRegistry, x: i32, y: i32) -> Option<(&Surface, (i32, i32))> {
    for surface in registry.iter_topmost_first() {
        let buffer = surface.buffer();
        if let Some(local) = surface_local(surface.position(), buffer.width(), buffer.height(), x, y)
        {
            return Some((surface, local));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Surface;
    use crate::shm::PixelBuffer;
    use std::fs::File;
    use std::io::Write;

    fn buffer(tag: &str, width: u32, height: u32) -> PixelBuffer {
        let path = std::env::temp_dir().join(format!("glint-input-{}-{tag}", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0u8; (width * height * 4) as usize])
            .unwrap();
        let buffer = PixelBuffer::open_file(&path, width, height).unwrap();
        std::fs::remove_file(path).ok();
        buffer
    }

    #[test]
    fn test_local_coordinates_scale_to_buffer() {
        let position = Rect::new(0, 0, 100, 100);
        // 200x50 buffer stretched over a 100x100 rectangle.
        assert_eq!(surface_local(&position, 200, 50, 50, 50), Some((100, 25)));
        assert_eq!(surface_local(&position, 200, 50, 0, 0), Some((0, 0)));
    }

    #[test]
    fn test_edges_are_inclusive() {
        let position = Rect::new(10, 10, 20, 20);
        assert!(surface_local(&position, 10, 10, 10, 10).is_some());
        assert!(surface_local(&position, 10, 10, 20, 20).is_some());
        assert!(surface_local(&position, 10, 10, 9, 10).is_none());
        assert!(surface_local(&position, 10, 10, 21, 20).is_none());
    }

    #[test]
    fn test_degenerate_rectangle_never_matches() {
        let position = Rect::new(5, 5, 5, 5);
        assert!(surface_local(&position, 10, 10, 5, 5).is_none());
    }

    #[test]
    fn test_topmost_surface_claims_the_event() {
        let mut registry = SurfaceRegistry::new();
        registry.insert(Surface::new("a".into(), buffer("a", 100, 100)));
        registry.set_position("a", Rect::new(0, 0, 100, 100));

        registry.insert(Surface::new("b".into(), buffer("b", 100, 100)));
        registry.set_position("b", Rect::new(50, 50, 150, 150));
        registry.set_strata("b", 1);

        // Overlap region: "b" is on top.
        let (surface, local) = hit_test(&registry, 60, 60).unwrap();
        assert_eq!(surface.name(), "b");
        assert_eq!(local, (10 * 100 / 100, 10 * 100 / 100));

        // Only "a" is under this point.
        let (surface, _) = hit_test(&registry, 10, 10).unwrap();
        assert_eq!(surface.name(), "a");

        // Nobody here.
        assert!(hit_test(&registry, 400, 400).is_none());
    }
}
