//! Shared-memory pixel buffers.
//!
//! A surface's pixels live in memory the client owns: either a file on disk
//! or an anonymous shared-memory descriptor passed over the socket. Both map
//! read-only into the compositor. The client keeps writing while we read;
//! torn reads are tolerated and the newest bytes win at upload time.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use memmap2::Mmap;

/// BGRA, the only supported pixel layout.
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug)]
enum Backing {
    File(PathBuf),
    SharedFd,
}

/// A read-only view of a client pixel buffer.
#[derive(Debug)]
pub struct PixelBuffer {
    map: Mmap,
    width: u32,
    height: u32,
    backing: Backing,
}

impl PixelBuffer {
    /// Map `width * height * 4` bytes from a file path.
    pub fn open_file(path: &Path, width: u32, height: u32) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open pixel file {}", path.display()))?;
        Self::map(file, width, height, Backing::File(path.to_path_buf()))
    }

    /// Map the same shape from a descriptor received over the socket.
    pub fn from_fd(fd: OwnedFd, width: u32, height: u32) -> Result<Self> {
        Self::map(File::from(fd), width, height, Backing::SharedFd)
    }

    fn map(file: File, width: u32, height: u32, backing: Backing) -> Result<Self> {
        ensure!(width > 0 && height > 0, "pixel buffer has zero dimension");
        let need = width as u64 * height as u64 * BYTES_PER_PIXEL as u64;
        let len = file
            .metadata()
            .context("failed to stat pixel buffer")?
            .len();
        ensure!(
            len >= need,
            "pixel buffer is {len} bytes, {need} required for {width}x{height}"
        );

        // Safety: the mapping is read-only. The owning client writes the
        // region concurrently; torn reads are part of the contract.
        let map = unsafe { Mmap::map(&file) }.context("failed to map pixel buffer")?;
        Ok(Self {
            map,
            width,
            height,
            backing,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map[..self.len()]
    }

    /// A full-width band of `count` rows starting at row `y`.
    pub fn rows(&self, y: u32, count: u32) -> &[u8] {
        let stride = self.width as usize * BYTES_PER_PIXEL;
        let start = y as usize * stride;
        let end = (y + count) as usize * stride;
        &self.bytes()[start..end]
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(name: &str, pixels: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("glint-shm-{}-{name}", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(pixels).unwrap();
        path
    }

    #[test]
    fn test_map_from_file() {
        let pixels: Vec<u8> = (0..16).collect();
        let path = scratch_file("file", &pixels);

        let buffer = PixelBuffer::open_file(&path, 2, 2).unwrap();
        assert_eq!(buffer.width(), 2);
        assert_eq!(buffer.height(), 2);
        assert_eq!(buffer.bytes(), &pixels[..]);
        assert!(buffer.is_file_backed());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_map_from_fd() {
        let pixels = vec![7u8; 16];
        let path = scratch_file("fd", &pixels);

        let fd = OwnedFd::from(File::open(&path).unwrap());
        let buffer = PixelBuffer::from_fd(fd, 2, 2).unwrap();
        assert_eq!(buffer.bytes(), &pixels[..]);
        assert!(!buffer.is_file_backed());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_rows_band() {
        let pixels: Vec<u8> = (0..32).collect();
        let path = scratch_file("rows", &pixels);

        let buffer = PixelBuffer::open_file(&path, 2, 4).unwrap();
        assert_eq!(buffer.rows(1, 2), &pixels[8..24]);
        assert_eq!(buffer.rows(0, 4), &pixels[..]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_short_file_is_rejected() {
        let path = scratch_file("short", &[0u8; 8]);
        assert!(PixelBuffer::open_file(&path, 2, 2).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file_is_rejected() {
        assert!(PixelBuffer::open_file(Path::new("/nonexistent/glint"), 2, 2).is_err());
    }
}
