//! Disk image handle - read-only access to the raw image under preparation

use crate::{mmap::MmapPipeline, window::ZoneWindow};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use unseal_core::{ReadSeek, Result, Zone, MAX_MMAP_SIZE};

/// Configuration for opening an image
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Use memory mapping when the image is small enough
    pub use_mmap: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self { use_mmap: true }
    }
}

/// A raw disk image opened for reading
///
/// The image is never written through this handle; modifications reach it
/// only through the external mount of a decrypted volume.
///
/// # Example
///
/// ```rust,no_run
/// use unseal_pipeline::{DiskImage, ImageConfig};
/// use std::path::Path;
///
/// let image = DiskImage::open(Path::new("disk.img"), &ImageConfig::default()).unwrap();
/// println!("{}: {} bytes", image.path().display(), image.length());
/// ```
pub struct DiskImage {
    path: PathBuf,
    stream: Box<dyn ReadSeek>,
    length: u64,
}

impl DiskImage {
    /// Open an image file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or accessed
    pub fn open(path: &Path, config: &ImageConfig) -> Result<Self> {
        let file = File::open(path)?;
        let length = file.metadata()?.len();

        let stream: Box<dyn ReadSeek> = if config.use_mmap && length <= MAX_MMAP_SIZE {
            match MmapPipeline::from_file(&file) {
                Ok(mapped) => Box::new(mapped),
                Err(e) => {
                    warn!("Memory mapping {} failed, using file stream: {}", path.display(), e);
                    Box::new(file)
                }
            }
        } else {
            Box::new(file)
        };

        debug!("Opened image {} ({} bytes)", path.display(), length);

        Ok(Self {
            path: path.to_path_buf(),
            stream,
            length,
        })
    }

    /// Wrap an in-memory image
    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        let length = data.len() as u64;
        Self {
            path: path.into(),
            stream: Box::new(Cursor::new(data)),
            length,
        }
    }

    /// Wrap any readable and seekable stream
    pub fn from_stream<R: Read + Seek + Send + 'static>(path: impl Into<PathBuf>, stream: R, length: u64) -> Self {
        Self {
            path: path.into(),
            stream: Box::new(stream),
            length,
        }
    }

    /// Path the image was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total image length in bytes
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Readable and seekable stream over the whole image
    pub fn content(&mut self) -> &mut dyn ReadSeek {
        &mut *self.stream
    }

    /// Window over one zone, clamped to the image end
    pub fn window(&mut self, zone: &Zone) -> io::Result<ZoneWindow<&mut dyn ReadSeek>> {
        let length = zone.length.min(self.length.saturating_sub(zone.offset));
        ZoneWindow::new(&mut *self.stream as &mut dyn ReadSeek, zone.offset, length)
    }
}
