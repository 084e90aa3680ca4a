//! Memory-mapped read-only access to disk images

use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use unseal_core::MAX_MMAP_SIZE;

/// A read-only stream backed by a memory-mapped image file.
///
/// # Example
///
/// ```rust,no_run
/// use unseal_pipeline::MmapPipeline;
/// use std::fs::File;
///
/// let file = File::open("disk.img").unwrap();
/// let pipeline = MmapPipeline::from_file(&file).unwrap();
/// println!("{} bytes mapped", pipeline.len());
/// ```
pub struct MmapPipeline {
    mmap: Mmap,
    position: u64,
}

impl MmapPipeline {
    /// Map an already opened image file
    ///
    /// # Errors
    ///
    /// Fails for non-regular files and files above [`MAX_MMAP_SIZE`].
    ///
    /// # Safety
    ///
    /// Uses `unsafe` for memory mapping: the file is validated as a regular
    /// file first and the mapping is read-only. The image must not be
    /// truncated while mapped.
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Only regular files can be memory-mapped",
            ));
        }

        if metadata.len() > MAX_MMAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "File size {} exceeds memory mapping limit {}",
                    metadata.len(),
                    MAX_MMAP_SIZE
                ),
            ));
        }

        // SAFETY: regular file of bounded size, mapped read-only
        let mmap = unsafe { Mmap::map(file)? };
        Ok(Self { mmap, position: 0 })
    }

    /// Length of the mapped image
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// True when the image is empty
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Current stream position
    pub fn position(&self) -> u64 {
        self.position
    }

    fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.position)
    }

    /// Borrow a region of the image without copying
    pub fn region(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        self.mmap.get(start..end)
    }
}

impl Read for MmapPipeline {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining() as usize;
        if remaining == 0 {
            return Ok(0);
        }

        let to_read = buf.len().min(remaining);
        let start = self.position as usize;
        buf[..to_read].copy_from_slice(&self.mmap[start..start + to_read]);
        self.position += to_read as u64;

        Ok(to_read)
    }
}

impl Seek for MmapPipeline {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => self.len() as i128 + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek before beginning of image",
            ));
        }

        // Seeking past EOF is allowed; reads there return 0
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn mapped(data: &[u8]) -> (NamedTempFile, MmapPipeline) {
        let mut tmpfile = NamedTempFile::new().unwrap();
        tmpfile.write_all(data).unwrap();
        tmpfile.flush().unwrap();
        let pipeline = MmapPipeline::from_file(tmpfile.as_file()).unwrap();
        (tmpfile, pipeline)
    }

    #[test]
    fn test_mmap_read_and_seek() {
        let data: Vec<u8> = (0..100).collect();
        let (_file, mut pipeline) = mapped(&data);
        assert_eq!(pipeline.len(), 100);

        pipeline.seek(SeekFrom::Start(50)).unwrap();
        let mut buf = [0u8; 5];
        pipeline.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &[50, 51, 52, 53, 54]);
        assert_eq!(pipeline.position(), 55);
    }

    #[test]
    fn test_mmap_read_past_end() {
        let (_file, mut pipeline) = mapped(&[1, 2, 3]);
        pipeline.seek(SeekFrom::Start(10)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(pipeline.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_mmap_region() {
        let data: Vec<u8> = (0..100).collect();
        let (_file, pipeline) = mapped(&data);
        assert_eq!(pipeline.region(10, 3), Some(&[10u8, 11, 12][..]));
        assert!(pipeline.region(99, 2).is_none());
    }
}
