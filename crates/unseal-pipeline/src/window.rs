//! Zone windows - a partition presented as an independent stream

use std::io::{self, Read, Seek, SeekFrom};

/// A stream that exposes only one zone of an underlying image.
///
/// Offsets are relative to the zone start; reads stop at the zone end even
/// when the image continues.
///
/// # Example
///
/// ```rust
/// use unseal_pipeline::ZoneWindow;
/// use std::io::Cursor;
///
/// let image = Cursor::new(vec![0u8; 4096]);
/// let mut window = ZoneWindow::new(image, 1024, 2048).unwrap();
/// let sector = window.read_at(0, 512).unwrap();
/// assert_eq!(sector.len(), 512);
/// ```
pub struct ZoneWindow<R: Read + Seek> {
    inner: R,
    start: u64,
    length: u64,
    position: u64,
}

impl<R: Read + Seek> ZoneWindow<R> {
    /// Create a window of `length` bytes at `start`
    ///
    /// # Errors
    ///
    /// Returns an error if seeking to the start position fails
    pub fn new(mut inner: R, start: u64, length: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;

        Ok(Self {
            inner,
            start,
            length,
            position: 0,
        })
    }

    /// Start offset of the window within the image
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Length of the window
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Current position within the window
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left between the position and the window end
    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.position)
    }

    /// Read up to `len` bytes at a window-relative offset
    ///
    /// The result is shorter than `len` only when the window or image ends.
    pub fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if offset >= self.length {
            return Ok(Vec::new());
        }
        self.seek(SeekFrom::Start(offset))?;
        let available = (self.length - offset).min(len as u64) as usize;
        let mut buf = vec![0u8; available];
        let mut filled = 0;
        while filled < available {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Read exactly `len` bytes at a window-relative offset
    pub fn read_exact_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let buf = self.read_at(offset, len)?;
        if buf.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "zone at 0x{:X}: wanted {} bytes at 0x{:X}, got {}",
                    self.start,
                    len,
                    offset,
                    buf.len()
                ),
            ));
        }
        Ok(buf)
    }
}

impl<R: Read + Seek> Read for ZoneWindow<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining() as usize;
        if remaining == 0 {
            return Ok(0);
        }

        let to_read = buf.len().min(remaining);
        self.inner.seek(SeekFrom::Start(self.start + self.position))?;
        let bytes_read = self.inner.read(&mut buf[..to_read])?;
        self.position += bytes_read as u64;

        Ok(bytes_read)
    }
}

impl<R: Read + Seek> Seek for ZoneWindow<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => self.length as i128 + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };

        if new_pos < 0 || new_pos > self.length as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {} outside zone of {} bytes", new_pos, self.length),
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// Read up to `len` bytes at an absolute offset of any stream
pub fn read_region<R: Read + Seek + ?Sized>(stream: &mut R, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len);
    stream.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}
