use super::{DemuxError, Result};

/// Simple reader state for extracting big-endian fields from a `&[u8]` slice.
///
/// Unlike the [`std::io::Read`] implementation for `&[u8]`, every read is
/// bounds-checked and reports the length of the offending read via
/// [`DemuxError::PacketOverrun`]. Supports the unsigned widths found in PSI
/// and DSM-CC structures: 8, 16, 24, 32, 40 and 64 bits.
///
/// # Example
///
/// ```
/// use demuxfs::SliceReader;
/// let some_data = [0x42];
/// let mut reader = SliceReader::new(&some_data);
/// assert_eq!(reader.read_u8()?, 0x42);
/// # Ok::<(), demuxfs::DemuxError>(())
/// ```
#[derive(Debug)]
pub struct SliceReader<'a> {
    slice: &'a [u8],
}

impl<'a> SliceReader<'a> {
    /// Initializes a reader from any byte slice.
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice }
    }

    /// Creates a fixed `length` sub-reader at the current position, then
    /// advances this reader to the sub-reader's end position.
    ///
    /// The sub-reader semantic makes reading nested data of known lengths
    /// easier with correct bounds checking of the nested data.
    pub fn new_sub_reader(&mut self, length: usize) -> Result<Self> {
        Ok(Self {
            slice: self.read(length)?,
        })
    }

    /// Number of bytes remaining in the slice reader.
    pub fn remaining_len(&self) -> usize {
        self.slice.len()
    }

    /// Advance reader without extracting any data from the slice.
    pub fn skip(&mut self, length: usize) -> Result<()> {
        if length > self.slice.len() {
            Err(DemuxError::PacketOverrun(length))
        } else {
            self.slice = &self.slice[length..];
            Ok(())
        }
    }

    /// Extract a fixed `length` sub-slice from this reader and advance.
    pub fn read(&mut self, length: usize) -> Result<&'a [u8]> {
        if length > self.slice.len() {
            Err(DemuxError::PacketOverrun(length))
        } else {
            let (left, right) = self.slice.split_at(length);
            self.slice = right;
            Ok(left)
        }
    }

    /// Extract a sub-slice of all data remaining to be read.
    pub fn read_to_end(&mut self) -> Result<&'a [u8]> {
        self.read(self.slice.len())
    }

    /// Same as [`SliceReader::read`] but also converts the slice to an array
    /// reference of length `N`.
    #[allow(unsafe_code)]
    pub fn read_array_ref<const N: usize>(&mut self) -> Result<&'a [u8; N]> {
        unsafe {
            // Bounds checking performed by read()
            Ok(&*(self.read(N)?.as_ptr() as *const [u8; N]))
        }
    }

    /// Read one byte interpreted as [`u8`].
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array_ref::<1>()?[0])
    }

    /// Read two bytes interpreted as big-endian [`u16`].
    pub fn read_be_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(*self.read_array_ref::<2>()?))
    }

    /// Read three bytes interpreted as big-endian `u24`.
    pub fn read_be_u24(&mut self) -> Result<u32> {
        let bytes = *self.read_array_ref::<3>()?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    /// Read four bytes interpreted as big-endian [`u32`].
    pub fn read_be_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(*self.read_array_ref::<4>()?))
    }

    /// Read five bytes interpreted as big-endian `u40`.
    pub fn read_be_u40(&mut self) -> Result<u64> {
        let bytes = *self.read_array_ref::<5>()?;
        Ok(u64::from_be_bytes([
            0, 0, 0, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4],
        ]))
    }

    /// Read eight bytes interpreted as big-endian [`u64`].
    pub fn read_be_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(*self.read_array_ref::<8>()?))
    }

    /// Extract a fixed `length` sub-slice from this reader without advancing.
    pub fn peek(&mut self, length: usize) -> Result<&'a [u8]> {
        if length > self.slice.len() {
            Err(DemuxError::PacketOverrun(length))
        } else {
            Ok(&self.slice[0..length])
        }
    }

    /// Same as [`SliceReader::peek`] but also converts the slice to an array
    /// reference of length `N`.
    #[allow(unsafe_code)]
    pub fn peek_array_ref<const N: usize>(&mut self) -> Result<&'a [u8; N]> {
        unsafe {
            // Bounds checking performed by read()
            Ok(&*(self.peek(N)?.as_ptr() as *const [u8; N]))
        }
    }
}

/// Convenience macro to read a modular bitfield from a [`SliceReader`].
///
/// Wraps [`SliceReader::read_array_ref`] to read the exact number of bytes
/// required by the bitfield type. Must be expanded in a function that returns
/// [`Result`].
#[macro_export]
macro_rules! read_bitfield {
    ($reader:expr, $type:ty) => {
        <$type>::from_bytes(*$reader.read_array_ref::<{ std::mem::size_of::<$type>() }>()?)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_every_width() {
        let data = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
        ];
        let mut reader = SliceReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_be_u16().unwrap(), 0x0203);
        assert_eq!(reader.read_be_u24().unwrap(), 0x040506);
        assert_eq!(reader.read_be_u32().unwrap(), 0x0708090a);
        assert_eq!(reader.read_be_u40().unwrap(), 0x0b0c0d0e0f);
        assert_eq!(reader.read_be_u64().unwrap(), 0x1011121314151617);
        assert_eq!(reader.remaining_len(), 0);
    }

    #[test]
    fn overrun_reports_requested_length() {
        let data = [0u8; 2];
        let mut reader = SliceReader::new(&data);
        match reader.read_be_u32() {
            Err(DemuxError::PacketOverrun(4)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn sub_reader_bounds_nested_data() {
        let data = [1, 2, 3, 4, 5];
        let mut reader = SliceReader::new(&data);
        let mut sub = reader.new_sub_reader(3).unwrap();
        assert_eq!(sub.read_to_end().unwrap(), &[1, 2, 3]);
        assert_eq!(reader.read_to_end().unwrap(), &[4, 5]);
    }
}
