use std::sync::RwLock;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemError {
    /// The address is not backed by any memory.
    Unmapped,
    /// The access starts within mapped memory but extends past the end of it.
    OutOfBounds,
}

impl MemError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unmapped => "Unmapped",
            Self::OutOfBounds => "OutOfBounds",
        }
    }
}

impl std::fmt::Display for MemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for MemError {}

pub type MemResult<T> = Result<T, MemError>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Endian {
    Big,
    Little,
}

macro_rules! typed_access {
    ($read:ident, $write:ident, $ty:ty) => {
        #[inline]
        fn $read(&self, addr: u32, endian: Endian) -> MemResult<$ty> {
            let mut bytes = [0; std::mem::size_of::<$ty>()];
            self.read_bytes(addr, &mut bytes)?;
            Ok(match endian {
                Endian::Big => <$ty>::from_be_bytes(bytes),
                Endian::Little => <$ty>::from_le_bytes(bytes),
            })
        }

        #[inline]
        fn $write(&self, addr: u32, value: $ty, endian: Endian) -> MemResult<()> {
            let bytes = match endian {
                Endian::Big => value.to_be_bytes(),
                Endian::Little => value.to_le_bytes(),
            };
            self.write_bytes(addr, &bytes)
        }
    };
}

/// Guest memory as seen by the translator and by generated code.
pub trait Memory: Send + Sync {
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> MemResult<()>;
    fn write_bytes(&self, addr: u32, buf: &[u8]) -> MemResult<()>;

    /// The number of bytes of guest memory.
    fn size(&self) -> u64;

    #[inline]
    fn read<const N: usize>(&self, addr: u32) -> MemResult<[u8; N]>
    where
        Self: Sized,
    {
        read_array(self, addr)
    }

    #[inline]
    fn read_u8(&self, addr: u32) -> MemResult<u8> {
        let mut buf = [0];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    #[inline]
    fn write_u8(&self, addr: u32, value: u8) -> MemResult<()> {
        self.write_bytes(addr, &[value])
    }

    typed_access!(read_u16, write_u16, u16);
    typed_access!(read_u32, write_u32, u32);
    typed_access!(read_u64, write_u64, u64);
    typed_access!(read_u128, write_u128, u128);
}

impl dyn Memory + '_ {
    #[inline]
    pub fn read<const N: usize>(&self, addr: u32) -> MemResult<[u8; N]> {
        read_array(self, addr)
    }
}

#[inline]
fn read_array<M: Memory + ?Sized, const N: usize>(mem: &M, addr: u32) -> MemResult<[u8; N]> {
    let mut buf = [0; N];
    mem.read_bytes(addr, &mut buf)?;
    Ok(buf)
}

/// A single contiguous block of guest memory starting at `base`.
pub struct FlatMemory {
    base: u32,
    data: RwLock<Vec<u8>>,
}

impl FlatMemory {
    pub fn new(base: u32, size: usize) -> Self {
        Self { base, data: RwLock::new(vec![0; size]) }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    fn range(&self, addr: u32, len: usize, size: usize) -> MemResult<std::ops::Range<usize>> {
        let start = addr.checked_sub(self.base).ok_or(MemError::Unmapped)? as usize;
        if start >= size {
            return Err(MemError::Unmapped);
        }
        let end = start.checked_add(len).ok_or(MemError::OutOfBounds)?;
        if end > size {
            return Err(MemError::OutOfBounds);
        }
        Ok(start..end)
    }

    /// Copies `data` into memory at `addr`.
    pub fn load(&self, addr: u32, data: &[u8]) -> MemResult<()> {
        self.write_bytes(addr, data)
    }
}

impl Memory for FlatMemory {
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> MemResult<()> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let range = self.range(addr, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_bytes(&self, addr: u32, buf: &[u8]) -> MemResult<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let range = self.range(addr, buf.len(), data.len())?;
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn big_endian_access() {
        let mem = FlatMemory::new(0x1000, 0x100);
        mem.write_u32(0x1000, 0x1122_3344, Endian::Big).unwrap();
        assert_eq!(mem.read::<4>(0x1000).unwrap(), [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(mem.read_u32(0x1000, Endian::Little).unwrap(), 0x4433_2211);
        assert_eq!(mem.read_u16(0x1002, Endian::Big).unwrap(), 0x3344);
    }

    #[test]
    fn bounds() {
        let mem = FlatMemory::new(0x1000, 0x100);
        assert_eq!(mem.read_u8(0xfff), Err(MemError::Unmapped));
        assert_eq!(mem.read_u8(0x1100), Err(MemError::Unmapped));
        assert_eq!(mem.read_u32(0x10fe, Endian::Big), Err(MemError::OutOfBounds));
        assert!(mem.read_u64(0x10f8, Endian::Big).is_ok());
    }
}
