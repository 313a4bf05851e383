//! Bounds-checked byte arena for building boot segments.
//!
//! Parts are appended in order; each append returns a [`Slot`] recording
//! where the part landed, so its physical address can be computed once the
//! arena itself has been placed.

use crate::error::{Error, Result};

/// Location of an appended part inside an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub len: usize,
}

impl Slot {
    /// Physical address of this part once the arena is placed at `base`.
    pub fn address(&self, base: u64) -> u64 {
        base + self.offset as u64
    }
}

#[derive(Debug, Default, Clone)]
pub struct Arena {
    bytes: Vec<u8>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, part: &[u8]) -> Slot {
        let slot = Slot {
            offset: self.bytes.len(),
            len: part.len(),
        };
        self.bytes.extend_from_slice(part);
        slot
    }

    pub fn append_zeroed(&mut self, len: usize) -> Slot {
        let slot = Slot {
            offset: self.bytes.len(),
            len,
        };
        self.bytes.resize(self.bytes.len() + len, 0);
        slot
    }

    /// Mutable view of `len` bytes at `offset` within `slot`.
    pub fn slice_mut(&mut self, slot: Slot, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= slot.len)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "write of {} bytes at {:#x} overruns a {}-byte part",
                    len, offset, slot.len
                ))
            })?;
        Ok(&mut self.bytes[slot.offset + offset..slot.offset + end])
    }

    pub fn write_u32(&mut self, slot: Slot, offset: usize, value: u32) -> Result<()> {
        self.slice_mut(slot, offset, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_track_offsets() {
        let mut arena = Arena::new();
        let a = arena.append_zeroed(16);
        let b = arena.append(b"abc");
        assert_eq!(a, Slot { offset: 0, len: 16 });
        assert_eq!(b, Slot { offset: 16, len: 3 });
        assert_eq!(b.address(0x2000), 0x2010);
        assert_eq!(&arena.as_bytes()[16..], b"abc");
        assert_eq!(arena.len(), 19);
    }

    #[test]
    fn test_writes_stay_inside_their_slot() {
        let mut arena = Arena::new();
        let a = arena.append_zeroed(8);
        let b = arena.append(&[0xff; 4]);
        arena.write_u32(a, 4, 0x1122_3344).unwrap();
        assert_eq!(&arena.as_bytes()[4..8], &[0x44, 0x33, 0x22, 0x11]);
        assert!(arena.write_u32(a, 6, 0).is_err());
        assert!(arena.slice_mut(a, usize::MAX, 2).is_err());
        assert_eq!(&arena.as_bytes()[b.offset..], &[0xff; 4]);
    }
}
