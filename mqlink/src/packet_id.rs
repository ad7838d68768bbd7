use std::num::NonZeroU16;

use parking_lot::Mutex;

use crate::{MqttError, Result};

const WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Packet identifiers in flight for one session.
///
/// `allocate` always hands out the smallest free identifier.
pub struct PacketIdAllocator {
    inner: Mutex<Bitmap>,
}

struct Bitmap {
    words: Box<[u64]>,
    //every id below `lowest` is taken
    lowest: usize,
    len: usize,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        let mut words = vec![0u64; WORDS].into_boxed_slice();
        //id 0 is never valid
        words[0] = 1;
        Self { inner: Mutex::new(Bitmap { words, lowest: 1, len: 0 }) }
    }

    pub fn allocate(&self) -> Result<NonZeroU16> {
        let mut bitmap = self.inner.lock();
        let start = bitmap.lowest / 64;
        for idx in start..WORDS {
            let word = bitmap.words[idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let id = idx * 64 + bit;
            bitmap.words[idx] |= 1 << bit;
            bitmap.lowest = id + 1;
            bitmap.len += 1;
            return NonZeroU16::new(id as u16).ok_or(MqttError::IdentifierSpaceExhausted);
        }
        bitmap.lowest = u16::MAX as usize + 1;
        Err(MqttError::IdentifierSpaceExhausted)
    }

    /// Releasing an identifier that is not allocated does nothing.
    pub fn release(&self, id: NonZeroU16) {
        let id = id.get() as usize;
        let (idx, mask) = (id / 64, 1u64 << (id % 64));
        let mut bitmap = self.inner.lock();
        if bitmap.words[idx] & mask != 0 {
            bitmap.words[idx] &= !mask;
            bitmap.len -= 1;
            if id < bitmap.lowest {
                bitmap.lowest = id;
            }
        }
    }

    #[inline]
    pub fn contains(&self, id: NonZeroU16) -> bool {
        let id = id.get() as usize;
        self.inner.lock().words[id / 64] & (1u64 << (id % 64)) != 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
