//! Blocks and the in-band tag that describes them.
//!
//! Every block starts with a 16-byte tag in heap memory:
//!
//! ```text
//! +-------+-------+--------+--------+--------+-----------------+
//! | state | magic |  size  |  prev  | check  |    payload ...  |
//! |  u16  |  u16  |  u32   |  u32   |  u32   |                 |
//! +-------+-------+--------+--------+--------+-----------------+
//! ^ block start                     ^ start + HEADER_SIZE (returned pointer)
//! ```
//!
//! The tag is the only record of a block. The next block starts at
//! `start + size`; `prev` holds the start of the block before it, or zero for
//! the first block. `check` covers every other field, so a stray write to any
//! of them is noticed before the block is trusted.

use kernel_memory_addresses::VirtualAddress;

/// Bytes occupied by the in-band tag.
pub const HEADER_SIZE: u32 = 16;

/// Payload alignment and size granularity.
pub const ALIGN: u32 = 8;

/// Smallest payload worth splitting off as its own block.
pub const MIN_PAYLOAD: u32 = 8;

/// Written over the tag of a block that was merged into a neighbor.
pub const POISON: u32 = 0xDEAD_BEEF;

const MAGIC: u16 = 0x4B48;
const SEED: u32 = 0x4B48_4550;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u16)]
pub enum BlockState {
    Free = 0x00F1,
    Used = 0x0A55,
}

impl BlockState {
    const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x00F1 => Some(Self::Free),
            0x0A55 => Some(Self::Used),
            _ => None,
        }
    }
}

/// One block, free or used.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Block {
    pub start: VirtualAddress,
    /// Total size including the tag.
    pub size: u32,
    pub state: BlockState,
    /// Start of the block right below this one.
    pub prev: Option<VirtualAddress>,
}

impl Block {
    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.state, BlockState::Free)
    }

    /// First byte past the block.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start.as_u32() + self.size
    }

    /// Address handed out to callers.
    #[inline]
    #[must_use]
    pub const fn payload(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u32() + HEADER_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn payload_size(&self) -> u32 {
        self.size - HEADER_SIZE
    }

    const fn check(state: u16, magic: u16, size: u32, prev: u32) -> u32 {
        SEED.rotate_left(7) ^ (state as u32) ^ ((magic as u32) << 16) ^ size ^ prev.rotate_left(13)
    }

    #[must_use]
    pub const fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let state = self.state as u16;
        let prev = match self.prev {
            Some(p) => p.as_u32(),
            None => 0,
        };
        let c = Self::check(state, MAGIC, self.size, prev).to_le_bytes();
        let st = state.to_le_bytes();
        let m = MAGIC.to_le_bytes();
        let sz = self.size.to_le_bytes();
        let pv = prev.to_le_bytes();
        [
            st[0], st[1], m[0], m[1], sz[0], sz[1], sz[2], sz[3], pv[0], pv[1], pv[2], pv[3], c[0],
            c[1], c[2], c[3],
        ]
    }

    /// Read back the tag found at `start`.
    #[must_use]
    pub const fn decode(start: VirtualAddress, raw: [u8; HEADER_SIZE as usize]) -> TagCheck {
        let [t0, t1, m0, m1, z0, z1, z2, z3, p0, p1, p2, p3, c0, c1, c2, c3] = raw;
        if u32::from_le_bytes([t0, t1, m0, m1]) == POISON {
            return TagCheck::Poisoned;
        }
        let state = u16::from_le_bytes([t0, t1]);
        let magic = u16::from_le_bytes([m0, m1]);
        let size = u32::from_le_bytes([z0, z1, z2, z3]);
        let prev = u32::from_le_bytes([p0, p1, p2, p3]);
        let check = u32::from_le_bytes([c0, c1, c2, c3]);
        if magic != MAGIC || check != Self::check(state, magic, size, prev) {
            return TagCheck::Invalid;
        }
        let Some(state) = BlockState::from_raw(state) else {
            return TagCheck::Invalid;
        };
        TagCheck::Valid(Self {
            start,
            size,
            state,
            prev: if prev == 0 {
                None
            } else {
                Some(VirtualAddress::new(prev))
            },
        })
    }
}

/// What a tag turned out to be.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TagCheck {
    Valid(Block),
    /// The block was merged away; its pointer is stale.
    Poisoned,
    Invalid,
}

#[must_use]
pub const fn poisoned_tag() -> [u8; HEADER_SIZE as usize] {
    let p = POISON.to_le_bytes();
    [
        p[0], p[1], p[2], p[3], p[0], p[1], p[2], p[3], p[0], p[1], p[2], p[3], p[0], p[1], p[2],
        p[3],
    ]
}
