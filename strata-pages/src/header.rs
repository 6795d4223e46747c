use bytemuck::{Pod, Zeroable};

/// Size in bytes of the header prefixing every Node.
pub const HEADER_BYTES: usize = 8;

/// The three independent bits carried in a Node header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// Set when the Node is a B+-tree inner node: elements are refs to
    /// subtree Nodes and a sibling offset vector gives cumulative counts.
    pub is_inner: bool,
    /// Set when every packed element is itself a ref rather than a payload
    /// value.
    pub has_child_refs: bool,
    /// Set when this Node doubles as a search index over its siblings.
    pub is_index: bool,
}

impl Flags {
    fn to_bits(self) -> u8 {
        (self.is_inner as u8) | ((self.has_child_refs as u8) << 1) | ((self.is_index as u8) << 2)
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            is_inner: bits & 0b001 != 0,
            has_child_refs: bits & 0b010 != 0,
            is_index: bits & 0b100 != 0,
        }
    }
}

/// Raw on-disk/in-slab 8-byte Node header.
///
/// Layout (little-endian throughout):
/// - byte 0: bits 0-2 flags ([`Flags`]), bits 3-5 width code (0-7), bits 6-7 reserved
/// - bytes 1-3: element count `n`, 24 bits
/// - bytes 4-6: capacity in bytes, 24 bits
/// - byte 7: reserved, always zero
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Header([u8; HEADER_BYTES]);

impl Header {
    pub fn new(flags: Flags, width_code: u8, n: u32, capacity: u32) -> Self {
        let mut h = Self([0; HEADER_BYTES]);
        h.set_flags(flags);
        h.set_width_code(width_code);
        h.set_len(n);
        h.set_capacity(capacity);
        h
    }

    pub fn from_bytes(bytes: [u8; HEADER_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> [u8; HEADER_BYTES] {
        self.0
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits(self.0[0] & 0x07)
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.0[0] = (self.0[0] & !0x07) | flags.to_bits();
    }

    /// Width code in 0..=7, indexing the ladder `[0, 1, 2, 4, 8, 16, 32, 64]`
    /// bits per element.
    pub fn width_code(&self) -> u8 {
        (self.0[0] >> 3) & 0x07
    }

    pub fn set_width_code(&mut self, code: u8) {
        debug_assert!(code <= 7);
        self.0[0] = (self.0[0] & !0x38) | ((code & 0x07) << 3);
    }

    /// Number of packed elements.
    pub fn len(&self) -> u32 {
        u32::from_le_bytes([self.0[1], self.0[2], self.0[3], 0])
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_len(&mut self, n: u32) {
        debug_assert!(n < (1 << 24));
        let b = n.to_le_bytes();
        self.0[1] = b[0];
        self.0[2] = b[1];
        self.0[3] = b[2];
    }

    /// Capacity of the packed payload, in bytes (always a multiple of 8).
    pub fn capacity(&self) -> u32 {
        u32::from_le_bytes([self.0[4], self.0[5], self.0[6], 0])
    }

    pub fn set_capacity(&mut self, capacity: u32) {
        debug_assert!(capacity < (1 << 24));
        let b = capacity.to_le_bytes();
        self.0[4] = b[0];
        self.0[5] = b[1];
        self.0[6] = b[2];
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("flags", &self.flags())
            .field("width_code", &self.width_code())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let flags = Flags { is_inner: true, has_child_refs: true, is_index: false };
        let h = Header::new(flags, 5, 12345, 1 << 20);
        assert_eq!(h.flags(), flags);
        assert_eq!(h.width_code(), 5);
        assert_eq!(h.len(), 12345);
        assert_eq!(h.capacity(), 1 << 20);
    }

    #[test]
    fn reserved_byte_stays_zero() {
        let h = Header::new(Flags::default(), 7, (1 << 24) - 1, (1 << 24) - 1);
        assert_eq!(h.as_bytes()[7], 0);
    }
}
