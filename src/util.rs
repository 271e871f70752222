use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Four-byte wrapper signature as it appears on the wire.
#[derive(Debug, AsBytes, FromBytes, Unaligned, PartialEq, Eq, Clone, Copy)]
#[repr(C)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

/// Source of CBW tags.
///
/// Tags increase by one per command and wrap at `u32::MAX`.
#[derive(Debug, Clone)]
pub struct TagGenerator {
    next: u32,
}

impl TagGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        TagGenerator { next: first }
    }

    pub fn next_tag(&mut self) -> u32 {
        let tag = self.next;
        self.next = self.next.wrapping_add(1);
        tag
    }

    /// The tag the next command will get.
    pub fn peek(&self) -> u32 {
        self.next
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}
