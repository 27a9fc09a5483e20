use crate::address::RelocatedAddress;
use std::fmt::{Display, Formatter};

/// Opaque, comparable identity of one occupied stack slot.
///
/// The frame address is the stack pointer of the frame's physical caller (the
/// value at the call site), which is stable for the lifetime of the physical
/// call even while the frame itself pushes and pops. It cannot be computed
/// until the caller frame is known, which is what makes the identity safe in
/// the presence of recursion: two activations of the same function at the same
/// code address still differ by their caller-side stack pointer.
///
/// `inline_depth` distinguishes inline frames layered on the same physical
/// frame. It participates in identity only; the `newer_than` order is based
/// purely on frame addresses, so fingerprints with equal frame addresses are
/// neither newer nor older than each other.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameFingerprint {
    frame_address: RelocatedAddress,
    inline_depth: usize,
}

impl FrameFingerprint {
    pub fn new(frame_address: impl Into<RelocatedAddress>, inline_depth: usize) -> Self {
        Self {
            frame_address: frame_address.into(),
            inline_depth,
        }
    }

    pub fn frame_address(&self) -> RelocatedAddress {
        self.frame_address
    }

    pub fn inline_depth(&self) -> usize {
        self.inline_depth
    }

    /// `self` identifies a strictly more recent call than `other`
    /// (the stack grows downward).
    pub fn newer_than(&self, other: &FrameFingerprint) -> bool {
        self.frame_address < other.frame_address
    }
}

impl Display for FrameFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.frame_address, self.inline_depth)
    }
}
