use crate::address::{AddressRange, RelocatedAddress};
use crate::fingerprint::FrameFingerprint;
use std::fmt::{Display, Formatter};

/// Source file and line resolved for an address. Line 0 marks compiler
/// bookkeeping entries that belong to no user-visible line.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileLine {
    pub file: String,
    pub line: u64,
}

impl FileLine {
    pub fn new(file: impl Into<String>, line: u64) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl Display for FileLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum FrameKind {
    Physical,
    /// Frame synthesized from inline-expansion debug info. `range` is the code
    /// range of the expansion; `range.begin` is the inline function entry.
    Inline { range: AddressRange },
}

/// One occupied stack slot. Immutable once captured, superseded wholesale on
/// each frame sync.
#[derive(Clone, Debug)]
pub struct Frame {
    pub ip: RelocatedAddress,
    pub sp: RelocatedAddress,
    pub bp: RelocatedAddress,
    pub kind: FrameKind,
    pub location: Option<FileLine>,
}

impl Frame {
    pub fn is_inline(&self) -> bool {
        matches!(self.kind, FrameKind::Inline { .. })
    }

    /// Entry address of the inline expansion, `None` for physical frames.
    pub fn inline_entry(&self) -> Option<RelocatedAddress> {
        match self.kind {
            FrameKind::Inline { range } => Some(range.begin),
            FrameKind::Physical => None,
        }
    }
}

/// Call stack of a stopped thread, innermost frame first, mixing physical
/// frames and inline frames synthesized from debug info.
///
/// The stack may be partially populated (innermost frames only) until an
/// asynchronous frame sync completes. An address that is simultaneously the
/// first instruction of an inline function and the return point of its caller
/// is ambiguous: the top inline frames starting exactly at the stopped address
/// may or may not have been entered yet. The `hidden` count treats that many
/// of them as not-yet-entered and removes them from the visible frame view;
/// adjusting it is a metadata-only operation, no execution occurs.
#[derive(Default)]
pub struct Stack {
    frames: Vec<Frame>,
    complete: bool,
    hidden: usize,
}

impl Stack {
    /// Replace the frame list (stop notification or frame sync). Resets the
    /// hidden ambiguous frame count.
    pub fn set_frames(&mut self, frames: Vec<Frame>, complete: bool) {
        self.frames = frames;
        self.complete = complete;
        self.hidden = 0;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Innermost frame. A stopped thread always has at least one frame.
    pub fn top(&self) -> &Frame {
        match self.frames.first() {
            Some(frame) => frame,
            None => panic!("empty stack on a stopped thread (frame sync contract violated)"),
        }
    }

    /// Stopped instruction pointer (shared by the whole top inline cluster).
    pub fn pc(&self) -> RelocatedAddress {
        self.top().ip
    }

    /// Number of visible frames (hidden ambiguous inline frames excluded).
    pub fn len(&self) -> usize {
        self.frames.len() - self.hidden
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible frame by index (0 = innermost visible).
    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index + self.hidden)
    }

    /// Visible frames, innermost first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames[self.hidden..]
    }

    /// Number of inline frames at the top whose expansion begins exactly at
    /// the stopped address (the "ambiguous" frames that may not have been
    /// entered yet).
    pub fn ambiguous_inline_count(&self) -> usize {
        let Some(top) = self.frames.first() else {
            return 0;
        };
        let pc = top.ip;
        self.frames
            .iter()
            .take_while(|f| f.inline_entry() == Some(pc))
            .count()
    }

    pub fn hidden_ambiguous_inline_count(&self) -> usize {
        self.hidden
    }

    pub fn set_hidden_ambiguous_inline_count(&mut self, count: usize) {
        debug_assert!(count <= self.ambiguous_inline_count());
        self.hidden = count;
    }

    /// Hide the innermost visible frame if it is an ambiguous inline entry.
    /// Returns `false` when there is nothing more to hide.
    pub fn hide_next_ambiguous_inline_frame(&mut self) -> bool {
        if self.hidden < self.ambiguous_inline_count() {
            self.hidden += 1;
            true
        } else {
            false
        }
    }

    /// Reveal the innermost hidden frame, but only if it is genuinely an
    /// inline frame entered exactly at the stopped address.
    pub fn reveal_next_ambiguous_inline_frame(&mut self) -> bool {
        if self.hidden == 0 {
            return false;
        }
        let pc = self.pc();
        if self.frames[self.hidden - 1].inline_entry() == Some(pc) {
            self.hidden -= 1;
            true
        } else {
            false
        }
    }

    /// Fingerprint of visible frame `index`.
    ///
    /// `None` until the frame's physical caller is known (a partial stack may
    /// not contain it yet). For the outermost frame of a complete stack the
    /// frame address is the max-address sentinel: older than everything.
    pub fn fingerprint(&self, index: usize) -> Option<FrameFingerprint> {
        let full = index + self.hidden;
        self.frames.get(full)?;

        // host physical frame of the (possibly inline) target
        let host = match (full..self.frames.len()).find(|&i| !self.frames[i].is_inline()) {
            Some(host) => host,
            None if self.complete => self.frames.len() - 1,
            None => return None,
        };
        let inline_depth = host - full;

        match self.frames.get(host + 1) {
            Some(caller) => Some(FrameFingerprint::new(caller.sp, inline_depth)),
            None if self.complete => Some(FrameFingerprint::new(u64::MAX, inline_depth)),
            None => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn physical(ip: u64, sp: u64) -> Frame {
        Frame {
            ip: ip.into(),
            sp: sp.into(),
            bp: sp.into(),
            kind: FrameKind::Physical,
            location: None,
        }
    }

    fn inline(ip: u64, sp: u64, begin: u64, end: u64) -> Frame {
        Frame {
            ip: ip.into(),
            sp: sp.into(),
            bp: sp.into(),
            kind: FrameKind::Inline {
                range: AddressRange::new(begin, end),
            },
            location: None,
        }
    }

    #[test]
    fn fingerprint_uses_caller_stack_pointer() {
        let mut stack = Stack::default();
        stack.set_frames(
            vec![physical(0x1004, 0x7FF0), physical(0x2008, 0x8000), physical(0x3000, 0x8100)],
            true,
        );
        assert_eq!(stack.fingerprint(0), Some(FrameFingerprint::new(0x8000u64, 0)));
        assert_eq!(stack.fingerprint(1), Some(FrameFingerprint::new(0x8100u64, 0)));
        // outermost frame: nothing is older
        assert_eq!(stack.fingerprint(2), Some(FrameFingerprint::new(u64::MAX, 0)));
    }

    #[test]
    fn fingerprint_unavailable_until_caller_synced() {
        let mut stack = Stack::default();
        stack.set_frames(vec![physical(0x1004, 0x7FF0)], false);
        assert_eq!(stack.fingerprint(0), None);
        stack.set_frames(vec![physical(0x1004, 0x7FF0), physical(0x2008, 0x8000)], false);
        assert_eq!(stack.fingerprint(0), Some(FrameFingerprint::new(0x8000u64, 0)));
    }

    #[test]
    fn inline_frames_share_frame_address_and_differ_by_depth() {
        let mut stack = Stack::default();
        stack.set_frames(
            vec![
                inline(0x2000, 0x9000, 0x2000, 0x2040),
                inline(0x2000, 0x9000, 0x2000, 0x2080),
                physical(0x2000, 0x9000),
                physical(0x4000, 0x9100),
            ],
            true,
        );
        assert_eq!(stack.fingerprint(0), Some(FrameFingerprint::new(0x9100u64, 2)));
        assert_eq!(stack.fingerprint(1), Some(FrameFingerprint::new(0x9100u64, 1)));
        assert_eq!(stack.fingerprint(2), Some(FrameFingerprint::new(0x9100u64, 0)));
    }

    #[test]
    fn hidden_frames_shift_the_visible_view() {
        let mut stack = Stack::default();
        stack.set_frames(
            vec![
                inline(0x2000, 0x9000, 0x2000, 0x2040),
                inline(0x2000, 0x9000, 0x2000, 0x2080),
                physical(0x2000, 0x9000),
                physical(0x4000, 0x9100),
            ],
            true,
        );
        assert_eq!(stack.ambiguous_inline_count(), 2);

        stack.set_hidden_ambiguous_inline_count(1);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.frame(0).unwrap().inline_entry(), Some(0x2000u64.into()));
        assert_eq!(stack.fingerprint(0), Some(FrameFingerprint::new(0x9100u64, 1)));

        assert!(stack.reveal_next_ambiguous_inline_frame());
        assert_eq!(stack.hidden_ambiguous_inline_count(), 0);
        assert!(!stack.reveal_next_ambiguous_inline_frame());

        assert!(stack.hide_next_ambiguous_inline_frame());
        assert!(stack.hide_next_ambiguous_inline_frame());
        assert!(!stack.hide_next_ambiguous_inline_frame());
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn non_entry_addresses_are_not_ambiguous() {
        let mut stack = Stack::default();
        stack.set_frames(
            vec![inline(0x2010, 0x9000, 0x2000, 0x2040), physical(0x2010, 0x9000)],
            true,
        );
        assert_eq!(stack.ambiguous_inline_count(), 0);
    }
}
