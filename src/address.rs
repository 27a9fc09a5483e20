use itertools::Itertools;
use std::fmt::{Display, Formatter};

/// Represent address in the debugged process virtual address space.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct RelocatedAddress(u64);

impl RelocatedAddress {
    /// Address zero is the null/sentinel value (e.g. an unknown return address).
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RelocatedAddress {
    fn from(addr: u64) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<usize> for RelocatedAddress {
    fn from(addr: usize) -> Self {
        RelocatedAddress(addr as u64)
    }
}

impl From<RelocatedAddress> for u64 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#016X}", self.0))
    }
}

/// Half-open `[begin, end)` interval of code addresses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AddressRange {
    pub begin: RelocatedAddress,
    pub end: RelocatedAddress,
}

impl AddressRange {
    pub fn new(begin: impl Into<RelocatedAddress>, end: impl Into<RelocatedAddress>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        addr >= self.begin && addr < self.end
    }
}

impl Display for AddressRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Set of address ranges in canonical form: sorted by begin address, no empty
/// members, overlapping/adjacent/enclosed inputs merged. Immutable after
/// canonicalization except by rebuilding.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct AddressRanges(Vec<AddressRange>);

impl AddressRanges {
    pub fn new(ranges: impl IntoIterator<Item = AddressRange>) -> Self {
        let canonical = ranges
            .into_iter()
            .filter(|r| !r.is_empty())
            .sorted_by_key(|r| r.begin)
            .coalesce(|prev, next| {
                if next.begin <= prev.end {
                    Ok(AddressRange {
                        begin: prev.begin,
                        end: prev.end.max(next.end),
                    })
                } else {
                    Err((prev, next))
                }
            })
            .collect();
        AddressRanges(canonical)
    }

    pub fn empty() -> Self {
        AddressRanges::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        self.range_containing(addr).is_some()
    }

    /// Member range covering `addr`, if any.
    pub fn range_containing(&self, addr: RelocatedAddress) -> Option<AddressRange> {
        let idx = self.0.partition_point(|r| r.end <= addr);
        self.0.get(idx).filter(|r| r.contains(addr)).copied()
    }

    /// Add one more range, rebuilding the canonical form.
    pub fn extend_with(&mut self, range: AddressRange) {
        let mut ranges = std::mem::take(&mut self.0);
        ranges.push(range);
        *self = AddressRanges::new(ranges);
    }

    pub fn as_slice(&self) -> &[AddressRange] {
        &self.0
    }
}

impl From<AddressRange> for AddressRanges {
    fn from(range: AddressRange) -> Self {
        AddressRanges::new([range])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn range(begin: u64, end: u64) -> AddressRange {
        AddressRange::new(begin, end)
    }

    #[test]
    fn canonicalization_sorts_and_merges() {
        let ranges = AddressRanges::new([
            range(0x30, 0x40),
            range(0x10, 0x20),
            range(0x18, 0x28),
            range(0x28, 0x2C),
            range(0x50, 0x50),
            range(0x60, 0x55),
        ]);
        assert_eq!(ranges.as_slice(), &[range(0x10, 0x2C), range(0x30, 0x40)]);
    }

    #[test]
    fn enclosed_ranges_are_absorbed() {
        let ranges = AddressRanges::new([range(0x10, 0x100), range(0x20, 0x30), range(0x40, 0x50)]);
        assert_eq!(ranges.as_slice(), &[range(0x10, 0x100)]);
    }

    #[test]
    fn covered_points_equal_union_of_inputs() {
        let input = [range(0x3, 0x7), range(0x0, 0x2), range(0x6, 0xA), range(0x2, 0x3)];
        let canonical = AddressRanges::new(input);
        for point in 0u64..0x10 {
            let addr = RelocatedAddress::from(point);
            let in_input = input.iter().any(|r| r.contains(addr));
            assert_eq!(canonical.contains(addr), in_input, "point {point:#x}");
        }
    }

    #[test]
    fn range_containing_picks_the_right_member() {
        let ranges = AddressRanges::new([range(0x10, 0x20), range(0x40, 0x50)]);
        assert_eq!(ranges.range_containing(0x10u64.into()), Some(range(0x10, 0x20)));
        assert_eq!(ranges.range_containing(0x1Fu64.into()), Some(range(0x10, 0x20)));
        assert_eq!(ranges.range_containing(0x20u64.into()), None);
        assert_eq!(ranges.range_containing(0x45u64.into()), Some(range(0x40, 0x50)));
        assert_eq!(ranges.range_containing(0x0u64.into()), None);
    }

    #[test]
    fn extend_with_rebuilds_canonical_form() {
        let mut ranges = AddressRanges::from(range(0x10, 0x20));
        ranges.extend_with(range(0x30, 0x40));
        assert_eq!(ranges.as_slice(), &[range(0x10, 0x20), range(0x30, 0x40)]);
        ranges.extend_with(range(0x20, 0x30));
        assert_eq!(ranges.as_slice(), &[range(0x10, 0x40)]);
    }
}
