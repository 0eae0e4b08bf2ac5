use std::{fmt::Display, net::Ipv4Addr, str::FromStr};

use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RangesParseError {
    #[error("Invalid address range '{}'!", .0)]
    InvalidRange(String),
}

/// A set of `u32` values kept as sorted, disjoint, non-adjacent inclusive
/// intervals.
///
/// The textual form is a comma-separated list of hexadecimal values and
/// `FIRST-LAST` ranges, e.g. `A000002-A000004,A000010`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRanges {
    entries: Vec<(u32, u32)>,
}

impl AddressRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> u64 {
        self.entries
            .iter()
            .map(|(first, last)| u64::from(last - first) + 1)
            .sum()
    }

    pub fn contains(&self, value: u32) -> bool {
        self.entries
            .binary_search_by(|(first, last)| {
                if *last < value {
                    std::cmp::Ordering::Less
                } else if *first > value {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Adds `first..=last`, merging with overlapping and adjacent entries.
    pub fn insert(&mut self, first: u32, last: u32) {
        let (first, last) = if first <= last { (first, last) } else { (last, first) };
        let touches = |(a, b): &(u32, u32)| {
            *a <= last.saturating_add(1) && first <= b.saturating_add(1)
        };

        let start = self.entries.partition_point(|e| !touches(e) && e.1 < first);
        let end = start + self.entries[start..].iter().take_while(|e| touches(e)).count();

        let merged = self.entries[start..end]
            .iter()
            .fold((first, last), |(lo, hi), (a, b)| (lo.min(*a), hi.max(*b)));

        self.entries.splice(start..end, [merged]);
    }

    pub fn union<'a>(ranges: impl IntoIterator<Item = &'a AddressRanges>) -> Self {
        let mut result = Self::new();
        for (first, last) in ranges.into_iter().flat_map(|r| r.entries.iter()) {
            result.insert(*first, *last);
        }

        result
    }

    /// Everything in `min..=max` that isn't in `self`.
    pub fn complement(&self, min: u32, max: u32) -> Self {
        let mut result = Self::new();
        if min > max {
            return result;
        }

        let mut next = Some(min);
        for (first, last) in &self.entries {
            let Some(low) = next else { break };

            if *first > low {
                result.insert(low, (first - 1).min(max));
            }

            next = last.checked_add(1).map(|n| n.max(low));
            if next.map_or(true, |n| n > max) {
                next = None;
            }
        }

        if let Some(low) = next {
            result.insert(low, max);
        }

        result
    }

    /// Removes and returns the `count` lowest values, or `None` (leaving the
    /// set untouched) when there aren't enough of them.
    pub fn take(&mut self, count: u64) -> Option<AddressRanges> {
        if self.len() < count {
            return None;
        }

        let mut taken = Self::new();
        let mut pending = count;

        while pending > 0 {
            let (first, last) = self.entries[0];
            let size = u64::from(last - first) + 1;

            if size <= pending {
                taken.insert(first, last);
                self.entries.remove(0);
                pending -= size;
            } else {
                // pending < size, so this stays within the entry
                let end = first + (pending as u32) - 1;
                taken.insert(first, end);
                self.entries[0].0 = end + 1;
                pending = 0;
            }
        }

        Some(taken)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().flat_map(|(first, last)| *first..=*last)
    }

    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.iter().map(Ipv4Addr::from)
    }
}

impl Display for AddressRanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = self
            .entries
            .iter()
            .map(|(first, last)| {
                if first == last {
                    format!("{first:X}")
                } else {
                    format!("{first:X}-{last:X}")
                }
            })
            .join(",");

        f.write_str(&text)
    }
}

impl FromStr for AddressRanges {
    type Err = RangesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Self::new();
        let parse = |part: &str| {
            u32::from_str_radix(part.trim(), 16)
                .map_err(|_| RangesParseError::InvalidRange(s.to_owned()))
        };

        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            match part.split_once('-') {
                Some((first, last)) => ranges.insert(parse(first)?, parse(last)?),
                None => {
                    let value = parse(part)?;
                    ranges.insert(value, value);
                }
            }
        }

        Ok(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(text: &str) -> AddressRanges {
        text.parse().unwrap()
    }

    #[test]
    fn parsing_normalizes_overlapping_and_adjacent_entries() {
        assert_eq!(ranges("5-7,1-2,3,10").to_string(), "1-3,5-7,10");
        assert_eq!(ranges("5-7,1-2,3-4").to_string(), "1-7");
        assert_eq!(ranges("a-F,c").to_string(), "A-F");
        assert_eq!(ranges("").to_string(), "");
    }

    #[test]
    fn invalid_text_is_rejected() {
        assert!("1-x".parse::<AddressRanges>().is_err());
        assert!("100000000".parse::<AddressRanges>().is_err());
    }

    #[test]
    fn insert_bridges_neighbouring_entries() {
        let mut set = ranges("1-2,8-9");

        set.insert(3, 7);

        assert_eq!(set.to_string(), "1-9");
        assert_eq!(set.len(), 9);
    }

    #[test]
    fn insert_keeps_disjoint_entries_sorted() {
        let mut set = ranges("10-12");

        set.insert(1, 1);
        set.insert(20, 21);
        set.insert(5, 6);

        assert_eq!(set.to_string(), "1,5-6,10-12,14-15");
    }

    #[test]
    fn union_merges_all_sets() {
        let union = AddressRanges::union([&ranges("1-3"), &ranges("3-5,A"), &ranges("B")]);

        assert_eq!(union.to_string(), "1-5,A-B");
    }

    #[test]
    fn complement_within_bounds() {
        assert_eq!(ranges("3-4,8").complement(1, 10).to_string(), "1-2,5-7,9-A");
        assert_eq!(ranges("1-10").complement(1, 10).to_string(), "");
        assert_eq!(ranges("").complement(2, 6).to_string(), "2-6");
        assert_eq!(ranges("0-1,20").complement(1, 10).to_string(), "2-A");
        assert_eq!(ranges("FFFFFFFE-FFFFFFFF").complement(0xFFFFFFF0, u32::MAX).to_string(), "FFFFFFF0-FFFFFFFD");
    }

    #[test]
    fn take_returns_lowest_values() {
        let mut available = ranges("2-3,6-9");

        let taken = available.take(3).unwrap();

        assert_eq!(taken.to_string(), "2-3,6");
        assert_eq!(available.to_string(), "7-9");
    }

    #[test]
    fn take_more_than_available_leaves_the_set_untouched() {
        let mut available = ranges("2-3");

        assert_eq!(available.take(3), None);
        assert_eq!(available.to_string(), "2-3");
    }

    #[test]
    fn addresses_iterate_in_order() {
        let set = ranges("A000002-A000003,A000010");

        assert_eq!(
            set.addresses().collect::<Vec<_>>(),
            [
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 16),
            ]
        );
        assert!(set.contains(0x0A000003));
        assert!(!set.contains(0x0A000004));
    }
}
