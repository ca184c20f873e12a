//! Port-range algebra for exit policies.
//!
//! Router status entries carry a summarized exit policy on their `p` line,
//! either as the ports a relay accepts or as the ports it rejects:
//!
//! ```text
//! p accept 20-23,43,53,79-81,88,110,143,194,220,389,443,464-465
//! p reject 1-24,26-65535
//! ```
//!
//! [`PortRangeSet::parse_policy`] turns either form into the list of
//! accepted ranges, and [`PortRangeSet::covers_all`] answers whether a
//! relay can carry every port an operator requires.
//!
//! # Coverage Semantics
//!
//! A required range is covered only when a *single* accepted range contains
//! it. A relay accepting `1-50,60-100` does not cover `40-70`, even though
//! both halves of the required range are accepted somewhere.
//!
//! ```text
//!   accepted   [1 ─────── 50]      [60 ─────── 100]
//!   required          [40 ─────────── 70]            ✗ not covered
//!   required     [10 ── 30]   [55]  [70 ─ 80]        ✗ 55 is rejected
//!   required     [10 ── 30]         [70 ─ 80]        ✓ covered
//! ```
//!
//! # Example
//!
//! ```rust
//! use fasttor_rs::PortRangeSet;
//!
//! let relay = PortRangeSet::parse_policy("reject 1-79,81-442,444-1023")?;
//! let wanted = PortRangeSet::parse_policy("accept 80,443,1024-65535")?;
//! assert!(relay.covers_all(&wanted));
//! # Ok::<(), fasttor_rs::Error>(())
//! ```

use std::borrow::Cow;
use std::fmt;

use crate::error::{Error, Result};

/// Lowest valid port number.
pub const MIN_PORT: u16 = 1;

/// Highest valid port number.
pub const MAX_PORT: u16 = 65535;

/// Inclusive range of ports, `1 <= start <= end <= 65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRange {
    /// First port in the range.
    pub start: u16,
    /// Last port in the range (inclusive).
    pub end: u16,
}

impl PortRange {
    /// Creates a range, checking the port bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortSpecParse`] if either end is 0 or `start > end`.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start < MIN_PORT || start > end {
            return Err(Error::PortSpecParse(format!(
                "invalid port range {}-{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Creates a range holding a single port.
    pub fn single(port: u16) -> Result<Self> {
        Self::new(port, port)
    }

    /// Returns true if `other` lies entirely inside this range.
    pub fn contains(&self, other: &PortRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Number of ports in the range.
    pub fn len(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    /// Always false; a valid range holds at least one port.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Parses `80` or `1024-65535`.
    fn parse_token(token: &str) -> Result<Self> {
        let parse_port = |s: &str| -> Result<u16> {
            s.trim()
                .parse::<u16>()
                .map_err(|_| Error::PortSpecParse(format!("invalid port '{}'", s)))
        };

        match token.split_once('-') {
            Some((lo, hi)) => Self::new(parse_port(lo)?, parse_port(hi)?),
            None => Self::single(parse_port(token)?),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// An ordered list of accepted port ranges.
///
/// Ranges keep the order they were parsed in; Tor emits summarized
/// policies sorted and disjoint, and nothing is merged. Coverage tests
/// check the ordering themselves (see [`covers_all`](Self::covers_all)).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRangeSet {
    ranges: Vec<PortRange>,
}

impl PortRangeSet {
    /// Creates a set from ranges, keeping their order.
    pub fn new(ranges: Vec<PortRange>) -> Self {
        Self { ranges }
    }

    /// Parses an `accept <csv>` or `reject <csv>` policy.
    ///
    /// `accept` lists map one-to-one onto ranges. `reject` lists are turned
    /// into their complement over `1..=65535`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortSpecParse`] on an unknown keyword, a missing port
    /// list, or a malformed port or range.
    ///
    /// # Example
    ///
    /// ```rust
    /// use fasttor_rs::{PortRange, PortRangeSet};
    ///
    /// let set = PortRangeSet::parse_policy("reject 1-79,81-442,444-1023")?;
    /// assert_eq!(
    ///     set.ranges(),
    ///     &[
    ///         PortRange { start: 80, end: 80 },
    ///         PortRange { start: 443, end: 443 },
    ///         PortRange { start: 1024, end: 65535 },
    ///     ]
    /// );
    /// # Ok::<(), fasttor_rs::Error>(())
    /// ```
    pub fn parse_policy(text: &str) -> Result<Self> {
        let mut parts = text.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| Error::PortSpecParse("empty port policy".to_string()))?;
        let list = parts.next().ok_or_else(|| {
            Error::PortSpecParse(format!("port policy '{}' has no port list", text))
        })?;
        if let Some(extra) = parts.next() {
            return Err(Error::PortSpecParse(format!(
                "unexpected '{}' in port policy '{}'",
                extra, text
            )));
        }

        let listed = list
            .split(',')
            .map(PortRange::parse_token)
            .collect::<Result<Vec<_>>>()?;

        match keyword {
            "accept" => Ok(Self::new(listed)),
            "reject" => Ok(Self::complement_of(&listed)),
            other => Err(Error::PortSpecParse(format!(
                "unknown policy keyword '{}'",
                other
            ))),
        }
    }

    /// Accepted ranges left over once `rejected` is removed from the port
    /// domain. The cursor never moves backwards.
    fn complement_of(rejected: &[PortRange]) -> Self {
        let mut accepted = Vec::new();
        let mut cursor = u32::from(MIN_PORT);

        for reject in rejected {
            let start = u32::from(reject.start);
            if start > cursor {
                accepted.push(PortRange {
                    start: cursor as u16,
                    end: reject.start - 1,
                });
            }
            cursor = cursor.max(u32::from(reject.end) + 1);
        }

        if cursor <= u32::from(MAX_PORT) {
            accepted.push(PortRange {
                start: cursor as u16,
                end: MAX_PORT,
            });
        }

        Self::new(accepted)
    }

    /// Returns the ranges in order.
    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    /// Returns true if the set accepts no ports at all.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of ranges in the set.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns true if the ranges are in ascending order of start port.
    pub fn is_ascending(&self) -> bool {
        self.ranges.windows(2).all(|w| w[0] <= w[1])
    }

    /// Returns true if a single accepted range contains `required`.
    pub fn covers(&self, required: &PortRange) -> bool {
        self.ranges.iter().any(|r| r.contains(required))
    }

    /// Returns true if every range in `required` fits inside one accepted
    /// range.
    ///
    /// Runs a two-pointer scan in linear time. The index into the accepted
    /// ranges only moves forward across successive required ranges, which is
    /// sound when both sides are ascending; a side that is not ascending is
    /// scanned as a sorted copy.
    pub fn covers_all(&self, required: &PortRangeSet) -> bool {
        let accepted = self.ascending();
        let required = required.ascending();

        let mut i = 0;
        for want in required.iter() {
            loop {
                let Some(have) = accepted.get(i) else {
                    return false;
                };
                if have.start > want.start {
                    return false;
                }
                if have.end < want.end {
                    i += 1;
                    continue;
                }
                break;
            }
        }
        true
    }

    fn ascending(&self) -> Cow<'_, [PortRange]> {
        if self.is_ascending() {
            Cow::Borrowed(self.ranges.as_slice())
        } else {
            let mut sorted = self.ranges.clone();
            sorted.sort();
            Cow::Owned(sorted)
        }
    }
}

impl fmt::Display for PortRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
        write!(f, "accept {}", list.join(","))
    }
}
