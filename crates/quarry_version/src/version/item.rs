use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use num_bigint::BigUint;

pub(crate) const QUALIFIER_ALPHA: i32 = -5;
pub(crate) const QUALIFIER_BETA: i32 = -4;
pub(crate) const QUALIFIER_MILESTONE: i32 = -3;
pub(crate) const QUALIFIER_RC: i32 = -2;
pub(crate) const QUALIFIER_SNAPSHOT: i32 = -1;
pub(crate) const QUALIFIER_RELEASE: i32 = 0;
pub(crate) const QUALIFIER_SP: i32 = 1;

/// Returns the weight of a well-known qualifier, or `None` for an
/// unrecognized label. The label must already be lower-cased.
pub(crate) fn qualifier_weight(label: &str) -> Option<i32> {
    match label {
        "alpha" => Some(QUALIFIER_ALPHA),
        "beta" => Some(QUALIFIER_BETA),
        "milestone" => Some(QUALIFIER_MILESTONE),
        "cr" | "rc" => Some(QUALIFIER_RC),
        "snapshot" => Some(QUALIFIER_SNAPSHOT),
        "" | "ga" | "final" | "release" => Some(QUALIFIER_RELEASE),
        "sp" => Some(QUALIFIER_SP),
        _ => None,
    }
}

fn qualifier_label(weight: i32) -> &'static str {
    match weight {
        QUALIFIER_ALPHA => "alpha",
        QUALIFIER_BETA => "beta",
        QUALIFIER_MILESTONE => "milestone",
        QUALIFIER_RC => "rc",
        QUALIFIER_SNAPSHOT => "snapshot",
        QUALIFIER_SP => "sp",
        _ => "ga",
    }
}

/// A single element of a parsed version string.
///
/// Items of different variants order by their kind ordinal
/// (`Min < Qualifier < Str < Int < BigInt < Max`); items of the same variant
/// order by their payload.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub(crate) enum Item {
    /// Sentinel below every other item, produced by a trailing `min` token.
    Min,
    /// A well-known pre-release or release label, stored as its weight.
    Qualifier(i32),
    /// An unrecognized label, lower-cased.
    Str(Box<str>),
    /// A numeric element of at most nine decimal digits.
    Int(u32),
    /// A numeric element too large for [`Item::Int`].
    BigInt(BigUint),
    /// Sentinel above every other item, produced by a trailing `max` token.
    Max,
}

impl Item {
    /// The kind encoding keeps bit 1 clear for the numeric class, which is
    /// what drives the padding runs during version comparison.
    fn kind(&self) -> u8 {
        match self {
            Item::Min => 0,
            Item::Qualifier(_) => 2,
            Item::Str(_) => 3,
            Item::Int(_) => 4,
            Item::BigInt(_) => 5,
            Item::Max => 8,
        }
    }

    pub(crate) fn is_numeric(&self) -> bool {
        self.kind() & 2 == 0
    }

    /// Compares this item against the conceptual padding element, the `0` or
    /// `"ga"` that extends a shorter item sequence.
    pub(crate) fn cmp_padding(&self) -> Ordering {
        match self {
            Item::Min => Ordering::Less,
            Item::Max | Item::BigInt(_) | Item::Str(_) => Ordering::Greater,
            Item::Int(value) => value.cmp(&0),
            Item::Qualifier(weight) => weight.cmp(&0),
        }
    }
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Item::Qualifier(a), Item::Qualifier(b)) => a.cmp(b),
            (Item::Str(a), Item::Str(b)) => a.cmp(b),
            (Item::Int(a), Item::Int(b)) => a.cmp(b),
            (Item::BigInt(a), Item::BigInt(b)) => a.cmp(b),
            _ => self.kind().cmp(&other.kind()),
        }
    }
}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Item {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Item::Min => f.write_str("min"),
            Item::Max => f.write_str("max"),
            Item::Qualifier(weight) => f.write_str(qualifier_label(*weight)),
            Item::Str(text) => f.write_str(text),
            Item::Int(value) => write!(f, "{value}"),
            Item::BigInt(value) => write!(f, "{value}"),
        }
    }
}
