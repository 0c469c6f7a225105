use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

use item::{Item, QUALIFIER_SNAPSHOT};

mod item;
mod parse;

/// Most versions consist of only a few items; keep those inline.
pub(crate) type ItemVec = SmallVec<[Item; 4]>;

/// A version string under the generic total order.
///
/// Version strings are sequences of tokens separated by `.`, `-`, `_` and by
/// digit/non-digit transitions. Numeric tokens compare numerically with
/// arbitrary precision; well-known pre-release labels compare by their
/// weight, below the release itself:
///
/// ```txt
/// 1-alpha < 1-beta < 1-milestone < 1-rc < 1-snapshot < 1 < 1-sp < 1.0.1
/// ```
///
/// Unknown labels compare lexicographically, case-insensitively, above the
/// release. Trailing zero-equivalents are insignificant, so `1`, `1.0` and
/// `1-ga` are all equal. The tokens `min` and `max` at the end of the input
/// are sentinels bounding every other version with the same prefix; the
/// range language uses them to expand wildcards.
///
/// Parsing cannot fail. The original input is preserved and returned by
/// [`Version::as_str`] and `Display`; the parsed items only drive
/// comparison.
#[derive(Clone, Eq)]
pub struct Version {
    orig: Box<str>,
    items: ItemVec,
}

impl Version {
    /// Parses a version string. Every string is valid, including the empty
    /// string, which reads as `"0"`.
    pub fn new(version: impl Into<String>) -> Self {
        let orig = version.into();
        let items = parse::parse_items(&orig);
        Self {
            orig: orig.into_boxed_str(),
            items,
        }
    }

    /// The original input string, byte-for-byte.
    pub fn as_str(&self) -> &str {
        &self.orig
    }

    /// Returns true if any element of this version is the `snapshot`
    /// qualifier.
    pub fn is_snapshot(&self) -> bool {
        self.items
            .iter()
            .any(|item| matches!(item, Item::Qualifier(weight) if *weight == QUALIFIER_SNAPSHOT))
    }

    /// Returns this version with a trailing `snapshot` qualifier dropped,
    /// or a clone when there is none.
    pub fn base_version(&self) -> Version {
        const SNAPSHOT: &str = "snapshot";
        if self.orig.len() > SNAPSHOT.len() {
            let (head, tail) = self.orig.split_at(self.orig.len() - SNAPSHOT.len());
            if tail.eq_ignore_ascii_case(SNAPSHOT) {
                let head = head.strip_suffix(['.', '-', '_']).unwrap_or(head);
                return Version::new(head);
            }
        }
        self.clone()
    }

    /// The parsed-item rendition, dot-joined with qualifiers expanded. Only
    /// meant for diagnostics; `Display` keeps the original input.
    pub fn canonical(&self) -> String {
        self.items.iter().join(".")
    }
}

impl From<&str> for Version {
    fn from(version: &str) -> Self {
        Version::new(version)
    }
}

impl FromStr for Version {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Version::new(s))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.orig)
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Version")
            .field("orig", &self.orig)
            .field("items", &self.items)
            .finish()
    }
}

/// Compares the items of one side from `index` onward against padding,
/// returning the first decisive result. With a class filter the walk stops
/// at the first item of the opposite class.
fn compare_padding(items: &[Item], index: usize, numeric: Option<bool>) -> Ordering {
    let mut rel = Ordering::Equal;
    for item in &items[index..] {
        if let Some(numeric) = numeric {
            if numeric != item.is_numeric() {
                break;
            }
        }
        rel = item.cmp_padding();
        if rel != Ordering::Equal {
            break;
        }
    }
    rel
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let these = &self.items;
        let those = &other.items;

        // Tracks the numeric-class of the last pair that compared equal;
        // decides which side pads at a class transition.
        let mut numeric = true;
        let mut index = 0;
        loop {
            match (these.get(index), those.get(index)) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return compare_padding(those, index, None).reverse(),
                (Some(_), None) => return compare_padding(these, index, None),
                (Some(this_item), Some(that_item)) => {
                    if this_item.is_numeric() != that_item.is_numeric() {
                        // the very first pair has no preceding run to pad
                        // against, so the items compare directly by kind
                        if index == 0 {
                            return this_item.cmp(that_item);
                        }
                        return if numeric == this_item.is_numeric() {
                            compare_padding(these, index, Some(numeric))
                        } else {
                            compare_padding(those, index, Some(numeric)).reverse()
                        };
                    }
                    match this_item.cmp(that_item) {
                        Ordering::Equal => {
                            numeric = this_item.is_numeric();
                            index += 1;
                        }
                        decided => return decided,
                    }
                }
            }
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Padding was trimmed during parsing, so equal versions hash the
        // same item sequence.
        self.items.hash(state);
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.orig)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Version::new(String::deserialize(deserializer)?))
    }
}
