use std::cmp::Ordering;

use num_bigint::BigUint;
use smallvec::SmallVec;

use super::item::{
    qualifier_weight, Item, QUALIFIER_ALPHA, QUALIFIER_BETA, QUALIFIER_MILESTONE,
};
use super::ItemVec;

/// The largest number of decimal digits that is guaranteed to fit an
/// [`Item::Int`]; anything longer spills into [`Item::BigInt`].
const MAX_INT_DIGITS: usize = 9;

struct Token<'a> {
    text: &'a str,
    /// Whether the token is a run of ASCII digits.
    number: bool,
    /// Whether a non-digit run was ended by a digit rather than a separator
    /// or the end of the input.
    terminated_by_number: bool,
    /// Whether the tokenizer consumed the whole input producing this token.
    at_end: bool,
}

/// Splits a version string into tokens in a single forward pass. Tokens are
/// separated by `.`, `-`, `_`, and by digit/non-digit transitions; an empty
/// token reads as `0`. Leading zeros of a digit run are dropped while
/// scanning so that the numeric payload is already normalized.
struct Tokenizer<'a> {
    version: &'a str,
    index: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(version: &'a str) -> Self {
        Self { version, index: 0 }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let bytes = self.version.as_bytes();
        if self.index >= bytes.len() {
            return None;
        }

        // -2 initial, -1 inside a string run, 0 only zeros so far, 1 number
        let mut state: i8 = -2;
        let mut start = self.index;
        let mut end = bytes.len();
        let mut terminated_by_number = false;
        while self.index < bytes.len() {
            match bytes[self.index] {
                b'.' | b'-' | b'_' => {
                    end = self.index;
                    self.index += 1;
                    break;
                }
                digit @ b'0'..=b'9' => {
                    if state == -1 {
                        end = self.index;
                        terminated_by_number = true;
                        break;
                    }
                    if state == 0 {
                        // the previous character was a leading zero
                        start += 1;
                    }
                    state = if state > 0 || digit > b'0' { 1 } else { 0 };
                    self.index += 1;
                }
                _ => {
                    if state >= 0 {
                        end = self.index;
                        break;
                    }
                    state = -1;
                    self.index += 1;
                }
            }
        }

        let at_end = self.index >= bytes.len();
        if end > start {
            Some(Token {
                text: &self.version[start..end],
                number: state >= 0,
                terminated_by_number,
                at_end,
            })
        } else {
            Some(Token {
                text: "0",
                number: true,
                terminated_by_number: false,
                at_end,
            })
        }
    }
}

fn item_from_token(token: &Token<'_>) -> Item {
    if token.number {
        return if token.text.len() <= MAX_INT_DIGITS {
            Item::Int(token.text.parse().unwrap_or(0))
        } else {
            Item::BigInt(BigUint::parse_bytes(token.text.as_bytes(), 10).unwrap_or_default())
        };
    }

    if token.at_end {
        if token.text.eq_ignore_ascii_case("min") {
            return Item::Min;
        }
        if token.text.eq_ignore_ascii_case("max") {
            return Item::Max;
        }
    }

    if token.terminated_by_number && token.text.len() == 1 {
        match token.text.as_bytes()[0] {
            b'a' | b'A' => return Item::Qualifier(QUALIFIER_ALPHA),
            b'b' | b'B' => return Item::Qualifier(QUALIFIER_BETA),
            b'm' | b'M' => return Item::Qualifier(QUALIFIER_MILESTONE),
            _ => {}
        }
    }

    let label = token.text.to_lowercase();
    match qualifier_weight(&label) {
        Some(weight) => Item::Qualifier(weight),
        None => Item::Str(label.into_boxed_str()),
    }
}

/// Drops trailing items that compare equal to padding at the end of every
/// same-kind run, keeping the run that directly precedes a kind transition.
/// This is what makes `1`, `1.0` and `1-ga` parse to the same item sequence.
fn trim_padding(items: &mut ItemVec) {
    let mut numeric: Option<bool> = None;
    let mut end = items.len().saturating_sub(1);
    let mut index = end;
    while index > 0 {
        let item_numeric = items[index].is_numeric();
        if numeric != Some(item_numeric) {
            end = index;
            numeric = Some(item_numeric);
        }
        if end == index
            && (index == items.len() - 1 || items[index - 1].is_numeric() == item_numeric)
            && items[index].cmp_padding() == Ordering::Equal
        {
            items.remove(index);
            end -= 1;
        }
        index -= 1;
    }
}

/// Parses a version string into its item sequence. Accepts every input; the
/// empty string reads as `"0"`.
pub(crate) fn parse_items(version: &str) -> ItemVec {
    let source = if version.is_empty() { "0" } else { version };
    let mut items: ItemVec = SmallVec::new();
    for token in Tokenizer::new(source) {
        items.push(item_from_token(&token));
    }
    trim_padding(&mut items);
    items
}

#[cfg(test)]
mod test {
    use super::*;

    fn items(version: &str) -> Vec<String> {
        parse_items(version)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn splits_on_separators_and_transitions() {
        assert_eq!(items("1.2.3"), ["1", "2", "3"]);
        assert_eq!(items("1.2-beta2"), ["1", "2", "beta", "2"]);
        assert_eq!(items("1.2rc3"), ["1", "2", "rc", "3"]);
        assert_eq!(items("1_2_3"), ["1", "2", "3"]);
    }

    #[test]
    fn empty_tokens_read_as_zero() {
        assert_eq!(items(""), ["0"]);
        assert_eq!(items("1..2"), ["1", "0", "2"]);
        assert_eq!(items("-1"), ["0", "1"]);
    }

    #[test]
    fn leading_zeros_are_stripped() {
        assert_eq!(items("007"), ["7"]);
        assert_eq!(items("1.000"), ["1"]);
        assert_eq!(items("0001.0002"), ["1", "2"]);
    }

    #[test]
    fn large_numbers_become_bigint() {
        assert_eq!(items("4294967296"), ["4294967296"]);
        assert!(matches!(
            parse_items("12345678901234567890")[0],
            Item::BigInt(_)
        ));
        assert!(matches!(parse_items("999999999")[0], Item::Int(999999999)));
    }

    #[test]
    fn single_letter_abbreviations_before_digits() {
        assert_eq!(parse_items("1a1")[1], Item::Qualifier(QUALIFIER_ALPHA));
        assert_eq!(parse_items("1b1")[1], Item::Qualifier(QUALIFIER_BETA));
        assert_eq!(parse_items("1m1")[1], Item::Qualifier(QUALIFIER_MILESTONE));
        // without a following digit `a` is just a string
        assert_eq!(parse_items("1-a")[1], Item::Str("a".into()));
    }

    #[test]
    fn sentinels_only_at_end_of_input() {
        assert_eq!(parse_items("1.min")[1], Item::Min);
        assert_eq!(parse_items("1.MAX")[1], Item::Max);
        assert_eq!(parse_items("1.min.2")[1], Item::Str("min".into()));
    }

    #[test]
    fn trailing_padding_is_trimmed() {
        assert_eq!(items("1.0.0"), ["1"]);
        assert_eq!(items("1-ga"), ["1"]);
        assert_eq!(items("1.0-final"), ["1"]);
        assert_eq!(items("1.0.alpha"), ["1", "alpha"]);
        // a zero that is the whole run before a kind transition survives
        assert_eq!(items("x.0.beta"), ["x", "0", "beta"]);
        assert_eq!(items("1-snapshot"), ["1", "snapshot"]);
    }
}
