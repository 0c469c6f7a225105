//! The version-range language: a single interval literal such as `[1,2)`,
//! `(,1]`, the singleton `[1.2]`, or the wildcard `[1.2.*]`.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use nom::bytes::complete::take_while;
use nom::character::complete::one_of;
use nom::combinator::eof;
use nom::error::{ErrorKind, ParseError};
use nom::{IResult, Parser};
use thiserror::Error;

use crate::Version;

/// An error produced when a range literal does not parse.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionRangeError {
    /// The literal does not start with `[` or `(`.
    #[error("version range must start with '[' or '('")]
    MissingOpenDelimiter,
    /// The literal does not end with `]` or `)`.
    #[error("version range must end with ']' or ')'")]
    MissingCloseDelimiter,
    /// More than one `,` between the delimiters.
    #[error("version range cannot have more than two bounds")]
    TooManyBounds,
    /// A single version was written with an exclusive delimiter.
    #[error("a single version must be surrounded by '[' and ']'")]
    UnbracketedSingleton,
    /// Trailing characters after the closing delimiter, e.g. a second
    /// interval. Unions of intervals are not supported.
    #[error("encountered more characters after the version range")]
    ExpectedEof,
    /// Nom error
    #[error("{0:?}")]
    Nom(ErrorKind),
}

impl<'i> ParseError<&'i str> for ParseVersionRangeError {
    fn from_error_kind(_: &'i str, kind: ErrorKind) -> Self {
        ParseVersionRangeError::Nom(kind)
    }

    fn append(_: &'i str, _: ErrorKind, other: Self) -> Self {
        other
    }
}

/// One end of a [`VersionRange`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Bound {
    /// The boundary version.
    pub version: Version,
    /// Whether the boundary itself lies inside the range.
    pub inclusive: bool,
}

/// A contiguous interval of versions. Absent bounds are unbounded on that
/// side. Equality is structural over the bounds.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VersionRange {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl VersionRange {
    /// The lower bound, or `None` when unbounded below.
    pub fn lower(&self) -> Option<&Bound> {
        self.lower.as_ref()
    }

    /// The upper bound, or `None` when unbounded above.
    pub fn upper(&self) -> Option<&Bound> {
        self.upper.as_ref()
    }

    /// Whether `version` lies within this range.
    pub fn contains(&self, version: &Version) -> bool {
        if let Some(lower) = &self.lower {
            match lower.version.cmp(version) {
                Ordering::Greater => return false,
                Ordering::Equal if !lower.inclusive => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match upper.version.cmp(version) {
                Ordering::Less => return false,
                Ordering::Equal if !upper.inclusive => return false,
                _ => {}
            }
        }
        true
    }
}

/// Recognizes the delimiter structure of one interval literal and returns
/// the delimiters together with everything between them.
fn delimited_interval(input: &str) -> IResult<&str, (char, &str, char), ParseVersionRangeError> {
    let (input, open) = one_of("[(").parse(input).map_err(
        |_: nom::Err<ParseVersionRangeError>| {
            nom::Err::Failure(ParseVersionRangeError::MissingOpenDelimiter)
        },
    )?;
    let (input, interior) = take_while(|c| c != ']' && c != ')').parse(input)?;
    let (input, close) = one_of("])").parse(input).map_err(
        |_: nom::Err<ParseVersionRangeError>| {
            nom::Err::Failure(ParseVersionRangeError::MissingCloseDelimiter)
        },
    )?;
    let (input, _) = eof(input).map_err(|_: nom::Err<ParseVersionRangeError>| {
        nom::Err::Failure(ParseVersionRangeError::ExpectedEof)
    })?;
    Ok((input, (open, interior, close)))
}

impl FromStr for VersionRange {
    type Err = ParseVersionRangeError;

    fn from_str(range: &str) -> Result<Self, Self::Err> {
        let (_, (open, interior, close)) = delimited_interval(range).map_err(|err| match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => e,
            nom::Err::Incomplete(_) => ParseVersionRangeError::Nom(ErrorKind::Complete),
        })?;

        let lower_inclusive = open == '[';
        let upper_inclusive = close == ']';

        let Some((lower, upper)) = interior.split_once(',') else {
            // A singleton `[X]`, or the wildcard `[X.*]` which admits every
            // version with prefix X via the min/max sentinel versions.
            if !lower_inclusive || !upper_inclusive {
                return Err(ParseVersionRangeError::UnbracketedSingleton);
            }
            let version = interior.trim();
            return Ok(match version.strip_suffix(".*") {
                Some(prefix) => VersionRange {
                    lower: Some(Bound {
                        version: Version::new(format!("{prefix}.min")),
                        inclusive: true,
                    }),
                    upper: Some(Bound {
                        version: Version::new(format!("{prefix}.max")),
                        inclusive: true,
                    }),
                },
                None => {
                    let version = Version::new(version);
                    VersionRange {
                        lower: Some(Bound {
                            version: version.clone(),
                            inclusive: true,
                        }),
                        upper: Some(Bound {
                            version,
                            inclusive: true,
                        }),
                    }
                }
            });
        };

        if upper.contains(',') {
            return Err(ParseVersionRangeError::TooManyBounds);
        }

        let lower = lower.trim();
        let upper = upper.trim();
        Ok(VersionRange {
            lower: (!lower.is_empty()).then(|| Bound {
                version: Version::new(lower),
                inclusive: lower_inclusive,
            }),
            upper: (!upper.is_empty()).then(|| Bound {
                version: Version::new(upper),
                inclusive: upper_inclusive,
            }),
        })
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Some(bound) => {
                write!(
                    f,
                    "{}{}",
                    if bound.inclusive { '[' } else { '(' },
                    bound.version
                )?;
            }
            None => f.write_str("(")?,
        }
        f.write_str(",")?;
        match &self.upper {
            Some(bound) => {
                write!(
                    f,
                    "{}{}",
                    bound.version,
                    if bound.inclusive { ']' } else { ')' }
                )?;
            }
            None => f.write_str(")")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::{ParseVersionRangeError, VersionRange};
    use crate::Version;

    fn range(literal: &str) -> VersionRange {
        literal.parse().unwrap()
    }

    #[rstest]
    #[case("[1,2]", "1", true)]
    #[case("[1,2]", "1.1-SNAPSHOT", true)]
    #[case("[1,2]", "2", true)]
    #[case("[1,2]", "2.1", false)]
    #[case("(1,3)", "1", false)]
    #[case("(1,3)", "3", false)]
    #[case("(1,3)", "2-SNAPSHOT", true)]
    #[case("[1.2.*]", "1.2-alpha-1", true)]
    #[case("[1.2.*]", "1.2", true)]
    #[case("[1.2.*]", "1.2.9999999", true)]
    #[case("[1.2.*]", "1.3-rc-1", false)]
    #[case("[,1]", "0.5", true)]
    #[case("[,1]", "1.1", false)]
    #[case("[1,]", "999", true)]
    #[case("(,)", "anything", true)]
    fn membership(#[case] literal: &str, #[case] version: &str, #[case] expected: bool) {
        assert_eq!(
            range(literal).contains(&Version::new(version)),
            expected,
            "{version} in {literal}"
        );
    }

    #[test]
    fn singleton() {
        let singleton = range("[1.0]");
        assert!(singleton.contains(&Version::new("1")));
        assert!(singleton.contains(&Version::new("1.0")));
        assert!(!singleton.contains(&Version::new("1.0.1")));
        assert_eq!(singleton.to_string(), "[1.0,1.0]");
    }

    #[rstest]
    #[case("1.0")]
    #[case("1.0]")]
    #[case("[1.0")]
    #[case("[1,2,3]")]
    #[case("(1.0)")]
    #[case("[1,2] ")]
    #[case("(,1),(1,)")]
    fn rejected(#[case] literal: &str) {
        assert!(literal.parse::<VersionRange>().is_err(), "{literal}");
    }

    #[test]
    fn rejection_reasons() {
        assert_matches!(
            "1.0".parse::<VersionRange>(),
            Err(ParseVersionRangeError::MissingOpenDelimiter)
        );
        assert_matches!(
            "[1.0".parse::<VersionRange>(),
            Err(ParseVersionRangeError::MissingCloseDelimiter)
        );
        assert_matches!(
            "[1,2,3]".parse::<VersionRange>(),
            Err(ParseVersionRangeError::TooManyBounds)
        );
        assert_matches!(
            "(1.0)".parse::<VersionRange>(),
            Err(ParseVersionRangeError::UnbracketedSingleton)
        );
    }

    #[rstest]
    #[case("[1,2]")]
    #[case("(1,3)")]
    #[case("[1.2.*]")]
    #[case("[1.0]")]
    #[case("(,1]")]
    #[case("[1,)")]
    #[case("(,)")]
    fn display_round_trips(#[case] literal: &str) {
        let parsed = range(literal);
        assert_eq!(parsed.to_string().parse::<VersionRange>().unwrap(), parsed);
    }

    #[test]
    fn bounds_are_trimmed() {
        assert_eq!(range("[1, 2]"), range("[1,2]"));
        assert_eq!(range("[ 1.0 ]"), range("[1.0]"));
    }

    #[test]
    fn structural_equality() {
        assert_eq!(range("[1,2]"), range("[1.0,2]"));
        assert_ne!(range("[1,2]"), range("(1,2]"));
        assert_ne!(range("[1,2]"), range("[1,2)"));
    }
}
