use chrono::{DateTime, Duration, Local, Utc};

/// Controls how stale a cached file must be before a remote fetch is
/// required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Trigger on every check (session deduplication still applies).
    Always,
    /// Never trigger from staleness alone.
    Never,
    /// Trigger when the calendar day in the local time zone has changed
    /// since the last check.
    Daily,
    /// Trigger when at least this many minutes have passed since the last
    /// check.
    Interval(u32),
    /// An unrecognized policy string; behaves like [`UpdatePolicy::Never`].
    Unknown,
}

impl UpdatePolicy {
    /// Parses a policy selector string (`always`, `never`, `daily`,
    /// `interval:N`). Anything unrecognized maps to
    /// [`UpdatePolicy::Unknown`].
    pub fn parse(policy: &str) -> Self {
        match policy {
            "always" => UpdatePolicy::Always,
            "never" => UpdatePolicy::Never,
            "daily" => UpdatePolicy::Daily,
            _ => match policy.strip_prefix("interval:") {
                Some(minutes) => match minutes.parse() {
                    Ok(minutes) => UpdatePolicy::Interval(minutes),
                    Err(_) => {
                        tracing::warn!("invalid update interval {policy:?}, assuming never");
                        UpdatePolicy::Unknown
                    }
                },
                None => {
                    tracing::warn!("unknown update policy {policy:?}, assuming never");
                    UpdatePolicy::Unknown
                }
            },
        }
    }

    /// Whether a file last checked at `last_updated` is stale at `now`. A
    /// missing timestamp counts as stale for every policy that can trigger
    /// at all.
    pub fn is_stale(&self, last_updated: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            UpdatePolicy::Never | UpdatePolicy::Unknown => false,
            UpdatePolicy::Always => true,
            UpdatePolicy::Daily => match last_updated {
                Some(last) => {
                    last.with_timezone(&Local).date_naive() != now.with_timezone(&Local).date_naive()
                }
                None => true,
            },
            UpdatePolicy::Interval(minutes) => match last_updated {
                Some(last) => {
                    now.signed_duration_since(last) >= Duration::minutes(i64::from(*minutes))
                }
                None => true,
            },
        }
    }

    /// Picks the more eager of two policies, i.e. the one that re-checks
    /// more frequently. Useful when an artifact is reachable through
    /// repositories with different policies.
    pub fn effective(first: Self, second: Self) -> Self {
        if first.check_frequency_minutes() <= second.check_frequency_minutes() {
            first
        } else {
            second
        }
    }

    fn check_frequency_minutes(&self) -> u32 {
        match self {
            UpdatePolicy::Always => 0,
            UpdatePolicy::Interval(minutes) => *minutes,
            UpdatePolicy::Daily => 24 * 60,
            UpdatePolicy::Never | UpdatePolicy::Unknown => u32::MAX,
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, Utc};
    use rstest::rstest;

    use super::UpdatePolicy;

    #[rstest]
    #[case("always", UpdatePolicy::Always)]
    #[case("never", UpdatePolicy::Never)]
    #[case("daily", UpdatePolicy::Daily)]
    #[case("interval:60", UpdatePolicy::Interval(60))]
    #[case("interval:x", UpdatePolicy::Unknown)]
    #[case("hourly", UpdatePolicy::Unknown)]
    fn parse(#[case] source: &str, #[case] expected: UpdatePolicy) {
        assert_eq!(UpdatePolicy::parse(source), expected);
    }

    #[test]
    fn interval_staleness() {
        let now = Utc::now();
        let policy = UpdatePolicy::Interval(60);
        assert!(!policy.is_stale(Some(now - Duration::minutes(59)), now));
        assert!(policy.is_stale(Some(now - Duration::minutes(61)), now));
        assert!(policy.is_stale(Some(now - Duration::minutes(60)), now));
        assert!(policy.is_stale(None, now));
    }

    #[test]
    fn daily_staleness() {
        let now = Utc::now();
        assert!(!UpdatePolicy::Daily.is_stale(Some(now), now));
        assert!(UpdatePolicy::Daily.is_stale(Some(now - Duration::days(1)), now));
    }

    #[test]
    fn never_is_never_stale() {
        let now = Utc::now();
        assert!(!UpdatePolicy::Never.is_stale(None, now));
        assert!(!UpdatePolicy::Never.is_stale(Some(now - Duration::days(400)), now));
        assert!(!UpdatePolicy::Unknown.is_stale(None, now));
    }

    #[test]
    fn always_is_always_stale() {
        let now = Utc::now();
        assert!(UpdatePolicy::Always.is_stale(Some(now), now));
        assert!(UpdatePolicy::Always.is_stale(None, now));
    }

    #[tracing_test::traced_test]
    #[test]
    fn unknown_policies_warn() {
        assert_eq!(UpdatePolicy::parse("hourly"), UpdatePolicy::Unknown);
        assert!(logs_contain("unknown update policy"));
    }

    #[rstest]
    #[case(UpdatePolicy::Always, UpdatePolicy::Never, UpdatePolicy::Always)]
    #[case(UpdatePolicy::Daily, UpdatePolicy::Interval(60), UpdatePolicy::Interval(60))]
    #[case(UpdatePolicy::Interval(30), UpdatePolicy::Interval(90), UpdatePolicy::Interval(30))]
    #[case(UpdatePolicy::Never, UpdatePolicy::Daily, UpdatePolicy::Daily)]
    #[case(UpdatePolicy::Unknown, UpdatePolicy::Always, UpdatePolicy::Always)]
    fn effective_policy(
        #[case] first: UpdatePolicy,
        #[case] second: UpdatePolicy,
        #[case] expected: UpdatePolicy,
    ) {
        assert_eq!(UpdatePolicy::effective(first, second), expected);
    }
}
