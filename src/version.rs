// src/version.rs

//! Debian-style package version ordering
//!
//! A version is an `(epoch, upstream, revision)` triple written as
//! `[epoch:]upstream[-revision]`. Epochs compare numerically; upstream and
//! revision use the mixed alphanumeric ordering where digit runs compare as
//! numbers, `~` sorts before everything (including end of string), and
//! letters sort before other punctuation.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Parsed package version
#[derive(Debug, Clone)]
pub struct Version {
    pub epoch: u32,
    pub upstream: String,
    pub revision: String,
}

impl Version {
    pub fn new(epoch: u32, upstream: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            epoch,
            upstream: upstream.into(),
            revision: revision.into(),
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    /// Parse `[epoch:]upstream[-revision]`
    ///
    /// The epoch is everything before the first `:` and must be a
    /// non-negative integer; the revision is everything after the *last*
    /// `-`, so upstream versions may themselves contain dashes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Parse("empty version string".to_string()));
        }

        let (epoch, rest) = match s.split_once(':') {
            Some((e, rest)) => {
                let epoch = e
                    .parse::<u32>()
                    .map_err(|_| Error::Parse(format!("invalid epoch in version '{}'", s)))?;
                (epoch, rest)
            }
            None => (0, s),
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((up, rev)) => (up.to_string(), rev.to_string()),
            None => (rest.to_string(), String::new()),
        };

        Ok(Version {
            epoch,
            upstream,
            revision,
        })
    }
}

impl fmt::Display for Version {
    /// Render as `epoch:upstream-revision`, omitting a zero epoch and an
    /// empty revision
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.upstream)?;
        if !self.revision.is_empty() {
            write!(f, "-{}", self.revision)?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_fragment(&self.upstream, &other.upstream))
            .then_with(|| compare_fragment(&self.revision, &other.revision))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// equality must agree with the comparator: `1.02` and `1.2` are the same
// version even though the strings differ
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

/// Sort weight of a byte within a non-digit run
///
/// `~` sorts before everything including end-of-string, letters before
/// other punctuation. Digits and end-of-string both weigh zero so a digit
/// run terminates the non-digit comparison on either side.
fn order(b: Option<u8>) -> i32 {
    match b {
        Some(b'~') => -1,
        Some(b) if b.is_ascii_digit() => 0,
        Some(b) if b.is_ascii_alphabetic() => b as i32,
        Some(b) => b as i32 + 256,
        None => 0,
    }
}

/// Compare one upstream-version or revision fragment
fn compare_fragment(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        // non-digit run
        while a.get(i).is_some_and(|c| !c.is_ascii_digit())
            || b.get(j).is_some_and(|c| !c.is_ascii_digit())
        {
            let wa = order(a.get(i).copied());
            let wb = order(b.get(j).copied());
            match wa.cmp(&wb) {
                Ordering::Equal => {}
                ord => return ord,
            }
            i += 1;
            j += 1;
        }

        // digit run, compared numerically: skip leading zeros, then a
        // longer remaining run wins, then first differing digit decides
        while a.get(i) == Some(&b'0') {
            i += 1;
        }
        while b.get(j) == Some(&b'0') {
            j += 1;
        }
        let mut first_diff = Ordering::Equal;
        while a.get(i).is_some_and(u8::is_ascii_digit) && b.get(j).is_some_and(u8::is_ascii_digit)
        {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if a.get(i).is_some_and(u8::is_ascii_digit) {
            return Ordering::Greater;
        }
        if b.get(j).is_some_and(u8::is_ascii_digit) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

/// Relational operator inside a dependency clause constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Earlier,
    EarlierEqual,
    Equal,
    LaterEqual,
    Later,
}

impl Relation {
    /// Parse a constraint operator
    ///
    /// Bare `<` and `>` are legacy spellings of `<=` and `>=`.
    pub fn parse(op: &str) -> Option<Relation> {
        match op {
            "<<" => Some(Relation::Earlier),
            "<=" | "<" => Some(Relation::EarlierEqual),
            "=" | "==" => Some(Relation::Equal),
            ">=" | ">" => Some(Relation::LaterEqual),
            ">>" => Some(Relation::Later),
            _ => None,
        }
    }

    /// Test `candidate <op> wanted`
    pub fn satisfied_by(self, candidate: &Version, wanted: &Version) -> bool {
        let ord = candidate.cmp(wanted);
        match self {
            Relation::Earlier => ord == Ordering::Less,
            Relation::EarlierEqual => ord != Ordering::Greater,
            Relation::Equal => ord == Ordering::Equal,
            Relation::LaterEqual => ord != Ordering::Less,
            Relation::Later => ord == Ordering::Greater,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_triple() {
        let ver = v("1:2.4.6-r3");
        assert_eq!(ver.epoch, 1);
        assert_eq!(ver.upstream, "2.4.6");
        assert_eq!(ver.revision, "r3");
    }

    #[test]
    fn test_parse_defaults() {
        let ver = v("0.9");
        assert_eq!(ver.epoch, 0);
        assert_eq!(ver.upstream, "0.9");
        assert_eq!(ver.revision, "");
    }

    #[test]
    fn test_revision_splits_at_last_dash() {
        let ver = v("1.0-beta-2");
        assert_eq!(ver.upstream, "1.0-beta");
        assert_eq!(ver.revision, "2");
    }

    #[test]
    fn test_invalid_epoch() {
        assert!("abc:1.0".parse::<Version>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        assert_eq!(v("1:2.0-1").to_string(), "1:2.0-1");
        assert_eq!(v("2.0-1").to_string(), "2.0-1");
        assert_eq!(v("2.0").to_string(), "2.0");
    }

    #[test]
    fn test_epoch_dominates() {
        assert!(v("1:1.0-2") > v("1.0-3"));
        assert!(v("1:0.1") < v("2:0.0"));
    }

    #[test]
    fn test_numeric_runs() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("1.02") == v("1.2"));
        assert!(v("10.0") > v("9.9"));
    }

    #[test]
    fn test_tilde_sorts_first() {
        assert!(v("2.0~rc1") < v("2.0"));
        assert!(v("2.0~rc1") < v("2.0~rc2"));
        assert!(v("1.0~") < v("1.0"));
    }

    #[test]
    fn test_letters_before_punctuation() {
        assert!(v("1.0a") < v("1.0+"));
        assert!(v("1.0a") > v("1.0"));
    }

    #[test]
    fn test_revision_breaks_ties() {
        assert!(v("1.0-2") > v("1.0-1"));
        assert!(v("1.0-r10") > v("1.0-r9"));
    }

    #[test]
    fn test_total_order() {
        let samples = ["1.0", "1.0-1", "1:0.5", "2.0~rc1", "2.0", "1.0a", "1.0+b1"];
        for a in &samples {
            assert_eq!(v(a).cmp(&v(a)), Ordering::Equal);
            for b in &samples {
                let ab = v(a).cmp(&v(b));
                assert_eq!(v(b).cmp(&v(a)), ab.reverse());
            }
        }
    }

    #[test]
    fn test_transitivity_sampled() {
        let samples = ["1.0~", "1.0", "1.0-1", "1.0a", "1.1", "1:0.1", "2.0~rc1", "2.0"];
        for a in &samples {
            for b in &samples {
                for c in &samples {
                    let (a, b, c) = (v(a), v(b), v(c));
                    if a <= b && b <= c {
                        assert!(a <= c, "{} <= {} <= {} broke transitivity", a, b, c);
                    }
                }
            }
        }
    }

    #[test]
    fn test_relations() {
        let rel = Relation::parse(">=").unwrap();
        assert!(rel.satisfied_by(&v("2.0"), &v("1.9")));
        assert!(rel.satisfied_by(&v("1.9"), &v("1.9")));
        assert!(!rel.satisfied_by(&v("1.8"), &v("1.9")));

        assert_eq!(Relation::parse("<"), Some(Relation::EarlierEqual));
        assert_eq!(Relation::parse(">"), Some(Relation::LaterEqual));
        assert!(Relation::parse("~=").is_none());

        assert!(Relation::Earlier.satisfied_by(&v("1.0"), &v("1.1")));
        assert!(!Relation::Earlier.satisfied_by(&v("1.1"), &v("1.1")));
        assert!(Relation::Equal.satisfied_by(&v("1:1.0-1"), &v("1:1.0-1")));
    }
}
