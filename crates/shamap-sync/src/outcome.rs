use std::fmt;
use std::ops::AddAssign;

/// Tally of what happened to nodes offered to a map during sync.
///
/// One outcome describes one node; outcomes are summed with `+=` to judge
/// a whole batch from a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddNodeOutcome {
    pub good: u32,
    pub bad: u32,
    pub duplicate: u32,
}

impl AddNodeOutcome {
    /// The node was new and was attached.
    pub fn useful() -> Self {
        Self {
            good: 1,
            ..Self::default()
        }
    }

    /// The node was malformed, unexpected or did not match its hash.
    pub fn invalid() -> Self {
        Self {
            bad: 1,
            ..Self::default()
        }
    }

    /// The map already had the node.
    pub fn duplicate() -> Self {
        Self {
            duplicate: 1,
            ..Self::default()
        }
    }

    /// More accepted or redundant nodes than bad ones.
    pub fn is_good(&self) -> bool {
        self.good + self.duplicate > self.bad
    }

    pub fn is_invalid(&self) -> bool {
        self.bad > 0
    }

    pub fn is_useful(&self) -> bool {
        self.good > 0
    }
}

impl AddAssign for AddNodeOutcome {
    fn add_assign(&mut self, other: Self) {
        self.good += other.good;
        self.bad += other.bad;
        self.duplicate += other.duplicate;
    }
}

impl fmt::Display for AddNodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "good:{} bad:{} dupe:{}",
            self.good, self.bad, self.duplicate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_outcomes() {
        assert!(AddNodeOutcome::useful().is_good());
        assert!(AddNodeOutcome::useful().is_useful());
        assert!(AddNodeOutcome::duplicate().is_good());
        assert!(!AddNodeOutcome::duplicate().is_useful());
        assert!(AddNodeOutcome::invalid().is_invalid());
        assert!(!AddNodeOutcome::invalid().is_good());
        assert!(!AddNodeOutcome::default().is_good());
    }

    #[test]
    fn batches_accumulate() {
        let mut total = AddNodeOutcome::default();
        total += AddNodeOutcome::useful();
        total += AddNodeOutcome::useful();
        total += AddNodeOutcome::invalid();
        total += AddNodeOutcome::duplicate();
        assert_eq!(
            total,
            AddNodeOutcome {
                good: 2,
                bad: 1,
                duplicate: 1
            }
        );
        assert!(total.is_good());
        assert!(total.is_invalid());
        assert_eq!(total.to_string(), "good:2 bad:1 dupe:1");
    }
}
