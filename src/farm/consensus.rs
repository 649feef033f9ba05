//! Consensus-group partitioning.
//!
//! Ants are grouped by shared recent block history. Two independently
//! polled daemons are rarely caught at the same height, so membership is
//! decided over a small lookback window: an ant joins a group when any of
//! the last few heights of the group's first member carries the same
//! block id in both histories.

use std::collections::HashMap;

use crate::types::BlockId;

/// Heights compared when deciding whether two ants share history. Wide
/// enough to absorb polling skew, narrow enough to flag a forked or
/// lagging ant.
const GROUP_LOOKBACK: u64 = 8;

/// Partition ants (given as tip height + seen-block history) into groups
/// of agreeing peers. Returns index lists into the input slice.
pub(crate) fn partition_by_history(tips: &[(u64, HashMap<u64, BlockId>)]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();

    'ants: for (i, (_, seen)) in tips.iter().enumerate() {
        for group in &mut groups {
            let (rep_height, rep_seen) = &tips[group[0]];
            for offset in 0..GROUP_LOOKBACK {
                let Some(height) = rep_height.checked_sub(offset) else {
                    break;
                };
                if let (Some(id), Some(rep_id)) = (seen.get(&height), rep_seen.get(&height)) {
                    if id == rep_id {
                        group.push(i);
                        continue 'ants;
                    }
                }
            }
        }
        groups.push(vec![i]);
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(heights: &[(u64, &str)]) -> HashMap<u64, BlockId> {
        heights
            .iter()
            .map(|(h, id)| (*h, id.to_string()))
            .collect()
    }

    #[test]
    fn test_identical_histories_form_one_group() {
        let shared = history(&[(1, "b1"), (2, "b2"), (3, "b3")]);
        let tips: Vec<_> = (0..4).map(|_| (3u64, shared.clone())).collect();
        let groups = partition_by_history(&tips);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_forked_ant_gets_own_group() {
        let main = history(&[(10, "b10"), (11, "b11"), (12, "b12")]);
        let fork = history(&[(10, "x10"), (11, "x11"), (12, "x12")]);
        let tips = vec![
            (12u64, main.clone()),
            (12u64, main),
            (12u64, fork),
        ];
        let groups = partition_by_history(&tips);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![0, 1]);
        assert_eq!(groups[1], vec![2]);
    }

    #[test]
    fn test_lookback_tolerates_height_skew() {
        // The second ant was polled three blocks behind the first but
        // shares history inside the lookback window.
        let ahead = history(&[(10, "b10"), (11, "b11"), (12, "b12"), (13, "b13")]);
        let behind = history(&[(9, "b9"), (10, "b10")]);
        let tips = vec![(13u64, ahead), (10u64, behind)];
        let groups = partition_by_history(&tips);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_agreement_outside_lookback_does_not_count() {
        // Shared history exists only deeper than the lookback window.
        let mut a = history(&[(1, "b1")]);
        let mut b = history(&[(1, "b1")]);
        for h in 2..=20u64 {
            a.insert(h, format!("a{}", h));
            b.insert(h, format!("b{}", h));
        }
        let tips = vec![(20u64, a), (20u64, b)];
        let groups = partition_by_history(&tips);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_lookback_never_underflows_at_low_heights() {
        let a = history(&[(0, "genesis"), (1, "b1")]);
        let b = history(&[(0, "genesis")]);
        let tips = vec![(1u64, a), (0u64, b)];
        let groups = partition_by_history(&tips);
        assert_eq!(groups.len(), 1);
    }
}
