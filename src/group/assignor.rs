//! Partition assignment strategies run by the group leader.
//!
//! Every strategy sorts member ids and topic names before assigning, so the
//! same input always yields the same plan.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::consumer::ConsumerGroupMemberMetadata;

/// member id → topic → partitions.
pub type BalancePlan = BTreeMap<String, BTreeMap<String, Vec<i32>>>;

pub trait BalanceStrategy: Send + Sync + fmt::Debug {
    /// Protocol name sent in JoinGroup.
    fn name(&self) -> &str;

    /// Assign every partition of `topics` to exactly one subscribed member.
    fn plan(
        &self,
        members: &BTreeMap<String, ConsumerGroupMemberMetadata>,
        topics: &BTreeMap<String, Vec<i32>>,
    ) -> Result<BalancePlan>;
}

pub fn range() -> Arc<dyn BalanceStrategy> {
    Arc::new(RangeStrategy)
}

pub fn round_robin() -> Arc<dyn BalanceStrategy> {
    Arc::new(RoundRobinStrategy)
}

pub fn sticky() -> Arc<dyn BalanceStrategy> {
    Arc::new(StickyStrategy)
}

pub fn by_name(name: &str) -> Option<Arc<dyn BalanceStrategy>> {
    match name.to_lowercase().as_str() {
        "range" => Some(range()),
        "roundrobin" | "round-robin" => Some(round_robin()),
        "sticky" => Some(sticky()),
        _ => None,
    }
}

fn subscribers<'a>(
    members: &'a BTreeMap<String, ConsumerGroupMemberMetadata>,
    topic: &str,
) -> Vec<&'a str> {
    members
        .iter()
        .filter(|(_, meta)| meta.topics.iter().any(|t| t == topic))
        .map(|(id, _)| id.as_str())
        .collect()
}

fn empty_plan(members: &BTreeMap<String, ConsumerGroupMemberMetadata>) -> BalancePlan {
    members.keys().map(|id| (id.clone(), BTreeMap::new())).collect()
}

fn assign(plan: &mut BalancePlan, member: &str, topic: &str, partition: i32) {
    plan.entry(member.to_string())
        .or_default()
        .entry(topic.to_string())
        .or_default()
        .push(partition);
}

/// Check that `plan` covers every subscribed partition exactly once.
pub fn validate_plan(
    plan: &BalancePlan,
    members: &BTreeMap<String, ConsumerGroupMemberMetadata>,
    topics: &BTreeMap<String, Vec<i32>>,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for (member, assigned) in plan {
        let Some(meta) = members.get(member) else {
            return Err(Error::InvariantViolation(format!("plan assigns to unknown member {member}")));
        };
        for (topic, partitions) in assigned {
            if !meta.topics.contains(topic) {
                return Err(Error::InvariantViolation(format!(
                    "member {member} is not subscribed to {topic}"
                )));
            }
            for partition in partitions {
                if !seen.insert((topic.as_str(), *partition)) {
                    return Err(Error::InvariantViolation(format!(
                        "{topic}/{partition} assigned twice"
                    )));
                }
            }
        }
    }
    for (topic, partitions) in topics {
        if subscribers(members, topic).is_empty() {
            continue;
        }
        if let Some(missing) = partitions.iter().find(|p| !seen.contains(&(topic.as_str(), **p))) {
            return Err(Error::InvariantViolation(format!("{topic}/{missing} left unassigned")));
        }
    }
    Ok(())
}

// ============================================================================
// Range
// ============================================================================

/// Contiguous partition ranges per topic; earlier members take the remainder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeStrategy;

impl BalanceStrategy for RangeStrategy {
    fn name(&self) -> &str {
        "range"
    }

    fn plan(
        &self,
        members: &BTreeMap<String, ConsumerGroupMemberMetadata>,
        topics: &BTreeMap<String, Vec<i32>>,
    ) -> Result<BalancePlan> {
        let mut plan = empty_plan(members);
        for (topic, partitions) in topics {
            let consumers = subscribers(members, topic);
            if consumers.is_empty() {
                continue;
            }
            let mut partitions = partitions.clone();
            partitions.sort_unstable();

            let per_member = partitions.len() / consumers.len();
            let extra = partitions.len() % consumers.len();
            let mut start = 0;
            for (i, member) in consumers.iter().enumerate() {
                let count = per_member + usize::from(i < extra);
                for partition in &partitions[start..start + count] {
                    assign(&mut plan, member, topic, *partition);
                }
                start += count;
            }
        }
        Ok(plan)
    }
}

// ============================================================================
// Round robin
// ============================================================================

/// Deals partitions, sorted by topic then id, to members in turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinStrategy;

impl BalanceStrategy for RoundRobinStrategy {
    fn name(&self) -> &str {
        "roundrobin"
    }

    fn plan(
        &self,
        members: &BTreeMap<String, ConsumerGroupMemberMetadata>,
        topics: &BTreeMap<String, Vec<i32>>,
    ) -> Result<BalancePlan> {
        let mut plan = empty_plan(members);
        let ids: Vec<&String> = members.keys().collect();
        if ids.is_empty() {
            return Ok(plan);
        }

        let mut next = 0;
        for (topic, partitions) in topics {
            let mut partitions = partitions.clone();
            partitions.sort_unstable();
            for partition in partitions {
                let chosen = (0..ids.len())
                    .map(|offset| (next + offset) % ids.len())
                    .find(|i| members[ids[*i]].topics.iter().any(|t| t == topic));
                if let Some(i) = chosen {
                    assign(&mut plan, ids[i], topic, partition);
                    next = i + 1;
                }
            }
        }
        Ok(plan)
    }
}

// ============================================================================
// Sticky
// ============================================================================

/// Keeps partitions with their previous owners where possible, then evens
/// out counts so no two eligible members differ by more than one.
#[derive(Debug, Clone, Copy, Default)]
pub struct StickyStrategy;

impl BalanceStrategy for StickyStrategy {
    fn name(&self) -> &str {
        "sticky"
    }

    fn plan(
        &self,
        members: &BTreeMap<String, ConsumerGroupMemberMetadata>,
        topics: &BTreeMap<String, Vec<i32>>,
    ) -> Result<BalancePlan> {
        let subscribed = |member: &str, topic: &str| {
            members
                .get(member)
                .is_some_and(|m| m.topics.iter().any(|t| t == topic))
        };
        let exists = |topic: &str, partition: i32| {
            topics.get(topic).is_some_and(|ps| ps.contains(&partition))
        };

        let mut owner: BTreeMap<(String, i32), String> = BTreeMap::new();
        let mut load: BTreeMap<&str, BTreeSet<(String, i32)>> =
            members.keys().map(|id| (id.as_str(), BTreeSet::new())).collect();

        for (member, meta) in members {
            for (topic, partitions) in &meta.owned_partitions {
                for partition in partitions {
                    let key = (topic.clone(), *partition);
                    if exists(topic, *partition) && subscribed(member, topic) && !owner.contains_key(&key) {
                        owner.insert(key.clone(), member.clone());
                        load.entry(member.as_str()).or_default().insert(key);
                    }
                }
            }
        }

        for (topic, partitions) in topics {
            let mut partitions = partitions.clone();
            partitions.sort_unstable();
            for partition in partitions {
                let key = (topic.clone(), partition);
                if owner.contains_key(&key) {
                    continue;
                }
                let target = load
                    .iter()
                    .filter(|&(&id, _)| subscribed(id, topic))
                    .min_by_key(|&(&id, owned)| (owned.len(), id))
                    .map(|(&id, _)| id);
                if let Some(target) = target {
                    owner.insert(key.clone(), target.to_string());
                    load.entry(target).or_default().insert(key);
                }
            }
        }

        // Move partitions from the most to the least loaded member while
        // that narrows the gap.
        loop {
            let mut moved = false;
            let mut by_load: Vec<&str> = load.keys().copied().collect();
            by_load.sort_by_key(|&id| (std::cmp::Reverse(load[&id].len()), id));
            'donors: for &donor in &by_load {
                let donor_load = load[&donor].len();
                let candidates: Vec<(String, i32)> = load[&donor].iter().cloned().collect();
                for key in candidates {
                    let receiver = load
                        .iter()
                        .filter(|&(&id, owned)| {
                            id != donor && subscribed(id, &key.0) && owned.len() + 1 < donor_load
                        })
                        .min_by_key(|&(&id, owned)| (owned.len(), id))
                        .map(|(&id, _)| id);
                    if let Some(receiver) = receiver {
                        load.entry(donor).or_default().remove(&key);
                        load.entry(receiver).or_default().insert(key.clone());
                        owner.insert(key, receiver.to_string());
                        moved = true;
                        break 'donors;
                    }
                }
            }
            if !moved {
                break;
            }
        }

        let mut plan = empty_plan(members);
        for ((topic, partition), member) in owner {
            assign(&mut plan, &member, &topic, partition);
        }
        for assigned in plan.values_mut() {
            for partitions in assigned.values_mut() {
                partitions.sort_unstable();
            }
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(topics: &[&str]) -> ConsumerGroupMemberMetadata {
        ConsumerGroupMemberMetadata::new(topics.iter().map(|t| t.to_string()).collect(), None)
    }

    fn owning(topics: &[&str], owned: &[(&str, &[i32])]) -> ConsumerGroupMemberMetadata {
        let mut meta = member(topics);
        meta.owned_partitions = owned
            .iter()
            .map(|(t, ps)| (t.to_string(), ps.to_vec()))
            .collect();
        meta
    }

    fn topics(counts: &[(&str, i32)]) -> BTreeMap<String, Vec<i32>> {
        counts.iter()
            .map(|(t, n)| (t.to_string(), (0..*n).collect()))
            .collect()
    }

    fn count(plan: &BalancePlan, member: &str) -> usize {
        plan[member].values().map(Vec::len).sum()
    }

    #[test]
    fn test_range_assigns_contiguous_blocks() {
        let members = BTreeMap::from([
            ("m1".to_string(), member(&["t0", "t1"])),
            ("m2".to_string(), member(&["t0", "t1"])),
        ]);
        let topics = topics(&[("t0", 3), ("t1", 3)]);
        let plan = range().plan(&members, &topics).unwrap();
        assert_eq!(plan["m1"]["t0"], vec![0, 1]);
        assert_eq!(plan["m1"]["t1"], vec![0, 1]);
        assert_eq!(plan["m2"]["t0"], vec![2]);
        assert_eq!(plan["m2"]["t1"], vec![2]);
        validate_plan(&plan, &members, &topics).unwrap();
    }

    #[test]
    fn test_round_robin_deals_in_order() {
        let members = BTreeMap::from([
            ("m1".to_string(), member(&["t0", "t1"])),
            ("m2".to_string(), member(&["t0", "t1"])),
        ]);
        let topics = topics(&[("t0", 3), ("t1", 3)]);
        let plan = round_robin().plan(&members, &topics).unwrap();
        assert_eq!(plan["m1"]["t0"], vec![0, 2]);
        assert_eq!(plan["m1"]["t1"], vec![1]);
        assert_eq!(plan["m2"]["t0"], vec![1]);
        assert_eq!(plan["m2"]["t1"], vec![0, 2]);
        validate_plan(&plan, &members, &topics).unwrap();
    }

    #[test]
    fn test_round_robin_skips_unsubscribed_members() {
        let members = BTreeMap::from([
            ("m1".to_string(), member(&["t0"])),
            ("m2".to_string(), member(&["t1"])),
        ]);
        let topics = topics(&[("t0", 2), ("t1", 2)]);
        let plan = round_robin().plan(&members, &topics).unwrap();
        assert_eq!(plan["m1"]["t0"], vec![0, 1]);
        assert_eq!(plan["m2"]["t1"], vec![0, 1]);
    }

    #[test]
    fn test_sticky_keeps_previous_owners() {
        let members = BTreeMap::from([
            ("m1".to_string(), owning(&["t"], &[("t", &[0, 1, 2, 3])])),
            ("m2".to_string(), member(&["t"])),
        ]);
        let topics = topics(&[("t", 4)]);
        let plan = sticky().plan(&members, &topics).unwrap();
        assert_eq!(count(&plan, "m1"), 2);
        assert_eq!(count(&plan, "m2"), 2);
        // m1 gives up partitions but keeps the rest it already had.
        assert!(plan["m1"]["t"].iter().all(|p| (0..4).contains(p)));
        validate_plan(&plan, &members, &topics).unwrap();

        let rejoined = BTreeMap::from([
            ("m1".to_string(), owning(&["t"], &[("t", &plan["m1"]["t"])])),
            ("m2".to_string(), owning(&["t"], &[("t", &plan["m2"]["t"])])),
            ("m3".to_string(), member(&["t"])),
        ]);
        let next = sticky().plan(&rejoined, &topics).unwrap();
        validate_plan(&next, &rejoined, &topics).unwrap();
        let kept = |m: &str| {
            next[m]
                .get("t")
                .map_or(0, |ps| ps.iter().filter(|p| plan[m]["t"].contains(p)).count())
        };
        assert_eq!(kept("m1") + kept("m2"), 3);
        assert_eq!(count(&next, "m3"), 1);
    }

    #[test]
    fn test_sticky_drops_stale_ownership() {
        let members = BTreeMap::from([
            ("m1".to_string(), owning(&["t"], &[("t", &[0, 7]), ("gone", &[0])])),
            ("m2".to_string(), owning(&["t"], &[("t", &[0])])),
        ]);
        let topics = topics(&[("t", 2)]);
        let plan = sticky().plan(&members, &topics).unwrap();
        validate_plan(&plan, &members, &topics).unwrap();
        assert_eq!(plan["m1"]["t"], vec![0]);
        assert_eq!(plan["m2"]["t"], vec![1]);
    }

    #[test]
    fn test_by_name() {
        assert_eq!(by_name("RoundRobin").unwrap().name(), "roundrobin");
        assert_eq!(by_name("sticky").unwrap().name(), "sticky");
        assert!(by_name("cooperative").is_none());
    }

    #[test]
    fn test_validate_plan_rejects_duplicates() {
        let members = BTreeMap::from([
            ("m1".to_string(), member(&["t"])),
            ("m2".to_string(), member(&["t"])),
        ]);
        let topics = topics(&[("t", 2)]);
        let plan = BalancePlan::from([
            ("m1".to_string(), BTreeMap::from([("t".to_string(), vec![0])])),
            ("m2".to_string(), BTreeMap::from([("t".to_string(), vec![0])])),
        ]);
        assert!(validate_plan(&plan, &members, &topics).is_err());
    }
}
