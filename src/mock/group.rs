//! Coordinator-side group membership for the mock cluster.
//!
//! A group moves through `Empty → PreparingRebalance → CompletingRebalance →
//! Stable`. JoinGroup and follower SyncGroup requests are parked until the
//! phase they wait for completes, so the connection that sent them blocks the
//! way it does against a real coordinator.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::KafkaCode;
use crate::protocol::groups::{
    DescribedGroup, DescribedGroupMember, HeartbeatRequest, JoinGroupMember, JoinGroupRequest,
    JoinGroupResponse, SyncGroupRequest, SyncGroupResponse,
};

/// A response available now or once the group advances.
pub(crate) enum Reply<T> {
    Now(T),
    Later(oneshot::Receiver<T>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Empty,
    PreparingRebalance,
    CompletingRebalance,
    Stable,
}

impl Phase {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Phase::Empty => "Empty",
            Phase::PreparingRebalance => "PreparingRebalance",
            Phase::CompletingRebalance => "CompletingRebalance",
            Phase::Stable => "Stable",
        }
    }
}

struct Member {
    instance_id: Option<String>,
    client_id: String,
    session_timeout: Duration,
    rebalance_timeout: Duration,
    protocols: Vec<(String, Bytes)>,
    assignment: Bytes,
    last_seen: Instant,
    awaiting_join: Option<oneshot::Sender<JoinGroupResponse>>,
    awaiting_sync: Option<oneshot::Sender<SyncGroupResponse>>,
}

impl Member {
    fn metadata_for(&self, protocol: &str) -> Bytes {
        self.protocols
            .iter()
            .find(|(name, _)| name == protocol)
            .map(|(_, metadata)| metadata.clone())
            .unwrap_or_default()
    }

    fn supports(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|(name, _)| name == protocol)
    }
}

pub(crate) struct Group {
    group_id: String,
    generation_id: i32,
    phase: Phase,
    protocol_type: Option<String>,
    protocol: Option<String>,
    leader: Option<String>,
    members: BTreeMap<String, Member>,
    rebalance_deadline: Option<Instant>,
    next_member: u64,
}

fn join_error(code: KafkaCode, member_id: &str) -> JoinGroupResponse {
    JoinGroupResponse {
        error_code: code,
        generation_id: -1,
        member_id: member_id.to_string(),
        ..Default::default()
    }
}

fn sync_error(code: KafkaCode) -> SyncGroupResponse {
    SyncGroupResponse {
        error_code: code,
        ..Default::default()
    }
}

impl Group {
    pub(crate) fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            generation_id: 0,
            phase: Phase::Empty,
            protocol_type: None,
            protocol: None,
            leader: None,
            members: BTreeMap::new(),
            rebalance_deadline: None,
            next_member: 0,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn generation_id(&self) -> i32 {
        self.generation_id
    }

    pub(crate) fn protocol_type(&self) -> Option<&str> {
        self.protocol_type.as_deref()
    }

    pub(crate) fn member_ids(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    // ========================================================================
    // JoinGroup
    // ========================================================================

    pub(crate) fn join(&mut self, request: JoinGroupRequest, client_id: &str, now: Instant) -> Reply<JoinGroupResponse> {
        if request.session_timeout_ms <= 0 {
            return Reply::Now(join_error(KafkaCode::InvalidSessionTimeout, &request.member_id));
        }
        if !self.accepts_protocols(&request) {
            return Reply::Now(join_error(KafkaCode::InconsistentGroupProtocol, &request.member_id));
        }

        let static_owner = request.group_instance_id.as_deref().and_then(|instance| {
            self.members
                .iter()
                .find(|(_, m)| m.instance_id.as_deref() == Some(instance))
                .map(|(id, _)| id.clone())
        });
        let member_id = match (request.member_id.is_empty(), static_owner) {
            (true, Some(owner)) => owner,
            (true, None) => {
                self.next_member += 1;
                format!("{client_id}-{}", self.next_member)
            }
            (false, Some(owner)) if owner != request.member_id => {
                return Reply::Now(join_error(KafkaCode::FencedInstanceId, &request.member_id));
            }
            (false, _) if !self.members.contains_key(&request.member_id) => {
                return Reply::Now(join_error(KafkaCode::UnknownMemberId, &request.member_id));
            }
            (false, _) => request.member_id.clone(),
        };

        let (tx, rx) = oneshot::channel();
        let member = Member {
            instance_id: request.group_instance_id.clone(),
            client_id: client_id.to_string(),
            session_timeout: Duration::from_millis(request.session_timeout_ms as u64),
            rebalance_timeout: Duration::from_millis(request.rebalance_timeout_ms.max(0) as u64),
            protocols: request
                .protocols
                .into_iter()
                .map(|p| (p.name, p.metadata))
                .collect(),
            assignment: Bytes::new(),
            last_seen: now,
            awaiting_join: Some(tx),
            awaiting_sync: None,
        };
        if self.protocol_type.is_none() {
            self.protocol_type = Some(request.protocol_type);
        }
        if let Some(previous) = self.members.insert(member_id.clone(), member)
            && let Some(waiting) = previous.awaiting_join
        {
            // A retried join replaces the one still parked.
            let _ = waiting.send(join_error(KafkaCode::UnknownMemberId, &member_id));
        }
        tracing::debug!(group = %self.group_id, member = %member_id, phase = self.phase.as_str(), "Member joining");

        if self.phase != Phase::PreparingRebalance {
            self.prepare_rebalance(now);
        }
        self.maybe_complete_join(now);
        Reply::Later(rx)
    }

    fn accepts_protocols(&self, request: &JoinGroupRequest) -> bool {
        if request.protocols.is_empty() {
            return false;
        }
        if self.members.is_empty() {
            return true;
        }
        if self.protocol_type.as_deref().is_some_and(|t| t != request.protocol_type) {
            return false;
        }
        request
            .protocols
            .iter()
            .any(|p| self.members.values().all(|m| m.supports(&p.name)))
    }

    fn prepare_rebalance(&mut self, now: Instant) {
        for member in self.members.values_mut() {
            if let Some(waiting) = member.awaiting_sync.take() {
                let _ = waiting.send(sync_error(KafkaCode::RebalanceInProgress));
            }
        }
        let timeout = self
            .members
            .values()
            .map(|m| m.rebalance_timeout)
            .max()
            .unwrap_or_default();
        self.phase = Phase::PreparingRebalance;
        self.rebalance_deadline = Some(now + timeout);
        tracing::debug!(group = %self.group_id, generation = self.generation_id, "Preparing rebalance");
    }

    /// Finish the join phase once every member has rejoined or the
    /// rebalance timeout has passed. Members that never rejoined are dropped.
    fn maybe_complete_join(&mut self, now: Instant) {
        if self.phase != Phase::PreparingRebalance {
            return;
        }
        let all_joined = self.members.values().all(|m| m.awaiting_join.is_some());
        let expired = self.rebalance_deadline.is_some_and(|deadline| now >= deadline);
        if !all_joined && !expired {
            return;
        }

        self.members.retain(|_, m| m.awaiting_join.is_some());
        self.rebalance_deadline = None;
        if self.members.is_empty() {
            self.to_empty();
            return;
        }

        self.generation_id += 1;
        if !self.leader.as_ref().is_some_and(|l| self.members.contains_key(l)) {
            self.leader = self.members.keys().next().cloned();
        }
        let Some(leader) = self.leader.clone() else {
            return;
        };
        self.protocol = self.members.get(&leader).and_then(|m| {
            m.protocols
                .iter()
                .map(|(name, _)| name)
                .find(|name| self.members.values().all(|other| other.supports(name)))
                .cloned()
        });
        let protocol = self.protocol.clone().unwrap_or_default();
        self.phase = Phase::CompletingRebalance;
        tracing::debug!(
            group = %self.group_id,
            generation = self.generation_id,
            leader = %leader,
            members = self.members.len(),
            "Join phase complete"
        );

        let roster: Vec<JoinGroupMember> = self
            .members
            .iter()
            .map(|(id, m)| JoinGroupMember {
                member_id: id.clone(),
                group_instance_id: m.instance_id.clone(),
                metadata: m.metadata_for(&protocol),
            })
            .collect();
        for (id, member) in self.members.iter_mut() {
            member.last_seen = now;
            if let Some(waiting) = member.awaiting_join.take() {
                let _ = waiting.send(JoinGroupResponse {
                    error_code: KafkaCode::None,
                    generation_id: self.generation_id,
                    protocol_name: protocol.clone(),
                    leader: leader.clone(),
                    member_id: id.clone(),
                    members: if *id == leader { roster.clone() } else { Vec::new() },
                    ..Default::default()
                });
            }
        }
    }

    fn to_empty(&mut self) {
        self.phase = Phase::Empty;
        self.leader = None;
        self.protocol = None;
        self.protocol_type = None;
        self.rebalance_deadline = None;
    }

    // ========================================================================
    // SyncGroup, Heartbeat, LeaveGroup
    // ========================================================================

    pub(crate) fn sync(&mut self, request: SyncGroupRequest, now: Instant) -> Reply<SyncGroupResponse> {
        let code = self.check_member(&request.member_id, request.generation_id);
        if code != KafkaCode::None {
            return Reply::Now(sync_error(code));
        }
        match self.phase {
            Phase::Empty => Reply::Now(sync_error(KafkaCode::UnknownMemberId)),
            Phase::PreparingRebalance => Reply::Now(sync_error(KafkaCode::RebalanceInProgress)),
            Phase::Stable => {
                let assignment = self
                    .members
                    .get_mut(&request.member_id)
                    .map(|m| {
                        m.last_seen = now;
                        m.assignment.clone()
                    })
                    .unwrap_or_default();
                Reply::Now(SyncGroupResponse {
                    assignment,
                    ..Default::default()
                })
            }
            Phase::CompletingRebalance => {
                let is_leader = self.leader.as_deref() == Some(request.member_id.as_str());
                if !is_leader {
                    let (tx, rx) = oneshot::channel();
                    if let Some(member) = self.members.get_mut(&request.member_id) {
                        member.last_seen = now;
                        member.awaiting_sync = Some(tx);
                    }
                    return Reply::Later(rx);
                }

                let mut assignments: BTreeMap<String, Bytes> = request
                    .assignments
                    .into_iter()
                    .map(|a| (a.member_id, a.assignment))
                    .collect();
                let mut own = Bytes::new();
                for (id, member) in self.members.iter_mut() {
                    member.assignment = assignments.remove(id).unwrap_or_default();
                    member.last_seen = now;
                    if *id == request.member_id {
                        own = member.assignment.clone();
                    } else if let Some(waiting) = member.awaiting_sync.take() {
                        let _ = waiting.send(SyncGroupResponse {
                            assignment: member.assignment.clone(),
                            ..Default::default()
                        });
                    }
                }
                self.phase = Phase::Stable;
                tracing::debug!(group = %self.group_id, generation = self.generation_id, "Group stable");
                Reply::Now(SyncGroupResponse {
                    assignment: own,
                    ..Default::default()
                })
            }
        }
    }

    pub(crate) fn heartbeat(&mut self, request: &HeartbeatRequest, now: Instant) -> KafkaCode {
        if let Some(instance) = request.group_instance_id.as_deref()
            && self
                .members
                .iter()
                .any(|(id, m)| m.instance_id.as_deref() == Some(instance) && *id != request.member_id)
        {
            return KafkaCode::FencedInstanceId;
        }
        let code = self.check_member(&request.member_id, request.generation_id);
        if code != KafkaCode::None {
            return code;
        }
        if let Some(member) = self.members.get_mut(&request.member_id) {
            member.last_seen = now;
        }
        match self.phase {
            Phase::PreparingRebalance => KafkaCode::RebalanceInProgress,
            Phase::Empty => KafkaCode::UnknownMemberId,
            Phase::CompletingRebalance | Phase::Stable => KafkaCode::None,
        }
    }

    pub(crate) fn leave(&mut self, member_id: &str, now: Instant) -> KafkaCode {
        let Some(member) = self.members.remove(member_id) else {
            return KafkaCode::UnknownMemberId;
        };
        if let Some(waiting) = member.awaiting_join {
            let _ = waiting.send(join_error(KafkaCode::UnknownMemberId, member_id));
        }
        tracing::debug!(group = %self.group_id, member = %member_id, "Member left");
        self.after_removal(now);
        KafkaCode::None
    }

    fn after_removal(&mut self, now: Instant) {
        if self.members.is_empty() {
            self.generation_id += 1;
            self.to_empty();
            return;
        }
        if self.phase != Phase::PreparingRebalance {
            self.prepare_rebalance(now);
        }
        self.maybe_complete_join(now);
    }

    /// Validate a member and generation for commits and heartbeats.
    pub(crate) fn check_member(&self, member_id: &str, generation_id: i32) -> KafkaCode {
        if !self.members.contains_key(member_id) {
            KafkaCode::UnknownMemberId
        } else if generation_id != self.generation_id {
            KafkaCode::IllegalGeneration
        } else {
            KafkaCode::None
        }
    }

    /// Expire silent members and overdue rebalances.
    pub(crate) fn tick(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| m.awaiting_join.is_none() && now.duration_since(m.last_seen) > m.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if !expired.is_empty() {
            for id in &expired {
                tracing::info!(group = %self.group_id, member = %id, "Member session expired");
                self.members.remove(id);
            }
            self.after_removal(now);
        }
        self.maybe_complete_join(now);
    }

    pub(crate) fn describe(&self) -> DescribedGroup {
        let protocol = self.protocol.clone().unwrap_or_default();
        DescribedGroup {
            error_code: KafkaCode::None,
            group_id: self.group_id.clone(),
            group_state: self.phase.as_str().to_string(),
            protocol_type: self.protocol_type.clone().unwrap_or_default(),
            protocol_data: protocol.clone(),
            members: self
                .members
                .iter()
                .map(|(id, m)| DescribedGroupMember {
                    member_id: id.clone(),
                    client_id: m.client_id.clone(),
                    client_host: "/127.0.0.1".to_string(),
                    member_metadata: m.metadata_for(&protocol),
                    member_assignment: m.assignment.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::groups::{JoinGroupProtocol, SyncGroupAssignment};

    fn join_request(member_id: &str) -> JoinGroupRequest {
        JoinGroupRequest {
            group_id: "g".to_string(),
            session_timeout_ms: 10_000,
            rebalance_timeout_ms: 1_000,
            member_id: member_id.to_string(),
            group_instance_id: None,
            protocol_type: "consumer".to_string(),
            protocols: vec![JoinGroupProtocol {
                name: "range".to_string(),
                metadata: Bytes::from_static(b"meta"),
            }],
        }
    }

    fn joined(reply: Reply<JoinGroupResponse>) -> JoinGroupResponse {
        match reply {
            Reply::Now(response) => response,
            Reply::Later(mut rx) => rx.try_recv().expect("join completed"),
        }
    }

    #[test]
    fn test_single_member_join_and_sync() {
        let mut group = Group::new("g");
        let now = Instant::now();

        let response = joined(group.join(join_request(""), "c", now));
        assert_eq!(response.error_code, KafkaCode::None);
        assert_eq!(response.generation_id, 1);
        assert!(response.is_leader());
        assert_eq!(response.members.len(), 1);
        assert_eq!(group.phase(), Phase::CompletingRebalance);

        let sync = SyncGroupRequest {
            group_id: "g".to_string(),
            generation_id: 1,
            member_id: response.member_id.clone(),
            group_instance_id: None,
            assignments: vec![SyncGroupAssignment {
                member_id: response.member_id.clone(),
                assignment: Bytes::from_static(b"all"),
            }],
        };
        match group.sync(sync, now) {
            Reply::Now(r) => assert_eq!(r.assignment, Bytes::from_static(b"all")),
            Reply::Later(_) => panic!("leader sync must not park"),
        }
        assert_eq!(group.phase(), Phase::Stable);
    }

    #[test]
    fn test_second_member_triggers_rebalance() {
        let mut group = Group::new("g");
        let now = Instant::now();
        let first = joined(group.join(join_request(""), "a", now));

        let Reply::Later(mut pending) = group.join(join_request(""), "b", now) else {
            panic!("second join should park");
        };
        assert!(pending.try_recv().is_err());
        assert_eq!(group.phase(), Phase::PreparingRebalance);

        let heartbeat = HeartbeatRequest {
            group_id: "g".to_string(),
            generation_id: 1,
            member_id: first.member_id.clone(),
            group_instance_id: None,
        };
        assert_eq!(group.heartbeat(&heartbeat, now), KafkaCode::RebalanceInProgress);

        let rejoined = joined(group.join(join_request(&first.member_id), "a", now));
        assert_eq!(rejoined.generation_id, 2);
        assert_eq!(rejoined.members.len(), 2);
        let second = pending.try_recv().unwrap();
        assert_eq!(second.generation_id, 2);
        assert!(second.members.is_empty());
    }

    #[test]
    fn test_unknown_member_rejected() {
        let mut group = Group::new("g");
        let response = joined(group.join(join_request("ghost"), "c", Instant::now()));
        assert_eq!(response.error_code, KafkaCode::UnknownMemberId);
    }

    #[test]
    fn test_session_expiry_empties_group() {
        let mut group = Group::new("g");
        let now = Instant::now();
        joined(group.join(join_request(""), "c", now));

        group.tick(now + Duration::from_secs(11));
        assert_eq!(group.phase(), Phase::Empty);
        assert!(group.member_ids().is_empty());
    }
}
