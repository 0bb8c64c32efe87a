use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{LogEntry, NodeInfo, Service};

/// Message kinds shared by every member of a cluster. The numeric values are
/// part of the wire format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum Opcode {
    Hi = 110,
    HiAck = 120,
    Response = 130,
    Heartbeat = 140,
    IAmLeader = 150,
    SplitBrainCheck = 160,
    SplitBrainUnset = 170,
    ScoreRequest = 180,
    ScoreCompareRequest = 190,
    ScoreCompareFailure = 200,
    ScoreCompareSuccess = 210,

    ReplSet = 310,
    ReplRemove = 320,
    ReplIncrementalUpdate = 330,
    ReplCompleteUpdate = 340,
    ReplHeartbeat = 350,
    ReplPeersUpdate = 370,
    ReplNeedUpdateLeader = 375,
    ReplNeedUpdateFollower = 380,
    ServiceUpdate = 385,
    ServiceNeedUpdateLeader = 390,
    ServiceNeedUpdateFollower = 400,

    PeersAdd = 520,
    PeersRemove = 530,
    ServiceSet = 540,
    ServiceRemove = 550,
}

const ALL_OPCODES: [Opcode; 26] = [
    Opcode::Hi,
    Opcode::HiAck,
    Opcode::Response,
    Opcode::Heartbeat,
    Opcode::IAmLeader,
    Opcode::SplitBrainCheck,
    Opcode::SplitBrainUnset,
    Opcode::ScoreRequest,
    Opcode::ScoreCompareRequest,
    Opcode::ScoreCompareFailure,
    Opcode::ScoreCompareSuccess,
    Opcode::ReplSet,
    Opcode::ReplRemove,
    Opcode::ReplIncrementalUpdate,
    Opcode::ReplCompleteUpdate,
    Opcode::ReplHeartbeat,
    Opcode::ReplPeersUpdate,
    Opcode::ReplNeedUpdateLeader,
    Opcode::ReplNeedUpdateFollower,
    Opcode::ServiceUpdate,
    Opcode::ServiceNeedUpdateLeader,
    Opcode::ServiceNeedUpdateFollower,
    Opcode::PeersAdd,
    Opcode::PeersRemove,
    Opcode::ServiceSet,
    Opcode::ServiceRemove,
];

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> Self {
        op as u16
    }
}

impl TryFrom<u16> for Opcode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ALL_OPCODES
            .iter()
            .copied()
            .find(|op| *op as u16 == value)
            .ok_or_else(|| format!("unknown opcode {}", value))
    }
}

/// Message body. Every opcode expects exactly one of these shapes; handlers
/// match on `(head, body)` and drop anything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Empty,
    /// A single log entry, leader to follower.
    Entry(LogEntry),
    /// Ordered entries for an incremental update, oldest first.
    Entries(Vec<LogEntry>),
    /// The whole K-V table for a complete update.
    Table(HashMap<String, String>),
    /// Client SET forwarded to the leader.
    Items(HashMap<String, String>),
    /// Client REMOVE forwarded to the leader.
    Keys(Vec<String>),
    Services(HashMap<String, Service>),
    Service(Service),
    Names(Vec<String>),
    Peers(Vec<NodeInfo>),
    Addresses(Vec<String>),
    Node(NodeInfo),
    /// Answer to a split-brain check.
    Verdict {
        reachable: bool,
        leader: Option<NodeInfo>,
    },
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub head: Opcode,
    pub body: Payload,
    pub info: NodeInfo,
}

impl Message {
    pub fn new(head: Opcode, body: Payload, info: NodeInfo) -> Self {
        Self { head, body, info }
    }

    pub fn empty(head: Opcode, info: NodeInfo) -> Self {
        Self::new(head, Payload::Empty, info)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.body {
            Payload::Error(e) => Some(e),
            _ => None,
        }
    }
}
