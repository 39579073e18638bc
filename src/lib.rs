use serde::{Deserialize, Serialize};

pub mod net;
pub mod raft;

/// Reserved id: broadcast destination, and the "leader unknown" sentinel.
pub const BROADCAST: &str = "FFFF";

// --- WIRE MESSAGES ---
//
// Every datagram is one JSON object. The envelope fields (`src`, `dst`,
// `leader`) are shared by all messages; the body is self-describing via the
// `type` field.

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message {
    pub src: String,
    pub dst: String,
    pub leader: String,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Hello,
    Get {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
    },
    Put {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
        value: String,
    },
    Ok {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    Vote {
        term: u64,
    },
    AppendEntry {
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        num_puts: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        put_id: Option<String>,
    },
    AppendEntryResponse {
        term: u64,
        success: bool,
        next_index: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        put_id: Option<String>,
    },
}

/// One unit of replication. Index 0 of every log holds the fixed sentinel
/// (`term = 0`, empty payload), so real entries are 1-based and the leader's
/// post-install broadcast can always frame `prev_log_index = 0,
/// prev_log_term = 0` against it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub key: String,
    pub value: String,
    pub client: String,
    pub put_id: String,
}

impl LogEntry {
    pub fn sentinel() -> Self {
        LogEntry {
            term: 0,
            key: String::new(),
            value: String::new(),
            client: String::new(),
            put_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Encode a message for the wire.
pub fn encode(msg: &Message) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(msg)
}

/// Decode one datagram. Callers drop the datagram on failure; Raft tolerates
/// message loss.
pub fn decode(bytes: &[u8]) -> serde_json::Result<Message> {
    serde_json::from_slice(bytes)
}
