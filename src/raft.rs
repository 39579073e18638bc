use crate::{Body, LogEntry, Message, Role, BROADCAST};
use log::{debug, info};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// How long a peer may stay silent before the leader refreshes it.
pub const HEARTBEAT_GAP: Duration = Duration::from_millis(450);
/// Pacing gap after sending entries to a peer that is still behind.
pub const RETRY_GAP: Duration = Duration::from_millis(100);
/// Pacing gap right after taking the lead, to propagate authority quickly.
pub const INSTALL_GAP: Duration = Duration::from_micros(2500);
/// Cap on entries per append_entry datagram, to bound datagram size.
pub const MAX_ENTRIES: usize = 7;

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub id: String,
    pub peers: Vec<String>, // ids of all other replicas (excluding self)
    pub election_timeout_min: u64, // milliseconds
    pub election_timeout_max: u64, // milliseconds
}

impl ReplicaConfig {
    pub fn new(id: String, peers: Vec<String>) -> Self {
        ReplicaConfig {
            id,
            peers,
            election_timeout_min: 500,
            election_timeout_max: 650,
        }
    }
}

/// Send pacing for one peer, maintained only while we lead.
#[derive(Debug, Clone, Copy)]
pub struct SendPacing {
    pub last_sent_at: Instant,
    pub gap: Duration,
}

#[derive(Debug)]
pub struct Replica {
    pub config: ReplicaConfig,
    pub role: Role,
    pub current_term: u64,
    pub voted_this_term: bool,
    pub leader_id: String,

    // --- Log & State Machine ---
    pub log: Vec<LogEntry>, // log[0] is the fixed sentinel; real entries are 1-based
    pub commit_index: u64,
    pub last_applied: u64,
    pub kvstore: HashMap<String, String>,

    // --- Election timer ---
    pub last_heard: Instant,
    pub election_timeout: Duration,

    // --- Candidate-only ---
    pub votes_received: usize,

    // --- Leader-only ---
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,
    pub staged_put: Option<Message>, // the one client write currently seeking quorum
    pub quorum: HashSet<String>,     // acknowledgers of the staged write, self included
    pub peer_send: HashMap<String, SendPacing>,

    // --- Queues ---
    pub backlog: VecDeque<Message>, // held client requests, re-offered each tick
    pub unprocessed: VecDeque<Message>,
    pub client_replies: VecDeque<Message>,
    pub peer_replies: VecDeque<Message>,
}

impl Replica {
    pub fn new(config: ReplicaConfig, now: Instant) -> Self {
        let mut replica = Replica {
            config,
            role: Role::Follower,
            current_term: 0,
            voted_this_term: false,
            leader_id: BROADCAST.to_string(),
            log: vec![LogEntry::sentinel()],
            commit_index: 0,
            last_applied: 0,
            kvstore: HashMap::new(),
            last_heard: now,
            election_timeout: Duration::ZERO,
            votes_received: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            staged_put: None,
            quorum: HashSet::new(),
            peer_send: HashMap::new(),
            backlog: VecDeque::new(),
            unprocessed: VecDeque::new(),
            client_replies: VecDeque::new(),
            peer_replies: VecDeque::new(),
        };
        replica.election_timeout = replica.random_election_timeout();
        replica
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64 - 1
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// The startup broadcast announcing this replica to the cluster endpoint.
    pub fn hello(&self) -> Message {
        self.envelope(BROADCAST.to_string(), Body::Hello)
    }

    /// Queue one inbound datagram for the next dispatch.
    pub fn receive(&mut self, msg: Message) {
        self.unprocessed.push_back(msg);
    }

    /// Drain the queued replies bound for clients.
    pub fn take_client_replies(&mut self) -> Vec<Message> {
        self.client_replies.drain(..).collect()
    }

    /// Drain the queued messages bound for peer replicas.
    pub fn take_peer_messages(&mut self) -> Vec<Message> {
        self.peer_replies.drain(..).collect()
    }

    fn envelope(&self, dst: String, body: Body) -> Message {
        Message {
            src: self.config.id.clone(),
            dst,
            leader: self.leader_id.clone(),
            body,
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let ms = rng.gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Duration::from_millis(ms)
    }

    fn reset_election_timer(&mut self, now: Instant) {
        self.last_heard = now;
        self.election_timeout = self.random_election_timeout();
    }

    fn staged_mid(&self) -> Option<String> {
        match &self.staged_put {
            Some(Message {
                body: Body::Put { mid, .. },
                ..
            }) => Some(mid.clone()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run every queued message through the current role's handler. Backlogged
    /// client requests are re-offered ahead of fresh traffic. A handler that
    /// changes role rebuilds the queue as `backlog ++ [msg?] ++ remaining` and
    /// the loop re-enters under the new role, so each message causes at most
    /// one role change and ordering is preserved across transitions.
    pub fn dispatch(&mut self, now: Instant) {
        let mut queue: VecDeque<Message> = self.backlog.drain(..).collect();
        queue.extend(self.unprocessed.drain(..));

        while let Some(msg) = queue.pop_front() {
            let replay = match self.role {
                Role::Follower => self.follower_handle(msg, now),
                Role::Candidate => self.candidate_handle(msg, now),
                Role::Leader => self.leader_handle(msg, now),
            };
            if let Some(pushed_back) = replay {
                let mut rebuilt: VecDeque<Message> = self.backlog.drain(..).collect();
                rebuilt.extend(pushed_back);
                rebuilt.append(&mut queue);
                queue = rebuilt;
            }
        }

        if self.role == Role::Leader {
            self.advance_commit();
            self.apply_committed();
        }
    }

    // ------------------------------------------------------------------
    // Follower
    // ------------------------------------------------------------------

    fn follower_handle(&mut self, msg: Message, now: Instant) -> Option<Vec<Message>> {
        match &msg.body {
            Body::Get { mid, .. } | Body::Put { mid, .. } => {
                if self.leader_id != BROADCAST {
                    let reply =
                        self.envelope(msg.src.clone(), Body::Redirect { mid: mid.clone() });
                    self.client_replies.push_back(reply);
                } else {
                    // No leader to point at yet; reconsider next tick.
                    self.backlog.push_back(msg);
                }
                None
            }
            Body::RequestVote {
                term,
                last_log_index,
                ..
            } => {
                let (term, last_log_index) = (*term, *last_log_index);
                let log_current = last_log_index >= self.last_log_index();
                let term_current = (term == self.current_term && !self.voted_this_term)
                    || term > self.current_term;
                if log_current && term_current {
                    self.current_term = term;
                    self.voted_this_term = true;
                    self.leader_id = BROADCAST.to_string();
                    self.reset_election_timer(now);
                    info!(
                        "[{}] granting vote to {} for term {}",
                        self.config.id, msg.src, term
                    );
                    let reply = self.envelope(
                        msg.src.clone(),
                        Body::Vote {
                            term: self.current_term,
                        },
                    );
                    self.peer_replies.push_back(reply);
                } else {
                    debug!(
                        "[{}] denying vote to {} (term {}, last_log_index {})",
                        self.config.id, msg.src, term, last_log_index
                    );
                }
                None
            }
            Body::AppendEntry { .. } => {
                self.handle_append(msg, now);
                None
            }
            _ => {
                debug!("[{}] follower ignoring {:?}", self.config.id, msg.body);
                None
            }
        }
    }

    /// Process an append_entry as a follower: heartbeat or log delivery.
    fn handle_append(&mut self, msg: Message, now: Instant) {
        let leader = msg.leader.clone();
        let src = msg.src.clone();
        if let Body::AppendEntry {
            term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
            put_id,
            ..
        } = msg.body
        {
            // 1. Reject on stale term or a log that does not contain a
            //    matching entry at prev_log_index.
            let prev = prev_log_index as usize;
            let consistent = term >= self.current_term
                && prev < self.log.len()
                && self.log[prev].term == prev_log_term;
            if !consistent {
                debug!(
                    "[{}] rejecting append_entry from {} (term {}, prev {}/{}, log len {})",
                    self.config.id,
                    src,
                    term,
                    prev_log_index,
                    prev_log_term,
                    self.log.len()
                );
                let reply = self.envelope(
                    src,
                    Body::AppendEntryResponse {
                        term: self.current_term,
                        success: false,
                        next_index: self.commit_index,
                        put_id,
                    },
                );
                self.peer_replies.push_back(reply);
                return;
            }

            // 2. A valid append_entry installs its sender's authority.
            self.current_term = term;
            self.leader_id = leader;
            self.voted_this_term = false;
            self.reset_election_timer(now);

            // 3. Only log deliveries touch the log and earn a reply;
            //    heartbeats must never truncate.
            if !entries.is_empty() {
                if self.log.len() > prev + 1 {
                    info!(
                        "[{}] truncating log at index {} ({} entries dropped)",
                        self.config.id,
                        prev + 1,
                        self.log.len() - prev - 1
                    );
                }
                self.log.truncate(prev + 1);
                self.log.extend(entries);
                let reply = self.envelope(
                    src,
                    Body::AppendEntryResponse {
                        term: self.current_term,
                        success: true,
                        next_index: self.log.len() as u64,
                        put_id,
                    },
                );
                self.peer_replies.push_back(reply);
            }

            // 4. Commitment advances from any accepted append_entry.
            if leader_commit > self.commit_index {
                self.commit_index = leader_commit.min(self.last_log_index());
                self.apply_committed();
            }
        }
    }

    // ------------------------------------------------------------------
    // Candidate
    // ------------------------------------------------------------------

    fn candidate_handle(&mut self, msg: Message, now: Instant) -> Option<Vec<Message>> {
        match &msg.body {
            Body::Get { .. } | Body::Put { .. } => {
                self.backlog.push_back(msg);
                None
            }
            Body::AppendEntry { term, put_id, .. } => {
                if *term >= self.current_term {
                    // Someone else won this round; re-handle their message as
                    // a follower.
                    let (term, leader) = (*term, msg.leader.clone());
                    self.step_down(term, &leader, now);
                    Some(vec![msg])
                } else {
                    let reply = self.envelope(
                        msg.src.clone(),
                        Body::AppendEntryResponse {
                            term: self.current_term,
                            success: false,
                            next_index: self.commit_index,
                            put_id: put_id.clone(),
                        },
                    );
                    self.peer_replies.push_back(reply);
                    None
                }
            }
            Body::Vote { term } if *term == self.current_term => {
                self.votes_received += 1;
                debug!(
                    "[{}] vote from {} ({} received)",
                    self.config.id, msg.src, self.votes_received
                );
                if self.votes_received > self.config.peers.len() / 2 {
                    self.take_lead(now);
                    Some(Vec::new())
                } else {
                    None
                }
            }
            Body::RequestVote { term, .. } if *term > self.current_term => {
                let term = *term;
                self.step_down(term, BROADCAST, now);
                Some(vec![msg])
            }
            _ => {
                debug!("[{}] candidate ignoring {:?}", self.config.id, msg.body);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Leader
    // ------------------------------------------------------------------

    fn leader_handle(&mut self, msg: Message, now: Instant) -> Option<Vec<Message>> {
        match &msg.body {
            Body::Get { mid, key } => {
                let value = self.kvstore.get(key).cloned().unwrap_or_default();
                let reply = self.envelope(
                    msg.src.clone(),
                    Body::Ok {
                        mid: mid.clone(),
                        value: Some(value),
                    },
                );
                self.client_replies.push_back(reply);
                None
            }
            Body::Put { .. } => {
                if self.staged_put.is_some() {
                    // One write in flight at a time; hold the rest in arrival
                    // order.
                    self.backlog.push_back(msg);
                } else {
                    self.admit_put(msg);
                }
                None
            }
            Body::AppendEntryResponse {
                term,
                success,
                next_index,
                put_id,
            } => {
                let (term, success, next_index) = (*term, *success, *next_index);
                let acked_put = put_id.clone();
                let peer = msg.src.clone();
                if term > self.current_term {
                    self.step_down(term, BROADCAST, now);
                    return None; // pending sends are dropped; peers retry
                }
                if success {
                    let ni = next_index.min(self.log.len() as u64);
                    self.next_index.insert(peer.clone(), ni);
                    self.match_index.insert(peer.clone(), ni - 1);
                    if let Some(pacing) = self.peer_send.get_mut(&peer) {
                        pacing.gap = INSTALL_GAP;
                    }
                    if let (Some(staged), Some(acked)) = (self.staged_mid(), acked_put) {
                        if staged == acked {
                            self.quorum.insert(peer);
                            if self.quorum.len() > self.config.peers.len() / 2 {
                                self.commit_index = self.last_log_index();
                                info!(
                                    "[{}] put {} committed at index {}",
                                    self.config.id, staged, self.commit_index
                                );
                                self.staged_put = None;
                                self.quorum.clear();
                            }
                        }
                    }
                } else {
                    // Log inconsistency: back up to the follower's hint. Clamp
                    // to 1 so the sentinel is never framed for sending.
                    debug!(
                        "[{}] {} rejected append_entry, next_index -> {}",
                        self.config.id, peer, next_index
                    );
                    self.next_index.insert(peer, next_index.max(1));
                }
                None
            }
            Body::RequestVote { term, .. } if *term > self.current_term => {
                let term = *term;
                self.step_down(term, BROADCAST, now);
                Some(vec![msg])
            }
            Body::AppendEntry { term, put_id, .. } => {
                if *term > self.current_term {
                    let (term, leader) = (*term, msg.leader.clone());
                    self.step_down(term, &leader, now);
                    Some(vec![msg])
                } else {
                    let reply = self.envelope(
                        msg.src.clone(),
                        Body::AppendEntryResponse {
                            term: self.current_term,
                            success: false,
                            next_index: self.commit_index,
                            put_id: put_id.clone(),
                        },
                    );
                    self.peer_replies.push_back(reply);
                    None
                }
            }
            _ => {
                debug!("[{}] leader ignoring {:?}", self.config.id, msg.body);
                None
            }
        }
    }

    /// Append the client's write to the log and start collecting a quorum.
    fn admit_put(&mut self, msg: Message) {
        if let Body::Put { mid, key, value } = &msg.body {
            info!("[{}] staging put {} (key {})", self.config.id, mid, key);
            self.log.push(LogEntry {
                term: self.current_term,
                key: key.clone(),
                value: value.clone(),
                client: msg.src.clone(),
                put_id: mid.clone(),
            });
            self.quorum.clear();
            self.quorum.insert(self.config.id.clone());
            self.staged_put = Some(msg);
        }
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    /// Revert to follower under the given term and leader.
    fn step_down(&mut self, term: u64, leader: &str, now: Instant) {
        if self.role == Role::Leader && self.staged_put.is_some() {
            info!(
                "[{}] dropping staged put; the client will retry via redirect",
                self.config.id
            );
        }
        if term > self.current_term || self.role == Role::Leader {
            self.voted_this_term = false;
        }
        if term > self.current_term {
            self.current_term = term;
        }
        info!(
            "[{}] stepping down to follower (term {}, leader {})",
            self.config.id, self.current_term, leader
        );
        self.role = Role::Follower;
        self.leader_id = leader.to_string();
        self.staged_put = None;
        self.quorum.clear();
        self.votes_received = 0;
        self.reset_election_timer(now);
    }

    /// Install this replica as leader after winning an election.
    pub fn take_lead(&mut self, now: Instant) {
        info!(
            "[{}] BECAME LEADER for term {}",
            self.config.id, self.current_term
        );
        self.role = Role::Leader;
        self.leader_id = self.config.id.clone();
        self.voted_this_term = true;
        self.votes_received = 0;
        self.staged_put = None;
        self.quorum.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.peer_send.clear();
        let next = self.log.len() as u64;
        for peer in &self.config.peers {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer.clone(), 0);
            self.peer_send.insert(
                peer.clone(),
                SendPacing {
                    last_sent_at: now,
                    gap: INSTALL_GAP,
                },
            );
        }
        // An empty broadcast framed against the sentinel asserts authority
        // before any client work arrives.
        let body = Body::AppendEntry {
            term: self.current_term,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: self.commit_index,
            num_puts: 0,
            put_id: None,
        };
        let broadcast = self.envelope(BROADCAST.to_string(), body);
        self.peer_replies.push_back(broadcast);
    }

    /// Become a candidate for the next term and ask the cluster for votes.
    pub fn start_election(&mut self, now: Instant) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.votes_received = 1; // our own
        self.leader_id = BROADCAST.to_string();
        self.last_heard = now;
        // No timeout reroll here: failing to win within the current window
        // escalates to a fresh term on the next expiry.
        info!(
            "[{}] starting election for term {}",
            self.config.id, self.current_term
        );
        let body = Body::RequestVote {
            term: self.current_term,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        let broadcast = self.envelope(BROADCAST.to_string(), body);
        self.peer_replies.push_back(broadcast);
    }

    /// Begin an election if the timer expired and no vote was cast this term.
    pub fn check_election(&mut self, now: Instant) {
        if self.role == Role::Leader || self.voted_this_term {
            return;
        }
        if now > self.last_heard + self.election_timeout {
            self.start_election(now);
        }
    }

    // ------------------------------------------------------------------
    // Leader replication
    // ------------------------------------------------------------------

    /// Per-peer append_entry emission: entries as soon as pacing allows while
    /// the peer is behind, otherwise a heartbeat once the gap since the last
    /// send exceeds the heartbeat interval.
    pub fn pulse(&mut self, now: Instant) {
        if self.role != Role::Leader {
            return;
        }
        let peers: Vec<String> = self.config.peers.clone();
        for peer in peers {
            let pacing = match self.peer_send.get(&peer) {
                Some(p) => *p,
                None => continue,
            };
            let next = self
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(self.log.len() as u64)
                .clamp(1, self.log.len() as u64);
            let prev = (next - 1) as usize;
            let behind = self.last_log_index() >= next;

            if behind && now >= pacing.last_sent_at + pacing.gap {
                let end = (next as usize + MAX_ENTRIES).min(self.log.len());
                let entries = self.log[next as usize..end].to_vec();
                let num_puts = entries.len() as u64;
                let body = Body::AppendEntry {
                    term: self.current_term,
                    prev_log_index: prev as u64,
                    prev_log_term: self.log[prev].term,
                    entries,
                    leader_commit: self.commit_index,
                    num_puts,
                    put_id: self.staged_mid(),
                };
                let send = self.envelope(peer.clone(), body);
                self.peer_replies.push_back(send);
                self.peer_send.insert(
                    peer,
                    SendPacing {
                        last_sent_at: now,
                        gap: RETRY_GAP,
                    },
                );
            } else if now >= pacing.last_sent_at + HEARTBEAT_GAP {
                let body = Body::AppendEntry {
                    term: self.current_term,
                    prev_log_index: prev as u64,
                    prev_log_term: self.log[prev].term,
                    entries: Vec::new(),
                    leader_commit: self.commit_index,
                    num_puts: 0,
                    put_id: self.staged_mid(),
                };
                let send = self.envelope(peer.clone(), body);
                self.peer_replies.push_back(send);
                self.peer_send.insert(
                    peer,
                    SendPacing {
                        last_sent_at: now,
                        gap: pacing.gap,
                    },
                );
            }
        }
    }

    /// Advance commit_index to the highest entry of the current term that a
    /// strict majority of peers has replicated, stopping at the first index
    /// that fails either test.
    fn advance_commit(&mut self) {
        let mut n = self.commit_index + 1;
        while n <= self.last_log_index() {
            let replicated = self
                .config
                .peers
                .iter()
                .filter(|p| self.match_index.get(*p).copied().unwrap_or(0) >= n)
                .count();
            if replicated > self.config.peers.len() / 2 && self.log[n as usize].term == self.current_term
            {
                self.commit_index = n;
                n += 1;
            } else {
                break;
            }
        }
    }

    /// Apply committed entries to the key-value map in index order. The
    /// leader acks each applied write to the client that submitted it.
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self.log[self.last_applied as usize].clone();
            self.kvstore.insert(entry.key, entry.value);
            if self.role == Role::Leader {
                let reply = self.envelope(
                    entry.client,
                    Body::Ok {
                        mid: entry.put_id,
                        value: None,
                    },
                );
                self.client_replies.push_back(reply);
            }
        }
    }
}
