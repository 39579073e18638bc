use kvstore::raft::{Replica, ReplicaConfig};
use kvstore::{Body, Message, Role, BROADCAST};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

const STEP: Duration = Duration::from_millis(5);

/// In-memory cluster: routes peer traffic between replicas by `dst`, collects
/// client-bound replies, fabricates time, and can partition replicas. Every
/// step also audits election safety and term monotonicity.
struct Cluster {
    replicas: Vec<Replica>,
    now: Instant,
    partitioned: HashSet<String>,
    client_inbox: Vec<Message>,
    leaders_by_term: HashMap<u64, HashSet<String>>,
    last_terms: HashMap<String, u64>,
}

impl Cluster {
    fn new(ids: &[&str]) -> Self {
        let now = Instant::now();
        let replicas = ids
            .iter()
            .map(|id| {
                let peers = ids
                    .iter()
                    .filter(|p| *p != id)
                    .map(|p| p.to_string())
                    .collect();
                Replica::new(ReplicaConfig::new(id.to_string(), peers), now)
            })
            .collect();
        Cluster {
            replicas,
            now,
            partitioned: HashSet::new(),
            client_inbox: Vec::new(),
            leaders_by_term: HashMap::new(),
            last_terms: HashMap::new(),
        }
    }

    /// Spread the initial timeouts so the first election is deterministic.
    fn stagger_timeouts(&mut self) {
        for (i, r) in self.replicas.iter_mut().enumerate() {
            r.election_timeout = Duration::from_millis(500 + 30 * i as u64);
        }
    }

    fn get(&self, id: &str) -> &Replica {
        self.replicas
            .iter()
            .find(|r| r.config.id == id)
            .expect("unknown replica id")
    }

    fn get_mut(&mut self, id: &str) -> &mut Replica {
        self.replicas
            .iter_mut()
            .find(|r| r.config.id == id)
            .expect("unknown replica id")
    }

    fn leader_id(&self) -> Option<String> {
        self.replicas
            .iter()
            .find(|r| r.role == Role::Leader && !self.partitioned.contains(&r.config.id))
            .map(|r| r.config.id.clone())
    }

    fn send_client(&mut self, dst: &str, body: Body) {
        let msg = Message {
            src: "X".to_string(),
            dst: dst.to_string(),
            leader: BROADCAST.to_string(),
            body,
        };
        self.get_mut(dst).receive(msg);
    }

    fn ok_for(&self, mid: &str) -> Option<&Message> {
        self.client_inbox.iter().find(
            |m| matches!(&m.body, Body::Ok { mid: got, .. } if got == mid),
        )
    }

    fn redirect_for(&self, mid: &str) -> Option<&Message> {
        self.client_inbox.iter().find(
            |m| matches!(&m.body, Body::Redirect { mid: got } if got == mid),
        )
    }

    fn step(&mut self) {
        self.now += STEP;

        // Flush every replica's outbound queues; a partitioned replica's
        // traffic is lost in both directions.
        let mut inflight: Vec<Message> = Vec::new();
        for r in &mut self.replicas {
            let blocked = self.partitioned.contains(&r.config.id);
            for m in r.take_client_replies() {
                if !blocked {
                    self.client_inbox.push(m);
                }
            }
            for m in r.take_peer_messages() {
                if !blocked {
                    inflight.push(m);
                }
            }
        }

        for m in inflight {
            if m.dst == BROADCAST {
                let src = m.src.clone();
                for r in &mut self.replicas {
                    if r.config.id != src && !self.partitioned.contains(&r.config.id) {
                        r.receive(m.clone());
                    }
                }
            } else if !self.partitioned.contains(&m.dst) {
                if let Some(r) = self.replicas.iter_mut().find(|r| r.config.id == m.dst) {
                    r.receive(m);
                }
            }
        }

        let now = self.now;
        for r in &mut self.replicas {
            r.pulse(now);
            r.dispatch(now);
            r.check_election(now);
        }

        self.audit();
    }

    fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    fn run_until<F: Fn(&Cluster) -> bool>(&mut self, max_steps: usize, done: F) -> bool {
        for _ in 0..max_steps {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }

    /// Election safety and term monotonicity, checked on every step.
    fn audit(&mut self) {
        for r in &self.replicas {
            let last = self.last_terms.entry(r.config.id.clone()).or_insert(0);
            assert!(
                r.current_term >= *last,
                "[{}] term went backwards: {} -> {}",
                r.config.id,
                last,
                r.current_term
            );
            *last = r.current_term;

            if r.role == Role::Leader {
                let leaders = self.leaders_by_term.entry(r.current_term).or_default();
                leaders.insert(r.config.id.clone());
                assert!(
                    leaders.len() <= 1,
                    "two leaders in term {}: {:?}",
                    r.current_term,
                    leaders
                );
            }
        }
    }
}

#[test]
fn cluster_elects_exactly_one_leader() {
    let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
    cluster.stagger_timeouts();

    assert!(
        cluster.run_until(400, |c| c.leader_id().is_some()),
        "no leader elected in time"
    );
    let leader = cluster.leader_id().unwrap();
    assert_eq!(cluster.get(&leader).current_term, 1);

    // A couple of rounds later every replica acknowledges the same leader.
    cluster.run(10);
    for r in &cluster.replicas {
        assert_eq!(r.leader_id, leader, "[{}] disagrees", r.config.id);
    }
}

#[test]
fn writes_replicate_and_reads_return_them() {
    let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
    cluster.stagger_timeouts();
    assert!(cluster.run_until(400, |c| c.leader_id().is_some()));
    let leader = cluster.leader_id().unwrap();

    cluster.send_client(
        &leader,
        Body::Put {
            mid: "m1".to_string(),
            key: "x".to_string(),
            value: "1".to_string(),
        },
    );
    assert!(
        cluster.run_until(100, |c| c.ok_for("m1").is_some()),
        "put was never acked"
    );

    cluster.send_client(
        &leader,
        Body::Get {
            mid: "m2".to_string(),
            key: "x".to_string(),
        },
    );
    assert!(cluster.run_until(100, |c| c.ok_for("m2").is_some()));
    match &cluster.ok_for("m2").unwrap().body {
        Body::Ok { value, .. } => assert_eq!(value.as_deref(), Some("1")),
        other => panic!("expected ok, got {:?}", other),
    }

    // Heartbeats carry the commit index; every replica applies eventually.
    cluster.run(120);
    for r in &cluster.replicas {
        assert_eq!(
            r.kvstore.get("x").map(String::as_str),
            Some("1"),
            "[{}] never applied the write",
            r.config.id
        );
    }
}

#[test]
fn follower_redirects_to_the_elected_leader() {
    let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
    cluster.stagger_timeouts();
    assert!(cluster.run_until(400, |c| c.leader_id().is_some()));
    cluster.run(10);
    let leader = cluster.leader_id().unwrap();
    let follower = cluster
        .replicas
        .iter()
        .find(|r| r.config.id != leader)
        .map(|r| r.config.id.clone())
        .unwrap();

    cluster.send_client(
        &follower,
        Body::Put {
            mid: "m3".to_string(),
            key: "y".to_string(),
            value: "2".to_string(),
        },
    );
    assert!(cluster.run_until(50, |c| c.redirect_for("m3").is_some()));
    let redirect = cluster.redirect_for("m3").unwrap();
    assert_eq!(redirect.leader, leader);

    // The client resends to the advertised leader and succeeds.
    cluster.send_client(
        &leader,
        Body::Put {
            mid: "m3".to_string(),
            key: "y".to_string(),
            value: "2".to_string(),
        },
    );
    assert!(cluster.run_until(100, |c| c.ok_for("m3").is_some()));
}

#[test]
fn failover_elects_a_new_leader_and_the_old_one_reverts() {
    let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
    cluster.stagger_timeouts();
    assert!(cluster.run_until(400, |c| c.leader_id().is_some()));
    cluster.run(10);
    let old_leader = cluster.leader_id().unwrap();
    let old_term = cluster.get(&old_leader).current_term;

    cluster.partitioned.insert(old_leader.clone());
    // Distinct timeouts keep the follow-up election deterministic too.
    let mut extra = 0;
    for r in &mut cluster.replicas {
        if r.config.id != old_leader {
            r.election_timeout = Duration::from_millis(500 + 40 * extra);
            extra += 1;
        }
    }

    assert!(
        cluster.run_until(2000, |c| c.leader_id().is_some()),
        "no replacement leader"
    );
    let new_leader = cluster.leader_id().unwrap();
    assert_ne!(new_leader, old_leader);
    assert!(cluster.get(&new_leader).current_term > old_term);

    // Heal: the deposed leader hears the higher term and reverts.
    cluster.partitioned.clear();
    assert!(cluster.run_until(
        300,
        |c| c.get(&old_leader).role == Role::Follower
    ));
    let healed = cluster.get(&old_leader);
    assert!(!healed.voted_this_term);
    assert_eq!(healed.leader_id, new_leader);
}

#[test]
fn uncommitted_writes_on_a_deposed_leader_are_discarded() {
    let mut cluster = Cluster::new(&["A", "B", "C", "D", "E"]);
    cluster.stagger_timeouts();
    assert!(cluster.run_until(400, |c| c.leader_id().is_some()));
    cluster.run(10);
    let old_leader = cluster.leader_id().unwrap();

    // The write lands in the leader's log, then the leader is cut off before
    // it can replicate.
    cluster.send_client(
        &old_leader,
        Body::Put {
            mid: "m-orphan".to_string(),
            key: "orphan".to_string(),
            value: "1".to_string(),
        },
    );
    {
        let now = cluster.now;
        let leader = cluster.get_mut(&old_leader);
        leader.dispatch(now);
        leader.take_peer_messages();
        assert_eq!(leader.log.len(), 2);
    }
    cluster.partitioned.insert(old_leader.clone());
    let mut extra = 0;
    for r in &mut cluster.replicas {
        if r.config.id != old_leader {
            r.election_timeout = Duration::from_millis(500 + 40 * extra);
            extra += 1;
        }
    }

    assert!(cluster.run_until(2000, |c| c.leader_id().is_some()));
    let new_leader = cluster.leader_id().unwrap();
    cluster.partitioned.clear();

    // A write through the new leader overwrites the orphaned suffix
    // everywhere once replication reaches the deposed leader.
    cluster.send_client(
        &new_leader,
        Body::Put {
            mid: "m-new".to_string(),
            key: "fresh".to_string(),
            value: "2".to_string(),
        },
    );
    assert!(cluster.run_until(200, |c| c.ok_for("m-new").is_some()));
    cluster.run(200);

    for r in &cluster.replicas {
        assert_eq!(r.log.len(), 2, "[{}] log diverges", r.config.id);
        assert_eq!(r.log[1].put_id, "m-new", "[{}] kept the orphan", r.config.id);
        assert!(
            !r.kvstore.contains_key("orphan"),
            "[{}] applied an uncommitted write",
            r.config.id
        );
    }
    // The orphaned put was never acked.
    assert!(cluster.ok_for("m-orphan").is_none());
}
