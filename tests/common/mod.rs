//! In-process fake cluster used by the integration tests.
//!
//! Nodes are reached through [`FakeConnector`], which hands out one half
//! of a `tokio::io::duplex` pipe and serves the other half on a task.
//! Slot ownership lives in one shared table so tests can reshard, start
//! migrations, or take nodes down between commands.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use slotmux::{
    key_slot, Allocator, BoxedStream, ClusterBuilder, Connector, Decoder, Encoder, Error, Frame,
    NodeAddr,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const A: u16 = 7000;
pub const B: u16 = 7001;
pub const C: u16 = 7002;
pub const HOST: &str = "127.0.0.1";

pub fn addr(port: u16) -> NodeAddr {
    NodeAddr::new(HOST, port)
}

#[derive(Debug, Default)]
struct State {
    /// Slot owner by port; `None` marks an unassigned slot.
    owners: Vec<Option<u16>>,
    ids: BTreeMap<u16, String>,
    down: Vec<u16>,
    /// Slot -> node the slot is being migrated to.
    migrating: HashMap<u16, u16>,
    /// Every node replies MOVED to the next node, forever.
    redirect_loop: bool,
    /// Answer the next N topology queries with garbage.
    broken_topology: usize,
    password: Option<String>,
    /// Nodes that read requests and never answer.
    silent: Vec<u16>,
    /// Keys whose replies are held back this long.
    slow: HashMap<Bytes, Duration>,
    /// Slot -> (error reply, remaining count) answered before serving it.
    failures: HashMap<u16, (String, usize)>,
    /// Replica port -> master port.
    replicas: BTreeMap<u16, u16>,
    data: HashMap<Bytes, Bytes>,
    log: Vec<(u16, Vec<String>)>,
    connects: HashMap<u16, usize>,
    topology_queries: usize,
}

/// A three-master cluster: A 0-5460, B 5461-10922, C 10923-16383.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let mut owners = vec![None; 16384];
        for (slot, owner) in owners.iter_mut().enumerate() {
            *owner = Some(match slot {
                0..=5460 => A,
                5461..=10922 => B,
                _ => C,
            });
        }
        let ids = [A, B, C]
            .iter()
            .map(|&port| (port, format!("{:040}", port)))
            .collect();
        Self {
            state: Arc::new(Mutex::new(State {
                owners,
                ids,
                ..State::default()
            })),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            cluster: self.clone(),
        })
    }

    pub fn seeds(&self) -> String {
        format!("{HOST}:{A}")
    }

    /// Builder pointed at this cluster.
    pub fn builder(&self) -> ClusterBuilder {
        ClusterBuilder::new()
            .add_nodes(&self.seeds())
            .connector(self.connector())
    }

    /// Moves the slot of `key` to `port` on the server side only.
    pub fn reshard(&self, key: &str, port: u16) {
        let slot = key_slot(key);
        let mut state = self.state.lock().unwrap();
        state.ids.entry(port).or_insert_with(|| format!("{:040}", port));
        state.owners[usize::from(slot)] = Some(port);
    }

    /// Starts migrating the slot of `key` to `port`; keys not yet on the
    /// owner are answered with ASK.
    pub fn migrate(&self, key: &str, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.ids.entry(port).or_insert_with(|| format!("{:040}", port));
        state.migrating.insert(key_slot(key), port);
    }

    pub fn unassign(&self, key: &str) {
        self.state.lock().unwrap().owners[usize::from(key_slot(key))] = None;
    }

    pub fn set_down(&self, port: u16, down: bool) {
        let mut state = self.state.lock().unwrap();
        state.down.retain(|p| *p != port);
        if down {
            state.down.push(port);
        }
    }

    pub fn set_redirect_loop(&self, enabled: bool) {
        self.state.lock().unwrap().redirect_loop = enabled;
    }

    pub fn break_topology(&self, times: usize) {
        self.state.lock().unwrap().broken_topology = times;
    }

    pub fn require_password(&self, password: &str) {
        self.state.lock().unwrap().password = Some(password.to_string());
    }

    /// The node keeps reading but never replies again.
    pub fn set_silent(&self, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.ids.entry(port).or_insert_with(|| format!("{:040}", port));
        state.silent.push(port);
    }

    /// Delays every reply to a command touching `key`.
    pub fn set_slow(&self, key: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .slow
            .insert(Bytes::from(key.to_string()), delay);
    }

    /// Answers the next `times` commands on the slot of `key` with `reply`.
    pub fn fail_slot(&self, key: &str, reply: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(key_slot(key), (reply.to_string(), times));
    }

    /// Adds a replica of `master` listed by both topology queries.
    pub fn add_replica(&self, master: u16, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.ids.entry(port).or_insert_with(|| format!("{:040}", port));
        state.replicas.insert(port, master);
    }

    pub fn put(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .data
            .insert(Bytes::from(key.to_string()), Bytes::from(value.to_string()));
    }

    /// Commands served so far, as `(port, argv)`.
    pub fn log(&self) -> Vec<(u16, Vec<String>)> {
        self.state.lock().unwrap().log.clone()
    }

    /// Commands other than topology queries and handshakes.
    pub fn data_log(&self) -> Vec<(u16, Vec<String>)> {
        self.log()
            .into_iter()
            .filter(|(_, argv)| {
                !matches!(argv[0].as_str(), "CLUSTER" | "AUTH" | "SELECT")
            })
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn connects(&self, port: u16) -> usize {
        self.state
            .lock()
            .unwrap()
            .connects
            .get(&port)
            .copied()
            .unwrap_or(0)
    }

    pub fn topology_queries(&self) -> usize {
        self.state.lock().unwrap().topology_queries
    }

    fn is_down(&self, port: u16) -> bool {
        self.state.lock().unwrap().down.contains(&port)
    }

    fn is_silent(&self, port: u16) -> bool {
        self.state.lock().unwrap().silent.contains(&port)
    }

    fn delay_for(&self, frame: &Frame) -> Option<Duration> {
        let Frame::Array(items) = frame else {
            return None;
        };
        let state = self.state.lock().unwrap();
        items.iter().find_map(|item| match item {
            Frame::BulkString(Some(arg)) => state.slow.get(arg).copied(),
            _ => None,
        })
    }

    async fn serve(self, port: u16, mut stream: tokio::io::DuplexStream) {
        let mut decoder = Decoder::new();
        let mut encoder = Encoder::new();
        let mut buf = [0u8; 8192];
        let mut session = Session::default();

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if self.is_down(port) {
                return;
            }
            if self.is_silent(port) {
                continue;
            }
            decoder.append(&buf[..n]);
            let mut delay = None;
            while let Ok(Some(frame)) = decoder.decode() {
                delay = delay.or(self.delay_for(&frame));
                let reply = self.handle(port, &mut session, frame);
                encoder.encode(&reply);
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if stream.write_all(&encoder.take()).await.is_err() {
                return;
            }
        }
    }

    fn handle(&self, port: u16, session: &mut Session, frame: Frame) -> Frame {
        let Frame::Array(items) = frame else {
            return err("ERR protocol");
        };
        let argv: Vec<Bytes> = items
            .into_iter()
            .filter_map(|f| match f {
                Frame::BulkString(Some(b)) => Some(b),
                _ => None,
            })
            .collect();
        let name = String::from_utf8_lossy(&argv[0]).to_uppercase();

        let mut state = self.state.lock().unwrap();
        state.log.push((
            port,
            std::iter::once(name.clone())
                .chain(argv[1..].iter().map(|a| String::from_utf8_lossy(a).into_owned()))
                .collect(),
        ));

        if let Some(password) = state.password.clone() {
            if name == "AUTH" {
                let given = String::from_utf8_lossy(&argv[argv.len() - 1]).into_owned();
                return if given == password {
                    session.authed = true;
                    Frame::ok()
                } else {
                    err("WRONGPASS invalid username-password pair")
                };
            }
            if !session.authed {
                return err("NOAUTH Authentication required.");
            }
        }

        match name.as_str() {
            "AUTH" => return err("ERR AUTH called without any password configured"),
            "SELECT" => return Frame::ok(),
            "ASKING" => {
                session.asking = true;
                return Frame::ok();
            }
            "PING" => return Frame::SimpleString(b"PONG".to_vec()),
            "DBSIZE" => {
                let count = state
                    .data
                    .keys()
                    .filter(|k| state.owners[usize::from(key_slot(k))] == Some(port))
                    .count();
                return Frame::Integer(count as i64);
            }
            "CLUSTER" => {
                state.topology_queries += 1;
                if state.broken_topology > 0 {
                    state.broken_topology -= 1;
                    return Frame::Integer(0);
                }
                let sub = String::from_utf8_lossy(&argv[1]).to_uppercase();
                return match sub.as_str() {
                    "SLOTS" => cluster_slots(&state),
                    "NODES" => cluster_nodes(&state, port),
                    _ => err("ERR unknown subcommand"),
                };
            }
            _ => {}
        }

        let keys: Vec<usize> = match name.as_str() {
            "GET" | "SET" | "INCR" => vec![1],
            "MGET" | "DEL" | "EXISTS" | "SUNION" => (1..argv.len()).collect(),
            "MSET" => (1..argv.len()).step_by(2).collect(),
            _ => return err(&format!("ERR unknown command '{name}'")),
        };
        let slot = key_slot(&argv[keys[0]]);
        if keys.iter().any(|&k| key_slot(&argv[k]) != slot) {
            return err("CROSSSLOT Keys in request don't hash to the same slot");
        }

        if let Some((reply, remaining)) = state.failures.get_mut(&slot) {
            if *remaining > 0 {
                *remaining -= 1;
                return err(reply);
            }
        }

        let asking = std::mem::take(&mut session.asking);
        if state.redirect_loop {
            let next = match port {
                A => B,
                B => C,
                _ => A,
            };
            return err(&format!("MOVED {slot} {HOST}:{next}"));
        }
        let owner = state.owners[usize::from(slot)];
        let importing = state.migrating.get(&slot).copied();
        if owner != Some(port) {
            if importing == Some(port) && asking {
                // Serve the imported slot.
            } else {
                return match owner {
                    Some(owner) => err(&format!("MOVED {slot} {HOST}:{owner}")),
                    None => err(&format!("CLUSTERDOWN Hash slot {slot} not served")),
                };
            }
        } else if let Some(target) = importing {
            if keys.iter().any(|&k| !state.data.contains_key(&argv[k])) {
                return err(&format!("ASK {slot} :{target}"));
            }
        }

        match name.as_str() {
            "GET" => Frame::BulkString(state.data.get(&argv[1]).cloned()),
            "SET" => {
                state.data.insert(argv[1].clone(), argv[2].clone());
                Frame::ok()
            }
            "INCR" => {
                let value = state
                    .data
                    .get(&argv[1])
                    .and_then(|v| std::str::from_utf8(v).ok()?.parse::<i64>().ok())
                    .unwrap_or(0)
                    + 1;
                state.data.insert(argv[1].clone(), Bytes::from(value.to_string()));
                Frame::Integer(value)
            }
            "MGET" => Frame::Array(
                argv[1..]
                    .iter()
                    .map(|k| Frame::BulkString(state.data.get(k).cloned()))
                    .collect(),
            ),
            "MSET" => {
                for pair in argv[1..].chunks(2) {
                    state.data.insert(pair[0].clone(), pair[1].clone());
                }
                Frame::ok()
            }
            "DEL" => Frame::Integer(
                argv[1..]
                    .iter()
                    .filter(|k| state.data.remove(*k).is_some())
                    .count() as i64,
            ),
            "EXISTS" => Frame::Integer(
                argv[1..]
                    .iter()
                    .filter(|k| state.data.contains_key(*k))
                    .count() as i64,
            ),
            _ => Frame::Array(Vec::new()),
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    asking: bool,
    authed: bool,
}

fn err(message: &str) -> Frame {
    Frame::Error(message.as_bytes().to_vec())
}

/// Contiguous `(start, end, port)` runs of the owner table.
fn ranges(state: &State) -> Vec<(u16, u16, u16)> {
    let mut out: Vec<(u16, u16, u16)> = Vec::new();
    for (slot, owner) in state.owners.iter().enumerate() {
        let slot = slot as u16;
        let Some(owner) = *owner else { continue };
        match out.last_mut() {
            Some((_, end, port)) if *port == owner && *end + 1 == slot => *end = slot,
            _ => out.push((slot, slot, owner)),
        }
    }
    out
}

fn cluster_slots(state: &State) -> Frame {
    Frame::Array(
        ranges(state)
            .into_iter()
            .map(|(start, end, port)| {
                let endpoint = |port: u16| {
                    Frame::Array(vec![
                        Frame::bulk(HOST),
                        Frame::Integer(i64::from(port)),
                        Frame::bulk(state.ids[&port].clone()),
                    ])
                };
                let mut entry = vec![
                    Frame::Integer(i64::from(start)),
                    Frame::Integer(i64::from(end)),
                    endpoint(port),
                ];
                entry.extend(
                    state
                        .replicas
                        .iter()
                        .filter(|(_, master)| **master == port)
                        .map(|(replica, _)| endpoint(*replica)),
                );
                Frame::Array(entry)
            })
            .collect(),
    )
}

fn cluster_nodes(state: &State, me: u16) -> Frame {
    let mut slots: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for (start, end, port) in ranges(state) {
        slots.entry(port).or_default().push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
    }
    for (slot, target) in &state.migrating {
        if let Some(owner) = state.owners[usize::from(*slot)] {
            let (from, to) = (&state.ids[&owner], &state.ids[target]);
            slots.entry(owner).or_default().push(format!("[{slot}->-{to}]"));
            slots.entry(*target).or_default().push(format!("[{slot}-<-{from}]"));
        }
    }
    let mut text = String::new();
    for (port, id) in &state.ids {
        let myself = if *port == me { "myself," } else { "" };
        let line = match state.replicas.get(port) {
            Some(master) => format!(
                "{id} {HOST}:{port}@{} {myself}slave {} 0 0 1 connected\n",
                port + 10000,
                state.ids[master]
            ),
            None => format!(
                "{id} {HOST}:{port}@{} {myself}master - 0 0 1 connected {}\n",
                port + 10000,
                slots.get(port).map(|s| s.join(" ")).unwrap_or_default()
            ),
        };
        text.push_str(&line);
    }
    Frame::bulk(text)
}

/// Opens duplex pipes to the fake nodes.
#[derive(Debug)]
pub struct FakeConnector {
    cluster: FakeCluster,
}

impl Connector for FakeConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let known = {
                let mut state = self.cluster.state.lock().unwrap();
                let known = host == HOST && state.ids.contains_key(&port) && !state.down.contains(&port);
                if known {
                    *state.connects.entry(port).or_default() += 1;
                }
                known
            };
            if !known {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(self.cluster.clone().serve(port, server));
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

/// Allocator that grants a fixed number of reservations, then refuses.
#[derive(Debug, Default)]
pub struct FailingAllocator {
    remaining: AtomicUsize,
    limited: std::sync::atomic::AtomicBool,
}

impl FailingAllocator {
    /// Grants `n` more reservations, then refuses every later one.
    pub fn fail_after(&self, n: usize) {
        self.remaining.store(n, Ordering::SeqCst);
        self.limited.store(true, Ordering::SeqCst);
    }

    pub fn unlimited(&self) {
        self.limited.store(false, Ordering::SeqCst);
    }
}

impl Allocator for FailingAllocator {
    fn reserve(&self, _bytes: usize) -> slotmux::Result<()> {
        if !self.limited.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| Error::OutOfMemory)
    }
}
