//! Command classification: where the keys of a command are.
//!
//! A static table maps each command (and subcommand) to its arity and a
//! key specification. Classification yields every key position with its
//! slot, and whether the command can be split per key and merged back.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::core::memory::{vec_with_capacity, Allocator, SystemAllocator};
use crate::proto::error::{Error, Result};

use super::slot::key_slot;

/// How sub-replies of a split command are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// One array element per key, reassembled in key order (MGET).
    Array,
    /// Every part must answer `+OK` (MSET).
    Status,
    /// Integer replies are summed (DEL, UNLINK, EXISTS, TOUCH).
    Sum,
}

/// Broad shape of a classified command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Not in the command table; treated as having no keys.
    Unknown,
    /// Known command that takes no keys.
    Keyless,
    /// Known command with at least one key.
    Keyed,
}

/// A key argument and the slot it hashes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPosition {
    /// Index of the key in the argument vector.
    pub index: usize,
    /// Slot of the key.
    pub slot: u16,
}

/// Result of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Upper-cased command name.
    pub name: String,
    /// Broad shape.
    pub kind: CommandKind,
    /// Key positions in argument order.
    pub keys: Vec<KeyPosition>,
    /// True if per-key parts merge losslessly.
    pub splittable: bool,
    /// Merge rule when splittable.
    pub merge: Option<MergeKind>,
    /// Arguments that travel with each key (2 for MSET's key/value).
    pub step: usize,
}

impl Classified {
    /// Returns the slot shared by all keys, or `None` for zero or mixed slots.
    pub fn single_slot(&self) -> Option<u16> {
        let first = self.keys.first()?.slot;
        self.keys.iter().all(|k| k.slot == first).then_some(first)
    }

    /// Returns true if the keys hash to more than one slot.
    pub fn is_cross_slot(&self) -> bool {
        !self.keys.is_empty() && self.single_slot().is_none()
    }
}

#[derive(Debug, Clone, Copy)]
enum KeySpec {
    None,
    /// Keys from `first` to `last` (negative counts from the end) every `step`.
    Index { first: usize, last: isize, step: usize },
    /// Argument `pos` holds the key count, keys follow it. `dest` marks
    /// argument 1 as an extra key (ZUNIONSTORE dest numkeys ...).
    KeyNum { pos: usize, dest: bool },
    /// Keys follow `keyword`, which appears at or after `from`; the second
    /// half of the remaining arguments are not keys (XREAD ... STREAMS k1 k2 id1 id2).
    Keyword { keyword: &'static str, from: usize },
}

#[derive(Debug)]
struct CommandSpec {
    name: &'static str,
    sub: Option<&'static str>,
    arity: i32,
    keys: KeySpec,
    merge: Option<MergeKind>,
}

const NONE: KeySpec = KeySpec::None;
const FIRST: KeySpec = range(1, 1, 1);

const fn range(first: usize, last: isize, step: usize) -> KeySpec {
    KeySpec::Index { first, last, step }
}

const fn keynum(pos: usize) -> KeySpec {
    KeySpec::KeyNum { pos, dest: false }
}

const fn cmd(name: &'static str, arity: i32, keys: KeySpec) -> CommandSpec {
    CommandSpec {
        name,
        sub: None,
        arity,
        keys,
        merge: None,
    }
}

const fn sub(name: &'static str, sub: &'static str, arity: i32, keys: KeySpec) -> CommandSpec {
    CommandSpec {
        name,
        sub: Some(sub),
        arity,
        keys,
        merge: None,
    }
}

const fn split(name: &'static str, arity: i32, step: usize, merge: MergeKind) -> CommandSpec {
    CommandSpec {
        name,
        sub: None,
        arity,
        keys: range(1, -1, step),
        merge: Some(merge),
    }
}

static COMMANDS: &[CommandSpec] = &[
    // splittable
    split("MGET", -2, 1, MergeKind::Array),
    split("MSET", -3, 2, MergeKind::Status),
    split("DEL", -2, 1, MergeKind::Sum),
    split("UNLINK", -2, 1, MergeKind::Sum),
    split("EXISTS", -2, 1, MergeKind::Sum),
    split("TOUCH", -2, 1, MergeKind::Sum),
    // server and connection
    cmd("PING", -1, NONE),
    cmd("ECHO", 2, NONE),
    cmd("INFO", -1, NONE),
    cmd("DBSIZE", 1, NONE),
    cmd("TIME", 1, NONE),
    cmd("FLUSHALL", -1, NONE),
    cmd("FLUSHDB", -1, NONE),
    cmd("KEYS", 2, NONE),
    cmd("SCAN", -2, NONE),
    cmd("RANDOMKEY", 1, NONE),
    cmd("LASTSAVE", 1, NONE),
    cmd("SAVE", 1, NONE),
    cmd("BGSAVE", -1, NONE),
    cmd("PUBLISH", 3, NONE),
    cmd("READONLY", 1, NONE),
    cmd("READWRITE", 1, NONE),
    cmd("ASKING", 1, NONE),
    cmd("WAIT", 3, NONE),
    cmd("MULTI", 1, NONE),
    cmd("EXEC", 1, NONE),
    cmd("DISCARD", 1, NONE),
    cmd("UNWATCH", 1, NONE),
    cmd("SELECT", 2, NONE),
    cmd("AUTH", -2, NONE),
    cmd("HELLO", -1, NONE),
    cmd("COMMAND", -1, NONE),
    sub("CONFIG", "GET", -3, NONE),
    sub("CONFIG", "SET", -4, NONE),
    sub("CONFIG", "RESETSTAT", 2, NONE),
    sub("CONFIG", "REWRITE", 2, NONE),
    sub("CLIENT", "LIST", -2, NONE),
    sub("CLIENT", "SETNAME", 3, NONE),
    sub("CLIENT", "GETNAME", 2, NONE),
    sub("CLIENT", "ID", 2, NONE),
    sub("CLIENT", "INFO", 2, NONE),
    sub("CLIENT", "KILL", -3, NONE),
    sub("CLUSTER", "SLOTS", 2, NONE),
    sub("CLUSTER", "NODES", 2, NONE),
    sub("CLUSTER", "SHARDS", 2, NONE),
    sub("CLUSTER", "INFO", 2, NONE),
    sub("CLUSTER", "MYID", 2, NONE),
    sub("CLUSTER", "KEYSLOT", 3, NONE),
    sub("CLUSTER", "COUNTKEYSINSLOT", 3, NONE),
    sub("CLUSTER", "GETKEYSINSLOT", 4, NONE),
    sub("SCRIPT", "LOAD", 3, NONE),
    sub("SCRIPT", "EXISTS", -3, NONE),
    sub("SCRIPT", "FLUSH", -2, NONE),
    sub("MEMORY", "USAGE", -3, range(2, 2, 1)),
    sub("MEMORY", "STATS", 2, NONE),
    sub("MEMORY", "DOCTOR", 2, NONE),
    sub("OBJECT", "ENCODING", 3, range(2, 2, 1)),
    sub("OBJECT", "FREQ", 3, range(2, 2, 1)),
    sub("OBJECT", "IDLETIME", 3, range(2, 2, 1)),
    sub("OBJECT", "REFCOUNT", 3, range(2, 2, 1)),
    sub("XINFO", "STREAM", -3, range(2, 2, 1)),
    sub("XINFO", "GROUPS", 3, range(2, 2, 1)),
    sub("XINFO", "CONSUMERS", 4, range(2, 2, 1)),
    sub("XGROUP", "CREATE", -5, range(2, 2, 1)),
    sub("XGROUP", "DESTROY", 4, range(2, 2, 1)),
    sub("XGROUP", "SETID", -5, range(2, 2, 1)),
    sub("XGROUP", "CREATECONSUMER", 5, range(2, 2, 1)),
    sub("XGROUP", "DELCONSUMER", 5, range(2, 2, 1)),
    // strings and generic keys
    cmd("GET", 2, FIRST),
    cmd("SET", -3, FIRST),
    cmd("SETNX", 3, FIRST),
    cmd("SETEX", 4, FIRST),
    cmd("PSETEX", 4, FIRST),
    cmd("GETSET", 3, FIRST),
    cmd("GETDEL", 2, FIRST),
    cmd("GETEX", -2, FIRST),
    cmd("APPEND", 3, FIRST),
    cmd("STRLEN", 2, FIRST),
    cmd("INCR", 2, FIRST),
    cmd("DECR", 2, FIRST),
    cmd("INCRBY", 3, FIRST),
    cmd("DECRBY", 3, FIRST),
    cmd("INCRBYFLOAT", 3, FIRST),
    cmd("GETRANGE", 4, FIRST),
    cmd("SETRANGE", 4, FIRST),
    cmd("GETBIT", 3, FIRST),
    cmd("SETBIT", 4, FIRST),
    cmd("BITCOUNT", -2, FIRST),
    cmd("BITPOS", -3, FIRST),
    cmd("TYPE", 2, FIRST),
    cmd("TTL", 2, FIRST),
    cmd("PTTL", 2, FIRST),
    cmd("EXPIRE", -3, FIRST),
    cmd("PEXPIRE", -3, FIRST),
    cmd("EXPIREAT", -3, FIRST),
    cmd("PEXPIREAT", -3, FIRST),
    cmd("EXPIRETIME", 2, FIRST),
    cmd("PERSIST", 2, FIRST),
    cmd("DUMP", 2, FIRST),
    cmd("RESTORE", -4, FIRST),
    cmd("SORT", -2, FIRST),
    cmd("SORT_RO", -2, FIRST),
    cmd("MIGRATE", -6, range(3, 3, 1)),
    cmd("RENAME", 3, range(1, 2, 1)),
    cmd("RENAMENX", 3, range(1, 2, 1)),
    cmd("COPY", -3, range(1, 2, 1)),
    cmd("MSETNX", -3, range(1, -1, 2)),
    cmd("BITOP", -4, range(2, -1, 1)),
    cmd("WATCH", -2, range(1, -1, 1)),
    // hashes
    cmd("HSET", -4, FIRST),
    cmd("HSETNX", 4, FIRST),
    cmd("HGET", 3, FIRST),
    cmd("HMSET", -4, FIRST),
    cmd("HMGET", -3, FIRST),
    cmd("HDEL", -3, FIRST),
    cmd("HLEN", 2, FIRST),
    cmd("HEXISTS", 3, FIRST),
    cmd("HKEYS", 2, FIRST),
    cmd("HVALS", 2, FIRST),
    cmd("HGETALL", 2, FIRST),
    cmd("HINCRBY", 4, FIRST),
    cmd("HINCRBYFLOAT", 4, FIRST),
    cmd("HSTRLEN", 3, FIRST),
    cmd("HSCAN", -3, FIRST),
    cmd("HRANDFIELD", -2, FIRST),
    // lists
    cmd("LPUSH", -3, FIRST),
    cmd("RPUSH", -3, FIRST),
    cmd("LPUSHX", -3, FIRST),
    cmd("RPUSHX", -3, FIRST),
    cmd("LPOP", -2, FIRST),
    cmd("RPOP", -2, FIRST),
    cmd("LLEN", 2, FIRST),
    cmd("LRANGE", 4, FIRST),
    cmd("LINDEX", 3, FIRST),
    cmd("LSET", 4, FIRST),
    cmd("LREM", 4, FIRST),
    cmd("LTRIM", 4, FIRST),
    cmd("LINSERT", 5, FIRST),
    cmd("LPOS", -3, FIRST),
    cmd("RPOPLPUSH", 3, range(1, 2, 1)),
    cmd("LMOVE", 5, range(1, 2, 1)),
    cmd("BLMOVE", 6, range(1, 2, 1)),
    cmd("BRPOPLPUSH", 4, range(1, 2, 1)),
    cmd("BLPOP", -3, range(1, -2, 1)),
    cmd("BRPOP", -3, range(1, -2, 1)),
    cmd("LMPOP", -4, keynum(1)),
    cmd("BLMPOP", -5, keynum(2)),
    // sets
    cmd("SADD", -3, FIRST),
    cmd("SREM", -3, FIRST),
    cmd("SMEMBERS", 2, FIRST),
    cmd("SISMEMBER", 3, FIRST),
    cmd("SMISMEMBER", -3, FIRST),
    cmd("SCARD", 2, FIRST),
    cmd("SPOP", -2, FIRST),
    cmd("SRANDMEMBER", -2, FIRST),
    cmd("SSCAN", -3, FIRST),
    cmd("SMOVE", 4, range(1, 2, 1)),
    cmd("SUNION", -2, range(1, -1, 1)),
    cmd("SINTER", -2, range(1, -1, 1)),
    cmd("SDIFF", -2, range(1, -1, 1)),
    cmd("SUNIONSTORE", -3, range(1, -1, 1)),
    cmd("SINTERSTORE", -3, range(1, -1, 1)),
    cmd("SDIFFSTORE", -3, range(1, -1, 1)),
    cmd("SINTERCARD", -3, keynum(1)),
    // sorted sets
    cmd("ZADD", -4, FIRST),
    cmd("ZREM", -3, FIRST),
    cmd("ZSCORE", 3, FIRST),
    cmd("ZMSCORE", -3, FIRST),
    cmd("ZINCRBY", 4, FIRST),
    cmd("ZCARD", 2, FIRST),
    cmd("ZCOUNT", 4, FIRST),
    cmd("ZRANGE", -4, FIRST),
    cmd("ZRANGEBYSCORE", -4, FIRST),
    cmd("ZREVRANGE", -4, FIRST),
    cmd("ZREVRANGEBYSCORE", -4, FIRST),
    cmd("ZRANGEBYLEX", -4, FIRST),
    cmd("ZLEXCOUNT", 4, FIRST),
    cmd("ZRANK", -3, FIRST),
    cmd("ZREVRANK", -3, FIRST),
    cmd("ZREMRANGEBYRANK", 4, FIRST),
    cmd("ZREMRANGEBYSCORE", 4, FIRST),
    cmd("ZPOPMIN", -2, FIRST),
    cmd("ZPOPMAX", -2, FIRST),
    cmd("ZSCAN", -3, FIRST),
    cmd("ZRANGESTORE", -5, range(1, 2, 1)),
    cmd("BZPOPMIN", -3, range(1, -2, 1)),
    cmd("BZPOPMAX", -3, range(1, -2, 1)),
    cmd("ZUNION", -3, keynum(1)),
    cmd("ZINTER", -3, keynum(1)),
    cmd("ZDIFF", -3, keynum(1)),
    cmd("ZINTERCARD", -3, keynum(1)),
    cmd("ZMPOP", -4, keynum(1)),
    cmd("BZMPOP", -5, keynum(2)),
    cmd("ZUNIONSTORE", -4, KeySpec::KeyNum { pos: 2, dest: true }),
    cmd("ZINTERSTORE", -4, KeySpec::KeyNum { pos: 2, dest: true }),
    cmd("ZDIFFSTORE", -4, KeySpec::KeyNum { pos: 2, dest: true }),
    // hyperloglog, geo, streams
    cmd("PFADD", -2, FIRST),
    cmd("PFCOUNT", -2, range(1, -1, 1)),
    cmd("PFMERGE", -2, range(1, -1, 1)),
    cmd("GEOADD", -5, FIRST),
    cmd("GEODIST", -4, FIRST),
    cmd("GEOPOS", -2, FIRST),
    cmd("GEOHASH", -2, FIRST),
    cmd("GEOSEARCH", -7, FIRST),
    cmd("GEOSEARCHSTORE", -8, range(1, 2, 1)),
    cmd("XADD", -5, FIRST),
    cmd("XLEN", 2, FIRST),
    cmd("XRANGE", -4, FIRST),
    cmd("XREVRANGE", -4, FIRST),
    cmd("XDEL", -3, FIRST),
    cmd("XTRIM", -4, FIRST),
    cmd("XACK", -4, FIRST),
    cmd("XPENDING", -3, FIRST),
    cmd("XCLAIM", -6, FIRST),
    cmd("XAUTOCLAIM", -6, FIRST),
    cmd("XREAD", -4, KeySpec::Keyword { keyword: "STREAMS", from: 1 }),
    cmd("XREADGROUP", -7, KeySpec::Keyword { keyword: "STREAMS", from: 4 }),
    // scripting
    cmd("EVAL", -3, keynum(2)),
    cmd("EVALSHA", -3, keynum(2)),
    cmd("EVAL_RO", -3, keynum(2)),
    cmd("EVALSHA_RO", -3, keynum(2)),
    cmd("FCALL", -3, keynum(2)),
    cmd("FCALL_RO", -3, keynum(2)),
];

enum Entry {
    Command(&'static CommandSpec),
    Container(HashMap<&'static str, &'static CommandSpec>),
}

fn table() -> &'static HashMap<&'static str, Entry> {
    static TABLE: OnceLock<HashMap<&'static str, Entry>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        for spec in COMMANDS {
            match spec.sub {
                None => {
                    table.insert(spec.name, Entry::Command(spec));
                }
                Some(sub) => {
                    if let Entry::Container(subs) = table
                        .entry(spec.name)
                        .or_insert_with(|| Entry::Container(HashMap::new()))
                    {
                        subs.insert(sub, spec);
                    }
                }
            }
        }
        table
    })
}

fn upper(alloc: &dyn Allocator, arg: &[u8]) -> Result<String> {
    let mut name = vec_with_capacity::<u8>(alloc, arg.len())?;
    name.extend(arg.iter().map(u8::to_ascii_uppercase));
    Ok(String::from_utf8_lossy(&name).into_owned())
}

fn lookup(name: &str, argv: &[Bytes]) -> Option<&'static CommandSpec> {
    match table().get(name)? {
        Entry::Command(spec) => Some(*spec),
        Entry::Container(subs) => {
            let sub = argv.get(1)?;
            let sub = std::str::from_utf8(sub).ok()?.to_ascii_uppercase();
            subs.get(sub.as_str()).copied()
        }
    }
}

/// Classifies `argv` using the system allocator.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for an empty argument vector, a
/// known command with the wrong number of arguments, or key positions
/// that cannot be determined.
pub fn classify(argv: &[Bytes]) -> Result<Classified> {
    classify_with(&SystemAllocator, argv)
}

pub(crate) fn classify_with(alloc: &dyn Allocator, argv: &[Bytes]) -> Result<Classified> {
    let first = argv
        .first()
        .ok_or_else(|| Error::invalid("empty command"))?;
    let name = upper(alloc, first)?;

    let Some(spec) = lookup(&name, argv) else {
        return Ok(Classified {
            name,
            kind: CommandKind::Unknown,
            keys: Vec::new(),
            splittable: false,
            merge: None,
            step: 1,
        });
    };

    let display = match spec.sub {
        Some(sub) => format!("{} {}", spec.name, sub),
        None => spec.name.to_string(),
    };
    let argc = argv.len();
    let arity_ok = if spec.arity >= 0 {
        argc == spec.arity as usize
    } else {
        argc >= spec.arity.unsigned_abs() as usize
    };
    if !arity_ok {
        return Err(Error::invalid(format!(
            "wrong number of arguments for command {display}"
        )));
    }

    let not_found = || Error::invalid(format!("Failed to find keys of command {display}"));
    let mut step = 1;
    let indices: Vec<usize> = match spec.keys {
        KeySpec::None => Vec::new(),
        KeySpec::Index {
            first,
            last,
            step: s,
        } => {
            step = s;
            let last = if last < 0 {
                argc.checked_sub(last.unsigned_abs()).ok_or_else(not_found)?
            } else {
                last as usize
            };
            if first > last || last >= argc || (last + 1 - first) % s != 0 {
                return Err(not_found());
            }
            let mut out = vec_with_capacity(alloc, (last + 1 - first) / s)?;
            out.extend((first..=last).step_by(s));
            out
        }
        KeySpec::KeyNum { pos, dest } => {
            let count = std::str::from_utf8(&argv[pos])
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(not_found)?;
            if pos.checked_add(count).map_or(true, |end| end >= argc) {
                return Err(not_found());
            }
            let mut out = vec_with_capacity(alloc, count + usize::from(dest))?;
            if dest {
                out.push(1);
            }
            out.extend(pos + 1..=pos + count);
            out
        }
        KeySpec::Keyword { keyword, from } => {
            let at = argv
                .iter()
                .enumerate()
                .skip(from)
                .find(|(_, a)| a.eq_ignore_ascii_case(keyword.as_bytes()))
                .map(|(i, _)| i)
                .ok_or_else(not_found)?;
            let rest = argc - at - 1;
            if rest == 0 || rest % 2 != 0 {
                return Err(not_found());
            }
            let mut out = vec_with_capacity(alloc, rest / 2)?;
            out.extend(at + 1..at + 1 + rest / 2);
            out
        }
    };

    if spec.name == "MIGRATE" && indices.iter().any(|&i| argv[i].is_empty()) {
        return Err(Error::invalid("MIGRATE with KEYS option is not supported"));
    }

    let mut keys = vec_with_capacity(alloc, indices.len())?;
    keys.extend(indices.into_iter().map(|index| KeyPosition {
        index,
        slot: key_slot(&argv[index]),
    }));

    let kind = if keys.is_empty() {
        CommandKind::Keyless
    } else {
        CommandKind::Keyed
    };
    Ok(Classified {
        name,
        kind,
        splittable: spec.merge.is_some() && keys.len() > 1,
        keys,
        merge: spec.merge,
        step,
    })
}
