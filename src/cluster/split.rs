//! Splitting multi-key commands across slots and merging the replies.
//!
//! Keys are grouped by slot in first-appearance order. Each group becomes
//! one sub-command carrying the command name followed by the key's
//! argument group (`key` for MGET/DEL, `key value` for MSET). Merging puts
//! every sub-reply back at the positions of the keys it answered.

use bytes::Bytes;

use crate::core::memory::{reserve_one, vec_with_capacity, Allocator};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

use super::inspect::{Classified, MergeKind};

/// One sub-command of a split.
#[derive(Debug, Clone)]
pub(crate) struct SplitPart {
    /// Slot shared by every key of this part.
    pub slot: u16,
    /// Full argument vector of the sub-command.
    pub argv: Vec<Bytes>,
    /// Ordinals (in the original key order) of the keys carried here.
    positions: Vec<usize>,
}

/// A split command ready to dispatch.
#[derive(Debug, Clone)]
pub(crate) struct SplitPlan {
    pub parts: Vec<SplitPart>,
    merge: MergeKind,
    keys: usize,
}

/// Partitions `argv` by slot.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the command is not splittable and
/// [`Error::OutOfMemory`] if an allocation is refused.
pub(crate) fn plan(alloc: &dyn Allocator, argv: &[Bytes], classified: &Classified) -> Result<SplitPlan> {
    let merge = classified
        .merge
        .filter(|_| classified.splittable)
        .ok_or_else(|| Error::invalid(format!("{} cannot be split", classified.name)))?;

    let mut parts: Vec<SplitPart> = Vec::new();
    for (ordinal, key) in classified.keys.iter().enumerate() {
        let end = key.index + classified.step;
        let group = argv
            .get(key.index..end)
            .ok_or_else(|| Error::invalid(format!("truncated arguments for {}", classified.name)))?;

        let at = match parts.iter().position(|p| p.slot == key.slot) {
            Some(at) => at,
            None => {
                reserve_one(alloc, &mut parts)?;
                let mut sub = vec_with_capacity(alloc, 1 + classified.step)?;
                sub.push(argv[0].clone());
                parts.push(SplitPart {
                    slot: key.slot,
                    argv: sub,
                    positions: Vec::new(),
                });
                parts.len() - 1
            }
        };
        let part = &mut parts[at];
        for arg in group {
            reserve_one(alloc, &mut part.argv)?;
            part.argv.push(arg.clone());
        }
        reserve_one(alloc, &mut part.positions)?;
        part.positions.push(ordinal);
    }

    Ok(SplitPlan {
        parts,
        merge,
        keys: classified.keys.len(),
    })
}

impl SplitPlan {
    /// Merges one reply per part (in part order) into a single reply.
    ///
    /// # Errors
    ///
    /// - [`Error::Server`] if any part answered with an error reply
    /// - [`Error::Protocol`] if a part's reply has the wrong shape
    pub(crate) fn merge(&self, alloc: &dyn Allocator, replies: Vec<Frame>) -> Result<Frame> {
        if replies.len() != self.parts.len() {
            return Err(Error::protocol("missing reply for split command"));
        }
        if let Some(message) = replies.iter().find_map(Frame::error_message) {
            return Err(Error::Server { message });
        }

        match self.merge {
            MergeKind::Array => {
                let mut merged: Vec<Option<Frame>> = vec_with_capacity(alloc, self.keys)?;
                merged.resize(self.keys, None);
                for (part, reply) in self.parts.iter().zip(replies) {
                    let Frame::Array(items) = reply else {
                        return Err(Error::protocol("reply type error"));
                    };
                    if items.len() != part.positions.len() {
                        return Err(Error::protocol("reply length mismatch"));
                    }
                    for (&pos, item) in part.positions.iter().zip(items) {
                        merged[pos] = Some(item);
                    }
                }
                let merged = merged
                    .into_iter()
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| Error::protocol("missing reply for split command"))?;
                Ok(Frame::Array(merged))
            }
            MergeKind::Sum => {
                let mut total = 0i64;
                for reply in &replies {
                    let n = match reply {
                        Frame::Integer(n) => *n,
                        _ => return Err(Error::protocol("reply type error")),
                    };
                    total = total.saturating_add(n);
                }
                Ok(Frame::Integer(total))
            }
            MergeKind::Status => {
                for reply in &replies {
                    match reply {
                        Frame::SimpleString(s) if s.eq_ignore_ascii_case(b"OK") => {}
                        _ => return Err(Error::protocol("reply type error")),
                    }
                }
                Ok(Frame::ok())
            }
        }
    }
}
