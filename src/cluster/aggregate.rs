//! Merging the replies of a command run on every primary.

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// How the replies of a broadcast command combine into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyPolicy {
    /// Every node must return the same reply (PING, FLUSHALL, SCRIPT LOAD).
    #[default]
    AllSucceeded,
    /// The first reply wins.
    OneSucceeded,
    /// Integer replies are added up (DBSIZE, DEL over several nodes).
    Sum,
    /// Smallest integer reply.
    Min,
    /// Largest integer reply.
    Max,
    /// 1 if every integer reply is non-zero, else 0.
    LogicalAnd,
    /// 1 if any integer reply is non-zero, else 0.
    LogicalOr,
    /// Array replies are concatenated in node order (KEYS).
    Concat,
}

impl ReplyPolicy {
    /// Folds `next`, received from `node`, into `merged`.
    ///
    /// # Errors
    ///
    /// [`Error::BroadcastMismatch`] when [`AllSucceeded`](ReplyPolicy::AllSucceeded)
    /// replies differ; [`Error::Protocol`] when a reply has the wrong shape
    /// for the policy.
    pub fn merge(self, merged: Frame, next: Frame, node: &str) -> Result<Frame> {
        match self {
            ReplyPolicy::AllSucceeded if merged == next => Ok(merged),
            ReplyPolicy::AllSucceeded => Err(Error::BroadcastMismatch {
                node: node.to_string(),
            }),
            ReplyPolicy::OneSucceeded => Ok(merged),
            ReplyPolicy::Sum => integers(merged, next, |a, b| a.wrapping_add(b)),
            ReplyPolicy::Min => integers(merged, next, i64::min),
            ReplyPolicy::Max => integers(merged, next, i64::max),
            ReplyPolicy::LogicalAnd => integers(merged, next, |a, b| i64::from(a != 0 && b != 0)),
            ReplyPolicy::LogicalOr => integers(merged, next, |a, b| i64::from(a != 0 || b != 0)),
            ReplyPolicy::Concat => match (merged, next) {
                (Frame::Array(mut items), Frame::Array(more)) => {
                    items.extend(more);
                    Ok(Frame::Array(items))
                }
                (Frame::Array(_), other) | (other, _) => Err(Error::unexpected("array", other.kind())),
            },
        }
    }
}

fn integers(merged: Frame, next: Frame, op: impl Fn(i64, i64) -> i64) -> Result<Frame> {
    match (merged, next) {
        (Frame::Integer(a), Frame::Integer(b)) => Ok(Frame::Integer(op(a, b))),
        (Frame::Integer(_), other) | (other, _) => Err(Error::unexpected("integer", other.kind())),
    }
}
