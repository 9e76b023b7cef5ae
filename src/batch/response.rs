use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::core::command::FromFrame;
use crate::core::connection::into_result;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Outcome recorded for one batched command.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Reply(Frame),
    Aborted,
}

pub(crate) type Slot = Arc<OnceLock<Outcome>>;

/// A deferred reply.
///
/// Returned when a command is queued in a [`Pipeline`](super::Pipeline) or
/// [`Transaction`](super::Transaction); it holds a value only once the
/// batch has been synchronized. Its position in the batch is fixed when
/// the command is queued.
pub struct Response<T> {
    position: usize,
    slot: Slot,
    _decoder: PhantomData<fn() -> T>,
}

impl<T: FromFrame> Response<T> {
    pub(crate) fn new(position: usize, slot: Slot) -> Self {
        Self {
            position,
            slot,
            _decoder: PhantomData,
        }
    }

    /// Decodes the reply.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] before the batch was synchronized
    /// - [`Error::TransactionAborted`] if the owning transaction did not run
    /// - the command's own error if the server rejected it
    pub fn get(&self) -> Result<T> {
        match self.slot.get() {
            None => Err(Error::NotReady {
                position: self.position,
            }),
            Some(Outcome::Aborted) => Err(Error::TransactionAborted),
            Some(Outcome::Reply(frame)) => into_result(frame.clone()).and_then(T::from_frame),
        }
    }

    /// Position of the command in its batch.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns true once the batch has been synchronized.
    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Returns true if the owning transaction was aborted.
    pub fn is_aborted(&self) -> bool {
        matches!(self.slot.get(), Some(Outcome::Aborted))
    }
}

impl<T> fmt::Debug for Response<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("position", &self.position)
            .field("outcome", &self.slot.get())
            .finish()
    }
}
