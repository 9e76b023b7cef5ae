use bytes::Bytes;
use tracing::{debug, instrument};

use super::response::{Outcome, Response, Slot};
use crate::core::command::{self, Cmd, FromFrame};
use crate::core::connection::Connection;
use crate::proto::error::Result;
use crate::proto::frame::Frame;

/// Commands sent in one write, replies read back in order.
///
/// Nothing reaches the server before [`sync`](Pipeline::sync); dropping an
/// unsynchronized pipeline discards its commands.
///
/// # Example
///
/// ```no_run
/// use shardis::core::command;
/// # async fn example(conn: &mut shardis::core::connection::Connection) -> shardis::Result<()> {
/// let mut pipeline = conn.pipeline();
/// pipeline.set("a", "1");
/// let counter = pipeline.incr("counter");
/// let value = pipeline.queue::<Option<String>>(command::get("a"));
/// pipeline.sync().await?;
/// assert_eq!(value.get()?.as_deref(), Some("1"));
/// println!("counter = {}", counter.get()?);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<'a> {
    conn: &'a mut Connection,
    commands: Vec<Cmd>,
    slots: Vec<Slot>,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self {
            conn,
            commands: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Queues a command, decoding its reply as `T`.
    pub fn queue<T: FromFrame>(&mut self, cmd: Cmd) -> Response<T> {
        let slot = Slot::default();
        let response = Response::new(self.slots.len(), Slot::clone(&slot));
        self.queue_into(cmd, slot);
        response
    }

    /// Queues a command whose response was handed out elsewhere.
    pub(crate) fn queue_into(&mut self, cmd: Cmd, slot: Slot) {
        self.commands.push(cmd);
        self.slots.push(slot);
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Queues GET.
    pub fn get(&mut self, key: impl Into<Bytes>) -> Response<Option<Bytes>> {
        self.queue(command::get(key))
    }

    /// Queues SET.
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Response<()> {
        self.queue(command::set(key, value))
    }

    /// Queues DEL.
    pub fn del(&mut self, key: impl Into<Bytes>) -> Response<i64> {
        self.queue(command::del(key))
    }

    /// Queues EXISTS.
    pub fn exists(&mut self, key: impl Into<Bytes>) -> Response<bool> {
        self.queue(command::exists(key))
    }

    /// Queues INCR.
    pub fn incr(&mut self, key: impl Into<Bytes>) -> Response<i64> {
        self.queue(command::incr(key))
    }

    /// Sends every queued command and resolves their responses in order.
    ///
    /// An error reply resolves only its own response. A transport failure
    /// aborts the sync; responses not yet read stay unresolved and the
    /// connection is marked broken.
    #[instrument(level = "debug", skip(self), fields(address = %self.conn.address(), commands = self.commands.len()))]
    pub async fn sync(&mut self) -> Result<()> {
        self.sync_all().await.map(|_| ())
    }

    /// Like [`sync`](Pipeline::sync), also returning the raw replies.
    pub async fn sync_all(&mut self) -> Result<Vec<Frame>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }

        for cmd in self.commands.drain(..) {
            self.conn.send(&cmd);
        }
        self.conn.flush().await?;

        let slots = std::mem::take(&mut self.slots);
        let mut replies = Vec::with_capacity(slots.len());
        for slot in slots {
            let frame = self.conn.receive().await?;
            let _ = slot.set(Outcome::Reply(frame.clone()));
            replies.push(frame);
        }

        debug!(replies = replies.len(), "pipeline synchronized");
        Ok(replies)
    }
}

impl Connection {
    /// Starts a pipeline on this connection.
    pub fn pipeline(&mut self) -> Pipeline<'_> {
        Pipeline::new(self)
    }
}
