use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::response::{Outcome, Response, Slot};
use crate::core::command::{self, Cmd, FromFrame};
use crate::core::connection::{into_result, Connection};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A MULTI/EXEC block.
///
/// Commands are buffered and sent together with MULTI and EXEC by
/// [`exec`](Transaction::exec). If EXEC reports an abort (a watched key
/// changed), every response resolves as aborted, which is distinct from a
/// command that returned an empty value.
///
/// # Example
///
/// ```no_run
/// # async fn example(conn: &mut shardis::core::connection::Connection) -> shardis::Result<()> {
/// let mut tx = conn.transaction();
/// tx.watch(["balance"]).await?;
/// let balance = tx.incr("balance");
/// match tx.exec().await? {
///     Some(_) => println!("balance = {}", balance.get()?),
///     None => println!("retry: balance changed concurrently"),
/// }
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'a> {
    conn: &'a mut Connection,
    commands: Vec<Cmd>,
    slots: Vec<Slot>,
    watching: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Self {
            conn,
            commands: Vec::new(),
            slots: Vec::new(),
            watching: false,
        }
    }

    /// Watches keys; EXEC aborts if any of them changes before it runs.
    ///
    /// Must be called before queuing commands.
    pub async fn watch<K: Into<Bytes>>(&mut self, keys: impl IntoIterator<Item = K>) -> Result<()> {
        if !self.commands.is_empty() {
            return Err(Error::InvalidArgument {
                message: "WATCH inside MULTI is not allowed".to_string(),
            });
        }
        self.conn.query::<()>(&command::watch(keys)).await?;
        self.watching = true;
        Ok(())
    }

    /// Queues a command, decoding its reply as `T`.
    pub fn queue<T: FromFrame>(&mut self, cmd: Cmd) -> Response<T> {
        let slot = Slot::default();
        let response = Response::new(self.slots.len(), Slot::clone(&slot));
        self.commands.push(cmd);
        self.slots.push(slot);
        response
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

    /// Queues INCR.
    pub fn incr(&mut self, key: impl Into<Bytes>) -> Response<i64> {
        self.queue(command::incr(key))
    }

    /// Runs the transaction.
    ///
    /// Returns `Ok(None)` when the server aborted it (watched key changed);
    /// every response is then aborted. Otherwise returns the raw replies and
    /// resolves each response with its own reply.
    ///
    /// # Errors
    ///
    /// A command rejected while queuing makes EXEC fail with `EXECABORT`;
    /// the rejected commands' responses carry their error, the rest are
    /// aborted, and the EXEC error is returned. A rejected MULTI aborts
    /// every response and is returned once all pending replies are read.
    #[instrument(level = "debug", skip(self), fields(address = %self.conn.address(), commands = self.commands.len()))]
    pub async fn exec(mut self) -> Result<Option<Vec<Frame>>> {
        self.watching = false;
        let commands = std::mem::take(&mut self.commands);
        let slots = std::mem::take(&mut self.slots);

        self.conn.send(&command::multi());
        for cmd in &commands {
            self.conn.send(cmd);
        }
        self.conn.send(&command::exec());
        self.conn.flush().await?;

        // a rejected MULTI still owes the queued replies and EXEC's
        let opened = into_result(self.conn.receive().await?);

        let mut rejected = vec![None; slots.len()];
        for rejection in rejected.iter_mut() {
            let queued = self.conn.receive().await?;
            if queued.is_error() {
                *rejection = Some(queued);
            }
        }

        let reply = self.conn.receive().await?;
        if let Err(e) = opened {
            abort_all(&slots);
            debug!(error = %e, "MULTI rejected");
            return Err(e);
        }

        match reply {
            Frame::Array(items) => {
                if items.len() != slots.len() {
                    return Err(Error::Protocol {
                        message: format!(
                            "EXEC returned {} replies for {} commands",
                            items.len(),
                            slots.len()
                        ),
                    });
                }
                for (slot, item) in slots.iter().zip(&items) {
                    let _ = slot.set(Outcome::Reply(item.clone()));
                }
                debug!("transaction committed");
                Ok(Some(items))
            }
            reply if reply.is_null() => {
                abort_all(&slots);
                debug!("transaction aborted by server");
                Ok(None)
            }
            Frame::Error(message) => {
                for (slot, rejection) in slots.iter().zip(rejected) {
                    let outcome = rejection.map_or(Outcome::Aborted, Outcome::Reply);
                    let _ = slot.set(outcome);
                }
                Err(Error::from_reply(&message))
            }
            other => Err(Error::unexpected("EXEC reply", other.kind())),
        }
    }

    /// Abandons the transaction without running it.
    ///
    /// Every response resolves as aborted; watched keys are released.
    pub async fn discard(mut self) -> Result<()> {
        self.commands.clear();
        abort_all(&self.slots);
        if self.watching {
            self.watching = false;
            self.conn.query::<()>(&command::unwatch()).await?;
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.watching {
            // WATCH state would leak into the next user of this connection
            warn!(address = %self.conn.address(), "watching transaction dropped without exec or discard");
            self.conn.invalidate();
        }
    }
}

fn abort_all(slots: &[Slot]) {
    for slot in slots {
        let _ = slot.set(Outcome::Aborted);
    }
}

impl Connection {
    /// Starts a MULTI/EXEC transaction on this connection.
    pub fn transaction(&mut self) -> Transaction<'_> {
        Transaction::new(self)
    }
}
