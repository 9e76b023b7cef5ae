use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Command identifiers known to the client.
///
/// `Other` carries an arbitrary command name for generic dispatch; known
/// commands resolve their wire name through [`Command::name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Command {
    /// ASKING
    Asking,
    /// AUTH
    Auth,
    /// CLIENT
    Client,
    /// CLUSTER
    Cluster,
    /// DECR
    Decr,
    /// DECRBY
    DecrBy,
    /// DEL
    Del,
    /// DISCARD
    Discard,
    /// ECHO
    Echo,
    /// EXEC
    Exec,
    /// EXISTS
    Exists,
    /// EXPIRE
    Expire,
    /// GET
    Get,
    /// INCR
    Incr,
    /// INCRBY
    IncrBy,
    /// MGET
    MGet,
    /// MSET
    MSet,
    /// MULTI
    Multi,
    /// PING
    Ping,
    /// SELECT
    Select,
    /// SET
    Set,
    /// UNWATCH
    Unwatch,
    /// WATCH
    Watch,
    /// Any other command, by name.
    Other(Bytes),
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> Bytes {
        let name: &'static str = match self {
            Command::Asking => "ASKING",
            Command::Auth => "AUTH",
            Command::Client => "CLIENT",
            Command::Cluster => "CLUSTER",
            Command::Decr => "DECR",
            Command::DecrBy => "DECRBY",
            Command::Del => "DEL",
            Command::Discard => "DISCARD",
            Command::Echo => "ECHO",
            Command::Exec => "EXEC",
            Command::Exists => "EXISTS",
            Command::Expire => "EXPIRE",
            Command::Get => "GET",
            Command::Incr => "INCR",
            Command::IncrBy => "INCRBY",
            Command::MGet => "MGET",
            Command::MSet => "MSET",
            Command::Multi => "MULTI",
            Command::Ping => "PING",
            Command::Select => "SELECT",
            Command::Set => "SET",
            Command::Unwatch => "UNWATCH",
            Command::Watch => "WATCH",
            Command::Other(name) => return name.clone(),
        };
        Bytes::from_static(name.as_bytes())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.name()))
    }
}

/// Per-client command renaming (`rename-command` on the server side).
#[derive(Debug, Clone, Default)]
pub struct CommandRenames {
    table: HashMap<Command, Bytes>,
}

impl CommandRenames {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `command` under `wire_name` instead of its default name.
    pub fn rename(&mut self, command: Command, wire_name: impl Into<Bytes>) {
        self.table.insert(command, wire_name.into());
    }

    /// Resolves the wire name for `command`.
    pub fn resolve(&self, command: &Command) -> Bytes {
        self.table
            .get(command)
            .cloned()
            .unwrap_or_else(|| command.name())
    }

    /// Returns true if no command is renamed.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// A request: a command identifier plus its ordered arguments.
///
/// # Example
///
/// ```
/// use shardis::core::command::{Cmd, Command};
///
/// let cmd = Cmd::new(Command::Set).arg("key").arg("value");
/// assert_eq!(cmd.args().len(), 2);
/// let custom = Cmd::named("OBJECT").arg("ENCODING").arg("key");
/// assert_eq!(custom.command().to_string(), "OBJECT");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    command: Command,
    args: Vec<Bytes>,
}

impl Cmd {
    /// Creates a command without arguments.
    #[inline]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            args: Vec::new(),
        }
    }

    /// Creates a command for an arbitrary command name.
    #[inline]
    pub fn named(name: impl Into<Bytes>) -> Self {
        Self::new(Command::Other(name.into()))
    }

    /// Appends an argument.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The command identifier.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The arguments, without the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Wire representation: command name (after renaming) followed by the
    /// arguments.
    pub fn to_wire(&self, renames: &CommandRenames) -> Vec<Bytes> {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(renames.resolve(&self.command));
        parts.extend(self.args.iter().cloned());
        parts
    }

    /// Converts the command to a RESP array frame using default names.
    pub fn into_frame(self) -> Frame {
        Frame::Array(
            self.to_wire(&CommandRenames::default())
                .into_iter()
                .map(Frame::bulk)
                .collect(),
        )
    }
}

/// Decodes a raw reply into a typed value.
///
/// Error replies never reach a decoder: they are turned into [`Error`]s
/// before decoding.
pub trait FromFrame: Sized {
    /// Converts the frame.
    fn from_frame(frame: Frame) -> Result<Self>;
}

impl FromFrame for Frame {
    fn from_frame(frame: Frame) -> Result<Self> {
        Ok(frame)
    }
}

impl FromFrame for () {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::SimpleString(_) => Ok(()),
            other => Err(Error::unexpected("status", other.kind())),
        }
    }
}

impl FromFrame for i64 {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Integer(n) => Ok(n),
            Frame::BulkString(Some(data)) => std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::unexpected("integer", "non-numeric bulk string")),
            other => Err(Error::unexpected("integer", other.kind())),
        }
    }
}

impl FromFrame for bool {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Integer(n) => Ok(n != 0),
            Frame::SimpleString(_) => Ok(true),
            Frame::BulkString(None) | Frame::Null => Ok(false),
            other => Err(Error::unexpected("boolean", other.kind())),
        }
    }
}

impl FromFrame for Bytes {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::BulkString(Some(data)) => Ok(data),
            Frame::SimpleString(s) => Ok(Bytes::from(s)),
            other => Err(Error::unexpected("bulk string", other.kind())),
        }
    }
}

impl FromFrame for String {
    fn from_frame(frame: Frame) -> Result<Self> {
        let data = Bytes::from_frame(frame)?;
        String::from_utf8(data.to_vec()).map_err(|_| Error::unexpected("utf-8 string", "binary data"))
    }
}

impl<T: FromFrame> FromFrame for Option<T> {
    fn from_frame(frame: Frame) -> Result<Self> {
        if frame.is_null() {
            Ok(None)
        } else {
            T::from_frame(frame).map(Some)
        }
    }
}

impl<T: FromFrame> FromFrame for Vec<T> {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Array(items) => items.into_iter().map(T::from_frame).collect(),
            other => Err(Error::unexpected("array", other.kind())),
        }
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new(Command::Ping)
}

/// Creates an ECHO command.
#[inline]
pub fn echo(msg: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Echo).arg(msg)
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Get).arg(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Set).arg(key).arg(value)
}

/// Creates a SET command with an expiry in seconds.
#[inline]
pub fn set_with_expiry(
    key: impl Into<Bytes>,
    value: impl Into<Bytes>,
    expiry: std::time::Duration,
) -> Cmd {
    Cmd::new(Command::Set)
        .arg(key)
        .arg(value)
        .arg("EX")
        .arg(expiry.as_secs().to_string())
}

/// Creates a DEL command.
#[inline]
pub fn del(key: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Del).arg(key)
}

/// Creates an EXISTS command.
#[inline]
pub fn exists(key: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Exists).arg(key)
}

/// Creates an EXPIRE command.
#[inline]
pub fn expire(key: impl Into<Bytes>, seconds: u64) -> Cmd {
    Cmd::new(Command::Expire).arg(key).arg(seconds.to_string())
}

/// Creates an INCR command.
#[inline]
pub fn incr(key: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Incr).arg(key)
}

/// Creates an INCRBY command.
#[inline]
pub fn incr_by(key: impl Into<Bytes>, amount: i64) -> Cmd {
    Cmd::new(Command::IncrBy).arg(key).arg(amount.to_string())
}

/// Creates a DECR command.
#[inline]
pub fn decr(key: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Decr).arg(key)
}

/// Creates a DECRBY command.
#[inline]
pub fn decr_by(key: impl Into<Bytes>, amount: i64) -> Cmd {
    Cmd::new(Command::DecrBy).arg(key).arg(amount.to_string())
}

/// Creates an MGET command.
pub fn mget<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new(Command::MGet), Cmd::arg)
}

/// Creates an MSET command.
pub fn mset<K: Into<Bytes>, V: Into<Bytes>>(pairs: impl IntoIterator<Item = (K, V)>) -> Cmd {
    pairs
        .into_iter()
        .fold(Cmd::new(Command::MSet), |cmd, (k, v)| cmd.arg(k).arg(v))
}

/// Creates an AUTH command with password only.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Auth).arg(password)
}

/// Creates an AUTH command with username and password (ACL style).
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Auth).arg(username).arg(password)
}

/// Creates a SELECT command.
#[inline]
pub fn select(db: u8) -> Cmd {
    Cmd::new(Command::Select).arg(db.to_string())
}

/// Creates a CLIENT SETNAME command.
#[inline]
pub fn client_setname(name: impl Into<Bytes>) -> Cmd {
    Cmd::new(Command::Client).arg("SETNAME").arg(name)
}

/// Creates a MULTI command.
#[inline]
pub fn multi() -> Cmd {
    Cmd::new(Command::Multi)
}

/// Creates an EXEC command.
#[inline]
pub fn exec() -> Cmd {
    Cmd::new(Command::Exec)
}

/// Creates a DISCARD command.
#[inline]
pub fn discard() -> Cmd {
    Cmd::new(Command::Discard)
}

/// Creates a WATCH command.
pub fn watch<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new(Command::Watch), Cmd::arg)
}

/// Creates an UNWATCH command.
#[inline]
pub fn unwatch() -> Cmd {
    Cmd::new(Command::Unwatch)
}

/// Creates an ASKING command.
#[inline]
pub fn asking() -> Cmd {
    Cmd::new(Command::Asking)
}

/// Creates a CLUSTER SLOTS command.
#[inline]
pub fn cluster_slots() -> Cmd {
    Cmd::new(Command::Cluster).arg("SLOTS")
}

/// Creates a CLUSTER INFO command.
#[inline]
pub fn cluster_info() -> Cmd {
    Cmd::new(Command::Cluster).arg("INFO")
}
