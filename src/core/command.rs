use bytes::Bytes;

use crate::proto::frame::Frame;

/// A command ready to be routed to the cluster.
///
/// Commands are built using the builder pattern and handed to a cluster
/// context, which classifies the arguments to find their keys.
///
/// # Example
///
/// ```
/// use slotmux::Cmd;
///
/// let cmd = Cmd::new("SET").arg("key").arg("value");
/// assert_eq!(cmd.args().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Creates a new command with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The command name (e.g., "GET", "SET", "DEL")
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
        }
    }

    /// Creates a command from a complete argument vector.
    #[inline]
    pub fn from_args(args: Vec<Bytes>) -> Self {
        Self { args }
    }

    /// Appends an argument to the command.
    ///
    /// # Arguments
    ///
    /// * `arg` - The argument value
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Returns the argument vector, command name first.
    #[inline]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Consumes the command, returning its argument vector.
    #[inline]
    pub fn into_args(self) -> Vec<Bytes> {
        self.args
    }

    /// Converts the command to a RESP Array frame.
    #[inline]
    pub fn into_frame(self) -> Frame {
        argv_frame(&self.args)
    }
}

/// Builds the RESP array for an argument vector.
pub(crate) fn argv_frame(args: &[Bytes]) -> Frame {
    Frame::Array(args.iter().cloned().map(|b| Frame::BulkString(Some(b))).collect())
}

/// Creates an AUTH command with only a password.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}

/// Creates an AUTH command for an ACL user.
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(username).arg(password)
}

/// Creates a SELECT command.
#[inline]
pub fn select(db: u32) -> Cmd {
    Cmd::new("SELECT").arg(db.to_string())
}

/// Creates the ASKING hint sent ahead of an ASK-redirected command.
#[inline]
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

/// Creates a CLUSTER SLOTS command.
#[inline]
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates a CLUSTER NODES command.
#[inline]
pub fn cluster_nodes() -> Cmd {
    Cmd::new("CLUSTER").arg("NODES")
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").arg(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").arg(key).arg(value)
}

/// Creates an MGET command.
pub fn mget<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("MGET"), Cmd::arg)
}

/// Creates an MSET command.
pub fn mset<K: Into<Bytes>, V: Into<Bytes>>(pairs: impl IntoIterator<Item = (K, V)>) -> Cmd {
    pairs
        .into_iter()
        .fold(Cmd::new("MSET"), |cmd, (k, v)| cmd.arg(k).arg(v))
}

/// Creates a DEL command.
pub fn del<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("DEL"), Cmd::arg)
}
