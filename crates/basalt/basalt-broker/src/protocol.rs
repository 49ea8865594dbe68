//! Wire format between broker and peers.
//!
//! A request is one native-endian `u32` opcode. The reply to
//! [`Command::SendFds`] is a sequence of single-descriptor `SCM_RIGHTS`
//! messages followed by the broker closing the connection.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Where sockets go when no directory is configured.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    SendFds = 0,
    Quit = 1,
}

impl Command {
    pub fn to_bytes(self) -> [u8; 4] {
        (self as u32).to_ne_bytes()
    }
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(op: u32) -> Result<Self, u32> {
        match op {
            0 => Ok(Command::SendFds),
            1 => Ok(Command::Quit),
            other => Err(other),
        }
    }
}

/// Reads one raw opcode.
pub fn read_opcode(r: &mut impl Read) -> io::Result<u32> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    Ok(u32::from_ne_bytes(raw))
}

/// Socket path of the broker serving `pool_name`.
pub fn socket_path(dir: impl AsRef<Path>, pool_name: &str) -> PathBuf {
    let bare = pool_name.trim_start_matches('/');
    dir.as_ref().join(format!("{bare}.sock"))
}
