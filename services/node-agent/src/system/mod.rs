//! Host collaborators the agent drives.
//!
//! - `cmd`: external command execution
//! - `clock`: injectable time source
//! - `poll`: bounded polling on top of the clock
//! - `mem`: host memory statistics

mod clock;
mod cmd;
mod mem;
mod poll;

pub use clock::{Clock, MockClock, SystemClock};
pub use cmd::{CmdError, CmdOutput, CmdRunner, Command, ExecCmdRunner, MockCmdResult, MockCmdRunner};
pub use mem::{MemoryStats, MockMemoryStats, ProcMemoryStats};
pub use poll::{poll_until, Poll, PollError, PollOptions};
