//! Thread execution states.

use std::fmt;

/// What a thread is doing, from the collector's point of view.
///
/// Only [`ThreadState::Runnable`] threads may touch the managed heap; every
/// other state is safe to treat as stopped once the thread's suspend count is
/// raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    /// Created but not yet attached to the runtime.
    Starting = 0,
    /// Executing managed code; holds the mutator lock shared.
    Runnable = 1,
    /// Executing native code.
    Native = 2,
    /// Blocked inside the runtime.
    VmWait = 3,
    /// Parked at a safepoint.
    Suspended = 4,
    Waiting = 5,
    TimedWaiting = 6,
    Sleeping = 7,
    /// Waiting to acquire a monitor.
    Blocked = 8,
    Terminated = 9,
}

impl ThreadState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Starting,
            1 => ThreadState::Runnable,
            2 => ThreadState::Native,
            3 => ThreadState::VmWait,
            4 => ThreadState::Suspended,
            5 => ThreadState::Waiting,
            6 => ThreadState::TimedWaiting,
            7 => ThreadState::Sleeping,
            8 => ThreadState::Blocked,
            _ => ThreadState::Terminated,
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadState::Starting => "Starting",
            ThreadState::Runnable => "Runnable",
            ThreadState::Native => "Native",
            ThreadState::VmWait => "VmWait",
            ThreadState::Suspended => "Suspended",
            ThreadState::Waiting => "Waiting",
            ThreadState::TimedWaiting => "TimedWaiting",
            ThreadState::Sleeping => "Sleeping",
            ThreadState::Blocked => "Blocked",
            ThreadState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip_covers_every_state() {
        for raw in 0..=9u8 {
            assert_eq!(ThreadState::from_u8(raw) as u8, raw);
        }
        assert_eq!(ThreadState::from_u8(200), ThreadState::Terminated);
    }
}
