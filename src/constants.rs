use std::time::Duration;

pub const IO_BUFFER_CAPACITY: usize = 32 * 1024;
pub const LISTEN_BACKLOG: i32 = 1024;

pub const WORKER_THREAD_NAME: &str = "weft-worker";

// floor maintenance stops retrying after this many consecutive failed spawns
pub const MAX_FLOOR_SPAWN_FAILURES: usize = 3;

// once one side of a bridged pair has ended, the other side may stay quiet
// this long before the pair is torn down
pub const HALF_CLOSE_LINGER: Duration = Duration::from_secs(1);

pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);
