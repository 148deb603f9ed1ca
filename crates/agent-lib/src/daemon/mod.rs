//! Node daemon: per-node control loop and its remote control endpoint

mod control_loop;
mod protocol;
mod server;
mod session;


pub use control_loop::{
    next_tick_delay, tick_deadline, ControlLoop, LoopSummary, WallClock, LIMIT_EPSILON,
    TICK_INTERVAL, TICK_PHASE,
};
pub use protocol::{Request, Response};
pub use server::{NodeServer, DEFAULT_LISTEN_PORT};
pub use session::{SessionState, SharedSession};
