//! Entity model (component B, §3.3–§3.7, §4.B).

pub mod job;
pub mod node;
pub mod queue;
pub mod reservation;
pub mod resresv;
pub mod server;
