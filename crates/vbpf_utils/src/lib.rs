pub mod logger;
pub mod rcu;
pub mod timer;

pub use rcu::RcuCell;
pub use timer::Stopwatch;
