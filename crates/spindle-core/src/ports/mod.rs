//! Ports - seams the pool talks through.
//!
//! Each trait hides one outside concern so tests can replace it:
//! time, id allocation and progress delivery.

pub mod clock;
pub mod id_generator;
pub mod progress_sink;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::progress_sink::{ChannelProgressSink, ProgressSink, TracingProgressSink};
