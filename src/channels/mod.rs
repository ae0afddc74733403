mod signal;

pub use signal::{SignalChannel, SignalSender};
