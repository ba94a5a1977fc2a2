mod range;
mod signal;

pub use range::ByteRange;
pub use signal::WorkSignal;
