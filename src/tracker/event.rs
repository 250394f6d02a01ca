use speedy::{Readable, Writable};

/// Why we are announcing. Written to the wire as a big-endian u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Writable, Readable)]
pub enum Event {
    None = 0,
    Completed = 1,
    #[default]
    Started = 2,
    Stopped = 3,
}
