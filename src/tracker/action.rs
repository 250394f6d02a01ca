use speedy::{Readable, Writable};

/// The action field present in every UDP tracker packet. Written to the
/// wire as a big-endian u32.
#[derive(Debug, Clone, Copy, PartialEq, Default, Writable, Readable)]
pub enum Action {
    #[default]
    Connect = 0,
    Announce = 1,
    Scrape = 2,
}
