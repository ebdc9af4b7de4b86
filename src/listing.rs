#[cfg(test)]
use mockall::automock;

/// A single entry of a remote directory listing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub size: Option<u64>,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Turns the text a server produces for `LIST` / `STAT` into structured
///  entries.
///
/// Listing formats are a zoo (UNIX ls-style, DOS, EPLF, ...) and parsing
///  them is deliberately not this crate's concern: an implementation is
///  injected into [`crate::session::Session::connect`]. Unparseable lines
///  are expected to be skipped, not to fail the listing.
#[cfg_attr(test, automock)]
pub trait ListingParser: Sync + Send {
    fn parse_entries(&self, text: &str) -> Vec<FileEntry>;
}
