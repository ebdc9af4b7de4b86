/// A single parsed server reply.
///
/// For multi-line replies `text` joins all lines with `\n`: the first line
///  minus its `nnn-` prefix, interior lines verbatim, and the final line
///  minus its `nnn ` prefix.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Response {
    pub code: u16,
    pub text: String,
}

impl Response {
    /// Preliminary positive reply (1xx): the server has accepted a transfer
    ///  command and a terminal reply will follow once the data connection
    ///  is done.
    pub fn is_mark(&self) -> bool {
        (100..=199).contains(&self.code)
    }

    pub fn is_error(&self) -> bool {
        (400..=599).contains(&self.code)
    }
}
