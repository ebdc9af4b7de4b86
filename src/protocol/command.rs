use tokio::sync::oneshot;

use crate::protocol::response::Response;

/// Which preliminary replies a queued command is prepared to consume, and
///  which terminal reply to swallow afterwards.
///
/// Transfer commands (`RETR`, `STOR`, `LIST`) complete on the mark: the
///  caller's signal for the transfer itself is the data connection closing,
///  not the terminal reply, so the trailing `226` must be consumed silently
///  instead of being paired with the next queued command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MarkExpectation {
    pub marks: Vec<u16>,
    pub ignore: Option<u16>,
}

impl MarkExpectation {
    /// The expectation shared by all passive-mode transfer commands.
    pub fn transfer() -> MarkExpectation {
        MarkExpectation {
            marks: vec![125, 150],
            ignore: Some(226),
        }
    }
}

/// A queued command line plus its one-shot completion.
///
/// The completion sender is consumed on first use, so a command can be
///  completed at most once no matter how many source events race for it
///  (mark vs. terminal, reply vs. teardown).
pub struct Command {
    pub line: String,
    pub expects_mark: Option<MarkExpectation>,
    completion: Option<oneshot::Sender<anyhow::Result<Response>>>,
}

impl Command {
    pub fn new(
        line: String,
        expects_mark: Option<MarkExpectation>,
    ) -> (Command, oneshot::Receiver<anyhow::Result<Response>>) {
        let (tx, rx) = oneshot::channel();
        (
            Command {
                line,
                expects_mark,
                completion: Some(tx),
            },
            rx,
        )
    }

    pub fn complete(&mut self, result: anyhow::Result<Response>) {
        if let Some(tx) = self.completion.take() {
            // a dropped receiver just means nobody is waiting any more
            let _ = tx.send(result);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_none()
    }
}
