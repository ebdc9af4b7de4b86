//! Async FTP client library.
//!
//! The core of the crate is a long-lived [`session::Session`] that speaks
//! RFC 959 over a TCP control connection. User operations are funneled
//! through a serialized command queue: at most one command is on the wire at
//! any time, replies are paired with the queue head in FIFO order, and the
//! first user-visible command transparently runs the feature probe
//! (`FEAT`/`SYST`) and login (`USER`/`PASS`/`TYPE I`) before it executes.
//!
//! Data transfers and directory listings open an ephemeral passive-mode
//! connection each: the session asks the server for an endpoint via `PASV`,
//! connects a second socket, and issues the transfer command expecting a
//! preliminary 1xx "mark" reply. The transfer completes when the data socket
//! closes; the terminal `226` on the control connection is swallowed by the
//! queue so it can never be mistaken for the reply to a later command.
//!
//! Listing output parsing and filename normalization are collaborator
//! concerns: the session is handed an implementation of
//! [`listing::ListingParser`] at connect time and applies Unicode NFC to
//! entry names itself.

pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod listing;
pub mod protocol;
pub mod session;

mod control;
mod dispatch;

#[cfg(test)]
mod test_util;
