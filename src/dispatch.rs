use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::control::ControlChannel;
use crate::data::PasvGuard;
use crate::error::ReplyError;
use crate::events::EventSink;
use crate::protocol::command::{Command, MarkExpectation};
use crate::protocol::response::Response;
use crate::session::TransferType;

/// Serializes all command traffic on the control connection.
///
/// The queue head is the in-flight command; `in_progress` gates writes, so
///  no command ever hits the wire while another is awaiting its reply.
///  Responses are paired with the head in FIFO order; preliminary marks and
///  the suppressed transfer terminals are handled here so they can never be
///  misattributed to a later command.
#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<DispatchCore>,
}

struct DispatchCore {
    config: Arc<SessionConfig>,
    events: EventSink,
    conn: tokio::sync::Mutex<Option<ControlChannel>>,
    /// serializes the implicit auth chain: it runs at most once per burst of
    ///  pre-auth commands, everyone else waits here
    auth_gate: tokio::sync::Mutex<()>,
    queue: Mutex<CommandQueue>,
    state: Mutex<SessionState>,
    /// bumped per control connection so a dying read loop only fails the
    ///  queue if no newer connection has taken over
    generation: AtomicU64,
    pasv_active: Arc<AtomicBool>,
}

struct CommandQueue {
    commands: VecDeque<Command>,
    in_progress: bool,
    ignore_next_code: Option<u16>,
}

struct SessionState {
    authenticated: bool,
    authenticating: bool,
    features: Option<FxHashSet<String>>,
    system: Option<String>,
    transfer_type: Option<TransferType>,
    use_list: bool,
}

enum Paired {
    Dropped,
    /// an expected mark completed the head command, which stays queued until
    ///  its suppressed terminal arrives
    MarkDelivered,
    /// the suppressed terminal popped the (already completed) head
    SilentlyConsumed,
    Terminal(Command, anyhow::Result<Response>),
}

impl Dispatcher {
    pub fn new(config: Arc<SessionConfig>, events: EventSink) -> Dispatcher {
        let use_list = config.use_list;
        Dispatcher {
            core: Arc::new(DispatchCore {
                config,
                events,
                conn: tokio::sync::Mutex::new(None),
                auth_gate: tokio::sync::Mutex::new(()),
                queue: Mutex::new(CommandQueue {
                    commands: VecDeque::new(),
                    in_progress: false,
                    ignore_next_code: None,
                }),
                state: Mutex::new(SessionState {
                    authenticated: false,
                    authenticating: false,
                    features: None,
                    system: None,
                    transfer_type: None,
                    use_list,
                }),
                generation: AtomicU64::new(0),
                pasv_active: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Runs a command through the queue: reconnects a dead control channel,
    ///  interleaves the implicit auth chain for the first user-visible
    ///  command, then awaits the paired reply.
    pub async fn execute(
        &self,
        line: &str,
        expects_mark: Option<MarkExpectation>,
    ) -> anyhow::Result<Response> {
        self.ensure_connected().await?;
        if !self.is_authenticated() && !is_auth_exempt(line) {
            self.ensure_authenticated().await?;
        }
        self.core.execute_direct(line, expects_mark).await
    }

    /// Explicit authentication. Unlike the implicit path, which waits for a
    ///  chain already in flight, calling this while one runs is an error.
    pub async fn authenticate(&self) -> anyhow::Result<()> {
        if self.core.state.lock().unwrap().authenticating {
            bail!("this client is already authenticating");
        }
        self.ensure_connected().await?;
        self.ensure_authenticated().await
    }

    pub async fn ensure_connected(&self) -> anyhow::Result<()> {
        let mut conn = self.core.conn.lock().await;
        if conn.as_ref().is_some_and(|c| c.is_open()) {
            return Ok(());
        }

        if let Some(previous) = conn.take() {
            debug!("control channel is gone, recreating it");
            previous.shutdown().await;
            // login state belongs to the old connection; features survive
            self.core.state.lock().unwrap().authenticated = false;
        }

        let (channel, responses) = ControlChannel::connect(
            &self.core.config.host,
            self.core.config.port,
            self.core.config.timeout,
            self.core.events.clone(),
        )
        .await?;

        let generation = self.core.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let core = self.core.clone();
        tokio::spawn(async move {
            let mut responses = responses;
            while let Some(response) = responses.recv().await {
                core.on_response(response).await;
            }
            if core.generation.load(Ordering::SeqCst) == generation {
                core.fail_pending("control connection closed");
            }
        });

        *conn = Some(channel);
        Ok(())
    }

    async fn ensure_authenticated(&self) -> anyhow::Result<()> {
        if self.is_authenticated() {
            return Ok(());
        }
        let _gate = self.core.auth_gate.lock().await;
        if self.is_authenticated() {
            // somebody else ran the chain while we waited
            return Ok(());
        }

        self.core.state.lock().unwrap().authenticating = true;
        let result = self.auth_chain().await;
        {
            let mut state = self.core.state.lock().unwrap();
            state.authenticating = false;
            if result.is_ok() {
                state.authenticated = true;
            }
        }
        result
    }

    /// FEAT/SYST probe, then USER/PASS, then TYPE I. Probe failures are
    ///  non-fatal; login failures surface to the triggering command.
    async fn auth_chain(&self) -> anyhow::Result<()> {
        debug!("running implicit authentication");

        let features_cached = self.core.state.lock().unwrap().features.is_some();
        if !features_cached {
            let features = match self.core.execute_direct("FEAT", None).await {
                Ok(reply) => parse_features(&reply.text),
                Err(e) => {
                    debug!("FEAT probe failed, assuming no extended features: {:#}", e);
                    FxHashSet::default()
                }
            };
            match self.core.execute_direct("SYST", None).await {
                Ok(reply) if reply.code == 215 => {
                    self.core.state.lock().unwrap().system = Some(reply.text.to_lowercase());
                }
                Ok(reply) => trace!("unexpected SYST reply code {}, ignoring", reply.code),
                Err(e) => debug!("SYST probe failed: {:#}", e),
            }
            self.core.state.lock().unwrap().features = Some(features);
        }

        let user = self.core.config.user.clone();
        let pass = self.core.config.pass.clone();

        let user_reply = self
            .core
            .execute_direct(&format!("USER {}", user), None)
            .await?;
        match user_reply.code {
            230 => {}
            331 | 332 => {
                let pass_reply = self
                    .core
                    .execute_direct(&format!("PASS {}", pass), None)
                    .await?;
                match pass_reply.code {
                    230 | 202 => {}
                    332 => {
                        // ACCT has no real-world support; try it, but never
                        // leave the caller without an answer
                        match self.core.execute_direct("ACCT", None).await {
                            Ok(reply) if reply.code == 230 || reply.code == 202 => {}
                            _ => bail!("account required for login"),
                        }
                    }
                    code => bail!("unexpected reply to PASS: {} {}", code, pass_reply.text),
                }
            }
            code => bail!("unexpected reply to USER: {} {}", code, user_reply.text),
        }

        self.core.execute_direct("TYPE I", None).await?;
        self.core.state.lock().unwrap().transfer_type = Some(TransferType::Image);
        debug!("authenticated as {}", user);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.core.state.lock().unwrap().authenticated
    }

    pub fn has_feat(&self, feature: &str) -> bool {
        let feature = feature.to_lowercase();
        self.core
            .state
            .lock()
            .unwrap()
            .features
            .as_ref()
            .is_some_and(|f| f.contains(&feature))
    }

    pub fn system(&self) -> Option<String> {
        self.core.state.lock().unwrap().system.clone()
    }

    pub fn transfer_type(&self) -> Option<TransferType> {
        self.core.state.lock().unwrap().transfer_type
    }

    pub fn set_transfer_type(&self, transfer_type: TransferType) {
        self.core.state.lock().unwrap().transfer_type = Some(transfer_type);
    }

    pub fn use_list(&self) -> bool {
        self.core.state.lock().unwrap().use_list
    }

    pub fn set_use_list(&self) {
        self.core.state.lock().unwrap().use_list = true;
    }

    /// Claims the session's single passive transfer slot, failing fast when
    ///  one is already in flight.
    pub fn acquire_passive_slot(&self) -> anyhow::Result<PasvGuard> {
        PasvGuard::try_acquire(&self.core.pasv_active)
    }

    /// Closes the control connection, fails all pending commands and resets
    ///  login state and feature cache.
    pub async fn shutdown(&self) {
        let conn = self.core.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }
        self.core.fail_pending("session destroyed");

        let mut state = self.core.state.lock().unwrap();
        state.authenticated = false;
        state.authenticating = false;
        state.features = None;
        state.system = None;
        state.transfer_type = None;
    }
}

impl DispatchCore {
    async fn execute_direct(
        &self,
        line: &str,
        expects_mark: Option<MarkExpectation>,
    ) -> anyhow::Result<Response> {
        let line = frame_command(line);
        if line.is_empty() {
            bail!("empty command");
        }

        let rx = {
            let (command, rx) = Command::new(line, expects_mark);
            self.queue.lock().unwrap().commands.push_back(command);
            rx
        };
        self.pump().await;

        match rx.await {
            Ok(result) => result,
            Err(_) => bail!("control connection closed"),
        }
    }

    /// Writes the queue head if nothing is in flight. A failed write fails
    ///  that command and tries the next one.
    async fn pump(&self) {
        loop {
            let line = {
                let mut queue = self.queue.lock().unwrap();
                if queue.in_progress {
                    return;
                }
                match queue.commands.front().map(|head| head.line.clone()) {
                    None => return,
                    Some(line) => {
                        queue.in_progress = true;
                        line
                    }
                }
            };

            debug!(
                "sending command {}",
                line.split_whitespace().next().unwrap_or("")
            );
            let sent = {
                let conn = self.conn.lock().await;
                match conn.as_ref() {
                    Some(conn) => conn.send(&line).await,
                    None => Err(anyhow!("control connection closed")),
                }
            };

            match sent {
                Ok(()) => return,
                Err(e) => {
                    warn!("cannot write command to the control connection: {:#}", e);
                    let failed = {
                        let mut queue = self.queue.lock().unwrap();
                        queue.in_progress = false;
                        queue.commands.pop_front()
                    };
                    if let Some(mut failed) = failed {
                        failed.complete(Err(e));
                    }
                }
            }
        }
    }

    async fn on_response(&self, response: Response) {
        match self.pair_response(&response) {
            Paired::Dropped | Paired::MarkDelivered => {}
            Paired::SilentlyConsumed => self.pump().await,
            Paired::Terminal(mut command, result) => {
                command.complete(result);
                self.pump().await;
            }
        }
    }

    /// The pairing state machine: matches one response against the queue
    ///  head. Must not be given the chance to interleave with itself - the
    ///  single response loop is the only caller.
    fn pair_response(&self, response: &Response) -> Paired {
        let mut queue = self.queue.lock().unwrap();

        if queue.commands.is_empty() {
            trace!("no command in flight, dropping response {}", response.code);
            return Paired::Dropped;
        }
        if response.code == 220 {
            trace!("dropping server greeting");
            return Paired::Dropped;
        }

        if response.is_mark() {
            let deliver = {
                let head = queue.commands.front().expect("queue checked non-empty");
                match &head.expects_mark {
                    None => {
                        trace!("unsolicited mark {}, dropping", response.code);
                        None
                    }
                    Some(expectation) if !expectation.marks.contains(&response.code) => {
                        trace!(
                            "mark {} is not one the head command expects, dropping",
                            response.code
                        );
                        None
                    }
                    Some(expectation) => Some(expectation.ignore),
                }
            };
            let Some(ignore) = deliver else {
                return Paired::Dropped;
            };
            if let Some(code) = ignore {
                queue.ignore_next_code = Some(code);
            }
            // the transfer is in flight now: the command completes with the
            // mark but keeps its queue slot until the terminal arrives
            queue
                .commands
                .front_mut()
                .expect("queue checked non-empty")
                .complete(Ok(response.clone()));
            return Paired::MarkDelivered;
        }

        if queue.ignore_next_code == Some(response.code) {
            trace!("swallowing transfer terminal {}", response.code);
            queue.ignore_next_code = None;
            let _ = queue.commands.pop_front();
            queue.in_progress = false;
            return Paired::SilentlyConsumed;
        }

        let command = queue.commands.pop_front().expect("queue checked non-empty");
        queue.in_progress = false;
        // a transfer that ends in an error instead of its suppressed
        // terminal must not leave the ignore code armed
        if let (Some(expectation), Some(armed)) = (&command.expects_mark, queue.ignore_next_code) {
            if expectation.ignore == Some(armed) {
                queue.ignore_next_code = None;
            }
        }
        drop(queue);

        let result = if response.is_error() {
            Err(ReplyError::from_response(response).into())
        } else {
            Ok(response.clone())
        };
        Paired::Terminal(command, result)
    }

    fn fail_pending(&self, reason: &str) {
        let mut drained = {
            let mut queue = self.queue.lock().unwrap();
            queue.in_progress = false;
            queue.ignore_next_code = None;
            queue.commands.drain(..).collect::<Vec<_>>()
        };
        if !drained.is_empty() {
            debug!("failing {} pending command(s): {}", drained.len(), reason);
        }
        for command in &mut drained {
            command.complete(Err(anyhow!("{}", reason)));
        }
    }
}

/// Commands of the auth chain itself must not re-trigger it.
fn is_auth_exempt(line: &str) -> bool {
    let verb = line.split_whitespace().next().unwrap_or("");
    ["feat", "syst", "user", "pass"]
        .iter()
        .any(|exempt| verb.eq_ignore_ascii_case(exempt))
}

/// Trims the line and uppercases the verb; arguments (paths!) stay as given.
fn frame_command(line: &str) -> String {
    let line = line.trim();
    match line.split_once(' ') {
        Some((verb, rest)) => format!("{} {}", verb.to_ascii_uppercase(), rest),
        None => line.to_ascii_uppercase(),
    }
}

/// FEAT reply body minus its first and last line, trimmed, lowercased.
fn parse_features(text: &str) -> FxHashSet<String> {
    let lines = text.lines().collect::<Vec<_>>();
    if lines.len() <= 2 {
        return FxHashSet::default();
    }
    lines[1..lines.len() - 1]
        .iter()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use tokio::sync::mpsc;

    use crate::config::SessionConfig;

    use super::*;

    #[rstest]
    #[case::feat("feat", true)]
    #[case::feat_upper("FEAT", true)]
    #[case::syst("syst", true)]
    #[case::user_with_arg("USER anonymous", true)]
    #[case::pass_with_arg("pass secret", true)]
    #[case::pwd("PWD", false)]
    #[case::noop("noop", false)]
    #[case::stor("STOR file", false)]
    #[case::empty("", false)]
    fn test_is_auth_exempt(#[case] line: &str, #[case] expected: bool) {
        assert_eq!(is_auth_exempt(line), expected);
    }

    #[rstest]
    #[case::bare_verb("feat", "FEAT")]
    #[case::verb_with_arg("retr /Some/File.txt", "RETR /Some/File.txt")]
    #[case::arg_case_preserved("stor /CaseSensitive", "STOR /CaseSensitive")]
    #[case::trimmed("  pwd  ", "PWD")]
    #[case::empty("   ", "")]
    fn test_frame_command(#[case] line: &str, #[case] expected: &str) {
        assert_eq!(frame_command(line), expected);
    }

    #[rstest]
    #[case::typical("Features:\n UTF8\n EPSV\nEnd", vec!["utf8", "epsv"])]
    #[case::single_line("End", vec![])]
    #[case::first_and_last_only("Features:\nEnd", vec![])]
    #[case::blank_body_lines_dropped("Features:\n UTF8\n\n  \nEnd", vec!["utf8"])]
    #[case::multi_word_lines_kept("Features:\n REST STREAM\nEnd", vec!["rest stream"])]
    fn test_parse_features(#[case] text: &str, #[case] expected: Vec<&str>) {
        let expected = expected
            .into_iter()
            .map(str::to_string)
            .collect::<FxHashSet<_>>();
        assert_eq!(parse_features(text), expected);
    }

    fn test_core() -> Arc<DispatchCore> {
        let (tx, _rx) = mpsc::channel(8);
        Dispatcher::new(Arc::new(SessionConfig::default()), EventSink::new(tx)).core
    }

    fn response(code: u16, text: &str) -> Response {
        Response {
            code,
            text: text.to_string(),
        }
    }

    fn enqueue_in_flight(
        core: &DispatchCore,
        line: &str,
        expects_mark: Option<MarkExpectation>,
    ) -> tokio::sync::oneshot::Receiver<anyhow::Result<Response>> {
        let (command, rx) = Command::new(line.to_string(), expects_mark);
        let mut queue = core.queue.lock().unwrap();
        queue.commands.push_back(command);
        queue.in_progress = true;
        rx
    }

    #[test]
    fn test_empty_queue_drops_response() {
        let core = test_core();
        assert!(matches!(
            core.pair_response(&response(150, "opening")),
            Paired::Dropped
        ));
        assert!(matches!(
            core.pair_response(&response(226, "done")),
            Paired::Dropped
        ));
    }

    #[test]
    fn test_greeting_never_advances_the_queue() {
        let core = test_core();
        let mut rx = enqueue_in_flight(&core, "SYST", None);

        assert!(matches!(
            core.pair_response(&response(220, "ready")),
            Paired::Dropped
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(core.queue.lock().unwrap().commands.len(), 1);

        // the actual reply still pairs normally afterwards
        match core.pair_response(&response(215, "UNIX Type: L8")) {
            Paired::Terminal(mut command, result) => {
                command.complete(result);
            }
            _ => panic!("expected terminal pairing"),
        }
        assert_eq!(rx.try_recv().unwrap().unwrap().code, 215);
        assert!(core.queue.lock().unwrap().commands.is_empty());
    }

    #[test]
    fn test_unsolicited_mark_is_dropped() {
        let core = test_core();
        let mut rx = enqueue_in_flight(&core, "PWD", None);

        assert!(matches!(
            core.pair_response(&response(150, "opening")),
            Paired::Dropped
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(core.queue.lock().unwrap().commands.len(), 1);
        assert!(core.queue.lock().unwrap().in_progress);
    }

    #[test]
    fn test_mark_outside_expected_set_is_dropped() {
        let core = test_core();
        let expectation = MarkExpectation {
            marks: vec![125, 150],
            ignore: Some(226),
        };
        let mut rx = enqueue_in_flight(&core, "RETR f", Some(expectation));

        assert!(matches!(
            core.pair_response(&response(110, "restart marker")),
            Paired::Dropped
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(core.queue.lock().unwrap().ignore_next_code, None);
    }

    #[test]
    fn test_expected_mark_completes_but_keeps_queue_slot() {
        let core = test_core();
        let mut rx = enqueue_in_flight(&core, "RETR f", Some(MarkExpectation::transfer()));

        assert!(matches!(
            core.pair_response(&response(150, "opening")),
            Paired::MarkDelivered
        ));
        assert_eq!(rx.try_recv().unwrap().unwrap().code, 150);
        {
            let queue = core.queue.lock().unwrap();
            assert_eq!(queue.commands.len(), 1);
            assert!(queue.in_progress);
            assert_eq!(queue.ignore_next_code, Some(226));
        }

        // the suppressed terminal pops the slot without another delivery
        assert!(matches!(
            core.pair_response(&response(226, "done")),
            Paired::SilentlyConsumed
        ));
        let queue = core.queue.lock().unwrap();
        assert!(queue.commands.is_empty());
        assert!(!queue.in_progress);
        assert_eq!(queue.ignore_next_code, None);
    }

    #[test]
    fn test_error_terminal_carries_reply_error() {
        let core = test_core();
        let mut rx = enqueue_in_flight(&core, "DELE f", None);

        match core.pair_response(&response(550, "No such file")) {
            Paired::Terminal(mut command, result) => command.complete(result),
            _ => panic!("expected terminal pairing"),
        }
        let err = rx.try_recv().unwrap().unwrap_err();
        let reply = err.downcast_ref::<ReplyError>().expect("typed reply error");
        assert_eq!(reply.code, 550);
        assert_eq!(reply.text, "No such file");
    }

    #[test]
    fn test_failed_transfer_clears_armed_ignore() {
        let core = test_core();
        let mut rx = enqueue_in_flight(&core, "RETR f", Some(MarkExpectation::transfer()));

        assert!(matches!(
            core.pair_response(&response(150, "opening")),
            Paired::MarkDelivered
        ));
        assert_eq!(rx.try_recv().unwrap().unwrap().code, 150);

        // the transfer dies with 426 instead of the suppressed 226
        match core.pair_response(&response(426, "connection closed")) {
            Paired::Terminal(mut command, result) => {
                // one-shot guard: the mark already completed this command
                assert!(command.is_completed());
                command.complete(result);
            }
            _ => panic!("expected terminal pairing"),
        }
        let queue = core.queue.lock().unwrap();
        assert!(queue.commands.is_empty());
        assert_eq!(queue.ignore_next_code, None);
    }

    #[test]
    fn test_fail_pending_drains_everything() {
        let core = test_core();
        let mut rx1 = enqueue_in_flight(&core, "PWD", None);
        let (command, mut rx2) = Command::new("SYST".to_string(), None);
        core.queue.lock().unwrap().commands.push_back(command);

        core.fail_pending("control connection closed");

        assert!(rx1.try_recv().unwrap().is_err());
        assert!(rx2.try_recv().unwrap().is_err());
        let queue = core.queue.lock().unwrap();
        assert!(queue.commands.is_empty());
        assert!(!queue.in_progress);
    }
}
