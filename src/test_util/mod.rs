//! In-process scripted FTP server for exercising the dispatcher and the
//!  session facade against real sockets. A script is a linear sequence of
//!  steps; any deviation by the client fails the script, and the test when
//!  it collects the report.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

pub enum ScriptStep {
    /// push bytes to the client without waiting for a command (greetings,
    ///  unsolicited replies, transfer terminals)
    Send(&'static str),
    /// read one command line, require it to match, reply
    Expect {
        line: &'static str,
        reply: &'static str,
    },
    /// expect `PASV`, bind a data listener and advertise it in a 227 reply
    OpenPassive,
    /// accept the pending data connection, write the payload, close it
    DataSend(&'static str),
    /// accept the pending data connection, read it to EOF, record the bytes
    DataRecv,
    /// accept the pending data connection and hold it open without traffic
    DataHold,
    /// keep all connections alive for a while (lets client-side timeouts
    ///  fire while the sockets are still up)
    Pause(Duration),
    /// drop the current control connection and accept a fresh one
    AcceptAgain,
}

/// Everything the server observed, for post-hoc assertions.
pub struct ServerReport {
    /// command lines received on the control connection(s), in order
    pub lines: Vec<String>,
    /// payloads received over data connections, in order
    pub data: Vec<Vec<u8>>,
}

pub struct ScriptedServer {
    pub addr: SocketAddr,
    handle: JoinHandle<anyhow::Result<ServerReport>>,
}

impl ScriptedServer {
    pub async fn start(script: Vec<ScriptStep>) -> ScriptedServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind scripted server");
        let addr = listener.local_addr().expect("scripted server local addr");
        debug!("scripted server listening on {}", addr);
        let handle = tokio::spawn(run_script(listener, script));
        ScriptedServer { addr, handle }
    }

    /// Awaits the end of the script; panics if the client deviated from it.
    pub async fn finish(self) -> ServerReport {
        self.handle
            .await
            .expect("scripted server panicked")
            .expect("client deviated from the script")
    }
}

async fn run_script(
    listener: TcpListener,
    script: Vec<ScriptStep>,
) -> anyhow::Result<ServerReport> {
    let (control, _) = listener.accept().await?;
    let (mut lines, mut write_half) = split_control(control);

    let mut report = ServerReport {
        lines: Vec::new(),
        data: Vec::new(),
    };
    let mut data_listener: Option<TcpListener> = None;
    let mut held: Vec<TcpStream> = Vec::new();

    for step in script {
        match step {
            ScriptStep::Send(reply) => {
                write_half.write_all(reply.as_bytes()).await?;
            }
            ScriptStep::Expect { line, reply } => {
                let received = next_command(&mut lines).await?;
                if received != line {
                    bail!("expected command {:?}, got {:?}", line, received);
                }
                report.lines.push(received);
                write_half.write_all(reply.as_bytes()).await?;
            }
            ScriptStep::OpenPassive => {
                let received = next_command(&mut lines).await?;
                if received != "PASV" {
                    bail!("expected PASV, got {:?}", received);
                }
                report.lines.push(received);

                let l = TcpListener::bind("127.0.0.1:0").await?;
                let port = l.local_addr()?.port();
                let reply = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                    port / 256,
                    port % 256
                );
                data_listener = Some(l);
                write_half.write_all(reply.as_bytes()).await?;
            }
            ScriptStep::DataSend(payload) => {
                let (mut data, _) = pending_data_listener(&mut data_listener)?.accept().await?;
                data.write_all(payload.as_bytes()).await?;
                data.shutdown().await?;
            }
            ScriptStep::DataRecv => {
                let (mut data, _) = pending_data_listener(&mut data_listener)?.accept().await?;
                let mut payload = Vec::new();
                data.read_to_end(&mut payload).await?;
                report.data.push(payload);
            }
            ScriptStep::DataHold => {
                let (data, _) = pending_data_listener(&mut data_listener)?.accept().await?;
                held.push(data);
            }
            ScriptStep::Pause(duration) => {
                tokio::time::sleep(duration).await;
            }
            ScriptStep::AcceptAgain => {
                let (control, _) = listener.accept().await?;
                let (new_lines, new_write_half) = split_control(control);
                // the previous halves drop here, closing the old connection
                lines = new_lines;
                write_half = new_write_half;
            }
        }
    }
    Ok(report)
}

fn split_control(control: TcpStream) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
    let (read_half, write_half) = control.into_split();
    (BufReader::new(read_half).lines(), write_half)
}

async fn next_command(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> anyhow::Result<String> {
    lines
        .next_line()
        .await?
        .context("client closed the control connection mid-script")
}

fn pending_data_listener(
    data_listener: &mut Option<TcpListener>,
) -> anyhow::Result<&mut TcpListener> {
    data_listener
        .as_mut()
        .context("script error: no passive data listener is open")
}
