//! Session bootstrap and cooperative event loop: prints the connect banner,
//! forks a shell under a PTY, and keeps the terminal-side synchronized state
//! in step with whatever the shell writes, applying received keystrokes to
//! the PTY as they arrive.

use std::env;
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvp, fork, setsid, ForkResult, Pid};

use mosh_crypto::Base64Key;
use mosh_terminal::{CompleteTerminal, UserEvent, UserStream};
use mosh_transport::{Assembler, Connection, Fragment, TransportReceiver, TransportSender};

const DEFAULT_WIDTH: u16 = 80;
const DEFAULT_HEIGHT: u16 = 24;

/// Spawns a shell under a PTY and bridges it to a mosh client over UDP.
#[derive(Parser, Debug)]
#[command(name = "mosh-server", about = "Mosh state-synchronization server")]
struct Args {
    /// UDP port to bind; a free port in the protocol's default range is
    /// chosen if omitted.
    #[arg(short, long)]
    port: Option<u16>,

    /// Terminal color support to pass through to the child shell's `TERM`.
    #[arg(long)]
    colors: Option<String>,

    /// Locale to export to the child shell in place of the one inherited
    /// from the calling environment.
    #[arg(long)]
    locale: Option<String>,

    /// Command to run in place of the user's shell.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

/// Refuses to start with a non-UTF-8 locale, the same fatal-at-startup check
/// the original performs before touching the network: a misconfigured
/// locale produces mojibake the synchronized terminal state can't recover
/// from later.
fn check_locale_utf8() -> anyhow::Result<()> {
    let locale = env::var("LC_ALL")
        .or_else(|_| env::var("LC_CTYPE"))
        .or_else(|_| env::var("LANG"))
        .unwrap_or_default();
    if !locale.is_empty() && !locale.to_uppercase().contains("UTF-8") && !locale.to_uppercase().contains("UTF8") {
        anyhow::bail!("mosh-server requires a UTF-8 locale, but found {locale:?}");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    check_locale_utf8()?;

    if let Some(locale) = &args.locale {
        env::set_var("LC_ALL", locale);
    }
    if let Some(colors) = &args.colors {
        env::set_var("TERM", colors);
    }

    let key = Base64Key::generate();
    let mut connection = Connection::bind_server(args.port, &key).context("binding server socket")?;
    let port = connection.local_port()?;

    // The wrapping ssh session greps stdout for this exact line.
    println!("MOSH CONNECT {port} {}", key.printable_key());
    io::stdout().flush()?;

    let winsize = Winsize {
        ws_row: DEFAULT_HEIGHT,
        ws_col: DEFAULT_WIDTH,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None).context("opening pty")?;

    let shell_argv = shell_command(&args.command)?;

    match unsafe { fork() }.context("forking child shell")? {
        ForkResult::Child => {
            drop(pty.master);
            exec_child(pty.slave, &shell_argv);
        }
        ForkResult::Parent { child } => {
            drop(pty.slave);
            let master = std::fs::File::from(pty.master);
            run(master, child, &mut connection)
        }
    }
}

fn shell_command(command: &[String]) -> anyhow::Result<Vec<CString>> {
    if command.is_empty() {
        let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        Ok(vec![CString::new(shell)?])
    } else {
        command.iter().map(|s| CString::new(s.as_str()).map_err(Into::into)).collect()
    }
}

/// Runs in the forked child: becomes session leader, attaches the PTY slave
/// as its controlling terminal on stdio, and execs the shell. Never returns.
fn exec_child(slave: std::os::fd::OwnedFd, argv: &[CString]) -> ! {
    let slave_fd = slave.as_raw_fd();
    let _ = setsid();
    unsafe {
        nix::libc::ioctl(slave_fd, nix::libc::TIOCSCTTY as _, 0);
    }
    let _ = dup2(slave_fd, 0);
    let _ = dup2(slave_fd, 1);
    let _ = dup2(slave_fd, 2);
    drop(slave);

    let _ = execvp(&argv[0], argv);
    std::process::exit(127);
}

fn set_pty_size(master: &std::fs::File, width: u16, height: u16) {
    let winsize = Winsize {
        ws_row: height,
        ws_col: width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        nix::libc::ioctl(master.as_raw_fd(), nix::libc::TIOCSWINSZ as _, &winsize as *const Winsize);
    }
}

fn child_has_exited(child: Pid) -> bool {
    matches!(
        waitpid(child, Some(WaitPidFlag::WNOHANG)),
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..))
    )
}

fn run(mut master: std::fs::File, child: Pid, connection: &mut Connection) -> anyhow::Result<()> {
    let now = Instant::now();
    let mut sender: TransportSender<CompleteTerminal> =
        TransportSender::new(CompleteTerminal::new(DEFAULT_WIDTH as usize, DEFAULT_HEIGHT as usize), now);
    let mut receiver: TransportReceiver<UserStream> = TransportReceiver::new(UserStream::new(), now);
    let mut assembler = Assembler::new();
    let mut applied_len = 0usize;

    loop {
        let now = Instant::now();

        if child_has_exited(child) {
            sender.start_shutdown(now);
        }
        sender.check_shutdown_timeout(now);
        if sender.is_done() {
            break;
        }

        let wait = sender.wait_time(now).min(Duration::from_millis(1000));

        let master_borrowed = unsafe { BorrowedFd::borrow_raw(master.as_raw_fd()) };
        let socket_borrowed = unsafe { BorrowedFd::borrow_raw(connection.as_raw_fd()) };
        let mut fds = [
            PollFd::new(master_borrowed, PollFlags::POLLIN),
            PollFd::new(socket_borrowed, PollFlags::POLLIN),
        ];
        let timeout = PollTimeout::try_from(wait).unwrap_or(PollTimeout::MAX);
        poll(&mut fds, timeout).context("polling pty and socket")?;

        let master_ready = fds[0].revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false);
        let socket_ready = fds[1].revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false);

        if master_ready {
            let mut buf = [0u8; 4096];
            match master.read(&mut buf) {
                Ok(0) => sender.start_shutdown(now),
                Ok(n) => {
                    if let Some(state) = sender.current_state_mut() {
                        let reply = state.act(&buf[..n]);
                        if !reply.is_empty() {
                            let _ = master.write_all(&reply);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }

        if socket_ready {
            if let Some(datagram) = connection.recv_timeout(Duration::from_millis(0))? {
                let fragment: Fragment = mosh_wire::deserialize(&datagram)?;
                if let Some(instruction) = assembler.add_fragment(fragment)? {
                    let outcome = receiver.process_instruction(&instruction, now)?;
                    // Unconditional: ack_num/throwaway_num describe the
                    // remote's view of our sent states, not this
                    // Instruction's diff, so they're valid even when the
                    // diff itself gets dropped as a replay or out-of-order.
                    sender.apply_ack(instruction.ack_num, instruction.throwaway_num);
                    if outcome.is_some() {
                        sender.note_heard_from_peer(now);
                    }
                    sender.note_remote_ack_num(receiver.ack_num());
                    if instruction.is_shutdown() {
                        sender.note_shutdown_acknowledged();
                    }

                    let actions = receiver.latest_state().actions();
                    if actions.len() > applied_len {
                        let fresh: Vec<UserEvent> = actions[applied_len..].to_vec();
                        applied_len = actions.len();
                        for action in fresh {
                            match action {
                                UserEvent::Byte(b) => {
                                    let _ = master.write_all(&[b]);
                                }
                                UserEvent::Resize { width, height } => {
                                    if let Some(state) = sender.current_state_mut() {
                                        state.resize(width as usize, height as usize);
                                    }
                                    set_pty_size(&master, width, height);
                                }
                            }
                        }
                        if let Some(state) = sender.current_state_mut() {
                            state.register_input_frame(instruction.new_num, now);
                        }
                    }
                }
            }
        }

        if let Some(state) = sender.current_state_mut() {
            state.set_echo_ack(now);
        }

        sender.tick(now, connection)?;

        if let Some(exception) = connection.take_send_exception() {
            tracing::warn!(error = %exception, "transient send failure");
        }
    }

    let _ = waitpid(child, None);
    Ok(())
}
