//! Cooperative single-threaded event loop driving a local tty against a
//! remote mosh-server: reads keystrokes, predicts them locally, and applies
//! the server's synchronized terminal diffs to the real screen.

use std::env;
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::Parser;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use mosh_crypto::Base64Key;
use mosh_terminal::display;
use mosh_terminal::{CompleteTerminal, DisplayPreference, Framebuffer, OverlayManager, UserStream};
use mosh_transport::{Assembler, Connection, Fragment, Instruction, TransportReceiver, TransportSender};

/// Connects to a running mosh-server and drives the local terminal.
#[derive(Parser, Debug)]
#[command(name = "mosh-client", about = "Mosh state-synchronization client")]
struct Args {
    /// Host the server is listening on.
    host: String,
    /// UDP port printed by `mosh-server`'s `MOSH CONNECT` banner.
    port: u16,
}

/// Restores the local tty to cooked mode and the primary screen on drop,
/// however the process exits.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode().context("enabling raw mode")?;
        print!("{}", display::OPEN_SEQUENCE);
        io::stdout().flush()?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        print!("{}", display::CLOSE_SEQUENCE);
        let _ = io::stdout().flush();
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

fn prediction_preference_from_env() -> DisplayPreference {
    match env::var("MOSH_PREDICTION_DISPLAY").as_deref() {
        Ok("always") => DisplayPreference::Always,
        Ok("never") => DisplayPreference::Never,
        Ok("experimental") => DisplayPreference::Experimental,
        _ => DisplayPreference::Adaptive,
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let key_str = env::var("MOSH_KEY").map_err(|_| anyhow!("MOSH_KEY must be set in the environment"))?;
    env::remove_var("MOSH_KEY");
    let key = Base64Key::from_printable(&key_str).context("parsing MOSH_KEY")?;

    let remote = (args.host.as_str(), args.port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}:{}", args.host, args.port))?
        .next()
        .ok_or_else(|| anyhow!("{}:{} did not resolve to an address", args.host, args.port))?;

    let mut connection = Connection::connect_client(remote, &key).context("connecting to server")?;

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let now = Instant::now();

    let mut sender: TransportSender<UserStream> = TransportSender::new(UserStream::new(), now);
    let mut receiver: TransportReceiver<CompleteTerminal> =
        TransportReceiver::new(CompleteTerminal::new(cols as usize, rows as usize), now);
    let mut assembler = Assembler::new();

    let mut overlays = OverlayManager::new(now);
    overlays.predictions.set_display_preference(prediction_preference_from_env());

    let mut shown = Framebuffer::new(cols as usize, rows as usize);
    let mut screen_initialized = false;

    let _guard = TerminalGuard::enter()?;

    let stdin_fd = io::stdin().as_raw_fd();
    let mut stdout = io::stdout();

    loop {
        let now = Instant::now();

        if sender.is_done() {
            break;
        }
        sender.check_shutdown_timeout(now);
        if sender.is_done() {
            break;
        }

        let wait = [
            sender.wait_time(now),
            overlays.wait_time(now),
            Duration::from_millis(1000),
        ]
        .into_iter()
        .min()
        .unwrap_or(Duration::from_millis(250));

        let stdin_borrowed = unsafe { BorrowedFd::borrow_raw(stdin_fd) };
        let socket_borrowed = unsafe { BorrowedFd::borrow_raw(connection.as_raw_fd()) };
        let mut fds = [
            PollFd::new(stdin_borrowed, PollFlags::POLLIN),
            PollFd::new(socket_borrowed, PollFlags::POLLIN),
        ];

        let timeout = PollTimeout::try_from(wait).unwrap_or(PollTimeout::MAX);
        poll(&mut fds, timeout).context("polling stdin and socket")?;

        let stdin_ready = fds[0]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false);
        let socket_ready = fds[1]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false);

        if stdin_ready {
            let mut buf = [0u8; 4096];
            match io::stdin().read(&mut buf) {
                Ok(0) => sender.start_shutdown(now),
                Ok(n) => {
                    let fb_for_prediction = receiver.latest_state().fb().clone();
                    if let Some(state) = sender.current_state_mut() {
                        for &byte in &buf[..n] {
                            state.push_byte(byte);
                            overlays.predictions.new_user_byte(byte, &fb_for_prediction, now);
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
                    handle_instruction(&instruction, &mut sender, &mut receiver, &mut overlays, now)?;
                }
            }
        }

        overlays
            .predictions
            .set_local_frame_sent(sender.last_sent_num());

        sender.tick(now, &mut connection)?;

        if let Some(exception) = connection.take_send_exception() {
            tracing::warn!(error = %exception, "transient send failure");
        }

        let shown_now = overlays.apply(receiver.latest_state().fb(), now);
        if !screen_initialized || shown_now != shown {
            let bytes = display::new_frame(screen_initialized, &shown, &shown_now);
            stdout.write_all(bytes.as_bytes())?;
            stdout.flush()?;
            shown = shown_now;
            screen_initialized = true;
        }
    }

    Ok(())
}

fn handle_instruction(
    instruction: &Instruction,
    sender: &mut TransportSender<UserStream>,
    receiver: &mut TransportReceiver<CompleteTerminal>,
    overlays: &mut OverlayManager,
    now: Instant,
) -> anyhow::Result<()> {
    let outcome = receiver.process_instruction(instruction, now)?;
    // Feed ack/throwaway through unconditionally, before the replay/old_num
    // checks inside process_instruction can drop the instruction: these
    // fields describe the remote's view of our sent states, not the diff
    // this Instruction carries, so they're valid even when the diff isn't.
    sender.apply_ack(instruction.ack_num, instruction.throwaway_num);
    if let Some(applied) = outcome {
        sender.note_heard_from_peer(now);
        overlays.notifications.server_heard(now);
        overlays.predictions.set_local_frame_acked(applied.ack_num);
        overlays.predictions.set_local_frame_late_acked(applied.ack_num);
        sender.request_prompt_ack();
    }
    sender.note_remote_ack_num(receiver.ack_num());

    if instruction.is_shutdown() {
        sender.start_shutdown(now);
        sender.note_shutdown_acknowledged();
    }

    Ok(())
}
