//! PTY Relay
//!
//! Runs a program under a `ChildProcessHost` and relays the invoking
//! terminal's stdin/stdout through it. Used for testing the host by hand.

use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::process::ExitCode;
use std::time::Duration;

use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use ptyhost::{ChildProcessHost, ChildState, HostConfig, Side, WindowSize};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PUMP_INTERVAL: Duration = Duration::from_millis(20);

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<String> = None;
    let mut cols: Option<u16> = None;
    let mut rows: Option<u16> = None;
    let mut command: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--cols" => {
                i += 1;
                cols = args.get(i).and_then(|v| v.parse().ok());
            },
            "-r" | "--rows" => {
                i += 1;
                rows = args.get(i).and_then(|v| v.parse().ok());
            },
            "--config" => {
                i += 1;
                config_path = args.get(i).cloned();
            },
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            },
            "--" => {
                command = args[i + 1..].to_vec();
                break;
            },
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                return ExitCode::FAILURE;
            },
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => match HostConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            },
        },
        None => HostConfig::default(),
    };

    let (term_cols, term_rows) = terminal_size().unwrap_or((80, 24));
    config.window = WindowSize::new(cols.unwrap_or(term_cols), rows.unwrap_or(term_rows));
    if let Some((program, program_args)) = command.split_first() {
        config.program = program.clone();
        config.args = program_args.to_vec();
    }

    tracing::info!(
        "Starting {} on a {}x{} terminal",
        config.program,
        config.window.cols,
        config.window.rows
    );

    let mut host = ChildProcessHost::new(config);
    if let Err(e) = host.spawn_default() {
        eprintln!("Failed to spawn: {}", e);
        return ExitCode::FAILURE;
    }

    let code = {
        let _raw_guard = match RawModeGuard::new() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!("stdin is not a terminal, not switching to raw mode: {}", e);
                None
            },
        };
        match relay(&mut host) {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("Relay failed: {}", e);
                1
            },
        }
    };

    for event in host.drain_events() {
        eprintln!("{}", event);
    }
    ExitCode::from(code.clamp(0, 255) as u8)
}

/// Move bytes until the child exits; returns its exit code
fn relay(host: &mut ChildProcessHost) -> Result<i32, Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut stdin_open = true;
    let mut buf = [0u8; 4096];

    loop {
        if stdin_open {
            let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
            if poll(&mut fds, PollTimeout::ZERO)? > 0 {
                // SAFETY: buf is valid for writes of its length
                let n = unsafe {
                    libc::read(stdin.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n <= 0 {
                    stdin_open = false;
                } else {
                    host.write(&buf[..n as usize])?;
                }
            }
        }

        let mut write_err = None;
        host.pump(PUMP_INTERVAL, &mut |side: Side, bytes: &[u8]| {
            if side == Side::Master && write_err.is_none() {
                if let Err(e) = stdout.write_all(bytes).and_then(|_| stdout.flush()) {
                    write_err = Some(e);
                }
            }
        })?;
        if let Some(e) = write_err {
            return Err(e.into());
        }

        match &host.child().state {
            ChildState::Running => {},
            ChildState::Exited(code) => return Ok(*code),
            ChildState::Failed(_) | ChildState::NotStarted => return Ok(1),
        }
    }
}

fn print_help() {
    println!("pty-relay - run a program on a pseudoterminal and relay I/O");
    println!();
    println!("USAGE:");
    println!("    pty-relay [OPTIONS] [-- PROGRAM [ARGS...]]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --cols <N>       Terminal columns (default: current terminal)");
    println!("    -r, --rows <N>       Terminal rows (default: current terminal)");
    println!("    --config <FILE>      JSON host configuration");
    println!("    -h, --help           Show this help message");
    println!();
    println!("Without a PROGRAM the configured program ($SHELL) is started.");
    println!("Set RUST_LOG=debug for verbose output.");
}

/// Size of the invoking terminal
fn terminal_size() -> Option<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ fills in the winsize we pass
    let result = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };

    if result == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

/// RAII guard for raw terminal mode
struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    fn new() -> nix::Result<Self> {
        let original = termios::tcgetattr(io::stdin())?;

        let mut raw = original.clone();

        // Disable canonical mode, echo and signal generation
        raw.local_flags.remove(LocalFlags::ICANON);
        raw.local_flags.remove(LocalFlags::ECHO);
        raw.local_flags.remove(LocalFlags::ISIG);
        raw.local_flags.remove(LocalFlags::IEXTEN);

        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw)?;

        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original);
    }
}
