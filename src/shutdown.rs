//! Termination signal handling.

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Listens for SIGHUP, SIGINT and SIGTERM; on the first one prints an
/// acknowledgement and cancels `token`.
///
/// # Errors
///
/// Fails if a signal listener cannot be registered.
pub fn install_signal_handlers(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let caught = tokio::select! {
            _ = hangup.recv() => Signal::SIGHUP,
            _ = interrupt.recv() => Signal::SIGINT,
            _ = terminate.recv() => Signal::SIGTERM,
            _ = token.cancelled() => return,
        };
        println!("Caught signal ({})", caught as i32);
        token.cancel();
    }))
}
