use std::io;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::watch;

/// Shutdown request broadcast by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it does not take longer than `timeout` to
/// wind down. Ideally, open work is persisted or finished in an orderly
/// manner, but no new work is accepted. After the timeout the runtime stops
/// regardless of what the receivers do.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced
    /// shutdown.
    pub timeout: Option<Duration>,
}

type ShutdownChannel = (
    watch::Sender<Option<Shutdown>>,
    watch::Receiver<Option<Shutdown>>,
);

/// Global [`ShutdownChannel`] for all services.
static SHUTDOWN: OnceCell<ShutdownChannel> = OnceCell::new();

/// Notifies a service about an upcoming shutdown.
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Waits for a shutdown.
    ///
    /// This method is cancellation safe and can be used in `select!`.
    pub async fn notified(&mut self) -> Shutdown {
        while self.0.changed().await.is_ok() {
            if let Some(shutdown) = &*self.0.borrow() {
                return shutdown.clone();
            }
        }

        Shutdown { timeout: None }
    }
}

/// Monitors process signals and coordinates graceful shutdown.
///
/// Services obtain a [`ShutdownHandle`] through [`Controller::shutdown_handle`]
/// and poll it in their main loop. On SIGTERM they receive a [`Shutdown`] with
/// the configured timeout; SIGINT and SIGQUIT force an immediate shutdown.
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts a controller that monitors shutdown signals.
    pub fn start(shutdown_timeout: Duration) {
        tokio::spawn(monitor_shutdown(shutdown_timeout));
    }

    /// Initiates the shutdown process of the system programmatically.
    ///
    /// This behaves identically to delivering the corresponding signal:
    /// `graceful` maps to SIGTERM semantics, non-graceful to SIGINT.
    pub fn trigger_shutdown(timeout: Option<Duration>) {
        let (tx, _) = SHUTDOWN.get_or_init(|| watch::channel(None));
        tx.send(Some(Shutdown { timeout })).ok();
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        let (_, ref rx) = SHUTDOWN.get_or_init(|| watch::channel(None));
        ShutdownHandle(rx.clone())
    }

    /// Waits for the shutdown and its timeout to elapse.
    ///
    /// Resolves once the grace period of the first shutdown signal has passed,
    /// or immediately when the shutdown is upgraded by a second signal.
    pub async fn shutdown() {
        let mut handle = Controller::shutdown_handle();
        let shutdown = handle.notified().await;

        if let Some(timeout) = shutdown.timeout {
            tokio::select! {
                _ = handle.notified() => (),
                _ = tokio::time::sleep(timeout) => (),
            }
        }
    }
}

#[cfg(unix)]
async fn monitor_shutdown(timeout: Duration) -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_quit = signal(SignalKind::quit())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    let (tx, _) = SHUTDOWN.get_or_init(|| watch::channel(None));

    loop {
        let timeout = tokio::select! {
            biased;

            Some(()) = sig_int.recv() => {
                logsentry_log::info!("SIGINT received, exiting");
                None
            }
            Some(()) = sig_quit.recv() => {
                logsentry_log::info!("SIGQUIT received, exiting");
                None
            }
            Some(()) = sig_term.recv() => {
                logsentry_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
                Some(timeout)
            }

            else => break,
        };

        tx.send(Some(Shutdown { timeout })).ok();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_programmatic_shutdown_reaches_handles() {
        let mut handle = Controller::shutdown_handle();

        Controller::trigger_shutdown(Some(Duration::from_secs(7)));

        let shutdown = handle.notified().await;
        assert_eq!(shutdown.timeout, Some(Duration::from_secs(7)));

        // Handles created after the signal observe it as well.
        let mut late = Controller::shutdown_handle();
        assert!(late.notified().await.timeout.is_some());
    }
}

#[cfg(windows)]
async fn monitor_shutdown(timeout: Duration) -> io::Result<()> {
    use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close};

    let mut ctrl_c = ctrl_c()?;
    let mut ctrl_break = ctrl_break()?;
    let mut ctrl_close = ctrl_close()?;

    let (tx, _) = SHUTDOWN.get_or_init(|| watch::channel(None));

    loop {
        tokio::select! {
            biased;

            Some(()) = ctrl_c.recv() => logsentry_log::info!("CTRL-C received, exiting"),
            Some(()) = ctrl_break.recv() => logsentry_log::info!("CTRL-BREAK received, exiting"),
            Some(()) = ctrl_close.recv() => logsentry_log::info!("CTRL-CLOSE received, exiting"),

            else => break,
        };

        tx.send(Some(Shutdown { timeout: None })).ok();
    }

    Ok(())
}
