use super::RegisterError;

#[cfg(unix)]
pub(super) use self::unix::Signals;
#[cfg(windows)]
pub(super) use self::windows::Signals;

#[cfg(unix)]
mod unix {
    use super::RegisterError;
    use tokio::signal::unix::{signal, Signal, SignalKind};

    #[derive(Debug)]
    pub(crate) struct Signals {
        interrupt: Signal,
        terminate: Signal,
    }

    impl Signals {
        pub(crate) fn new() -> Result<Self, RegisterError> {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        pub(crate) async fn recv(&mut self) {
            tokio::select! {
                _ = self.interrupt.recv() => tracing::debug!("Received SIGINT"),
                _ = self.terminate.recv() => tracing::debug!("Received SIGTERM"),
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::RegisterError;
    use tokio::signal::windows::{ctrl_break, ctrl_c, CtrlBreak, CtrlC};

    #[derive(Debug)]
    pub(crate) struct Signals {
        ctrl_break: CtrlBreak,
        ctrl_c: CtrlC,
    }

    impl Signals {
        pub(crate) fn new() -> Result<Self, RegisterError> {
            Ok(Self {
                ctrl_break: ctrl_break()?,
                ctrl_c: ctrl_c()?,
            })
        }

        pub(crate) async fn recv(&mut self) {
            tokio::select! {
                _ = self.ctrl_break.recv() => tracing::debug!("Received Ctrl-Break"),
                _ = self.ctrl_c.recv() => tracing::debug!("Received Ctrl-C"),
            }
        }
    }
}
