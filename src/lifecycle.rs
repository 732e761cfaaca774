use crate::error::{LifecycleError, TransportError};
use crate::writer::WriterSummary;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Running,
    Draining,
}

/// Why `wait_for_exit` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Signal,
    ListenerExited,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub writer: WriterSummary,
    /// The writer was still busy when the drain timeout elapsed.
    pub deadline_reached: bool,
    /// Set when the listener gave up on the broker.
    pub transport_failure: Option<String>,
}

/// Sequences the listener and writer tasks: start both, wait for a
/// termination signal, then drain.
pub struct LifecycleController {
    state: watch::Sender<LifecycleState>,
    stop: CancellationToken,
    drain_deadline: CancellationToken,
    drain_timeout: Duration,
    started: bool,
    listener: Option<JoinHandle<Result<(), TransportError>>>,
    writer: Option<JoinHandle<WriterSummary>>,
    transport_failure: Option<String>,
    report: Option<ShutdownReport>,
}

impl LifecycleController {
    pub fn new(drain_timeout: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Self {
            state,
            stop: CancellationToken::new(),
            drain_deadline: CancellationToken::new(),
            drain_timeout,
            started: false,
            listener: None,
            writer: None,
            transport_failure: None,
            report: None,
        }
    }

    /// Cancelled when the listener should unsubscribe and return.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Cancelled when the drain timeout elapses with the writer still busy.
    pub fn drain_deadline_token(&self) -> CancellationToken {
        self.drain_deadline.clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn start<L, W>(&mut self, listener: L, writer: W) -> Result<(), LifecycleError>
    where
        L: Future<Output = Result<(), TransportError>> + Send + 'static,
        W: Future<Output = WriterSummary> + Send + 'static,
    {
        if self.report.is_some() {
            return Err(LifecycleError::Terminated);
        }
        if self.started {
            return Err(LifecycleError::AlreadyStarted);
        }
        self.started = true;
        self.writer = Some(tokio::spawn(writer));
        self.listener = Some(tokio::spawn(listener));
        self.state.send_replace(LifecycleState::Running);
        tracing::info!("pipeline running");
        Ok(())
    }

    /// Resolves when `signal` completes or the listener stops on its own.
    pub async fn wait_for_exit<F>(&mut self, signal: F) -> Exit
    where
        F: Future<Output = ()>,
    {
        let joined = {
            let Some(listener) = self.listener.as_mut() else {
                return Exit::ListenerExited;
            };
            tokio::select! {
                _ = signal => None,
                joined = listener => Some(joined),
            }
        };
        match joined {
            None => {
                tracing::info!("termination signal received");
                Exit::Signal
            }
            Some(joined) => {
                self.listener = None;
                self.record_listener(joined);
                Exit::ListenerExited
            }
        }
    }

    /// Drains the pipeline. Safe to call more than once; later calls return
    /// the first report without touching the tasks again.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        if !self.started {
            let report = ShutdownReport::default();
            self.report = Some(report.clone());
            return report;
        }

        self.state.send_replace(LifecycleState::Draining);
        let deadline = Instant::now() + self.drain_timeout;
        tracing::info!(
            drain_timeout_ms = self.drain_timeout.as_millis() as u64,
            "draining pipeline"
        );

        self.stop.cancel();
        if let Some(listener) = self.listener.take() {
            let joined = listener.await;
            self.record_listener(joined);
        }

        let mut deadline_reached = false;
        let writer = match self.writer.take() {
            Some(mut handle) => match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    deadline_reached = true;
                    tracing::warn!("drain timeout elapsed; dead-lettering remaining records");
                    self.drain_deadline.cancel();
                    handle.await
                }
            },
            None => Ok(WriterSummary::default()),
        };
        let writer = writer.unwrap_or_else(|err| {
            tracing::error!(error = %err, "storage writer task failed");
            WriterSummary::default()
        });

        let report = ShutdownReport {
            writer,
            deadline_reached,
            transport_failure: self.transport_failure.clone(),
        };
        self.report = Some(report.clone());
        self.state.send_replace(LifecycleState::Stopped);
        tracing::info!(
            stored = report.writer.stored,
            dead_lettered = report.writer.dead_lettered,
            dead_letter_failed = report.writer.dead_letter_failed,
            deadline_reached,
            "pipeline stopped"
        );
        report
    }

    fn record_listener(&mut self, joined: Result<Result<(), TransportError>, JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "MQTT listener gave up");
                self.transport_failure = Some(err.to_string());
            }
            Err(err) => {
                tracing::error!(error = %err, "MQTT listener task failed");
                self.transport_failure = Some(err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_listener(stop: CancellationToken) -> impl Future<Output = Result<(), TransportError>> {
        async move {
            stop.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_through_states_once() {
        let mut controller = LifecycleController::new(Duration::from_millis(100));
        let mut states = controller.subscribe();
        assert_eq!(controller.state(), LifecycleState::Stopped);

        let stop = controller.stop_token();
        controller
            .start(idle_listener(stop.clone()), async {
                WriterSummary {
                    stored: 2,
                    dead_lettered: 0,
                    dead_letter_failed: 0,
                }
            })
            .expect("start");
        assert_eq!(controller.state(), LifecycleState::Running);
        assert!(states.has_changed().expect("sender alive"));
        assert_eq!(*states.borrow_and_update(), LifecycleState::Running);

        assert_eq!(
            controller.start(idle_listener(stop.clone()), async { WriterSummary::default() }),
            Err(LifecycleError::AlreadyStarted)
        );

        let report = controller.shutdown().await;
        assert_eq!(report.writer.stored, 2);
        assert!(!report.deadline_reached);
        assert!(stop.is_cancelled());
        assert_eq!(controller.state(), LifecycleState::Stopped);

        assert_eq!(
            controller.start(idle_listener(stop), async { WriterSummary::default() }),
            Err(LifecycleError::Terminated)
        );
    }

    #[tokio::test]
    async fn second_shutdown_returns_first_report() {
        let mut controller = LifecycleController::new(Duration::from_millis(100));
        let stop = controller.stop_token();
        controller
            .start(idle_listener(stop), async {
                WriterSummary {
                    stored: 7,
                    dead_lettered: 1,
                    dead_letter_failed: 0,
                }
            })
            .expect("start");

        let first = controller.shutdown().await;
        let second = controller.shutdown().await;
        assert_eq!(first, second);
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn fires_drain_deadline_when_writer_overruns() {
        let mut controller = LifecycleController::new(Duration::from_millis(30));
        let stop = controller.stop_token();
        let deadline = controller.drain_deadline_token();
        controller
            .start(idle_listener(stop), async move {
                deadline.cancelled().await;
                WriterSummary {
                    stored: 0,
                    dead_lettered: 4,
                    dead_letter_failed: 0,
                }
            })
            .expect("start");

        let report = controller.shutdown().await;
        assert!(report.deadline_reached);
        assert_eq!(report.writer.dead_lettered, 4);
        assert!(controller.drain_deadline_token().is_cancelled());
    }

    #[tokio::test]
    async fn reports_listener_giving_up() {
        let mut controller = LifecycleController::new(Duration::from_millis(100));
        controller
            .start(
                async {
                    Err::<(), _>(TransportError::ConnectCeiling {
                        attempts: 3,
                        last_error: "connection refused".into(),
                    })
                },
                async { WriterSummary::default() },
            )
            .expect("start");

        let exit = controller.wait_for_exit(std::future::pending()).await;
        assert_eq!(exit, Exit::ListenerExited);
        let report = controller.shutdown().await;
        let failure = report.transport_failure.expect("transport failure");
        assert!(failure.contains("3 consecutive"));
    }

    #[tokio::test]
    async fn signal_ends_the_wait() {
        let mut controller = LifecycleController::new(Duration::from_millis(100));
        let stop = controller.stop_token();
        controller
            .start(idle_listener(stop), async { WriterSummary::default() })
            .expect("start");

        let exit = controller.wait_for_exit(std::future::ready(())).await;
        assert_eq!(exit, Exit::Signal);
        assert_eq!(controller.state(), LifecycleState::Running);
        let report = controller.shutdown().await;
        assert!(report.transport_failure.is_none());
    }

    #[tokio::test]
    async fn shutdown_before_start_is_a_no_op() {
        let mut controller = LifecycleController::new(Duration::from_millis(10));
        assert_eq!(controller.shutdown().await, ShutdownReport::default());
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }
}
