//! Session worker task.

use super::events::{ConnectionEvent, EventBus, EventKind};
use super::link::{BatchResult, Link, Snapshot};
use super::{SessionId, State};
use crate::catalog::{Register, Value};
use crate::config::DeviceKind;
use crate::error::{AppResult, DeviceError, SessionError};
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

/// Deferred delivery of a job's result to its caller.
pub(crate) type Reply = Box<dyn FnOnce() + Send>;

/// A driver closure bound to its reply channel. Returns the hard fault it hit,
/// if any, and the reply to send once the worker has acted on the fault.
pub(crate) type Job =
    Box<dyn for<'a> FnOnce(&'a mut Link) -> BoxFuture<'a, (Option<DeviceError>, Reply)> + Send>;

/// Work queued on a session.
pub(crate) enum Command {
    Read {
        register: &'static Register,
        reply: oneshot::Sender<AppResult<Value>>,
    },
    Write {
        register: &'static Register,
        value: Value,
        reply: oneshot::Sender<AppResult<()>>,
    },
    BatchRead {
        names: Vec<String>,
        reply: oneshot::Sender<AppResult<BatchResult>>,
    },
    Execute(Job),
}

impl Command {
    pub(crate) fn read(register: &'static Register) -> (Self, oneshot::Receiver<AppResult<Value>>) {
        let (reply, rx) = oneshot::channel();
        (Command::Read { register, reply }, rx)
    }

    pub(crate) fn write(
        register: &'static Register,
        value: Value,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (reply, rx) = oneshot::channel();
        (
            Command::Write {
                register,
                value,
                reply,
            },
            rx,
        )
    }

    pub(crate) fn batch_read(names: Vec<String>) -> (Self, oneshot::Receiver<AppResult<BatchResult>>) {
        let (reply, rx) = oneshot::channel();
        (Command::BatchRead { names, reply }, rx)
    }

    pub(crate) fn execute<T, F>(f: F) -> (Self, oneshot::Receiver<AppResult<T>>)
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Link) -> BoxFuture<'a, AppResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = bind(move |link| {
            Box::pin(async move {
                let result = f(link).await;
                let fault = hard_fault(&result);
                let reply: Reply = Box::new(move || {
                    let _ = tx.send(result);
                });
                (fault, reply)
            })
        });
        (Command::Execute(job), rx)
    }

    /// Answer a command that will never run.
    fn cancel(self) {
        let cancelled = || DeviceError::from(SessionError::QueueCancelled);
        match self {
            Command::Read { reply, .. } => {
                let _ = reply.send(Err(cancelled()));
            }
            Command::Write { reply, .. } => {
                let _ = reply.send(Err(cancelled()));
            }
            Command::BatchRead { reply, .. } => {
                let _ = reply.send(Err(cancelled()));
            }
            // Dropping the job drops its sender; the caller maps that to
            // QueueCancelled.
            Command::Execute(_) => {}
        }
    }
}

/// Requests that bypass the command queue.
pub(crate) enum Control {
    Disconnect { ack: oneshot::Sender<()> },
}

fn bind<F>(job: F) -> Job
where
    F: for<'a> FnOnce(&'a mut Link) -> BoxFuture<'a, (Option<DeviceError>, Reply)> + Send + 'static,
{
    Box::new(job)
}

fn hard_fault<T>(result: &AppResult<T>) -> Option<DeviceError> {
    result.as_ref().err().filter(|e| e.is_fatal()).cloned()
}

/// Publishes state transitions of one session.
pub(crate) struct Reporter {
    pub(crate) session: SessionId,
    pub(crate) device: String,
    pub(crate) kind: DeviceKind,
    pub(crate) address: String,
    bus: EventBus,
    state: watch::Sender<State>,
}

impl Reporter {
    pub(crate) fn new(
        session: SessionId,
        device: String,
        kind: DeviceKind,
        address: String,
        bus: EventBus,
    ) -> (Self, watch::Receiver<State>) {
        let (state, rx) = watch::channel(State::Disconnected);
        (
            Self {
                session,
                device,
                kind,
                address,
                bus,
                state,
            },
            rx,
        )
    }

    fn event(&self, event: EventKind) -> ConnectionEvent {
        ConnectionEvent {
            session: self.session,
            device: self.device.clone(),
            kind: self.kind,
            address: self.address.clone(),
            event,
            state: *self.state.borrow(),
            snapshot: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn transition(&self, state: State, snapshot: Option<Snapshot>, error: Option<&DeviceError>) {
        self.state.send_replace(state);
        let mut event = self.event(EventKind::StateChanged);
        event.snapshot = snapshot;
        event.error = error.map(ToString::to_string);
        self.bus.publish(event);
    }

    fn write_completed(&self, register: &str, value: Value) {
        self.bus.publish(self.event(EventKind::WriteCompleted {
            register: register.to_string(),
            value,
        }));
    }
}

/// Owns the link and drains the queue.
pub(crate) struct Worker {
    link: Link,
    commands: mpsc::Receiver<Command>,
    control: mpsc::Receiver<Control>,
    reporter: Reporter,
}

impl Worker {
    pub(crate) fn new(
        link: Link,
        commands: mpsc::Receiver<Command>,
        control: mpsc::Receiver<Control>,
        reporter: Reporter,
    ) -> Self {
        Self {
            link,
            commands,
            control,
            reporter,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(session = %self.reporter.session, port = self.link.describe(), "worker started");
        loop {
            tokio::select! {
                biased;

                Some(control) = self.control.recv() => {
                    match control {
                        Control::Disconnect { ack } => {
                            self.shut_down().await;
                            let _ = ack.send(());
                        }
                    }
                    return;
                }

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Every handle is gone.
                        self.shut_down().await;
                        return;
                    };
                    if let Some(err) = self.handle(command).await {
                        error!(session = %self.reporter.session, error = %err, "transport fault");
                        return;
                    }
                }
            }
        }
    }

    /// Run one command. Returns the hard fault that ended the session, if any.
    async fn handle(&mut self, command: Command) -> Option<DeviceError> {
        match command {
            Command::Read { register, reply } => {
                let result = self.link.read_register(register).await;
                self.conclude(hard_fault(&result), move || {
                    let _ = reply.send(result);
                })
                .await
            }
            Command::Write {
                register,
                value,
                reply,
            } => {
                let result = self.link.write_register(register, &value).await;
                self.conclude(hard_fault(&result), move || {
                    let _ = reply.send(result);
                })
                .await
            }
            Command::BatchRead { names, reply } => {
                let results = self.link.batch_read(names.as_slice()).await;
                let fault = results.values().find_map(hard_fault);
                self.conclude(fault, move || {
                    let _ = reply.send(Ok(results));
                })
                .await
            }
            Command::Execute(job) => {
                let (fault, reply) = job(&mut self.link).await;
                self.conclude(fault, reply).await
            }
        }
    }

    /// Publish completed writes, fault the session if needed, then answer.
    async fn conclude(
        &mut self,
        fault: Option<DeviceError>,
        reply: impl FnOnce(),
    ) -> Option<DeviceError> {
        for (register, value) in self.link.take_writes() {
            self.reporter.write_completed(register, value);
        }
        if let Some(err) = &fault {
            self.fail(err).await;
        }
        reply();
        fault
    }

    fn cancel_queued(&mut self) {
        self.commands.close();
        let mut cancelled = 0;
        while let Ok(command) = self.commands.try_recv() {
            command.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!(session = %self.reporter.session, cancelled, "queued commands cancelled");
        }
    }

    async fn fail(&mut self, err: &DeviceError) {
        self.cancel_queued();
        self.link.close().await;
        self.reporter.transition(State::Faulted, None, Some(err));
    }

    async fn shut_down(&mut self) {
        self.reporter.transition(State::Disconnecting, None, None);
        self.cancel_queued();
        self.link.release().await;
        self.link.close().await;
        self.reporter.transition(State::Disconnected, None, None);
        info!(session = %self.reporter.session, device = %self.reporter.device, "disconnected");
    }
}
