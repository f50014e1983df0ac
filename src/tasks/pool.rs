//! Long-lived worker threads fed from one shared command channel.
//!
//! Each worker loops on `recv_timeout`: a `Run` command is handled and its
//! output sent back, `Close` makes the worker report `Closed` and exit. A
//! worker that sees no command for longer than its idle timeout exits with
//! `TimedOut`. Every worker sends exactly one terminal event (`Closed`,
//! `TimedOut`, `Stopped` or `Panicked`) before its thread ends.

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::shutdown::Shutdown;

/// A unit of work. The ticket identifies the job's items so they can be
/// failed when the worker handling it panics.
pub trait Job: Send + 'static {
    type Ticket: Send + 'static;

    fn ticket(&self) -> Self::Ticket;
}

/// Per-thread job handler. Each worker owns one instance, so handlers may
/// keep state between jobs.
pub trait Worker: Send + 'static {
    type Job: Job;
    type Output: Send + 'static;

    fn handle(&mut self, job: Self::Job) -> Self::Output;
}

/// Message on the command channel.
#[derive(Debug)]
pub enum Command<J> {
    Run(J),
    /// No more work for the worker that receives it.
    Close,
}

/// Message on the result channel.
#[derive(Debug)]
pub enum WorkerEvent<O, T> {
    Done { worker: usize, output: O },
    Closed { worker: usize },
    TimedOut { worker: usize },
    /// Exited after a stop request once the queue ran dry.
    Stopped { worker: usize },
    Panicked {
        worker: usize,
        ticket: T,
        message: String,
    },
}

impl<O, T> WorkerEvent<O, T> {
    /// Whether this is the last event the worker will send.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerEvent::Done { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    /// Longest a submit may block on a full command channel.
    pub send_timeout: Duration,
    /// Command channel capacity.
    pub capacity: usize,
}

impl PoolSettings {
    pub fn from_config(config: &crate::config::WorkerConfig) -> Self {
        Self {
            workers: config.count.max(1),
            poll_interval: config.poll_interval(),
            idle_timeout: config.worker_idle_timeout(),
            send_timeout: config.stall_timeout(),
            // Room for every in-flight job plus one close per worker.
            capacity: config.in_flight_limit() + config.count.max(1),
        }
    }
}

type Event<W> = WorkerEvent<<W as Worker>::Output, <<W as Worker>::Job as Job>::Ticket>;

pub struct WorkerPool<W: Worker> {
    commands: Sender<Command<W::Job>>,
    events: Receiver<Event<W>>,
    handles: Vec<JoinHandle<()>>,
    settings: PoolSettings,
    exited: usize,
}

impl<W: Worker> WorkerPool<W> {
    /// Spawn `settings.workers` threads, building each handler with `make`.
    pub fn spawn<F>(settings: PoolSettings, shutdown: Shutdown, make: F) -> Result<Self>
    where
        F: Fn(usize) -> W,
    {
        let (command_tx, command_rx) = bounded::<Command<W::Job>>(settings.capacity.max(1));
        let (event_tx, event_rx) = unbounded::<Event<W>>();

        let mut handles = Vec::with_capacity(settings.workers);
        for id in 0..settings.workers {
            let handler = make(id);
            let rx = command_rx.clone();
            let tx = event_tx.clone();
            let shutdown = shutdown.clone();
            let poll = settings.poll_interval;
            let idle = settings.idle_timeout;
            let handle = thread::Builder::new()
                .name(format!("diffscan-worker-{}", id))
                .spawn(move || run_worker(id, handler, rx, tx, shutdown, poll, idle))?;
            handles.push(handle);
        }

        debug!(workers = settings.workers, "Worker pool started");
        Ok(Self {
            commands: command_tx,
            events: event_rx,
            handles,
            settings,
            exited: 0,
        })
    }

    pub fn submit(&self, job: W::Job) -> Result<()> {
        self.send(Command::Run(job))
    }

    /// Queue one close sentinel; whichever idle worker takes it exits.
    pub fn close_one(&self) -> Result<()> {
        self.send(Command::Close)
    }

    fn send(&self, command: Command<W::Job>) -> Result<()> {
        match self.commands.send_timeout(command, self.settings.send_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(Error::QueueTimeout(format!(
                "command channel stayed full for {:?}",
                self.settings.send_timeout
            ))),
            Err(SendTimeoutError::Disconnected(_)) => Err(Error::FatalWorkerLoss {
                workers: self.settings.workers,
            }),
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv(&mut self, timeout: Duration) -> Option<Event<W>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                if event.is_terminal() {
                    self.exited += 1;
                }
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.settings.workers
    }

    /// Workers that have not yet sent their terminal event.
    pub fn alive(&self) -> usize {
        self.settings.workers.saturating_sub(self.exited)
    }

    /// Join every thread. Call once all terminal events were received.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("Worker thread ended abnormally");
            }
        }
    }
}

fn run_worker<W: Worker>(
    id: usize,
    mut handler: W,
    rx: Receiver<Command<W::Job>>,
    tx: Sender<Event<W>>,
    shutdown: Shutdown,
    poll: Duration,
    idle_timeout: Duration,
) {
    let mut last_job = Instant::now();

    let terminal = loop {
        if shutdown.is_forced() {
            break WorkerEvent::Stopped { worker: id };
        }

        match rx.recv_timeout(poll) {
            Ok(Command::Run(job)) => {
                let ticket = job.ticket();
                match catch_unwind(AssertUnwindSafe(|| handler.handle(job))) {
                    Ok(output) => {
                        if tx.send(WorkerEvent::Done { worker: id, output }).is_err() {
                            return;
                        }
                    }
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "worker panicked".to_string());
                        break WorkerEvent::Panicked {
                            worker: id,
                            ticket,
                            message,
                        };
                    }
                }
                last_job = Instant::now();
            }
            Ok(Command::Close) => break WorkerEvent::Closed { worker: id },
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.is_stopping() {
                    break WorkerEvent::Stopped { worker: id };
                }
                if last_job.elapsed() >= idle_timeout {
                    break WorkerEvent::TimedOut { worker: id };
                }
            }
            Err(RecvTimeoutError::Disconnected) => break WorkerEvent::Closed { worker: id },
        }
    };

    debug!(worker = id, "Worker exiting");
    let _ = tx.send(terminal);
}
