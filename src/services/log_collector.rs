use crate::ctx::Ctx;
use crate::domain::{ContainerRuntime, Interrupter, LogRecord, LogStream};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

pub const CHANNEL_CAPACITY: usize = 256;
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(10);

/// Follows a container's output on a worker thread.
///
/// Records land in a bounded channel. When the channel is full the worker
/// waits, checking the stop flag between attempts. The channel closes when
/// the worker exits and drops its sender, which happens exactly once.
pub struct LogCollector {
    container: String,
    stop: Arc<AtomicBool>,
    interrupter: Interrupter,
    worker: Option<JoinHandle<()>>,
    records: Option<Receiver<LogRecord>>,
    forwarder: Option<JoinHandle<()>>,
    stopped: bool,
}

impl LogCollector {
    pub fn start(ctx: &Ctx, runtime: &dyn ContainerRuntime, name: &str) -> Result<Self> {
        ctx.check()?;

        let attach_error = |reason: String| Error::Attach {
            container: name.to_string(),
            reason,
        };

        let running = runtime
            .is_running(name)
            .map_err(|e| attach_error(e.to_string()))?;
        if !running {
            return Err(attach_error("container is not running".into()));
        }

        let stream = runtime.attach_logs(name).map_err(|err| match err {
            Error::Attach { .. } => err,
            other => attach_error(other.to_string()),
        })?;
        let interrupter = stream.interrupter();

        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let worker = thread::Builder::new()
            .name(format!("logs-{name}"))
            .spawn(move || pump(stream, tx, worker_stop))
            .map_err(|e| {
                interrupter();
                attach_error(e.to_string())
            })?;

        debug!(container = %name, "Log collector attached");

        Ok(Self {
            container: name.to_string(),
            stop,
            interrupter,
            worker: Some(worker),
            records: Some(rx),
            forwarder: None,
            stopped: false,
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Hands the receiving end to the caller. Returns `None` once taken or
    /// forwarded.
    pub fn take_records(&mut self) -> Option<Receiver<LogRecord>> {
        self.records.take()
    }

    /// Emits every record through `tracing` under the `fixturebox::container`
    /// target.
    pub fn forward_to_tracing(&mut self) {
        let Some(records) = self.records.take() else {
            return;
        };
        let container = self.container.clone();

        self.forwarder = thread::Builder::new()
            .name(format!("logs-fwd-{container}"))
            .spawn(move || {
                for record in records {
                    info!(
                        target: "fixturebox::container",
                        container = %container,
                        source = %record.source,
                        "{}",
                        record.text().trim_end()
                    );
                }
            })
            .ok();
    }

    /// Stops the worker and waits for it. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.stop.store(true, Ordering::SeqCst);
        (self.interrupter)();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.join();
        }
        debug!(container = %self.container, "Log collector stopped");
    }
}

impl fmt::Debug for LogCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogCollector")
            .field("container", &self.container)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump(mut stream: Box<dyn LogStream>, tx: SyncSender<LogRecord>, stop: Arc<AtomicBool>) {
    while let Some(mut record) = stream.next_record() {
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            match tx.try_send(record) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    record = rejected;
                    thread::sleep(BACKPRESSURE_PAUSE);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LogSource;
    use crate::test_support::MockRuntime;

    #[test]
    fn test_attach_requires_running_container() {
        let mock = MockRuntime::new();
        mock.add_container("stopped", false);

        let err = LogCollector::start(&Ctx::background(), &mock, "stopped").unwrap_err();

        assert!(matches!(err, Error::Attach { .. }));
        assert_eq!(mock.count_commands("attach_logs:stopped"), 0);
    }

    #[test]
    fn test_records_flow_until_stop() {
        let mock = MockRuntime::new();
        mock.add_container("t1", true);

        let mut collector = LogCollector::start(&Ctx::background(), &mock, "t1").unwrap();
        let records = collector.take_records().unwrap();

        assert!(mock.push_log("t1", LogSource::Stdout, "Ready to accept connections"));
        assert!(mock.push_log("t1", LogSource::Stderr, "warning"));

        let first = records.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = records.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.text(), "Ready to accept connections");
        assert_eq!(second.source, LogSource::Stderr);

        collector.stop();
        collector.stop();

        assert!(records.recv_timeout(Duration::from_secs(2)).is_err());
        assert!(!mock.push_log("t1", LogSource::Stdout, "late"));
    }

    #[test]
    fn test_stop_with_full_channel_does_not_hang() {
        let mock = MockRuntime::new();
        mock.add_container("noisy", true);

        let mut collector = LogCollector::start(&Ctx::background(), &mock, "noisy").unwrap();
        for i in 0..CHANNEL_CAPACITY + 10 {
            mock.push_log("noisy", LogSource::Stdout, &format!("line {i}"));
        }

        collector.stop();
        assert!(collector.take_records().is_some());
    }

    #[test]
    fn test_forwarding_stops_cleanly() {
        let mock = MockRuntime::new();
        mock.add_container("t1", true);

        let mut collector = LogCollector::start(&Ctx::background(), &mock, "t1").unwrap();
        collector.forward_to_tracing();
        mock.push_log("t1", LogSource::Stdout, "hello");

        assert!(collector.take_records().is_none());
        drop(collector);
    }
}
