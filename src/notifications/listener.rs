//! A single background worker that multiplexes readiness on many eventfds
//! and dispatches each event to its registration's receiver.
//!
//! The worker owns every registered eventfd and is solely responsible for
//! closing them. Deliveries for one registration are serialized; deliveries
//! across registrations may interleave. The wait timeout exists so the
//! worker can observe the stop flag between events.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::{Error, Result};
use crate::kernel::KernelOps;

const POLL_TIMEOUT_MS: u16 = 200;
const MAX_MULTIPLEXED_EVENTS: usize = 20;

/// Receives deliveries and terminations for one registration.
pub(crate) trait EventReceiver: Send + Sync {
    /// Delivers one counter value. Returning false unsubscribes the
    /// registration cleanly.
    fn report_event(&self, name: &str, value: u64) -> bool;

    /// The registration is being torn down after a delivery failure.
    fn report_error(&self, name: &str);

    /// The registration is being torn down because its backing control file
    /// is gone or the listener is shutting down.
    fn report_exit(&self, name: &str);
}

struct Registration {
    name: String,
    control_path: PathBuf,
    eventfd: OwnedFd,
    receiver: Box<dyn EventReceiver>,
}

struct Shared {
    epoll: Epoll,
    registrations: Mutex<HashMap<u64, Arc<Registration>>>,
    keep_running: AtomicBool,
    running: AtomicBool,
    kernel: Arc<dyn KernelOps>,
}

pub struct EventfdListener {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventfdListener {
    pub fn new(kernel: Arc<dyn KernelOps>) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|err| Error::internal(format!("failed to create epoll instance: {err}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                epoll,
                registrations: Mutex::new(HashMap::new()),
                keep_running: AtomicBool::new(true),
                running: AtomicBool::new(false),
                kernel,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Subscribes an eventfd. The listener takes ownership of the fd and
    /// will close it when the registration terminates.
    pub(crate) fn add(
        &self,
        name: String,
        control_path: PathBuf,
        eventfd: OwnedFd,
        receiver: Box<dyn EventReceiver>,
    ) -> Result<()> {
        if !self.shared.keep_running.load(Ordering::SeqCst) {
            return Err(Error::cancelled("event listener is shutting down"));
        }

        let mut registrations = self.shared.registrations.lock().unwrap();
        if registrations.len() >= MAX_MULTIPLEXED_EVENTS {
            return Err(Error::failed_precondition(format!(
                "event listener is at its capacity of {MAX_MULTIPLEXED_EVENTS} registrations"
            )));
        }

        let key = eventfd.as_raw_fd() as u64;
        self.shared
            .epoll
            .add(&eventfd, EpollEvent::new(EpollFlags::EPOLLIN, key))
            .map_err(|err| {
                Error::internal(format!("failed to add eventfd for \"{name}\" to epoll: {err}"))
            })?;
        registrations.insert(
            key,
            Arc::new(Registration {
                name,
                control_path,
                eventfd,
                receiver,
            }),
        );
        Ok(())
    }

    /// Starts the worker thread. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("corral-eventfd-listener".into())
            .spawn(move || shared.run())
            .map_err(|err| {
                self.shared.running.store(false, Ordering::SeqCst);
                Error::internal(format!("failed to spawn event listener thread: {err}"))
            })?;
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Requests the worker to stop after its current iteration.
    pub fn stop_soon(&self) {
        self.shared.keep_running.store(false, Ordering::SeqCst);
    }

    /// Stops the worker and waits for it to terminate every remaining
    /// registration.
    pub fn stop(&self) {
        self.stop_soon();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn registration_count(&self) -> usize {
        self.shared.registrations.lock().unwrap().len()
    }
}

impl Drop for EventfdListener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        let mut events: Vec<EpollEvent> = (0..MAX_MULTIPLEXED_EVENTS)
            .map(|_| EpollEvent::empty())
            .collect();

        while self.keep_running.load(Ordering::SeqCst) {
            match self
                .epoll
                .wait(&mut events, EpollTimeout::from(POLL_TIMEOUT_MS))
            {
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    // A failing wait means the multiplexer itself is broken;
                    // every registration is reported as errored.
                    tracing::error!("cannot poll eventfds: {err}");
                    self.terminate_all(true);
                }
                Ok(0) => continue,
                Ok(count) => self.handle_ready(&events[..count]),
            }
        }

        self.terminate_all(false);
        self.running.store(false, Ordering::SeqCst);
    }

    fn handle_ready(&self, ready: &[EpollEvent]) {
        let mut pending_delete: Vec<(u64, bool)> = Vec::new();

        for event in ready {
            if !event.events().contains(EpollFlags::EPOLLIN) {
                continue;
            }
            let key = event.data();
            let registration = match self.registrations.lock().unwrap().get(&key) {
                Some(registration) => Arc::clone(registration),
                None => continue,
            };

            tracing::debug!(name = %registration.name, "received event");

            // The cgroup behind this registration may have been destroyed;
            // in that case the pending counter is meaningless.
            if !self.kernel.path_exists(&registration.control_path) {
                pending_delete.push((key, false));
                continue;
            }

            match self.kernel.read_counter(registration.eventfd.as_fd()) {
                Err(err) => {
                    tracing::error!(
                        name = %registration.name,
                        "cannot read eventfd to reset its counter: {err}"
                    );
                    pending_delete.push((key, true));
                }
                Ok(value) => {
                    if !registration.receiver.report_event(&registration.name, value) {
                        pending_delete.push((key, false));
                    }
                }
            }
        }

        for (key, error) in pending_delete {
            self.terminate(key, error);
        }
    }

    fn terminate(&self, key: u64, error: bool) {
        let registration = match self.registrations.lock().unwrap().remove(&key) {
            Some(registration) => registration,
            None => return,
        };
        let _ = self.epoll.delete(&registration.eventfd);

        tracing::info!(
            name = %registration.name,
            error,
            "terminating eventfd registration"
        );
        if error {
            registration.receiver.report_error(&registration.name);
        } else {
            registration.receiver.report_exit(&registration.name);
        }
        // Dropping the last Arc closes the eventfd.
    }

    fn terminate_all(&self, error: bool) {
        let keys: Vec<u64> = self
            .registrations
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect();
        for key in keys {
            self.terminate(key, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use nix::unistd::dup;

    use super::*;
    use crate::kernel::LinuxKernelOps;
    use crate::test_util::set_fixture;

    enum Delivery {
        Event(u64),
        Error,
        Exit,
    }

    struct ChannelReceiver {
        tx: Mutex<mpsc::Sender<Delivery>>,
        stop_after: Option<u64>,
    }

    impl ChannelReceiver {
        fn new(tx: mpsc::Sender<Delivery>, stop_after: Option<u64>) -> Self {
            Self {
                tx: Mutex::new(tx),
                stop_after,
            }
        }

        fn send(&self, delivery: Delivery) {
            self.tx.lock().unwrap().send(delivery).unwrap();
        }
    }

    impl EventReceiver for ChannelReceiver {
        fn report_event(&self, _name: &str, value: u64) -> bool {
            self.send(Delivery::Event(value));
            self.stop_after.map_or(true, |limit| value < limit)
        }

        fn report_error(&self, _name: &str) {
            self.send(Delivery::Error);
        }

        fn report_exit(&self, _name: &str) {
            self.send(Delivery::Exit);
        }
    }

    struct TestListener {
        listener: EventfdListener,
        tmp: tempfile::TempDir,
    }

    impl TestListener {
        fn new() -> Self {
            Self {
                listener: EventfdListener::new(Arc::new(LinuxKernelOps)).unwrap(),
                tmp: tempfile::tempdir().unwrap(),
            }
        }

        /// Registers a receiver and returns a duplicate of the eventfd the
        /// test can write to, plus the path of the backing control file.
        fn register(
            &self,
            name: &str,
            receiver: ChannelReceiver,
        ) -> (OwnedFd, PathBuf) {
            let control_path = set_fixture(self.tmp.path(), name, "").unwrap();
            let ops = LinuxKernelOps;
            let efd = crate::kernel::KernelOps::eventfd(&ops).unwrap();
            let writer = dup(efd.as_raw_fd()).unwrap();
            let writer = unsafe { std::os::fd::FromRawFd::from_raw_fd(writer) };
            self.listener
                .add(
                    name.to_string(),
                    control_path.clone(),
                    efd,
                    Box::new(receiver),
                )
                .unwrap();
            (writer, control_path)
        }
    }

    fn recv(rx: &mpsc::Receiver<Delivery>) -> Delivery {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_delivers_counter_values() {
        let fixture = TestListener::new();
        let (tx, rx) = mpsc::channel();
        let (writer, _control) = fixture.register(
            "oom",
            ChannelReceiver::new(tx, None),
        );
        fixture.listener.start().unwrap();

        nix::unistd::write(&writer, &1u64.to_ne_bytes()).unwrap();
        assert!(matches!(recv(&rx), Delivery::Event(1)));

        // Values accumulate between reads; no event is lost.
        nix::unistd::write(&writer, &2u64.to_ne_bytes()).unwrap();
        nix::unistd::write(&writer, &3u64.to_ne_bytes()).unwrap();
        match recv(&rx) {
            Delivery::Event(v) => assert!(v == 2 || v == 5),
            _ => panic!("expected an event delivery"),
        }

        fixture.listener.stop();
    }

    #[test]
    fn test_receiver_stop_removes_registration() {
        let fixture = TestListener::new();
        let (tx, rx) = mpsc::channel();
        let (writer, _control) = fixture.register(
            "threshold",
            ChannelReceiver::new(tx, Some(1)),
        );
        fixture.listener.start().unwrap();

        nix::unistd::write(&writer, &1u64.to_ne_bytes()).unwrap();
        assert!(matches!(recv(&rx), Delivery::Event(1)));
        assert!(matches!(recv(&rx), Delivery::Exit));
        assert_eq!(fixture.listener.registration_count(), 0);

        fixture.listener.stop();
    }

    #[test]
    fn test_missing_control_file_reports_exit() {
        let fixture = TestListener::new();
        let (tx, rx) = mpsc::channel();
        let (writer, control) = fixture.register(
            "oom",
            ChannelReceiver::new(tx, None),
        );
        fixture.listener.start().unwrap();

        std::fs::remove_file(&control).unwrap();
        nix::unistd::write(&writer, &1u64.to_ne_bytes()).unwrap();

        assert!(matches!(recv(&rx), Delivery::Exit));
        assert_eq!(fixture.listener.registration_count(), 0);

        fixture.listener.stop();
    }

    #[test]
    fn test_stop_terminates_remaining_registrations() {
        let fixture = TestListener::new();
        let (tx, rx) = mpsc::channel();
        let (_writer, _control) = fixture.register(
            "oom",
            ChannelReceiver::new(tx, None),
        );
        fixture.listener.start().unwrap();

        fixture.listener.stop();
        assert!(matches!(recv(&rx), Delivery::Exit));
        assert_eq!(fixture.listener.registration_count(), 0);
        assert!(!fixture.listener.is_running());
    }

    #[test]
    fn test_add_after_stop_is_rejected() {
        let fixture = TestListener::new();
        fixture.listener.stop_soon();

        let ops = LinuxKernelOps;
        let efd = crate::kernel::KernelOps::eventfd(&ops).unwrap();
        let (tx, _rx) = mpsc::channel();
        let err = fixture
            .listener
            .add(
                "late".into(),
                fixture.tmp.path().join("late"),
                efd,
                Box::new(ChannelReceiver::new(tx, None)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
    }
}
