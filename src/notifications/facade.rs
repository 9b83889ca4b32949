//! Registration front door for eventfd notifications.
//!
//! Wires an eventfd to a cgroup control file through the hierarchy's
//! event-control protocol, allocates a handle in the active-notifications
//! registry, and subscribes the listener.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use super::active::{ActiveNotifications, Handle};
use super::listener::{EventReceiver, EventfdListener};
use crate::common::{self, ControlFileError, ControlFileOp, CGROUP_EVENT_CONTROL};
use crate::error::{Error, Result};
use crate::kernel::KernelOps;

/// Callback invoked on every delivery for a registration: the counter value
/// on success, or a `Cancelled` error when the registration is torn down
/// after a delivery failure.
pub type EventCallback = Arc<dyn Fn(Result<u64>) + Send + Sync>;

pub struct EventFdNotifications {
    active: Arc<ActiveNotifications>,
    listener: EventfdListener,
    kernel: Arc<dyn KernelOps>,
}

impl EventFdNotifications {
    pub fn new(active: Arc<ActiveNotifications>, kernel: Arc<dyn KernelOps>) -> Result<Self> {
        let listener = EventfdListener::new(Arc::clone(&kernel))?;
        Ok(Self {
            active,
            listener,
            kernel,
        })
    }

    pub fn active(&self) -> &Arc<ActiveNotifications> {
        &self.active
    }

    /// Registers an eventfd notification against `cgroup_file` inside the
    /// cgroup at `cgroup_basepath` and returns the registration's handle.
    pub fn register(
        &self,
        cgroup_basepath: &Path,
        cgroup_file: &str,
        args: &str,
        callback: EventCallback,
    ) -> Result<Handle> {
        let control_path = cgroup_basepath.join(cgroup_file);
        let control = File::open(&control_path).map_err(|err| {
            Error::not_found(format!(
                "failed to open {}: {err}; the cgroup was probably destroyed",
                control_path.display()
            ))
        })?;

        let eventfd = self
            .kernel
            .eventfd()
            .map_err(|err| Error::internal(format!("eventfd creation failed: {err}")))?;

        let command = format!("{} {} {args}\n", eventfd.as_raw_fd(), control.as_raw_fd());
        let event_control_path = cgroup_basepath.join(CGROUP_EVENT_CONTROL);
        let write_result = common::write_control_file(&event_control_path, &command);
        // The control fd only had to stay open for the event_control write.
        drop(control);
        if let Err(err) = write_result {
            return Err(map_event_control_error(err, cgroup_basepath));
        }

        let handle = self.active.add();
        let receiver = Box::new(NotificationReceiver {
            handle,
            active: Arc::clone(&self.active),
            callback,
        });

        tracing::info!(
            control_file = %control_path.display(),
            args,
            handle,
            "listening for events"
        );

        let subscribed = self
            .listener
            .add(control_path.display().to_string(), control_path, eventfd, receiver)
            .and_then(|_| {
                if !self.listener.is_running() {
                    self.listener.start()?;
                }
                Ok(())
            });
        if let Err(err) = subscribed {
            self.active.remove(handle);
            return Err(err);
        }

        Ok(handle)
    }

    pub fn stop(&self) {
        self.listener.stop();
    }
}

impl Drop for EventFdNotifications {
    fn drop(&mut self) {
        self.listener.stop();
    }
}

fn map_event_control_error(err: ControlFileError, cgroup_basepath: &Path) -> Error {
    match (err.op(), err.os_error()) {
        (ControlFileOp::Open, Some(libc::ENODEV)) => Error::not_found(format!(
            "cgroup {} was destroyed",
            cgroup_basepath.display()
        )),
        (ControlFileOp::Write, Some(libc::ENOENT)) => Error::not_found(format!(
            "{} has no {CGROUP_EVENT_CONTROL}; the cgroup may have been destroyed",
            cgroup_basepath.display()
        )),
        _ => Error::internal(format!("failed to set up event notification: {err}")),
    }
}

/// Delivers events to the user while the registration is still in the
/// active set; reports stop once it has been unregistered.
struct NotificationReceiver {
    handle: Handle,
    active: Arc<ActiveNotifications>,
    callback: EventCallback,
}

impl EventReceiver for NotificationReceiver {
    fn report_event(&self, _name: &str, value: u64) -> bool {
        if !self.active.contains(self.handle) {
            return false;
        }
        (self.callback)(Ok(value));
        true
    }

    fn report_error(&self, name: &str) {
        tracing::warn!(
            handle = self.handle,
            "no longer notifying for \"{name}\" after a delivery error"
        );
        (self.callback)(Err(Error::cancelled(format!(
            "event delivery failed for notification handle {}",
            self.handle
        ))));
    }

    fn report_exit(&self, name: &str) {
        tracing::info!(handle = self.handle, "no longer notifying for \"{name}\"");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use nix::unistd::write;

    use super::*;
    use crate::error::ErrorKind;
    use crate::kernel::LinuxKernelOps;
    use crate::test_util::set_fixture;

    fn notifications() -> EventFdNotifications {
        EventFdNotifications::new(
            Arc::new(ActiveNotifications::default()),
            Arc::new(LinuxKernelOps),
        )
        .unwrap()
    }

    #[test]
    fn test_register_writes_event_control_line() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "memory.oom_control", "").unwrap();
        set_fixture(tmp.path(), CGROUP_EVENT_CONTROL, "").unwrap();

        let facade = notifications();
        let handle = facade
            .register(tmp.path(), "memory.oom_control", "", Arc::new(|_| {}))
            .unwrap();

        assert!(facade.active().contains(handle));
        assert!(facade.listener.is_running());

        let line = std::fs::read_to_string(tmp.path().join(CGROUP_EVENT_CONTROL)).unwrap();
        assert!(line.ends_with('\n'));
        let fields: Vec<&str> = line.trim_end().split(' ').collect();
        // "<eventfd> <control_fd> <args>" with empty args.
        assert_eq!(fields.len(), 3);
        assert!(fields[0].parse::<i32>().unwrap() > 2);
        assert!(fields[1].parse::<i32>().unwrap() > 2);
        assert_eq!(fields[2], "");

        facade.stop();
    }

    #[test]
    fn test_register_with_threshold_args() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "memory.usage_in_bytes", "0").unwrap();
        set_fixture(tmp.path(), CGROUP_EVENT_CONTROL, "").unwrap();

        let facade = notifications();
        facade
            .register(tmp.path(), "memory.usage_in_bytes", "4096", Arc::new(|_| {}))
            .unwrap();

        let line = std::fs::read_to_string(tmp.path().join(CGROUP_EVENT_CONTROL)).unwrap();
        assert!(line.trim_end().ends_with(" 4096"));

        facade.stop();
    }

    #[test]
    fn test_register_missing_control_file() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_EVENT_CONTROL, "").unwrap();

        let facade = notifications();
        let err = facade
            .register(tmp.path(), "memory.oom_control", "", Arc::new(|_| {}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("destroyed"));
        assert!(facade.active().is_empty());
    }

    #[test]
    fn test_register_missing_event_control() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "memory.oom_control", "").unwrap();

        let facade = notifications();
        let err = facade
            .register(tmp.path(), "memory.oom_control", "", Arc::new(|_| {}))
            .unwrap_err();
        // The event_control open fails with ENOENT, not ENODEV: an
        // unclassified setup failure.
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(facade.active().is_empty());
    }

    #[test]
    fn test_delivery_and_unregister_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "memory.oom_control", "").unwrap();
        set_fixture(tmp.path(), CGROUP_EVENT_CONTROL, "").unwrap();

        let facade = notifications();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let handle = facade
            .register(
                tmp.path(),
                "memory.oom_control",
                "",
                Arc::new(move |delivery| {
                    tx.lock().unwrap().send(delivery).unwrap();
                }),
            )
            .unwrap();

        // The eventfd number is recorded in the event_control line; write
        // to it the way the kernel would on an event.
        let line = std::fs::read_to_string(tmp.path().join(CGROUP_EVENT_CONTROL)).unwrap();
        let eventfd: i32 = line.trim_end().split(' ').next().unwrap().parse().unwrap();
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(eventfd) };
        write(borrowed, &1u64.to_ne_bytes()).unwrap();

        let delivery = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivery.unwrap(), 1);

        // After unregistration the next delivery attempt unsubscribes the
        // registration instead of invoking the callback.
        assert!(facade.active().remove(handle));
        write(borrowed, &1u64.to_ne_bytes()).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());

        facade.stop();
    }
}
