use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

/// A named thread with a cooperative cancellation channel and a bounded join.
///
/// The task body receives the cancel receiver. Nothing is ever sent on it: cancellation drops the
/// sender, which makes every receive on it return immediately.
pub(crate) struct Task {
    name: String,
    cancel: Option<Sender<()>>,
    done: Receiver<()>,
    join_handle: Option<JoinHandle<()>>,
}

pub(crate) fn spawn<F>(name: String, f: F) -> io::Result<Task>
where
    F: FnOnce(Receiver<()>) + Send + 'static,
{
    let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

    let join_handle = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            // dropped on every exit path, panics included
            let _done = done_tx;
            f(cancel_rx);
        })?;

    Ok(Task {
        name,
        cancel: Some(cancel_tx),
        done: done_rx,
        join_handle: Some(join_handle),
    })
}

impl Task {
    /// Signals the task to stop without waiting for it.
    pub fn cancel(&mut self) {
        self.cancel.take();
    }

    /// Waits up to `timeout` for the task to finish on its own. Returns whether it finished.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Cancels the task and waits up to `timeout` for it to finish. A task that is still running
    /// afterwards is detached. Returns whether the task finished.
    pub fn join(mut self, timeout: Duration) -> bool {
        self.cancel();

        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("task {}: still running after {timeout:?}, detaching", self.name);
                false
            }
            _ => {
                if let Some(join_handle) = self.join_handle.take() {
                    if join_handle.join().is_err() {
                        log::error!("task {}: panicked", self.name);
                    }
                }
                true
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Sleeps for `duration` unless cancelled first. Returns `true` if cancelled.
pub(crate) fn sleep_or_cancel(cancel: &Receiver<()>, duration: Duration) -> bool {
    !matches!(cancel.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
}

pub(crate) fn is_cancelled(cancel: &Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Err(TryRecvError::Disconnected))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    #[test]
    fn cancel_wakes_sleeper() {
        let task = spawn("sleeper".to_owned(), |cancel| {
            assert!(sleep_or_cancel(&cancel, Duration::from_secs(30)));
            assert!(is_cancelled(&cancel));
        })
        .unwrap();

        let started = Instant::now();
        assert!(task.join(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stuck_task_is_detached() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let task = spawn("stuck".to_owned(), move |_cancel| {
            let _ = release_rx.recv();
        })
        .unwrap();

        assert!(!task.join(Duration::from_millis(50)));
        drop(release_tx);
    }

    #[test]
    fn wait_does_not_cancel() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let task = spawn("waiter".to_owned(), move |cancel| {
            let _ = release_rx.recv();
            assert!(!is_cancelled(&cancel));
        })
        .unwrap();

        assert!(!task.wait(Duration::from_millis(20)));
        drop(release_tx);
        assert!(task.wait(Duration::from_secs(5)));
        assert!(task.join(Duration::from_secs(5)));
    }

    #[test]
    fn uncancelled_sleep_times_out() {
        let (_cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        assert!(!sleep_or_cancel(&cancel_rx, Duration::from_millis(10)));
        assert!(!is_cancelled(&cancel_rx));
    }
}
