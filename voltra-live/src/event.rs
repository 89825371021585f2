//! Live event plumbing: one worker thread draining an MPSC queue plus a
//! periodic thread enqueueing Timer events.
//!
//! Suspension points are the worker's timed receive (so shutdown is never
//! blocked more than a second) and the timer thread's sleep. A shared
//! atomic gates both loops; `stop` clears it and joins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::info;
use voltra_core::Event;

use crate::LiveCore;

/// Timed-receive window of the worker loop.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Cloneable handle external producers (gateway thread, market-data
/// poller) use to enqueue events.
#[derive(Clone)]
pub struct EventSender {
    sender: Sender<Event>,
}

impl EventSender {
    /// Enqueue one event; silently dropped after shutdown.
    pub fn send(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

/// Queue, worker thread, and timer thread of the live runtime.
pub struct EventEngine {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    interval: Duration,
    active: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl EventEngine {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            interval,
            active: Arc::new(AtomicBool::new(false)),
            worker: None,
            timer: None,
        }
    }

    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawn the worker and timer threads. Idempotent while running.
    pub fn start(&mut self, core: Arc<Mutex<LiveCore>>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }

        let receiver = self.receiver.clone();
        let active = Arc::clone(&self.active);
        self.worker = Some(std::thread::spawn(move || {
            while active.load(Ordering::SeqCst) {
                match receiver.recv_timeout(DEQUEUE_TIMEOUT) {
                    Ok(event) => {
                        if active.load(Ordering::SeqCst) {
                            core.lock().expect("live core poisoned").dispatch(event);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }));

        let sender = self.sender.clone();
        let active = Arc::clone(&self.active);
        let interval = self.interval;
        self.timer = Some(std::thread::spawn(move || {
            while active.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                let _ = sender.send(Event::Timer);
            }
        }));
        info!(interval_secs = self.interval.as_secs_f64(), "event engine started");
    }

    /// Clear the active flag and join both threads.
    pub fn stop(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        info!("event engine stopped");
    }
}

impl Drop for EventEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
