use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex, Once};
use std::thread;

use log::error;

use crate::event_loop::{EventLoop, LoopHandle};

/// A thread owning one event loop.
///
/// The loop is constructed on the spawned thread (so the thread that runs
/// it is the thread that built it) and parks until [`run`] releases it.
/// Dropping the value quits the loop and joins the thread.
///
/// [`run`]: EventLoopThread::run
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
    run_tx: mpsc::Sender<()>,
    started: Once,
}

impl EventLoopThread {
    pub fn new(name: &str) -> EventLoopThread {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (run_tx, run_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        error!("failed to create event loop: {}", err);
                        return;
                    }
                };
                if handle_tx.send(event_loop.handle()).is_err() {
                    return;
                }
                // Park until run() is called; a dropped sender means the
                // owner went away before ever running us.
                if run_rx.recv().is_ok() {
                    event_loop.run();
                }
            })
            .expect("failed to spawn event-loop thread");
        let handle = handle_rx
            .recv()
            .expect("event-loop thread died during startup");
        EventLoopThread {
            handle,
            thread: Some(thread),
            run_tx,
            started: Once::new(),
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Releases the thread into its loop. Only the first call does
    /// anything; it returns once the loop is actually looping.
    pub fn run(&self) {
        self.started.call_once(|| {
            let (ready_tx, ready_rx) = mpsc::channel();
            self.handle.queue_in_loop(move || {
                let _ = ready_tx.send(());
            });
            let _ = self.run_tx.send(());
            let _ = ready_rx.recv();
        });
    }

    /// Blocks until the loop thread exits.
    pub fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        // A never-released thread would ignore quit; release it first.
        self.run();
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A fixed set of event-loop threads handed out round-robin.
pub struct EventLoopThreadPool {
    threads: Mutex<Vec<EventLoopThread>>,
    handles: Vec<LoopHandle>,
    index: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(thread_num: usize, name: &str) -> EventLoopThreadPool {
        let threads: Vec<_> = (0..thread_num)
            .map(|i| EventLoopThread::new(&format!("{}-{}", name, i)))
            .collect();
        let handles = threads.iter().map(|t| t.handle().clone()).collect();
        EventLoopThreadPool {
            threads: Mutex::new(threads),
            handles,
            index: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Releases every thread into its loop; idempotent.
    pub fn start(&self) {
        for thread in self.threads.lock().unwrap().iter() {
            thread.run();
        }
    }

    /// Joins every loop thread.
    pub fn wait(&self) {
        let mut threads = self.threads.lock().unwrap();
        for thread in threads.iter_mut() {
            thread.wait();
        }
    }

    /// The next loop, round-robin; `None` for an empty pool.
    pub fn next_loop(&self) -> Option<LoopHandle> {
        if self.handles.is_empty() {
            return None;
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        Some(self.handles[index].clone())
    }

    pub fn get_loop(&self, index: usize) -> Option<&LoopHandle> {
        self.handles.get(index)
    }

    pub fn handles(&self) -> &[LoopHandle] {
        &self.handles
    }
}
