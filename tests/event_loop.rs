use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use netloop::{EventLoopThread, TimerId, TimerPriority};

mod util;

#[test]
fn run_in_loop_runs_on_the_loop_thread() {
    util::init();
    let thread = EventLoopThread::new("loop-test");
    thread.run();
    let handle = thread.handle();

    assert!(!handle.is_in_loop_thread());

    let (tx, rx) = mpsc::channel();
    let check = handle.clone();
    handle.run_in_loop(move || {
        let _ = tx.send(check.is_in_loop_thread());
    });
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn queued_tasks_preserve_order() {
    util::init();
    let thread = EventLoopThread::new("loop-order");
    thread.run();
    let handle = thread.handle();

    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let log = Arc::clone(&log);
        handle.queue_in_loop(move || log.lock().unwrap().push(i));
    }
    let (tx, rx) = mpsc::channel();
    handle.queue_in_loop(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let log = log.lock().unwrap();
    assert_eq!(*log, (0..100).collect::<Vec<_>>());
}

#[test]
fn run_on_quit_runs_at_shutdown() {
    util::init();
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let thread = EventLoopThread::new("loop-quit");
        thread.run();
        let ran = Arc::clone(&ran);
        thread.handle().run_on_quit(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        // Dropping quits the loop and joins the thread.
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn run_after_fires_once() {
    util::init();
    let thread = EventLoopThread::new("timer-once");
    thread.run();

    let fired = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&fired);
    let start = Instant::now();
    let (tx, rx) = mpsc::channel();
    thread
        .handle()
        .run_after(Duration::from_millis(50), move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn run_every_respects_the_interval() {
    util::init();
    let thread = EventLoopThread::new("timer-every");
    thread.run();

    let stamps = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&stamps);
    let (tx, rx) = mpsc::channel();
    let handle = thread.handle().clone();
    let id = handle.run_every(Duration::from_millis(40), move |_| {
        let mut log = log.lock().unwrap();
        log.push(Instant::now());
        if log.len() == 4 {
            let _ = tx.send(());
        }
    });
    assert_ne!(id, TimerId::INVALID);

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.cancel_timer(id);

    let stamps = stamps.lock().unwrap();
    for pair in stamps.windows(2) {
        // Modulo scheduler skew, consecutive firings are at least an
        // interval apart.
        assert!(pair[1] - pair[0] >= Duration::from_millis(35));
    }
}

#[test]
fn repeating_timer_cancelled_on_fifth_run_fires_exactly_five_times() {
    util::init();
    let thread = EventLoopThread::new("timer-cancel");
    thread.run();
    let handle = thread.handle().clone();

    let count = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&count);
    let cancel_handle = handle.clone();
    let (tx, rx) = mpsc::channel();
    handle.run_every(Duration::from_millis(20), move |id| {
        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 5 {
            cancel_handle.cancel_timer(id);
            let _ = tx.send(());
        }
    });

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(count.load(Ordering::SeqCst), 5);
}

#[test]
fn cancelled_timer_never_fires() {
    util::init();
    let thread = EventLoopThread::new("timer-cancelled");
    thread.run();
    let handle = thread.handle().clone();

    let fired = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&fired);
    let id = handle.run_after(Duration::from_millis(150), move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    handle.cancel_timer(id);

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn event_callback_override_preempts_dispatch() {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    util::init();
    let (mut left, right) = UnixStream::pair().unwrap();

    let events = Arc::new(AtomicUsize::new(0));
    let reads = Arc::new(AtomicUsize::new(0));
    let event_hits = Arc::clone(&events);
    let read_hits = Arc::clone(&reads);

    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        let event_loop = netloop::EventLoop::new().unwrap();
        let token = event_loop.add_channel(right.as_raw_fd());
        let channel = event_loop.channel(token);

        let quitter = event_loop.handle();
        channel.set_event_callback(move || {
            event_hits.fetch_add(1, Ordering::SeqCst);
            quitter.quit();
        });
        channel.set_read_callback(move || {
            read_hits.fetch_add(1, Ordering::SeqCst);
        });
        channel.enable_reading();

        tx.send(()).unwrap();
        event_loop.run();
        drop(right);
    });

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    left.write_all(b"x").unwrap();
    thread.join().unwrap();

    // The override swallowed the event; the read callback never ran.
    assert!(events.load(Ordering::SeqCst) >= 1);
    assert_eq!(reads.load(Ordering::SeqCst), 0);
}

#[test]
fn timer_tiers_run_highest_normal_lowest_within_a_tick() {
    util::init();
    let thread = EventLoopThread::new("timer-tiers");
    thread.run();
    let handle = thread.handle().clone();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    // Install all three from the loop thread so they share one deadline
    // and expire in the same tick.
    let log = Arc::clone(&order);
    let scheduling = handle.clone();
    handle.run_in_loop(move || {
        let when = Instant::now() + Duration::from_millis(50);

        let order = Arc::clone(&log);
        scheduling.run_at_prioritized(
            when,
            move |_| order.lock().unwrap().push("lowest"),
            TimerPriority::Lowest,
        );
        let order = Arc::clone(&log);
        scheduling.run_at_prioritized(
            when,
            move |_| order.lock().unwrap().push("normal"),
            TimerPriority::Normal,
        );
        let order = Arc::clone(&log);
        let done = tx.clone();
        scheduling.run_at_prioritized(
            when,
            move |_| {
                order.lock().unwrap().push("highest");
                let _ = done.send(());
            },
            TimerPriority::Highest,
        );
    });

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let order = order.lock().unwrap();
    assert_eq!(*order, vec!["highest", "normal", "lowest"]);
}
