use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::{mpsc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use log::error;

use crate::InetAddr;

/// Hostname lookup with a process-wide TTL cache.
///
/// Hits invoke the callback on the caller; misses run `getaddrinfo` (via
/// the standard library) on one shared background worker so a slow lookup
/// never blocks an event loop. Failed lookups yield the
/// [unspecified](InetAddr::unspecified) address and are not cached.
pub struct Resolver {
    ttl: Duration,
}

impl Resolver {
    /// `ttl` of zero means cached entries never expire.
    pub fn new(ttl: Duration) -> Resolver {
        Resolver { ttl }
    }

    /// Resolves `hostname`, calling `cb` with the first address (port 0).
    pub fn resolve(&self, hostname: &str, cb: impl FnOnce(InetAddr) + Send + 'static) {
        if let Some(addr) = cache_lookup(hostname, self.ttl) {
            cb(addr);
            return;
        }
        let name = hostname.to_string();
        let ttl = self.ttl;
        worker().run(move || {
            // Another queued lookup may have resolved it meanwhile.
            if let Some(addr) = cache_lookup(&name, ttl) {
                cb(addr);
                return;
            }
            let addr = lookup(&name);
            cb(addr);
            if !addr.is_unspecified() {
                cache()
                    .lock()
                    .unwrap()
                    .insert(name, (addr, Instant::now()));
            }
        });
    }

    /// Blocking [`resolve`](Resolver::resolve).
    pub fn sync_resolve(&self, hostname: &str) -> InetAddr {
        let (tx, rx) = mpsc::channel();
        self.resolve(hostname, move |addr| {
            let _ = tx.send(addr);
        });
        rx.recv().unwrap_or_else(|_| InetAddr::unspecified())
    }
}

fn lookup(name: &str) -> InetAddr {
    match (name, 0u16).to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .map(InetAddr::from)
            .unwrap_or_else(InetAddr::unspecified),
        Err(err) => {
            error!("failed to resolve {}: {}", name, err);
            InetAddr::unspecified()
        }
    }
}

type Cache = Mutex<HashMap<String, (InetAddr, Instant)>>;

fn cache() -> &'static Cache {
    static CACHE: OnceLock<Cache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cache_lookup(name: &str, ttl: Duration) -> Option<InetAddr> {
    let cache = cache().lock().unwrap();
    let (addr, stamp) = cache.get(name)?;
    if ttl.is_zero() || stamp.elapsed() < ttl {
        Some(*addr)
    } else {
        None
    }
}

/// One background thread working a FIFO of closures.
struct SerialTaskQueue {
    tx: mpsc::Sender<Box<dyn FnOnce() + Send>>,
}

impl SerialTaskQueue {
    fn new(name: &str) -> SerialTaskQueue {
        let (tx, rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .expect("failed to spawn resolver worker");
        SerialTaskQueue { tx }
    }

    fn run(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(task));
    }
}

fn worker() -> &'static SerialTaskQueue {
    static WORKER: OnceLock<SerialTaskQueue> = OnceLock::new();
    WORKER.get_or_init(|| SerialTaskQueue::new("dns-resolver"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_resolve_localhost() {
        let resolver = Resolver::new(Duration::ZERO);
        let addr = resolver.sync_resolve("localhost");
        assert!(!addr.is_unspecified());
        assert!(addr.is_loopback());
    }

    #[test]
    fn caches_across_resolvers() {
        let resolver = Resolver::new(Duration::ZERO);
        let first = resolver.sync_resolve("localhost");
        // Second lookup must come straight from the cache, on the caller.
        let (tx, rx) = mpsc::channel();
        resolver.resolve("localhost", move |addr| {
            let _ = tx.send(addr);
        });
        let second = rx.recv().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_host_is_unspecified() {
        let resolver = Resolver::new(Duration::from_secs(60));
        let addr = resolver.sync_resolve("no-such-host.invalid.");
        assert!(addr.is_unspecified());
    }
}
