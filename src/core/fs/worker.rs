//! Background prefetch threads
//!
//! Workers share one command channel and run [`PixelMapFs::prefetch_tick`]
//! for every tick they receive.

use super::PixelMapFs;
use crate::error::Result;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrefetchCommand {
    /// Run one prefetch pass at the given unix time
    Tick(f64),
    Shutdown,
}

pub struct PrefetchWorker {
    sender: Sender<PrefetchCommand>,
    handles: Vec<JoinHandle<()>>,
}

impl PrefetchWorker {
    /// Start `config.workers` threads (at least one)
    pub fn spawn(fs: Arc<PixelMapFs>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let workers = fs.config().workers.max(1);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let fs = Arc::clone(&fs);
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("pixelmap-prefetch-{}", id))
                .spawn(move || run(id, fs, receiver))?;
            handles.push(handle);
        }

        Ok(PrefetchWorker { sender, handles })
    }

    /// Queue a prefetch pass; false once the workers are gone
    pub fn tick(&self, now: f64) -> bool {
        self.sender.send(PrefetchCommand::Tick(now)).is_ok()
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for _ in &self.handles {
            let _ = self.sender.send(PrefetchCommand::Shutdown);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Prefetch worker panicked");
            }
        }
    }
}

impl Drop for PrefetchWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(id: usize, fs: Arc<PixelMapFs>, receiver: Receiver<PrefetchCommand>) {
    while let Ok(command) = receiver.recv() {
        match command {
            PrefetchCommand::Tick(now) => match fs.prefetch_tick(now) {
                Ok(0) => {}
                Ok(n) => debug!("Worker {} prefetched {} files", id, n),
                Err(e) => warn!("Worker {} prefetch failed: {}", id, e),
            },
            PrefetchCommand::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::unix_now;
    use std::time::{Duration, Instant};

    #[test]
    fn test_worker_prefetches() {
        let mut config = MountConfig::read_write();
        config.workers = 2;
        let fs = Arc::new(PixelMapFs::format(256, config).unwrap());
        fs.write("/w", b"warm data", 0).unwrap();
        fs.read("/w", 100, 0).unwrap();
        fs.read("/w", 100, 0).unwrap();

        let worker = PrefetchWorker::spawn(Arc::clone(&fs)).unwrap();
        assert_eq!(worker.workers(), 2);
        assert!(worker.tick(unix_now()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while fs.stats().prefetch.cached_entries == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        worker.shutdown();

        assert_eq!(fs.stats().prefetch.cached_entries, 1);
        assert_eq!(fs.read("/w", 4, 0).unwrap(), b"warm");
        assert_eq!(fs.stats().prefetch_hits, 1);
    }
}
