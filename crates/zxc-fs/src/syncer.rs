//! Background write-back and reconnection
//!
//! One cooperative task per filesystem. It coalesces sync requests
//! (mutating operations signal it without blocking), enforces the
//! minimum interval between syncs, and sequences reconnection: after
//! an I/O failure it keeps redialing on a short interval and holds the
//! dirty state locally until the remote answers again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use zxc_core::FsError;

use crate::remote::Remote;
use crate::store::Cache;

/// Retry interval while a burst of sync requests is being coalesced.
const COALESCE_IVAL: Duration = Duration::from_secs(1);

pub(crate) struct Syncer {
    remote: Arc<dyn Remote>,
    cache: Cache,
    sync_ival: Duration,
    redial_ival: Duration,
    redial_ok: bool,
}

enum Event {
    Sync,
    Redial,
    Tick,
    Closed,
}

impl Syncer {
    pub(crate) fn new(
        remote: Arc<dyn Remote>,
        cache: Cache,
        sync_ival: Duration,
        redial_ival: Duration,
        redial_ok: bool,
    ) -> Syncer {
        Syncer {
            remote,
            cache,
            sync_ival,
            redial_ival,
            redial_ok,
        }
    }

    /// Run until both signal channels are closed. The owning
    /// filesystem performs the final sync itself.
    pub(crate) async fn run(
        self,
        mut sync_rx: mpsc::Receiver<()>,
        mut redial_rx: mpsc::Receiver<()>,
    ) {
        let mut ival = self.sync_ival;
        let mut last = Instant::now();
        let mut redialing = false;
        loop {
            let ev = tokio::select! {
                m = redial_rx.recv() => match m {
                    Some(()) => Event::Redial,
                    None => Event::Closed,
                },
                m = sync_rx.recv() => match m {
                    Some(()) => Event::Sync,
                    None => Event::Closed,
                },
                _ = tokio::time::sleep(ival) => Event::Tick,
            };
            match ev {
                Event::Closed => break,
                Event::Redial => {
                    redialing = true;
                    if self.redial().await.is_ok() {
                        redialing = false;
                        ival = self.sync_ival;
                    } else {
                        ival = self.redial_ival;
                    }
                }
                Event::Sync => {
                    if last.elapsed() < self.sync_ival {
                        // too soon; pick the request up on a short tick
                        ival = COALESCE_IVAL;
                        continue;
                    }
                    self.step(&mut redialing, &mut ival, &mut last).await;
                }
                Event::Tick => {
                    self.step(&mut redialing, &mut ival, &mut last).await;
                }
            }
        }
        debug!("syncer done");
    }

    /// One sync round, redialing first when the remote is known down.
    async fn step(&self, redialing: &mut bool, ival: &mut Duration, last: &mut Instant) {
        if *redialing {
            if self.redial().await.is_err() {
                *ival = self.redial_ival;
                return;
            }
            *redialing = false;
        }
        match self.sync_all().await {
            Err(e) if e.is_io() && self.redial_ok => {
                *redialing = true;
                *ival = self.redial_ival;
            }
            res => {
                if let Err(e) = res {
                    warn!("sync: {}", e);
                }
                *ival = self.sync_ival;
                *last = Instant::now();
            }
        }
    }

    async fn redial(&self) -> Result<(), FsError> {
        if !self.remote.supports_redial() {
            return Err(FsError::Unsupported(self.remote.name().to_string()));
        }
        match self.remote.redial().await {
            Ok(()) => {
                info!("{}: reconnected", self.remote.name());
                Ok(())
            }
            Err(e) => {
                debug!("redial: {}", e);
                Err(e)
            }
        }
    }

    async fn sync_all(&self) -> Result<(), FsError> {
        self.cache.sync(&self.remote).await?;
        if self.remote.supports_sync() {
            self.remote.sync().await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Fs;
    use crate::remote::byte_stream;
    use crate::testfs::MemRemote;
    use zxc_core::{Config, Dir};

    fn file_put(content: &[u8]) -> (Dir, crate::remote::ByteStream) {
        (
            Dir::from_iter([("type", "-")]),
            byte_stream(content.to_vec()),
        )
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, ms: u64) -> bool {
        for _ in 0..(ms / 20) {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_back_reaches_remote() {
        let remote = MemRemote::shared();
        let mut config = Config::default();
        config.sync.sync_interval_secs = 1;
        let fs = Fs::new(remote.clone(), &config).await.unwrap();

        let (d, data) = file_put(b"hi");
        fs.put("/a", d, 0, Some(data)).await.unwrap();
        // Not write-through: the remote lags until the syncer runs.
        assert!(remote.stat("/a").await.unwrap_err().is_not_exist());

        let r = remote.clone();
        assert!(wait_for(move || r.stat_sync("/a").is_ok(), 3000).await);
        assert_eq!(remote.stat("/a").await.unwrap().size(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_redial_recovers_and_flushes() {
        let remote = MemRemote::shared();
        remote.set_heal_on_redial(true);
        let mut config = Config::default();
        config.sync.sync_interval_secs = 1;
        config.sync.redial_interval_secs = 1;
        let fs = Fs::new(remote.clone(), &config).await.unwrap();

        // Warm the root listing, then lose the remote.
        crate::remote::collect(fs.get("/", 0, zxc_core::ALL))
            .await
            .unwrap();
        remote.set_offline(true);

        let (d, data) = file_put(b"bridge");
        fs.put("/a", d, 0, Some(data)).await.unwrap();

        // The syncer hits the outage, redials (which heals the fake
        // remote), and the dirty file eventually lands upstream.
        let r = remote.clone();
        assert!(wait_for(move || r.stat_sync("/a").is_ok(), 5000).await);
    }

    #[tokio::test]
    async fn test_close_performs_final_sync() {
        let remote = MemRemote::shared();
        // Long interval: only the final sync can explain the flush.
        let fs = Fs::new(remote.clone(), &Config::default()).await.unwrap();

        let (d, data) = file_put(b"bye");
        fs.put("/a", d, 0, Some(data)).await.unwrap();
        assert!(remote.stat("/a").await.unwrap_err().is_not_exist());

        fs.close().await.unwrap();
        assert_eq!(remote.stat("/a").await.unwrap().size(), 3);
    }
}
