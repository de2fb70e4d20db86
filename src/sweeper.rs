//! Background sweeper for expired typing indicators.
//!
//! Reads already ignore expired rows, so the sweeper only reclaims space.
//! A missed or failed run is harmless.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::core::RoutingFacade;
use crate::error::{Error, Result};

pub struct ExpirySweeper {
    facade: Arc<RoutingFacade>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl ExpirySweeper {
    pub fn new(facade: Arc<RoutingFacade>, interval: Duration) -> Self {
        Self {
            facade,
            interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Delete everything expired as of the facade clock.
    pub async fn run_once(&self) -> Result<usize> {
        let now = self.facade.clock().now();
        self.facade.presence().sweep_expired(now).await
    }

    /// Sweep until stopped.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(Error::Internal("Sweeper already running".to_string()));
        }
        *running = true;
        drop(running);

        tracing::info!("Typing sweeper started (every {:?})", self.interval);

        loop {
            {
                let running = self.running.read().await;
                if !*running {
                    tracing::info!("Typing sweeper stopping");
                    break;
                }
            }

            if let Err(e) = self.run_once().await {
                tracing::warn!("Typing sweep failed: {}", e);
            }

            sleep(self.interval).await;
        }

        Ok(())
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::core::{FacadeOptions, ManualClock};
    use crate::identity::JwtGateway;
    use crate::store::{RecordStore, SqliteStore};
    use chrono::{Duration as ChronoDuration, Utc};

    fn facade(store: Arc<SqliteStore>, clock: Arc<ManualClock>) -> Arc<RoutingFacade> {
        Arc::new(RoutingFacade::new(
            store,
            Arc::new(JwtGateway::new("test-secret", 60)),
            Arc::new(EventBus::default()),
            clock,
            FacadeOptions::default(),
        ))
    }

    #[tokio::test]
    async fn test_run_once_removes_expired_rows() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sweeper = ExpirySweeper::new(facade(store.clone(), clock.clone()), Duration::from_secs(30));

        let now = Utc::now();
        store
            .upsert_typing("s1", None, "a1", now, now + ChronoDuration::seconds(10))
            .await
            .unwrap();

        clock.set(now + ChronoDuration::seconds(5));
        assert_eq!(sweeper.run_once().await.unwrap(), 0);
        clock.set(now + ChronoDuration::seconds(10));
        assert_eq!(sweeper.run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_loop_stops_on_flag() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sweeper = Arc::new(ExpirySweeper::new(facade(store, clock), Duration::from_millis(10)));

        let task = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.start().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sweeper.start().await.is_err());

        sweeper.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
