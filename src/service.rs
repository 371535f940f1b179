// Cooperative service scheduler. Each service runs as its own tokio task on a
// fixed tick; a failing cycle is logged and retried after a short backoff
// without touching any other service.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A periodic unit of work with a managed lifecycle. `setup` runs once before
/// the first cycle, `teardown` once after the last; `cycle` errors are
/// contained by the scheduler.
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &str;
    fn interval(&self) -> Duration;

    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn cycle(&mut self) -> Result<()>;

    async fn teardown(&mut self) {}
}

/// Running service: the task plus the controls to observe and stop it.
pub struct ServiceHandle {
    name: String,
    interval: Duration,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    last_success: Arc<AtomicI64>,
}

impl ServiceHandle {
    /// Run setup, then launch the tick loop. Setup failures surface to the
    /// caller; once spawned, the service only stops when asked.
    pub async fn spawn(mut service: impl Service) -> Result<ServiceHandle> {
        let name = service.name().to_string();
        let interval = service.interval();
        service
            .setup()
            .await
            .with_context(|| format!("{} setup failed", name))?;

        let (stop, mut stop_rx) = watch::channel(false);
        let last_success = Arc::new(AtomicI64::new(Utc::now().timestamp()));
        let success = last_success.clone();
        let task = tokio::spawn(async move {
            info!("{} started, cycling every {:?}", service.name(), interval);
            loop {
                let pause = match service.cycle().await {
                    Ok(()) => {
                        success.store(Utc::now().timestamp(), Ordering::Relaxed);
                        interval
                    }
                    Err(e) => {
                        error!("{} cycle failed: {:#}", service.name(), e);
                        ERROR_BACKOFF
                    }
                };
                if stopped_within(&mut stop_rx, pause).await {
                    break;
                }
            }
            service.teardown().await;
            info!("{} stopped", service.name());
        });

        Ok(ServiceHandle {
            name,
            interval,
            stop,
            task,
            last_success,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request a stop and wait for teardown to finish. The current cycle runs
    /// to completion; any pending sleep is cut short.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }

    pub fn health(&self) -> ServiceHealth {
        let last_success = self.last_success.load(Ordering::Relaxed);
        ServiceHealth {
            name: self.name.clone(),
            last_success,
            stale: is_stale(last_success, self.interval, Utc::now().timestamp()),
        }
    }
}

/// Wait out the pause, returning early (and true) when a stop arrives.
async fn stopped_within(stop: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

/// A service with no successful cycle within twice its interval is stale.
fn is_stale(last_success: i64, interval: Duration, now: i64) -> bool {
    now - last_success >= 2 * interval.as_secs() as i64
}

#[derive(Clone, Debug)]
pub struct ServiceHealth {
    pub name: String,
    pub last_success: i64,
    pub stale: bool,
}

/// Owns every running service. Dropping the manager without `stop_all` aborts
/// nothing; stopping is always explicit.
#[derive(Default)]
pub struct ServiceManager {
    handles: Vec<ServiceHandle>,
}

impl ServiceManager {
    pub fn new() -> ServiceManager {
        ServiceManager::default()
    }

    pub async fn spawn(&mut self, service: impl Service) -> Result<()> {
        self.handles.push(ServiceHandle::spawn(service).await?);
        Ok(())
    }

    pub fn health(&self) -> Vec<ServiceHealth> {
        self.handles.iter().map(ServiceHandle::health).collect()
    }

    /// Stop services in reverse spawn order, each fully torn down before the
    /// next begins.
    pub async fn stop_all(mut self) {
        while let Some(handle) = self.handles.pop() {
            info!("stopping {}", handle.name());
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        cycles: Arc<AtomicUsize>,
        teardowns: Arc<AtomicUsize>,
        fail: bool,
        fail_setup: bool,
    }

    impl Counter {
        fn new() -> (Counter, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let cycles = Arc::new(AtomicUsize::new(0));
            let teardowns = Arc::new(AtomicUsize::new(0));
            let service = Counter {
                cycles: cycles.clone(),
                teardowns: teardowns.clone(),
                fail: false,
                fail_setup: false,
            };
            (service, cycles, teardowns)
        }
    }

    #[async_trait]
    impl Service for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn setup(&mut self) -> Result<()> {
            if self.fail_setup {
                anyhow::bail!("refusing to start");
            }
            Ok(())
        }

        async fn cycle(&mut self) -> Result<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("cycle exploded");
            }
            Ok(())
        }

        async fn teardown(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn cycles_on_interval_and_tears_down_on_stop() {
        let (service, cycles, teardowns) = Counter::new();
        let handle = ServiceHandle::spawn(service).await.unwrap();
        tokio::time::sleep(Duration::from_millis(55)).await;
        handle.stop().await;
        let ran = cycles.load(Ordering::SeqCst);
        assert!(ran >= 3, "expected several cycles, got {}", ran);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn setup_failure_surfaces_to_caller() {
        let (mut service, _, teardowns) = Counter::new();
        service.fail_setup = true;
        assert!(ServiceHandle::spawn(service).await.is_err());
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_cycle_backs_off_instead_of_dying() {
        let (mut service, cycles, _) = Counter::new();
        service.fail = true;
        let handle = ServiceHandle::spawn(service).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // One failed cycle, then the backoff pause; still alive and stoppable.
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        let stopped = tokio::time::timeout(Duration::from_millis(500), handle.stop()).await;
        assert!(stopped.is_ok(), "stop must interrupt the backoff pause");
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_interval() {
        struct Sleepy;
        #[async_trait]
        impl Service for Sleepy {
            fn name(&self) -> &str {
                "sleepy"
            }
            fn interval(&self) -> Duration {
                Duration::from_secs(3600)
            }
            async fn cycle(&mut self) -> Result<()> {
                Ok(())
            }
        }
        let handle = ServiceHandle::spawn(Sleepy).await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_millis(500), handle.stop()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn manager_stops_in_reverse_order() {
        let mut manager = ServiceManager::new();
        let (first, _, first_teardowns) = Counter::new();
        let (second, _, second_teardowns) = Counter::new();
        manager.spawn(first).await.unwrap();
        manager.spawn(second).await.unwrap();
        assert_eq!(manager.health().len(), 2);
        manager.stop_all().await;
        assert_eq!(first_teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(second_teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn staleness_is_twice_the_interval() {
        let interval = Duration::from_secs(60);
        assert!(!is_stale(1000, interval, 1060));
        assert!(!is_stale(1000, interval, 1119));
        assert!(is_stale(1000, interval, 1120));
    }
}
