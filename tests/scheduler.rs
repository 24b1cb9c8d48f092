use rbksd::adapters::{SimEvent, SimulatedConnector, SimulatedRouter};
use rbksd::core::notifications::{BackupEvent, NotificationChannel};
use rbksd::core::{
    BatchRunner, Clock, DeviceCycle, DeviceDescriptor, ReadinessPolicy, Scheduler,
};
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Records events; once `limit` have arrived, requests a stop shortly after,
/// while the scheduler is sleeping.
struct StopAfter {
    limit: usize,
    events: Mutex<Vec<BackupEvent>>,
    stop: CancellationToken,
}

impl StopAfter {
    fn new(limit: usize, stop: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            limit,
            events: Mutex::new(Vec::new()),
            stop,
        })
    }

    fn events(&self) -> Vec<BackupEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for StopAfter {
    async fn notify(&self, event: BackupEvent) -> anyhow::Result<()> {
        let mut events = self.events.lock().unwrap();
        events.push(event);
        if events.len() == self.limit {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                stop.cancel();
            });
        }
        Ok(())
    }
}

fn scheduler(
    connector: &SimulatedConnector,
    dest: &Path,
    devices: Vec<DeviceDescriptor>,
) -> Scheduler {
    let readiness = ReadinessPolicy::Poll {
        interval: Duration::from_millis(10),
        timeout: Duration::from_millis(200),
    };
    let runner = BatchRunner::new(
        Arc::new(connector.clone()),
        DeviceCycle::new(dest, readiness),
        Duration::from_secs(1),
    );
    Scheduler::new(Arc::new(runner), devices, Duration::from_millis(300))
}

fn connect_attempts(connector: &SimulatedConnector) -> usize {
    connector
        .journal()
        .iter()
        .filter(|e| matches!(e, SimEvent::ConnectAttempt { .. }))
        .count()
}

#[tokio::test]
async fn test_stop_during_second_sleep_runs_two_batches() {
    let dir = tempdir().unwrap();
    let router = DeviceDescriptor::new("192.0.2.1", 22, "admin", "secret");
    let connector = SimulatedConnector::new();
    connector.add_router(&router, SimulatedRouter::new("RouterA"));

    let stop = CancellationToken::new();
    let recorder = StopAfter::new(2, stop.clone());
    let scheduler =
        scheduler(&connector, dir.path(), vec![router]).with_notifier(recorder.clone());

    let batches = timeout(Duration::from_secs(5), scheduler.run(stop))
        .await
        .expect("scheduler did not stop");

    assert_eq!(batches, 2);
    assert_eq!(connect_attempts(&connector), 2);
    assert_eq!(connector.open_sessions(), 0);

    let events = recorder.events();
    assert_eq!(events.len(), 2);
    for (i, event) in events.iter().enumerate() {
        match event {
            BackupEvent::BatchCompleted { iteration, result } => {
                assert_eq!(*iteration, i as u64 + 1);
                assert_eq!(result.success_count, 1);
                assert_eq!(result.failure_count, 0);
            }
            other => panic!("expected BatchCompleted, got {:?}", other),
        }
    }
}

/// Advances one day every time the date is read.
struct NextDayClock {
    start: NaiveDate,
    reads: AtomicU64,
}

impl Clock for NextDayClock {
    fn today(&self) -> NaiveDate {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        self.start + Days::new(n)
    }
}

#[tokio::test]
async fn test_backup_name_follows_the_date_of_each_batch() {
    let dir = tempdir().unwrap();
    let router = DeviceDescriptor::new("192.0.2.1", 22, "admin", "secret");
    let connector = SimulatedConnector::new();
    connector.add_router(&router, SimulatedRouter::new("RouterA"));

    let clock = Arc::new(NextDayClock {
        start: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
        reads: AtomicU64::new(0),
    });
    let runner = BatchRunner::new(
        Arc::new(connector.clone()),
        DeviceCycle::with_clock(dir.path(), ReadinessPolicy::FixedDelay(Duration::ZERO), clock),
        Duration::from_secs(1),
    );

    let stop = CancellationToken::new();
    let recorder = StopAfter::new(2, stop.clone());
    let scheduler = Scheduler::new(
        Arc::new(runner),
        vec![router.clone()],
        Duration::from_millis(300),
    )
    .with_notifier(recorder.clone());

    let batches = timeout(Duration::from_secs(5), scheduler.run(stop))
        .await
        .expect("scheduler did not stop");
    assert_eq!(batches, 2);

    for name in ["RouterA_01-01-2030.backup", "RouterA_02-01-2030.backup"] {
        assert!(dir.path().join(name).exists(), "{} missing locally", name);
    }

    let removals: Vec<String> = connector
        .commands_for(&router)
        .into_iter()
        .filter(|c| c.starts_with("/file remove"))
        .collect();
    assert_eq!(
        removals,
        vec![
            "/file remove RouterA_01-01-2030.backup".to_string(),
            "/file remove RouterA_02-01-2030.backup".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_stop_requested_during_sleep_ends_promptly() {
    let dir = tempdir().unwrap();
    let router = DeviceDescriptor::new("192.0.2.1", 22, "admin", "secret");
    let connector = SimulatedConnector::new();
    connector.add_router(&router, SimulatedRouter::new("RouterA"));

    let readiness = ReadinessPolicy::FixedDelay(Duration::ZERO);
    let runner = BatchRunner::new(
        Arc::new(connector.clone()),
        DeviceCycle::new(dir.path(), readiness),
        Duration::from_secs(1),
    );
    let scheduler = Scheduler::new(Arc::new(runner), vec![router], Duration::from_secs(3600));

    let stop = CancellationToken::new();
    let handle = tokio::spawn({
        let stop = stop.clone();
        async move { scheduler.run(stop).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.cancel();

    let batches = timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler ignored the stop request")
        .unwrap();
    assert_eq!(batches, 1);
}

#[tokio::test]
async fn test_aborted_batch_does_not_end_the_daemon() {
    let dir = tempdir().unwrap();
    let connector = SimulatedConnector::new();
    let invalid = DeviceDescriptor::new("", 22, "admin", "secret");

    let stop = CancellationToken::new();
    let recorder = StopAfter::new(2, stop.clone());
    let scheduler =
        scheduler(&connector, dir.path(), vec![invalid]).with_notifier(recorder.clone());

    let batches = timeout(Duration::from_secs(5), scheduler.run(stop))
        .await
        .expect("scheduler did not stop");

    assert_eq!(batches, 2);
    assert!(
        recorder
            .events()
            .iter()
            .all(|e| matches!(e, BackupEvent::BatchAborted { .. }))
    );
    assert_eq!(connect_attempts(&connector), 0);
}

#[tokio::test]
async fn test_empty_inventory_completes_every_batch() {
    let dir = tempdir().unwrap();
    let connector = SimulatedConnector::new();

    let stop = CancellationToken::new();
    let recorder = StopAfter::new(2, stop.clone());
    let scheduler = scheduler(&connector, dir.path(), Vec::new()).with_notifier(recorder.clone());

    let batches = timeout(Duration::from_secs(5), scheduler.run(stop))
        .await
        .expect("scheduler did not stop");

    assert_eq!(batches, 2);
    for event in recorder.events() {
        match event {
            BackupEvent::BatchCompleted { result, .. } => assert_eq!(result.total(), 0),
            other => panic!("expected BatchCompleted, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let dir = tempdir().unwrap();
    let router = DeviceDescriptor::new("192.0.2.1", 22, "admin", "secret");
    let connector = SimulatedConnector::new();
    connector.add_router(&router, SimulatedRouter::new("RouterA"));

    let stop = CancellationToken::new();
    stop.cancel();

    let batches = scheduler(&connector, dir.path(), vec![router])
        .run(stop)
        .await;

    assert_eq!(batches, 0);
    assert!(connector.journal().is_empty());
}
