//! Job administration and trigger registration

mod common;

use common::*;
use lanwatch::discovery::Method;
use lanwatch::store::{ExecutionStatus, JobUpdate, NewJob};
use lanwatch::{ClientProvider, DaemonConfig, Database, JournalKind, MonitorRegistry, Scheduler, WatchError};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::assert_ok;

struct Harness {
    db: Database,
    recon: Arc<FakeRecon>,
    monitors: Arc<MonitorRegistry>,
    scheduler: Scheduler,
    _dir: TempDir,
}

fn harness_with(provider: Arc<dyn ClientProvider>, recon: Arc<FakeRecon>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::in_memory().unwrap();
    let config = DaemonConfig {
        lock_path: dir.path().join("scheduler.lock"),
        ..Default::default()
    };
    let monitors = Arc::new(MonitorRegistry::new(db.clone(), Arc::clone(&provider), fast_monitor(3)));
    let scheduler = Scheduler::new(
        db.clone(),
        runner(&db, Arc::clone(&provider)),
        Arc::clone(&monitors),
        provider,
        &config,
    );
    Harness {
        db,
        recon,
        monitors,
        scheduler,
        _dir: dir,
    }
}

fn harness() -> Harness {
    let recon = FakeRecon::new(EventFeed::Fixed(vec![]));
    harness_with(FakeProvider::new(recon.clone()), recon)
}

fn new_job(name: &str, method: Method, enabled: bool) -> NewJob {
    NewJob {
        name: name.to_string(),
        ranges: vec!["192.168.1.0/24".into()],
        method,
        params: Default::default(),
        cron: "*/5 * * * *".into(),
        enabled,
    }
}

#[tokio::test]
async fn test_second_enabled_recon_job_rejected() {
    let h = harness();
    let first = h.scheduler.create_job(new_job("office", Method::RestTool, true)).await.unwrap();

    let err = h
        .scheduler
        .create_job(new_job("lab", Method::RestTool, true))
        .await
        .unwrap_err();
    match err {
        WatchError::SchedulingConflict { job_id, name } => {
            assert_eq!(job_id, first.id);
            assert_eq!(name, "office");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.db.list_jobs().unwrap().len(), 1);

    // a disabled second recon job is fine, enabling it is not
    let second = h.scheduler.create_job(new_job("lab", Method::RestTool, false)).await.unwrap();
    assert!(matches!(
        h.scheduler.toggle_job(second.id).await,
        Err(WatchError::SchedulingConflict { .. })
    ));
    assert!(!h.db.require_job(second.id).unwrap().enabled);
    assert_eq!(h.db.require_job(first.id).unwrap(), first);

    assert_ok!(h.scheduler.toggle_job(first.id).await);
    assert!(h.scheduler.toggle_job(second.id).await.unwrap().enabled);

    // nmap jobs are not limited
    assert_ok!(h.scheduler.create_job(new_job("sweep a", Method::CliTool, true)).await);
    assert_ok!(h.scheduler.create_job(new_job("sweep b", Method::CliTool, true)).await);
}

#[tokio::test]
async fn test_job_validation() {
    let h = harness();

    let mut bad_cron = new_job("x", Method::CliTool, true);
    bad_cron.cron = "every minute".into();
    assert!(matches!(
        h.scheduler.create_job(bad_cron).await,
        Err(WatchError::InvalidCron { .. })
    ));

    let mut no_ranges = new_job("x", Method::CliTool, true);
    no_ranges.ranges.clear();
    assert!(matches!(h.scheduler.create_job(no_ranges).await, Err(WatchError::Validation(_))));

    let mut bad_range = new_job("x", Method::CliTool, true);
    bad_range.ranges = vec!["10.0.0.0/33".into()];
    assert!(matches!(h.scheduler.create_job(bad_range).await, Err(WatchError::InvalidRange(_))));

    assert!(matches!(
        h.scheduler.create_job(new_job("  ", Method::CliTool, true)).await,
        Err(WatchError::Validation(_))
    ));
    assert!(h.db.list_jobs().unwrap().is_empty());

    // short prefixes are well-formed
    let mut wide = new_job("wide", Method::CliTool, true);
    wide.ranges = vec!["10.0.0.0/8".into()];
    assert_ok!(h.scheduler.create_job(wide).await);

    let recon = FakeRecon::new(EventFeed::Fixed(vec![]));
    let unconfigured = harness_with(FakeProvider::unconfigured(recon.clone()), recon);
    assert!(matches!(
        unconfigured.scheduler.create_job(new_job("r", Method::RestTool, true)).await,
        Err(WatchError::NotConfigured)
    ));
    // disabled recon jobs can be stored before the service is set up
    unconfigured
        .scheduler
        .create_job(new_job("r", Method::RestTool, false))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_trigger_rules_and_execution_history() {
    let h = harness();
    let recon_job = h.scheduler.create_job(new_job("recon", Method::RestTool, true)).await.unwrap();
    let disabled = h.scheduler.create_job(new_job("off", Method::CliTool, false)).await.unwrap();
    let sweep = h.scheduler.create_job(new_job("sweep", Method::CliTool, true)).await.unwrap();

    assert!(matches!(h.scheduler.run_job_now(recon_job.id).await, Err(WatchError::Validation(_))));
    assert!(matches!(h.scheduler.trigger_job(disabled.id), Err(WatchError::Validation(_))));
    assert!(matches!(h.scheduler.run_job_now(999).await, Err(WatchError::NotFound(_))));

    // the nmap binary is missing, so the firing fails but is recorded
    let execution = h.scheduler.run_job_now(sweep.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.finished_at.is_some());
    assert!(h.db.require_job(sweep.id).unwrap().last_run_at.is_some());

    let history = h.db.executions(sweep.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    let logs = h.scheduler.job_logs(sweep.id, JournalKind::Friendly).unwrap();
    assert!(logs[0].contains("status failed"));
    assert!(logs.iter().any(|l| l.starts_with("error:")));
}

#[tokio::test]
async fn test_started_scheduler_follows_job_changes() {
    let h = harness();
    assert!(h.scheduler.start().await.unwrap());
    assert!(h.scheduler.start().await.unwrap());

    let status = h.scheduler.status().await;
    assert!(status.running);
    assert!(status.owns_lock);
    assert!(status.active_job_ids.is_empty());

    let recon_job = h.scheduler.create_job(new_job("recon", Method::RestTool, true)).await.unwrap();
    let sweep = h.scheduler.create_job(new_job("sweep", Method::CliTool, true)).await.unwrap();
    assert!(eventually(|| h.recon.count("net.recon on") == 1).await);

    let status = h.scheduler.status().await;
    assert_eq!(status.active_job_ids, vec![recon_job.id, sweep.id]);
    assert_eq!(status.monitor_job_ids, vec![recon_job.id]);

    // disabling a recon job tears its monitor down
    h.scheduler.toggle_job(recon_job.id).await.unwrap();
    assert!(!h.monitors.is_running(recon_job.id).await);
    assert_eq!(h.recon.count("net.recon off"), 1);

    // switching an nmap job to recon moves it to a monitor
    h.scheduler
        .update_job(
            sweep.id,
            JobUpdate {
                method: Some(Method::RestTool),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(h.monitors.is_running(sweep.id).await);

    h.scheduler.delete_job(sweep.id).await.unwrap();
    assert!(!h.monitors.is_running(sweep.id).await);
    assert!(h.scheduler.status().await.active_job_ids.is_empty());

    h.scheduler.shutdown().await;
    let status = h.scheduler.status().await;
    assert!(!status.running);
    assert!(!status.owns_lock);

    let types: Vec<String> = h.db.recent_events(50).unwrap().into_iter().map(|e| e.event_type).collect();
    assert!(types.contains(&"scheduler_started".to_string()));
    assert!(types.contains(&"scheduler_stopped".to_string()));
}

#[tokio::test]
async fn test_only_one_scheduler_owns_the_lock() {
    let h = harness();
    assert!(h.scheduler.start().await.unwrap());

    let db = Database::in_memory().unwrap();
    let recon = FakeRecon::new(EventFeed::Fixed(vec![]));
    let provider: Arc<dyn ClientProvider> = FakeProvider::new(recon);
    let config = DaemonConfig {
        lock_path: h._dir.path().join("scheduler.lock"),
        ..Default::default()
    };
    let monitors = Arc::new(MonitorRegistry::new(db.clone(), Arc::clone(&provider), fast_monitor(3)));
    let other = Scheduler::new(db.clone(), runner(&db, Arc::clone(&provider)), monitors, provider, &config);

    assert!(!other.start().await.unwrap());
    assert!(!other.is_started());
    assert!(lanwatch::scheduler::probe_lock(&config.lock_path).unwrap());

    h.scheduler.shutdown().await;
    assert!(!lanwatch::scheduler::probe_lock(&config.lock_path).unwrap());
    assert!(other.start().await.unwrap());
    other.shutdown().await;
}

#[tokio::test]
async fn test_sync_picks_up_changes_from_other_processes() {
    let h = harness();
    h.scheduler.start().await.unwrap();

    // written straight to the store, as the CLI process does
    let job = h.db.create_job(&new_job("external", Method::CliTool, true)).unwrap();
    assert!(h.scheduler.status().await.active_job_ids.is_empty());

    h.scheduler.sync_from_store().await.unwrap();
    assert_eq!(h.scheduler.status().await.active_job_ids, vec![job.id]);

    let mut disabled = job.clone();
    disabled.enabled = false;
    h.db.save_job(&disabled).unwrap();
    h.scheduler.sync_from_store().await.unwrap();
    assert!(h.scheduler.status().await.active_job_ids.is_empty());

    h.scheduler.shutdown().await;
}
