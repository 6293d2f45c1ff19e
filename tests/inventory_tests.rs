//! Scan output through reconciliation into the device registry

mod common;

use common::*;
use lanwatch::discovery::{HostInfo, Method};
use lanwatch::recon::Endpoint;
use lanwatch::runner::ScanRequest;
use lanwatch::utils::cidr;
use lanwatch::store::{JobParams, RunStatus};
use lanwatch::{parse_nmap_output, Database, Reconciler};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio_test::assert_err;

const SWEEP: &str = "\
Starting Nmap 7.94 ( https://nmap.org ) at 2024-05-01 10:00 UTC
Nmap scan report for printer.lan (192.168.50.9)
Host is up (0.0021s latency).
MAC Address: 3C:2A:F4:00:00:09 (Brother Industries)
Nmap scan report for 192.168.50.11
Host is up.
Nmap done: 256 IP addresses (2 hosts up) scanned in 2.10 seconds
";

#[test]
fn test_sweep_creates_new_and_marks_absent() {
    let db = Database::in_memory().unwrap();
    let reconciler = Reconciler::new(db.clone());
    let known = Ipv4Addr::new(192, 168, 50, 7);
    reconciler
        .observe(
            known,
            &HostInfo {
                mac: Some("02:00:00:00:00:07".into()),
                ..Default::default()
            },
            Method::CliTool,
        )
        .unwrap();

    let observations = parse_nmap_output(SWEEP);
    assert_eq!(observations.len(), 2);

    let universe = cidr::parse_ranges(&["192.168.50.0/24"]).unwrap();
    assert_eq!(cidr::host_count(&universe), 254);

    let stats = reconciler
        .reconcile(&observations, Method::CliTool, true, Some(universe.as_slice()))
        .unwrap();
    // .11 has neither MAC nor hostname and is not recorded
    assert_eq!((stats.updated, stats.new, stats.offline), (1, 1, 1));

    let printer = db.device_by_ip(Ipv4Addr::new(192, 168, 50, 9)).unwrap().unwrap();
    assert_eq!(printer.hostname.as_deref(), Some("printer.lan"));
    assert_eq!(printer.vendor.as_deref(), Some("Brother Industries"));
    assert!(printer.cli.is_online());
    assert!(db.device_by_ip(Ipv4Addr::new(192, 168, 50, 11)).unwrap().is_none());

    let absent = db.device_by_ip(known).unwrap().unwrap();
    assert!(!absent.cli.is_online());
    let stamped = absent.cli.offline_at;

    // a repeat keeps the first offline stamp
    let again = reconciler
        .reconcile(&observations, Method::CliTool, true, Some(universe.as_slice()))
        .unwrap();
    assert_eq!((again.updated, again.new, again.offline), (1, 0, 0));
    assert_eq!(db.device_by_ip(known).unwrap().unwrap().cli.offline_at, stamped);
}

#[tokio::test]
async fn test_rest_run_without_ranges_keeps_everything() {
    let db = Database::in_memory().unwrap();
    let recon = FakeRecon::new(EventFeed::Fixed(vec![]));
    *recon.hosts.lock().unwrap() = vec![
        Endpoint {
            ipv4: "192.168.7.4".into(),
            mac: "02:00:00:00:07:04".into(),
            ..Default::default()
        },
        Endpoint {
            ipv4: "10.20.0.8".into(),
            mac: "02:00:00:00:20:08".into(),
            ..Default::default()
        },
    ];
    let runner = runner(&db, FakeProvider::new(recon.clone()));

    let token = runner
        .submit(ScanRequest {
            ranges: vec![],
            method: Method::RestTool,
            params: JobParams {
                duration_secs: Some(0),
                ..Default::default()
            },
        })
        .unwrap();

    let mut run = runner.status(&token).unwrap().unwrap();
    for _ in 0..200 {
        if run.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        run = runner.status(&token).unwrap().unwrap();
    }

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_hosts, 0);
    assert_eq!((run.online_count, run.new_count, run.offline_count), (2, 2, 0));
    assert_eq!(db.list_devices().unwrap().len(), 2);
    assert_eq!(recon.count("net.probe off"), 1);
}

#[tokio::test]
async fn test_cli_run_needs_ranges() {
    let db = Database::in_memory().unwrap();
    let recon = FakeRecon::new(EventFeed::Fixed(vec![]));
    let runner = runner(&db, FakeProvider::new(recon));

    let result = runner.submit(ScanRequest {
        ranges: vec![],
        method: Method::CliTool,
        params: JobParams::default(),
    });
    let err = assert_err!(result);
    assert!(matches!(err, lanwatch::WatchError::Validation(_)));
}
