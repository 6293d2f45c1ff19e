use anyhow::{bail, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lanwatch::{
    config::{DaemonConfig, ProbeMode, ReconSettings},
    discovery::{Method, NmapEngine},
    disruption::{DisruptionController, ProtectionPolicy, TargetAdmin},
    monitor::{JournalKind, MonitorRegistry},
    recon::{ClientPool, ClientProvider, Role},
    runner::{ScanRequest, ScanRunner},
    scheduler::{probe_lock, Recurrence, Scheduler},
    store::{Database, JobParams, JobUpdate, NewJob, RunStatus, ScanRun},
    utils::network,
};

/// Everything a command may need, wired once
struct App {
    config: DaemonConfig,
    db: Database,
    clients: Arc<ClientPool>,
    runner: ScanRunner,
    scheduler: Arc<Scheduler>,
}

impl App {
    fn build(config: DaemonConfig) -> anyhow::Result<Self> {
        let db = Database::open(&config.database_path)
            .with_context(|| format!("opening database {}", config.database_path.display()))?;
        let clients = Arc::new(ClientPool::new(db.clone()));
        let provider: Arc<dyn ClientProvider> = clients.clone();
        let runner = ScanRunner::new(
            db.clone(),
            Arc::new(NmapEngine::new(config.nmap.clone())),
            Arc::clone(&provider),
            config.runner.clone(),
        );
        let monitors = Arc::new(MonitorRegistry::new(db.clone(), Arc::clone(&provider), config.monitor.clone()));
        let scheduler = Arc::new(Scheduler::new(db.clone(), runner.clone(), monitors, provider, &config));

        Ok(Self {
            config,
            db,
            clients,
            runner,
            scheduler,
        })
    }

    async fn target_admin(&self, matches: &ArgMatches) -> TargetAdmin {
        let gateway = matches.get_one::<Ipv4Addr>("gateway").copied();
        let extra: Vec<Ipv4Addr> = matches
            .get_many::<Ipv4Addr>("protect")
            .map(|v| v.copied().collect())
            .unwrap_or_default();
        let policy = ProtectionPolicy::detect(gateway, extra).await;
        let provider: Arc<dyn ClientProvider> = self.clients.clone();
        TargetAdmin::new(self.db.clone(), Arc::new(DisruptionController::new(provider, policy)))
    }
}

fn ranges_arg() -> Arg {
    Arg::new("range")
        .short('r')
        .long("range")
        .value_name("CIDR")
        .help("Network range(s) in prefix notation, comma separated")
        .value_delimiter(',')
        .action(ArgAction::Append)
}

fn method_arg() -> Arg {
    Arg::new("method")
        .short('m')
        .long("method")
        .value_name("METHOD")
        .help("Discovery method: cli (nmap) or rest (recon service)")
        .value_parser(["cli", "rest"])
}

fn job_id_arg() -> Arg {
    Arg::new("id")
        .value_name("JOB_ID")
        .required(true)
        .value_parser(clap::value_parser!(i64))
}

fn ip_arg() -> Arg {
    Arg::new("ip")
        .value_name("IP")
        .required(true)
        .value_parser(clap::value_parser!(Ipv4Addr))
}

fn cli() -> Command {
    Command::new("lanwatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("LAN device inventory driven by nmap sweeps and a recon REST service")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default ~/.lanwatch.toml)")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("database")
                .long("database")
                .value_name("FILE")
                .help("Override the database path")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print machine-readable JSON")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("serve").about("Run the scheduler until interrupted"))
        .subcommand(
            Command::new("scan")
                .about("Run a one-shot scan")
                .arg(ranges_arg().required(true))
                .arg(method_arg().default_value("cli"))
                .arg(
                    Arg::new("nmap-args")
                        .long("nmap-args")
                        .value_name("ARGS")
                        .help("nmap flags replacing the default host discovery")
                        .allow_hyphen_values(true),
                )
                .arg(
                    Arg::new("duration")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Recon session length for rest scans")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("run-status")
                .about("Show a scan run, or the most recent runs")
                .arg(Arg::new("token").value_name("TOKEN"))
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("10"),
                ),
        )
        .subcommand(
            Command::new("jobs")
                .about("Manage scheduled jobs")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List jobs"))
                .subcommand(
                    Command::new("add")
                        .about("Create a job")
                        .arg(Arg::new("name").long("name").required(true))
                        .arg(ranges_arg().required(true))
                        .arg(method_arg().default_value("cli"))
                        .arg(Arg::new("cron").long("cron").required(true).help("Cron expression (5 to 7 fields)"))
                        .arg(Arg::new("nmap-args").long("nmap-args").allow_hyphen_values(true))
                        .arg(Arg::new("disabled").long("disabled").action(ArgAction::SetTrue)),
                )
                .subcommand(
                    Command::new("update")
                        .about("Change a job")
                        .arg(job_id_arg())
                        .arg(Arg::new("name").long("name"))
                        .arg(ranges_arg())
                        .arg(method_arg())
                        .arg(Arg::new("cron").long("cron"))
                        .arg(Arg::new("nmap-args").long("nmap-args").allow_hyphen_values(true))
                        .arg(Arg::new("enable").long("enable").action(ArgAction::SetTrue))
                        .arg(
                            Arg::new("disable")
                                .long("disable")
                                .action(ArgAction::SetTrue)
                                .conflicts_with("enable"),
                        ),
                )
                .subcommand(Command::new("remove").about("Delete a job").arg(job_id_arg()))
                .subcommand(Command::new("toggle").about("Enable or disable a job").arg(job_id_arg()))
                .subcommand(Command::new("trigger").about("Run an nmap job now").arg(job_id_arg()))
                .subcommand(
                    Command::new("executions")
                        .about("Execution history of a job")
                        .arg(job_id_arg())
                        .arg(
                            Arg::new("limit")
                                .long("limit")
                                .value_parser(clap::value_parser!(usize))
                                .default_value("20"),
                        ),
                )
                .subcommand(
                    Command::new("logs")
                        .about("Logs of a job")
                        .arg(job_id_arg())
                        .arg(
                            Arg::new("kind")
                                .long("kind")
                                .value_parser(["raw", "friendly"])
                                .default_value("friendly"),
                        ),
                ),
        )
        .subcommand(
            Command::new("devices")
                .about("List known devices")
                .arg(Arg::new("online").long("online").action(ArgAction::SetTrue))
                .subcommand(
                    Command::new("annotate")
                        .about("Set tags or a note on a device")
                        .arg(ip_arg())
                        .arg(Arg::new("tags").long("tags"))
                        .arg(Arg::new("note").long("note")),
                )
                .subcommand(Command::new("forget").about("Remove a device from the registry").arg(ip_arg())),
        )
        .subcommand(
            Command::new("ban")
                .about("ARP ban control")
                .subcommand_required(true)
                .arg(
                    Arg::new("gateway")
                        .long("gateway")
                        .value_name("IP")
                        .help("Gateway address, instead of detecting it")
                        .value_parser(clap::value_parser!(Ipv4Addr))
                        .global(true),
                )
                .arg(
                    Arg::new("protect")
                        .long("protect")
                        .value_name("IP")
                        .help("Additional protected addresses")
                        .value_parser(clap::value_parser!(Ipv4Addr))
                        .value_delimiter(',')
                        .action(ArgAction::Append)
                        .global(true),
                )
                .subcommand(Command::new("start").about("Start banning the target list"))
                .subcommand(Command::new("stop").about("Stop banning"))
                .subcommand(Command::new("status").about("Ban state"))
                .subcommand(Command::new("targets").about("List targets"))
                .subcommand(
                    Command::new("add")
                        .about("Add a target")
                        .arg(ip_arg())
                        .arg(Arg::new("note").long("note")),
                )
                .subcommand(Command::new("remove").about("Remove a target").arg(ip_arg()))
                .subcommand(
                    Command::new("candidates")
                        .about("Addresses of a range that may be targeted")
                        .arg(
                            Arg::new("range")
                                .value_name("CIDR")
                                .help("Defaults to the /24 of the primary local address"),
                        ),
                )
                .subcommand(
                    Command::new("log").about("Ban action history").arg(
                        Arg::new("limit")
                            .long("limit")
                            .value_parser(clap::value_parser!(usize))
                            .default_value("20"),
                    ),
                ),
        )
        .subcommand(
            Command::new("recon")
                .about("Recon service connection")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("Show stored settings"))
                .subcommand(
                    Command::new("set")
                        .about("Update stored settings")
                        .arg(Arg::new("scan-url").long("scan-url"))
                        .arg(Arg::new("ban-url").long("ban-url"))
                        .arg(Arg::new("username").long("username"))
                        .arg(Arg::new("password").long("password"))
                        .arg(Arg::new("mode").long("mode").value_parser(["active", "passive"]))
                        .arg(Arg::new("throttle").long("throttle").value_parser(clap::value_parser!(u32)))
                        .arg(Arg::new("timeout").long("timeout").value_parser(clap::value_parser!(u32))),
                )
                .subcommand(Command::new("status").about("Query the service for running modules")),
        )
        .subcommand(Command::new("status").about("Scheduler status"))
        .subcommand(
            Command::new("events").about("Recent system events").arg(
                Arg::new("limit")
                    .long("limit")
                    .value_parser(clap::value_parser!(usize))
                    .default_value("50"),
            ),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<DaemonConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => DaemonConfig::from_toml_file(path)?,
        None => DaemonConfig::load_default_config(),
    };
    if let Some(db) = matches.get_one::<PathBuf>("database") {
        config.database_path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_method(matches: &ArgMatches) -> anyhow::Result<Option<Method>> {
    matches
        .get_one::<String>("method")
        .map(|m| m.parse::<Method>().map_err(anyhow::Error::from))
        .transpose()
}

fn ranges(matches: &ArgMatches) -> Option<Vec<String>> {
    matches
        .get_many::<String>("range")
        .map(|values| values.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()).collect())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_run(run: &ScanRun) {
    let status = match run.status {
        RunStatus::Completed => run.status.to_string().bright_green(),
        RunStatus::Failed => run.status.to_string().bright_red(),
        _ => run.status.to_string().bright_yellow(),
    };
    println!(
        "{} {} [{}] {} {}% via {}",
        "[~]".bright_blue(),
        run.token.bright_cyan(),
        status,
        run.ranges.join(","),
        run.progress,
        run.method
    );
    if run.status == RunStatus::Completed {
        println!(
            "    {} online, {} new, {} went offline ({} addresses in range)",
            run.online_count.to_string().bright_green(),
            run.new_count,
            run.offline_count,
            run.total_hosts
        );
    }
    if let Some(error) = &run.error {
        println!("    {} {}", "error:".bright_red(), error);
    }
}

async fn serve(app: &App) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!(
                "{}",
                "[!] Not running as root: nmap falls back to unprivileged discovery".bright_yellow()
            );
        }
    }

    if !app.scheduler.start().await? {
        bail!(
            "another lanwatch instance owns the scheduler lock {}",
            app.config.lock_path.display()
        );
    }
    println!("{} Scheduler running; Ctrl-C to stop", "[✓]".bright_green());

    let mut sync = tokio::time::interval(Duration::from_secs(app.config.sync_interval_secs));
    sync.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sync.tick() => {
                if let Err(e) = app.scheduler.sync_from_store().await {
                    log::warn!("Job sync failed: {}", e);
                }
            }
        }
    }

    println!("{} Shutting down", "[~]".bright_blue());
    app.scheduler.shutdown().await;
    Ok(())
}

async fn scan(app: &App, matches: &ArgMatches, json: bool) -> anyhow::Result<()> {
    let request = ScanRequest {
        ranges: ranges(matches).unwrap_or_default(),
        method: parse_method(matches)?.unwrap_or(Method::CliTool),
        params: JobParams {
            nmap_args: matches.get_one::<String>("nmap-args").cloned(),
            duration_secs: matches.get_one::<u64>("duration").copied(),
        },
    };

    let run = app.runner.run_to_completion(request).await?;
    if json {
        return print_json(&run);
    }
    print_run(&run);
    if run.status == RunStatus::Failed {
        bail!("scan failed");
    }
    Ok(())
}

async fn jobs(app: &App, matches: &ArgMatches, json: bool) -> anyhow::Result<()> {
    let scheduler = &app.scheduler;
    match matches.subcommand() {
        Some(("list", _)) => {
            let jobs = app.db.list_jobs()?;
            if json {
                return print_json(&jobs);
            }
            for job in jobs {
                let state = if job.enabled { "enabled".bright_green() } else { "disabled".dimmed() };
                let next = match (job.enabled, job.method, Recurrence::parse(&job.cron)) {
                    (true, Method::CliTool, Ok(recurrence)) => recurrence
                        .upcoming(1)
                        .first()
                        .map(|at| at.format("next %Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default(),
                    (true, Method::RestTool, _) => "continuous".to_string(),
                    _ => String::new(),
                };
                println!(
                    "{:>4}  {:<20} {:<9} {:<16} {:<18} {:<9} {}",
                    job.id,
                    job.name.bright_cyan(),
                    job.method.to_string(),
                    job.cron,
                    job.ranges.join(","),
                    state,
                    next.dimmed()
                );
            }
        }
        Some(("add", sub)) => {
            let job = scheduler
                .create_job(NewJob {
                    name: sub.get_one::<String>("name").cloned().unwrap_or_default(),
                    ranges: ranges(sub).unwrap_or_default(),
                    method: parse_method(sub)?.unwrap_or(Method::CliTool),
                    params: JobParams {
                        nmap_args: sub.get_one::<String>("nmap-args").cloned(),
                        duration_secs: None,
                    },
                    cron: sub.get_one::<String>("cron").cloned().unwrap_or_default(),
                    enabled: !sub.get_flag("disabled"),
                })
                .await?;
            println!("{} Created job {} ({})", "[✓]".bright_green(), job.id, job.name);
        }
        Some(("update", sub)) => {
            let id = *sub.get_one::<i64>("id").context("job id")?;
            let enabled = match (sub.get_flag("enable"), sub.get_flag("disable")) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let params = sub.get_one::<String>("nmap-args").map(|args| JobParams {
                nmap_args: Some(args.clone()),
                duration_secs: None,
            });
            let job = scheduler
                .update_job(
                    id,
                    JobUpdate {
                        name: sub.get_one::<String>("name").cloned(),
                        ranges: ranges(sub),
                        method: parse_method(sub)?,
                        params,
                        cron: sub.get_one::<String>("cron").cloned(),
                        enabled,
                    },
                )
                .await?;
            println!("{} Updated job {} ({})", "[✓]".bright_green(), job.id, job.name);
        }
        Some(("remove", sub)) => {
            let id = *sub.get_one::<i64>("id").context("job id")?;
            scheduler.delete_job(id).await?;
            println!("{} Deleted job {}", "[✓]".bright_green(), id);
        }
        Some(("toggle", sub)) => {
            let id = *sub.get_one::<i64>("id").context("job id")?;
            let job = scheduler.toggle_job(id).await?;
            let state = if job.enabled { "enabled" } else { "disabled" };
            println!("{} Job {} {}", "[✓]".bright_green(), job.id, state);
        }
        Some(("trigger", sub)) => {
            let id = *sub.get_one::<i64>("id").context("job id")?;
            match scheduler.run_job_now(id).await? {
                Some(execution) if json => print_json(&execution)?,
                Some(execution) => println!(
                    "{} Job {} {}: {} online, {} new, {} offline",
                    "[✓]".bright_green(),
                    id,
                    execution.status,
                    execution.online_count,
                    execution.new_count,
                    execution.offline_count
                ),
                None => println!("{} Job {} is already running", "[!]".bright_yellow(), id),
            }
        }
        Some(("executions", sub)) => {
            let id = *sub.get_one::<i64>("id").context("job id")?;
            let limit = *sub.get_one::<usize>("limit").unwrap_or(&20);
            let executions = app.db.executions(id, limit)?;
            if json {
                return print_json(&executions);
            }
            for e in executions {
                println!(
                    "{:>5}  {}  {:<8} online {} new {} offline {}{}",
                    e.id,
                    e.started_at.format("%Y-%m-%d %H:%M:%S"),
                    e.status.to_string(),
                    e.online_count,
                    e.new_count,
                    e.offline_count,
                    e.error.map(|err| format!("  error: {}", err)).unwrap_or_default()
                );
            }
        }
        Some(("logs", sub)) => {
            let id = *sub.get_one::<i64>("id").context("job id")?;
            let kind: JournalKind = sub
                .get_one::<String>("kind")
                .map(String::as_str)
                .unwrap_or("friendly")
                .parse()?;
            let lines = scheduler.job_logs(id, kind)?;
            if lines.is_empty() {
                println!("{} No logs in this process for job {}", "[~]".bright_blue(), id);
            }
            for line in lines {
                println!("{}", line);
            }
        }
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}

fn devices(app: &App, matches: &ArgMatches, json: bool) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("annotate", sub)) => {
            let ip = *sub.get_one::<Ipv4Addr>("ip").context("address")?;
            let tags = sub.get_one::<String>("tags").map(String::as_str);
            let note = sub.get_one::<String>("note").map(String::as_str);
            if !app.db.annotate_device(ip, tags, note)? {
                bail!("no device with address {}", ip);
            }
            println!("{} Updated {}", "[✓]".bright_green(), ip);
            return Ok(());
        }
        Some(("forget", sub)) => {
            let ip = *sub.get_one::<Ipv4Addr>("ip").context("address")?;
            if !app.db.delete_device(ip)? {
                bail!("no device with address {}", ip);
            }
            println!("{} Removed {}", "[✓]".bright_green(), ip);
            return Ok(());
        }
        _ => {}
    }

    let mut devices = app.db.list_devices()?;
    if matches.get_flag("online") {
        devices.retain(|d| d.is_online());
    }
    if json {
        return print_json(&devices);
    }

    for device in devices {
        let flag = |online: bool| if online { "up".bright_green() } else { "--".dimmed() };
        println!(
            "{:<15} {:<17} {:<24} {:<20} cli:{} rest:{}",
            device.ip.to_string().bright_cyan(),
            device.mac.as_deref().unwrap_or("-"),
            device.hostname.as_deref().unwrap_or("-"),
            device.vendor.as_deref().unwrap_or("-"),
            flag(device.cli.is_online()),
            flag(device.rest.is_online()),
        );
    }
    Ok(())
}

async fn ban(app: &App, matches: &ArgMatches, json: bool) -> anyhow::Result<()> {
    let admin = app.target_admin(matches).await;
    match matches.subcommand() {
        Some(("start", _)) => {
            let report = admin.start().await?;
            if json {
                return print_json(&report);
            }
            println!(
                "{} Ban started against {} targets",
                "[✓]".bright_green(),
                report.targets.len()
            );
            println!("    protected: {:?}", report.protected);
        }
        Some(("stop", _)) => {
            admin.stop().await?;
            println!("{} Ban stopped", "[✓]".bright_green());
        }
        Some(("status", _)) => {
            let status = admin.status().await?;
            if json {
                return print_json(&status);
            }
            let state = if status.running { "running".bright_red() } else { "stopped".bright_green() };
            println!("{} Ban {}", "[~]".bright_blue(), state);
            println!("    targets:   {:?}", status.targets);
            println!("    protected: {:?}", status.protected);
        }
        Some(("targets", _)) => {
            let targets = admin.targets()?;
            if json {
                return print_json(&targets);
            }
            for t in targets {
                println!("{:<15} {}", t.ip.to_string().bright_cyan(), t.note.unwrap_or_default());
            }
        }
        Some(("add", sub)) => {
            let ip = *sub.get_one::<Ipv4Addr>("ip").context("address")?;
            let _ = admin.controller().refresh().await;
            admin.add(ip, sub.get_one::<String>("note").map(String::as_str)).await?;
            println!("{} Added {}", "[✓]".bright_green(), ip);
        }
        Some(("remove", sub)) => {
            let ip = *sub.get_one::<Ipv4Addr>("ip").context("address")?;
            let _ = admin.controller().refresh().await;
            admin.remove(ip).await?;
            println!("{} Removed {}", "[✓]".bright_green(), ip);
        }
        Some(("candidates", sub)) => {
            let range = match sub.get_one::<String>("range") {
                Some(range) => range.clone(),
                None => network::detect_local_ip()
                    .map(network::local_slash24)
                    .context("no range given and no local IPv4 address detected")?,
            };
            let candidates = admin.candidates(&range)?;
            if json {
                return print_json(&candidates);
            }
            for c in candidates {
                let mark = match (c.protected, c.targeted) {
                    (true, _) => "protected".bright_green(),
                    (_, true) => "targeted".bright_red(),
                    _ => "".normal(),
                };
                println!("{:<15} {}", c.ip, mark);
            }
        }
        Some(("log", sub)) => {
            let limit = *sub.get_one::<usize>("limit").unwrap_or(&20);
            let entries = admin.history(limit)?;
            if json {
                return print_json(&entries);
            }
            for e in entries {
                println!(
                    "{}  {:<7} {:?} {}",
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                    e.action.to_string(),
                    e.targets,
                    e.detail.unwrap_or_default()
                );
            }
        }
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}

async fn recon(app: &App, matches: &ArgMatches, json: bool) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("show", _)) => match app.db.recon_settings()? {
            Some(settings) if json => print_json(&settings)?,
            Some(settings) => {
                println!("scan url:  {}", settings.scan_url);
                println!("ban url:   {}", settings.ban_url);
                println!("username:  {}", settings.username);
                println!("mode:      {}", settings.probe_mode.as_str());
                println!("throttle:  {}", settings.probe_throttle);
                println!("timeout:   {}", settings.probe_timeout);
            }
            None => println!("{} Recon service not configured", "[!]".bright_yellow()),
        },
        Some(("set", sub)) => {
            let mut settings = app.db.recon_settings()?.unwrap_or_else(ReconSettings::default);
            if let Some(v) = sub.get_one::<String>("scan-url") {
                settings.scan_url = v.clone();
            }
            if let Some(v) = sub.get_one::<String>("ban-url") {
                settings.ban_url = v.clone();
            }
            if let Some(v) = sub.get_one::<String>("username") {
                settings.username = v.clone();
            }
            if let Some(v) = sub.get_one::<String>("password") {
                settings.password = v.clone();
            }
            if let Some(v) = sub.get_one::<String>("mode") {
                settings.probe_mode = v.parse::<ProbeMode>()?;
            }
            if let Some(v) = sub.get_one::<u32>("throttle") {
                settings.probe_throttle = *v;
            }
            if let Some(v) = sub.get_one::<u32>("timeout") {
                settings.probe_timeout = *v;
            }
            app.scheduler.apply_recon_settings(&settings).await?;
            println!("{} Recon settings saved", "[✓]".bright_green());
        }
        Some(("status", _)) => {
            let client = app.clients.client(Role::Scan).await?;
            let session = client.session().await?;
            if json {
                return print_json(&session);
            }
            println!("{} discovery mode: {}", "[~]".bright_blue(), session.discovery_mode().bright_cyan());
            if let Some(throttle) = session.env.get("net.probe.throttle") {
                println!("    probe throttle: {}", throttle);
            }
            let mut running: Vec<&String> = session.modules.iter().filter(|(_, on)| **on).map(|(m, _)| m).collect();
            running.sort();
            println!("    running modules: {:?}", running);
        }
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}

async fn status(app: &App, json: bool) -> anyhow::Result<()> {
    let local = app.scheduler.status().await;
    let held_elsewhere = probe_lock(&app.config.lock_path)?;
    let enabled = app.db.list_enabled_jobs()?;
    let recent: Vec<ScanRun> = app.runner.recent(5)?;

    if json {
        return print_json(&serde_json::json!({
            "scheduler": local,
            "scheduler_lock_held": held_elsewhere,
            "enabled_jobs": enabled.iter().map(|j| j.id).collect::<Vec<_>>(),
            "recent_runs": recent,
        }));
    }

    let daemon = if held_elsewhere { "running".bright_green() } else { "not running".bright_yellow() };
    println!("{} scheduler daemon: {}", "[~]".bright_blue(), daemon);
    println!("    enabled jobs: {:?}", enabled.iter().map(|j| j.id).collect::<Vec<_>>());
    for run in &recent {
        print_run(run);
    }
    Ok(())
}

fn events(app: &App, matches: &ArgMatches, json: bool) -> anyhow::Result<()> {
    let limit = *matches.get_one::<usize>("limit").unwrap_or(&50);
    let events = app.db.recent_events(limit)?;
    if json {
        return print_json(&events);
    }
    for e in events {
        let severity = match e.severity {
            lanwatch::store::Severity::Info => e.severity.to_string().normal(),
            lanwatch::store::Severity::Warning => e.severity.to_string().bright_yellow(),
            lanwatch::store::Severity::Error => e.severity.to_string().bright_red(),
        };
        println!(
            "{}  {:<7} {:<24} {}",
            e.created_at.format("%Y-%m-%d %H:%M:%S"),
            severity,
            e.event_type,
            e.message
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = cli().get_matches();
    let json = matches.get_flag("json");
    let config = load_config(&matches)?;
    let app = App::build(config)?;

    match matches.subcommand() {
        Some(("serve", _)) => serve(&app).await,
        Some(("scan", sub)) => scan(&app, sub, json).await,
        Some(("run-status", sub)) => {
            match sub.get_one::<String>("token") {
                Some(token) => match app.runner.status(token)? {
                    Some(run) if json => print_json(&run)?,
                    Some(run) => print_run(&run),
                    None => bail!("no scan run with token {}", token),
                },
                None => {
                    let limit = *sub.get_one::<usize>("limit").unwrap_or(&10);
                    let runs = app.runner.recent(limit)?;
                    if json {
                        print_json(&runs)?;
                    } else {
                        runs.iter().for_each(print_run);
                    }
                }
            }
            Ok(())
        }
        Some(("jobs", sub)) => jobs(&app, sub, json).await,
        Some(("devices", sub)) => devices(&app, sub, json),
        Some(("ban", sub)) => ban(&app, sub, json).await,
        Some(("recon", sub)) => recon(&app, sub, json).await,
        Some(("status", _)) => status(&app, json).await,
        Some(("events", sub)) => events(&app, sub, json),
        _ => unreachable!("subcommand required"),
    }
}
