// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::config::Config,
    clap::{Arg, ArgMatches, Command},
    debian_mirror::{
        error::MirrorError,
        keyring::Keyring,
        mirror::{HumanDuration, RetentionPolicy},
        publish::{PublishController, Slot},
        snapshot::{Snapshot, SnapshotManager},
        source::source_from_url,
        sync::{sync_mirrors, MirrorEvent, MirrorSyncer, SyncOptions},
        transfer::{ConnectionLimiter, TransferManager},
    },
    futures::future::AbortHandle,
    log::{error, warn, LevelFilter},
    std::{
        io::Stdout,
        path::Path,
        sync::{Arc, Mutex},
    },
    thiserror::Error,
};

const CONFIG_ABOUT: &str = "\
Configuration

All commands read a YAML configuration file (see --config). It has the
following keys:

root (required) (string)
   Directory holding the content store, sync state and snapshots of every
   mirror. Relative paths are resolved against the configuration file.

max_connections (optional) (integer)
   Cap on concurrent connections across all mirrors synced together.

max_connections_per_host (optional) (integer)
   Cap on concurrent connections to one upstream host. Defaults to the
   number of CPUs.

retries (optional) (integer)
   Retries after a failed transfer attempt. Defaults to 3.

timeout (optional) (duration)
   Deadline for a whole sync invocation, e.g. `2h`.

retention (optional) (mapping)
   Default retention policy with `keep_last` (integer) and `keep_within`
   (duration) keys.

keyring (optional) (string)
   Path to a keyring (armored or binary) trusted to sign release manifests.

tls (optional) (mapping)
   TLS client policy with `min_version` (`1.2` or `1.3`), `cipher_suites`,
   `ca_bundle`, `timeout` and `connect_timeout` keys.

mirrors (required) (list)
   Mirror definitions with keys `id`, `url`, `suites`, `components`,
   `architectures`, and optionally `sources`, `snapshot_naming`,
   `retention`, `keyring` and `max_connections_per_host`.

Durations are written like `30d`, `12h`, `90m`, `45s` or `1w2d`.
";

const SYNC_ABOUT: &str = "\
Synchronize mirrors with their upstream repositories.

The release manifest of every configured suite is fetched and its signature
verified against the trusted keyring. Index files for the configured
components and architectures are then fetched and parsed, and every package
file they reference is downloaded into the mirror's content store unless it
is already present.

After a successful sync a snapshot is created unless --no-snapshot is given.
Mirrors are synced concurrently; one failing does not stop the others.
";

const PRUNE_ABOUT: &str = "\
Remove snapshots not retained by a retention policy.

Snapshots occupying the staging or production slot are never pruned. Of the
remaining snapshots, newest first, a snapshot is kept if it is among the
--keep-last newest or younger than --keep-within. Without either argument,
the mirror's configured policy applies, then the global one.
";

#[derive(Debug, Error)]
pub enum DmtError {
    #[error("argument parsing error: {0:?}")]
    Clap(#[from] clap::Error),

    #[error("{0:?}")]
    Mirror(#[from] MirrorError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0:?}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} mirror(s) failed to sync")]
    SyncFailed(usize),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, DmtError>;

fn mirror_arg() -> Arg<'static> {
    Arg::new("mirror")
        .required(true)
        .help("ID of the mirror to operate on")
}

fn name_arg() -> Arg<'static> {
    Arg::new("name").required(true).help("Name of the snapshot")
}

fn force_arg(help: &'static str) -> Arg<'static> {
    Arg::new("force").long("force").help(help)
}

fn command() -> Command<'static> {
    let app = Command::new("Debian Mirror Tool")
        .version("0.1")
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Mirror Debian repositories and manage their snapshots")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .default_value("dmt.yaml")
                .global(true)
                .allow_invalid_utf8(true)
                .help("Path to the YAML configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("sync")
            .about("Synchronize mirrors with upstream")
            .long_about(SYNC_ABOUT)
            .arg(
                Arg::new("mirror")
                    .multiple_values(true)
                    .help("IDs of mirrors to sync. All mirrors when omitted"),
            )
            .arg(
                Arg::new("skip-signature-verification")
                    .long("skip-signature-verification")
                    .help("Accept release manifests without verifying their signatures"),
            )
            .arg(
                Arg::new("dry-run")
                    .long("dry-run")
                    .help("Report what would be downloaded without downloading packages"),
            )
            .arg(
                Arg::new("quiet")
                    .long("quiet")
                    .short('q')
                    .help("Only print warnings and errors"),
            )
            .arg(force_arg("Replace an existing unpublished snapshot of the same name"))
            .arg(
                Arg::new("no-snapshot")
                    .long("no-snapshot")
                    .help("Do not create a snapshot after syncing"),
            )
            .arg(
                Arg::new("snapshot-name")
                    .long("snapshot-name")
                    .takes_value(true)
                    .help("Name of the snapshot to create"),
            ),
    );

    let app = app.subcommand(
        Command::new("create")
            .about("Create a snapshot from the last successful sync")
            .arg(mirror_arg())
            .arg(
                Arg::new("name")
                    .help("Name of the snapshot. Generated from the naming policy when omitted"),
            )
            .arg(force_arg("Replace an existing unpublished snapshot of the same name")),
    );

    let app = app.subcommand(
        Command::new("list")
            .about("List snapshots of a mirror")
            .arg(mirror_arg()),
    );

    let app = app.subcommand(
        Command::new("show")
            .about("Show details of a snapshot")
            .arg(mirror_arg())
            .arg(name_arg()),
    );

    let app = app.subcommand(
        Command::new("publish")
            .about("Point the production slot at a snapshot")
            .arg(mirror_arg())
            .arg(name_arg()),
    );

    let app = app.subcommand(
        Command::new("stage")
            .about("Point the staging slot at a snapshot")
            .arg(mirror_arg())
            .arg(name_arg()),
    );

    let app = app.subcommand(
        Command::new("promote")
            .about("Point the production slot at the staged snapshot")
            .arg(mirror_arg()),
    );

    let app = app.subcommand(
        Command::new("unpublish")
            .about("Empty a slot")
            .arg(mirror_arg())
            .arg(
                Arg::new("slot")
                    .required(true)
                    .possible_values(&["staging", "production"])
                    .help("Slot to empty"),
            ),
    );

    let app = app.subcommand(
        Command::new("delete")
            .about("Delete a snapshot")
            .arg(mirror_arg())
            .arg(name_arg())
            .arg(force_arg("Delete even if a slot points to the snapshot, emptying the slot")),
    );

    let app = app.subcommand(
        Command::new("prune")
            .about("Remove snapshots not retained by a retention policy")
            .long_about(PRUNE_ABOUT)
            .arg(mirror_arg())
            .arg(
                Arg::new("keep-last")
                    .long("keep-last")
                    .takes_value(true)
                    .help("Keep this many of the newest snapshots"),
            )
            .arg(
                Arg::new("keep-within")
                    .long("keep-within")
                    .takes_value(true)
                    .help("Keep snapshots younger than this duration"),
            )
            .arg(
                Arg::new("dry-run")
                    .long("dry-run")
                    .help("Print what would be removed without removing anything"),
            ),
    );

    let app = app.subcommand(
        Command::new("status")
            .about("Show which snapshots occupy the publish slots")
            .arg(
                Arg::new("mirror")
                    .multiple_values(true)
                    .help("IDs of mirrors. All mirrors when omitted"),
            ),
    );

    app.subcommand(
        Command::new("config-help").about("Print documentation about the configuration file"),
    )
}

/// Default log level for an invocation.
///
/// A quiet sync only reports warnings and errors.
fn log_level(matches: &ArgMatches) -> LevelFilter {
    if let Some(("sync", args)) = matches.subcommand() {
        if args.is_present("quiet") {
            return LevelFilter::Warn;
        }
    }

    match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub async fn run_cli() -> Result<()> {
    let mut app = command();
    let matches = app.clone().get_matches();

    let log_level = log_level(&matches);

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
        builder.filter_module("rustls", LevelFilter::Error);
    }

    builder.init();

    if let Some(("config-help", _)) = matches.subcommand() {
        println!("{}", CONFIG_ABOUT);
        return Ok(());
    }

    let load_config = |args: &ArgMatches| -> Result<Config> {
        let path = args
            .value_of_os("config")
            .expect("config argument has a default value");

        Config::from_path(Path::new(path))
    };

    match matches.subcommand() {
        Some(("sync", args)) => command_sync(&load_config(args)?, args).await,
        Some(("create", args)) => command_create(&load_config(args)?, args),
        Some(("list", args)) => command_list(&load_config(args)?, args),
        Some(("show", args)) => command_show(&load_config(args)?, args),
        Some(("publish", args)) => command_publish(&load_config(args)?, args, Slot::Production),
        Some(("stage", args)) => command_publish(&load_config(args)?, args, Slot::Staging),
        Some(("promote", args)) => command_promote(&load_config(args)?, args),
        Some(("unpublish", args)) => command_unpublish(&load_config(args)?, args),
        Some(("delete", args)) => command_delete(&load_config(args)?, args),
        Some(("prune", args)) => command_prune(&load_config(args)?, args),
        Some(("status", args)) => command_status(&load_config(args)?, args),
        Some((command, _)) => Err(DmtError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

/// Shared byte progress across concurrent transfer batches.
#[derive(Default)]
struct Progress {
    bar: Option<pbr::ProgressBar<Stdout>>,
    active: usize,
}

fn progress_callback() -> Box<dyn Fn(MirrorEvent) + Sync> {
    let progress = Arc::new(Mutex::new(Progress::default()));

    Box::new(move |event: MirrorEvent| match event {
        MirrorEvent::TransferBegin(_, bytes) => {
            let mut progress = progress.lock().unwrap();
            progress.active += 1;

            match progress.bar.as_mut() {
                Some(bar) => bar.total += bytes,
                None => {
                    let mut bar = pbr::ProgressBar::new(bytes);
                    bar.set_units(pbr::Units::Bytes);
                    progress.bar.replace(bar);
                }
            }
        }
        MirrorEvent::BytesTransferred(count) => {
            if let Some(bar) = progress.lock().unwrap().bar.as_mut() {
                bar.add(count);
            }
        }
        MirrorEvent::TransferFinished => {
            let mut progress = progress.lock().unwrap();
            progress.active = progress.active.saturating_sub(1);

            if progress.active == 0 {
                if let Some(mut bar) = progress.bar.take() {
                    bar.finish();
                }
            }
        }
        MirrorEvent::SyncBegin(_)
        | MirrorEvent::SuiteBegin(..)
        | MirrorEvent::SuiteFailed(..)
        | MirrorEvent::SnapshotCreated(..)
        | MirrorEvent::SyncFinished(_) => {
            println!("{}", event);
        }
        _ => {}
    })
}

async fn command_sync(config: &Config, args: &ArgMatches) -> Result<()> {
    let mirrors = config.select(args.values_of("mirror").into_iter().flatten())?;

    let options = SyncOptions {
        skip_signature_verification: args.is_present("skip-signature-verification"),
        dry_run: args.is_present("dry-run"),
        force: args.is_present("force"),
        create_snapshot: !args.is_present("no-snapshot"),
        snapshot_name: args.value_of("snapshot-name").map(|s| s.to_string()),
    };

    if options.skip_signature_verification {
        warn!("release manifest signatures will not be verified");
    }

    let limiter = Arc::new(ConnectionLimiter::new(config.max_connections));
    let http_config = config.http_config();

    let mut syncers = vec![];
    for mirror in mirrors {
        let source = source_from_url(&mirror.url, &http_config)
            .map_err(|e| e.in_mirror(&mirror.id))?;

        let keyring = match config.keyring_for(mirror) {
            Some(path) if !options.skip_signature_verification => {
                Some(Keyring::from_path(path).map_err(|e| e.in_mirror(&mirror.id))?)
            }
            _ => None,
        };

        let transfer = TransferManager::new(
            limiter.clone(),
            config.connections_per_host(mirror),
            config.retry_policy(),
        );

        syncers.push(MirrorSyncer::new(
            &config.root,
            mirror.clone(),
            source,
            keyring,
            transfer,
        )?);
    }

    let (handle, registration) = AbortHandle::new_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping transfers");
            handle.abort();
        }
    });

    let quiet = args.is_present("quiet");
    let cb = if quiet { None } else { Some(progress_callback()) };

    let results = sync_mirrors(
        &syncers,
        &options,
        config.timeout.map(|t| t.to_std()),
        Some(registration),
        &cb,
    )
    .await?;

    let mut failed = 0;
    for (mirror, res) in results {
        match res {
            Ok(report) => {
                if let Some((count, bytes)) = report.pending {
                    println!(
                        "{}: {} files ({} bytes) would be downloaded",
                        mirror, count, bytes
                    );
                } else if !quiet {
                    println!(
                        "{}: {} files ({} bytes) in sync; downloaded {} files ({} bytes)",
                        mirror,
                        report.file_count + report.index_count,
                        report.total_size,
                        report.transfers.downloaded_files,
                        report.transfers.downloaded_bytes
                    );
                }
            }
            Err(MirrorError::SyncFailed { mirror, failures }) => {
                error!("{}: {} file(s) failed", mirror, failures.len());
                for failure in failures {
                    error!("  {}: {}", failure.path, failure.error);
                }
                failed += 1;
            }
            Err(e) => {
                error!("{}: {:#?}", mirror, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        Err(DmtError::SyncFailed(failed))
    } else {
        Ok(())
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "{:<24} {:<20} {:<12} {:>8} files {:>6} indices {:>14} bytes",
        snapshot.name,
        snapshot.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        snapshot.status.to_string(),
        snapshot.file_count,
        snapshot.index_count,
        snapshot.total_size
    );
}

fn mirror_and_name(args: &ArgMatches) -> (&str, &str) {
    (
        args.value_of("mirror").expect("mirror argument is required"),
        args.value_of("name").expect("name argument is required"),
    )
}

fn command_create(config: &Config, args: &ArgMatches) -> Result<()> {
    let mirror = config.mirror(args.value_of("mirror").expect("mirror argument is required"))?;

    let snapshot = SnapshotManager::new(&config.root).create(
        mirror,
        args.value_of("name"),
        args.is_present("force"),
    )?;
    print_snapshot(&snapshot);

    Ok(())
}

fn command_list(config: &Config, args: &ArgMatches) -> Result<()> {
    let mirror = config.mirror(args.value_of("mirror").expect("mirror argument is required"))?;

    for snapshot in SnapshotManager::new(&config.root).list(&mirror.id)? {
        print_snapshot(&snapshot);
    }

    Ok(())
}

fn command_show(config: &Config, args: &ArgMatches) -> Result<()> {
    let (mirror, name) = mirror_and_name(args);
    let mirror = config.mirror(mirror)?;

    let snapshot = SnapshotManager::new(&config.root).show(&mirror.id, name)?;
    println!("mirror:   {}", snapshot.mirror);
    println!("name:     {}", snapshot.name);
    println!("created:  {}", snapshot.created_at.to_rfc3339());
    println!("status:   {}", snapshot.status);
    println!("suites:   {}", snapshot.suites.join(" "));
    println!("files:    {}", snapshot.file_count);
    println!("indices:  {}", snapshot.index_count);
    println!("size:     {} bytes", snapshot.total_size);

    Ok(())
}

fn command_publish(config: &Config, args: &ArgMatches, slot: Slot) -> Result<()> {
    let (mirror, name) = mirror_and_name(args);
    let mirror = config.mirror(mirror)?;
    let controller = PublishController::new(&config.root);

    match slot {
        Slot::Production => controller.publish(&mirror.id, name)?,
        Slot::Staging => controller.stage(&mirror.id, name)?,
    }
    println!("{}: {} -> {}", mirror.id, slot, name);

    Ok(())
}

fn command_promote(config: &Config, args: &ArgMatches) -> Result<()> {
    let mirror = config.mirror(args.value_of("mirror").expect("mirror argument is required"))?;

    let name = PublishController::new(&config.root).promote(&mirror.id)?;
    println!("{}: production -> {}", mirror.id, name);

    Ok(())
}

fn command_unpublish(config: &Config, args: &ArgMatches) -> Result<()> {
    let mirror = config.mirror(args.value_of("mirror").expect("mirror argument is required"))?;
    let slot = args.value_of_t::<Slot>("slot")?;

    match PublishController::new(&config.root).unpublish(&mirror.id, slot)? {
        Some(previous) => println!("{}: {} no longer points to {}", mirror.id, slot, previous),
        None => println!("{}: {} was already empty", mirror.id, slot),
    }

    Ok(())
}

fn command_delete(config: &Config, args: &ArgMatches) -> Result<()> {
    let (mirror, name) = mirror_and_name(args);
    let mirror = config.mirror(mirror)?;

    SnapshotManager::new(&config.root).delete(&mirror.id, name, args.is_present("force"))?;
    println!("{}: deleted {}", mirror.id, name);

    Ok(())
}

/// Resolve the retention policy for a prune invocation.
fn prune_policy(config: &Config, mirror_id: &str, args: &ArgMatches) -> Result<RetentionPolicy> {
    let mirror = config.mirror(mirror_id)?;

    let invocation = RetentionPolicy {
        keep_last: match args.value_of("keep-last") {
            Some(_) => Some(args.value_of_t::<usize>("keep-last")?),
            None => None,
        },
        keep_within: args
            .value_of("keep-within")
            .map(|v| v.parse::<HumanDuration>())
            .transpose()?,
    };

    RetentionPolicy::resolve(
        Some(&invocation),
        mirror.retention.as_ref(),
        config.retention.as_ref(),
    )
    .ok_or_else(|| {
        DmtError::Config(format!(
            "no retention policy for mirror {}; pass --keep-last or --keep-within",
            mirror.id
        ))
    })
}

fn command_prune(config: &Config, args: &ArgMatches) -> Result<()> {
    let mirror = args.value_of("mirror").expect("mirror argument is required");
    let policy = prune_policy(config, mirror, args)?;
    let dry_run = args.is_present("dry-run");

    let removed = SnapshotManager::new(&config.root).prune(mirror, &policy, dry_run)?;

    for name in &removed {
        if dry_run {
            println!("{}: would remove {}", mirror, name);
        } else {
            println!("{}: removed {}", mirror, name);
        }
    }

    if removed.is_empty() {
        println!("{}: nothing to prune", mirror);
    }

    Ok(())
}

fn command_status(config: &Config, args: &ArgMatches) -> Result<()> {
    let controller = PublishController::new(&config.root);

    for mirror in config.select(args.values_of("mirror").into_iter().flatten())? {
        let state = controller.status(&mirror.id)?;

        println!(
            "{}: staging={} production={}",
            mirror.id,
            state.staging.as_deref().unwrap_or("-"),
            state.production.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quiet_sync_logs_warnings_only() {
        let matches = command().get_matches_from(["dmt", "sync", "--quiet", "ubuntu"]);
        assert_eq!(log_level(&matches), LevelFilter::Warn);

        let matches = command().get_matches_from(["dmt", "-v", "sync", "-q"]);
        assert_eq!(log_level(&matches), LevelFilter::Warn);

        let matches = command().get_matches_from(["dmt", "sync", "ubuntu"]);
        assert_eq!(log_level(&matches), LevelFilter::Info);

        let matches = command().get_matches_from(["dmt", "-vv", "list", "ubuntu"]);
        assert_eq!(log_level(&matches), LevelFilter::Trace);
    }
}
