use std::fs;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use time::macros::format_description;

use buildcycle::builder::ChrootBuilder;
use buildcycle::config::Config;
use buildcycle::cycle::Cycle;
use buildcycle::git::WrongBranch;
use buildcycle::nvchecker::Nvchecker;
use buildcycle::pacman_repo::Pacman;
use buildcycle::report::{Sendmail, report_admin};
use buildcycle::state::{LOCK_FILE, STORE_FILE, Store, StoreLock};
use buildcycle::Pkgbase;

use crate::args::Args;

mod args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Must happen before the first child is spawned so that orphaned
    // grandchildren get reparented to us and a timeout can reap the whole
    // descendant tree.
    set_child_subreaper();

    let (config, config_path) = match Config::load(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("buildcycle: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    export_environment(&config);

    let invocation_logdir = match create_log_tree(&config) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("buildcycle: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let main_log = fs::File::create(invocation_logdir.join("main.log")).ok();
    buildcycle::tracing::init(args.verbose, main_log);
    tracing::info!("Using config file {config_path}");

    let statedir = &config.buildcycle.statedir;
    let _lock = match StoreLock::acquire(&statedir.join(LOCK_FILE)) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!("Another instance is running (or the lock failed): {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let store_path = statedir.join(STORE_FILE);
    let mut store = match Store::load(&store_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to load the persistent store: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    for mount in &config.buildcycle.bindmounts {
        let source = mount.split_once(':').map(|(source, _)| source).unwrap_or(mount);
        if let Err(e) = fs::create_dir_all(source) {
            tracing::error!("Failed to create bindmount source {source}: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    let reporter = Sendmail {
        command: config.mail.command.clone(),
        from: config.mail.from.clone(),
    };
    let builder = ChrootBuilder {
        command: config.buildcycle.build_command.clone(),
        bindmounts: config.buildcycle.bindmounts.clone(),
        pkg_suffixes: config.buildcycle.pkg_suffixes.clone(),
        db: Pacman,
    };
    let mut checker = Nvchecker::new(statedir.clone(), config.nvchecker.proxy.clone());
    let pkgs: Vec<Pkgbase> = args.pkgbases.iter().map(|name| name.as_str().into()).collect();

    let mut cycle = Cycle {
        config: &config,
        store: &mut store,
        db: &Pacman,
        reporter: &reporter,
        invocation_logdir: &invocation_logdir,
    };
    if let Err(e) = cycle.run(&builder, &mut checker, &pkgs).await {
        if let Some(wrong_branch) = e.downcast_ref::<WrongBranch>() {
            tracing::error!("{wrong_branch}, aborting");
        } else {
            tracing::error!("Cycle failed: {e:?}");
            report_admin(
                &reporter,
                config.mail.admin.as_deref(),
                "buildcycle runtime error",
                &format!("{e:?}\n\nLogs: {invocation_logdir}\n"),
            );
        }
    }

    // The store is saved on every path so that recorded failures survive
    // even a broken cycle.
    if let Err(e) = store.save(&store_path) {
        tracing::error!("Failed to save the persistent store: {e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn set_child_subreaper() {
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) };
    if rc != 0 {
        eprintln!(
            "buildcycle: failed to acquire subreaper semantics: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// The environment contract children rely on: the free-form `[env]`
/// section, our own directory first in `PATH`, and a parallel make by
/// default.
fn export_environment(config: &Config) {
    for (key, value) in &config.env {
        std::env::set_var(key, value);
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let path = std::env::var_os("PATH").unwrap_or_default();
            let mut parts = vec![dir.to_path_buf()];
            parts.extend(std::env::split_paths(&path));
            if let Ok(joined) = std::env::join_paths(parts) {
                std::env::set_var("PATH", joined);
            }
        }
    }

    if std::env::var_os("MAKEFLAGS").is_none() {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        std::env::set_var("MAKEFLAGS", format!("-j{ncpu}"));
    }
}

fn create_log_tree(config: &Config) -> anyhow::Result<Utf8PathBuf> {
    let timestamp = time::OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]"
        ))?;
    let dir = config.buildcycle.logdir.join(timestamp);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
