//! Command-line entry point: option layering, screen selection, and the
//! batch loop that drives the sampler tick after tick.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::debug;

use perftop::config;
use perftop::errlog::ErrorLog;
use perftop::options::{Cli, Options};
use perftop::procfs;
use perftop::row;
use perftop::sampler::{self, Sampler};
use perftop::screen::{self, Screen, ScreenSet};
use perftop::spawn::{self, SpawnedChild};
use perftop::task::TaskTable;
use perftop::{check, Session, TXT_LEN};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Make sure this host can attach counters at all before doing
    // anything else.
    check::check()?;

    let mut options = Options::default();
    let mut screens = ScreenSet::new();
    let mut errlog = ErrorLog::new();

    let config_path = config::find_config(cli.config.as_deref());
    if let Some(path) = &config_path {
        match config::read_config(path, &mut options, &mut screens, &mut errlog) {
            Ok(()) => options.config_file = true,
            Err(e) => errlog.record(format!("Could not parse '{}': {}", path.display(), e)),
        }
    }
    options.apply_cli(&cli);

    env_logger::Builder::from_default_env()
        .filter_level(if options.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();
    debug!(
        "configuration file: {}",
        config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".into())
    );

    errlog.attach_sink(options.batch, options.error_file.as_deref());

    if options.default_screens {
        screen::builtin_screens(&mut screens, &mut errlog);
    }
    // Unreferenced counters would cost one descriptor per task for
    // nothing; drop them before the first task is created.
    screens.tamp_counters(&mut errlog);

    if cli.list_screens {
        screens.list();
        return Ok(());
    }
    if cli.export_conf {
        let path = config::export(&screens, &options).context("configuration not exported")?;
        println!("{} written", path.display());
        return Ok(());
    }

    let (screen_pos, screen) = select_screen(&screens, cli.screen.as_deref())?;

    spawn::install_sigchld_handler();
    let mut child = if cli.command.is_empty() {
        None
    } else {
        Some(spawn::spawn(&cli.command).context("could not spawn command")?)
    };

    let mut sess = Session::new(options, errlog);
    let mut table = TaskTable::new();
    let mut sampler = Sampler::new();

    // A spawned command sits gated before exec until its counters are in
    // place: one early discovery pass picks it up, then it may run.
    if let Some(c) = &mut child {
        sampler.discover(&mut table, &screen, &mut sess);
        c.start().context("could not start command")?;
    }

    batch_mode(
        &mut sampler,
        &mut table,
        &screen,
        screen_pos,
        &mut sess,
        child.as_mut(),
    )
}

fn select_screen(screens: &ScreenSet, selection: Option<&str>) -> Result<(usize, Screen)> {
    let found = match selection {
        None => screens.get(0).map(|s| (0, s)),
        Some(text) => match text.parse::<usize>() {
            Ok(n) => screens.get(n).map(|s| (n, s)),
            Err(_) => screens.get_by_name(text),
        },
    };
    found
        .map(|(i, s)| (i, s.clone()))
        .ok_or_else(|| anyhow!("No such screen."))
}

/// The main loop: sample, accumulate, build, sort, print, sleep. Repeats
/// until the iteration limit is reached or the spawned command is done.
fn batch_mode(
    sampler: &mut Sampler,
    table: &mut TaskTable,
    screen: &Screen,
    screen_pos: usize,
    sess: &mut Session,
    mut child: Option<&mut SpawnedChild>,
) -> Result<()> {
    let mut out: Box<dyn Write> = match &sess.options.out_path {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(
            || format!("Could not open '{}'", path.display()),
        )?)),
        None => Box::new(io::stdout()),
    };

    print_banner(&mut *out, screen, screen_pos, &sess.options)?;

    // Sorting in batch mode is fixed: descending by the first column,
    // which on the stock screens is %CPU.
    let active_col = 0;
    let descending = true;
    let child_pid = child.as_ref().map(|c| c.pid());

    let mut num_iter: u32 = 0;
    while sess.options.max_iter == 0 || num_iter < sess.options.max_iter {
        let epoch = if sess.options.show_epoch {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        } else {
            0
        };

        let num_dead = sampler.sample(table, screen, sess, child.as_deref_mut());

        // Right after exec the spawned command still shows our own name;
        // refresh it once the first tick has given it time to settle.
        if num_iter == 1 {
            if let Some(pid) = child_pid {
                sampler::update_name_cmdline(table, pid, false);
            }
        }

        if !sess.options.show_threads {
            sampler::accumulate_stats(table);
        }

        row::build_rows(table, screen, &sess.options, active_col, None);
        row::sort_rows(
            table,
            active_col,
            screen.columns.len(),
            descending,
            sess.options.show_cmdline,
        );

        let mut printed = 0;
        for &id in table.order() {
            let rec = match table.get(id) {
                Some(r) => r,
                None => continue,
            };
            if rec.skip {
                continue;
            }
            if !(sess.options.show_threads || rec.pid == rec.tid) {
                continue;
            }
            if sess.options.show_timestamp {
                write!(out, "{:6} ", num_iter)?;
            }
            if sess.options.show_epoch {
                write!(out, "{:10} ", epoch)?;
            }
            write!(out, "{}{}", rec.row, if rec.dead { " DEAD" } else { "" })?;
            if sess.options.watch_matches(rec.tid, &rec.name, &rec.cmdline) {
                write!(out, " <---")?;
            }
            writeln!(out)?;
            printed += 1;
        }
        if printed > 0 {
            writeln!(out)?;
        }
        out.flush()?;

        if sess.options.command_done && sess.options.sticky {
            break;
        }
        if num_dead > 0 && !sess.options.sticky {
            table.compact(&mut sess.budget);
        }

        num_iter += 1;
        if sess.options.max_iter != 0 && num_iter >= sess.options.max_iter {
            break;
        }
        // A short first interval gets real deltas on screen quickly; the
        // sleep is a select so a SIGCHLD wakes it early.
        sleep_tick(if num_iter == 1 { 0.2 } else { sess.options.delay });
    }
    Ok(())
}

fn print_banner(out: &mut dyn Write, screen: &Screen, pos: usize, options: &Options) -> Result<()> {
    write!(out, "perftop - ")?;
    match (procfs::uptime(), procfs::loadavg()) {
        (Some(up), Some((l1, l5, l15))) => {
            let days = (up / 86400.0) as u64;
            let hours = ((up - days as f64 * 86400.0) / 3600.0) as u64;
            let minutes = ((up - days as f64 * 86400.0 - hours as f64 * 3600.0) / 60.0) as u64;
            writeln!(
                out,
                "up {} days, {}:{:02}, load average: {:.2}, {:.2}, {:.2}",
                days, hours, minutes, l1, l5, l15
            )?;
        }
        _ => writeln!(out)?,
    }
    writeln!(out, "{}", chrono::Local::now().format("%a %b %e %H:%M:%S %Z %Y"))?;

    writeln!(
        out,
        "delay: {:.2}  idle: {}  threads: {}",
        options.delay,
        i32::from(options.idle),
        i32::from(options.show_threads)
    )?;
    if let Some(pid) = options.watch_pid {
        writeln!(out, "watching pid {}", pid)?;
    } else if let Some(name) = &options.watch_name {
        writeln!(out, "watching '{}'", name)?;
    }
    if let Some(pid) = options.only_pid {
        writeln!(out, "only pid {}", pid)?;
    } else if let Some(name) = &options.only_name {
        writeln!(out, "only '{}'", name)?;
    }
    if let Some(uid) = options.watch_uid {
        writeln!(
            out,
            "watching uid {} '{}'",
            uid,
            procfs::username(uid).unwrap_or_else(|| "?".into())
        )?;
    }

    let header = screen::gen_header(screen, options, TXT_LEN - 1, 0);
    writeln!(out, "Screen {}: {}", pos, screen.name)?;
    writeln!(out, "\n{}", header)?;
    Ok(())
}

fn sleep_tick(seconds: f64) {
    let secs = seconds as libc::time_t;
    let mut tv = libc::timeval {
        tv_sec: secs,
        tv_usec: ((seconds - secs as f64) * 1_000_000.0) as libc::suseconds_t,
    };
    unsafe {
        // Interruption by a signal (SIGCHLD) is fine: it just refreshes
        // the display early.
        libc::select(
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut tv,
        );
    }
}
