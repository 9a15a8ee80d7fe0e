use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use photark_core::commands::store::{StoreRequest, DEFAULT_WORKERS};
use photark_core::commands::{prune, store};
use photark_core::provider::Registry;
use photark_core::repo::Repository;

#[derive(Parser)]
#[command(
    name = "photark",
    version,
    about = "Incremental, de-duplicated backups of cloud photo collections"
)]
struct Cli {
    /// The directory in which to store the downloaded media
    #[arg(long, default_value = "./photos_backup")]
    repo: PathBuf,

    /// How many downloads to do in parallel
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    concurrency: usize,

    /// How often to re-run, blocking indefinitely (e.g. 30m, 6h, 1d)
    #[arg(long)]
    every: Option<String>,

    /// Clean up removed photos and albums instead of backing up
    #[arg(long)]
    prune: bool,

    /// Obtain authorizations only; do not perform backups
    #[arg(long)]
    authonly: bool,

    /// Store all metadata returned by the provider for each item
    #[arg(long)]
    everything: bool,

    /// Verify checksums of items that already exist in the index
    #[arg(long)]
    integrity: bool,

    /// Write logs to stdout, stderr, or a file path
    #[arg(long, default_value = "stderr")]
    log: String,

    /// Write informational progress messages
    #[arg(short = 'v', long)]
    verbose: bool,
}

/// Providers are external collaborators: provider crates contribute their
/// [`photark_core::provider::Provider`] here, typically reading account
/// lists and secrets from their own configuration.
fn build_registry() -> Registry {
    Registry::new()
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.concurrency < 1 {
        eprintln!("Error: concurrency must be at least 1");
        std::process::exit(1);
    }

    if cli.authonly {
        if let Err(err) = run_authonly(&cli) {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
        println!("All configured accounts have credentials.");
        return;
    }

    let interval = match cli.every.as_deref() {
        Some(every) => match parse_every(every) {
            Ok(interval) => Some(interval),
            Err(err) => {
                eprintln!("Error: {err}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    // The running repository, shared with the interrupt thread so Ctrl-C
    // can unlink in-flight partial downloads before exiting.
    let current: Arc<Mutex<Option<Arc<Repository>>>> = Arc::new(Mutex::new(None));
    spawn_interrupt_cleanup(Arc::clone(&current));

    loop {
        if let Err(err) = run_once(&cli, &current) {
            match interval {
                None => {
                    eprintln!("Error: {err}");
                    std::process::exit(1);
                }
                Some(_) => error!("{err}"),
            }
        }
        let Some(interval) = interval else {
            break;
        };
        info!("next run in {interval:?}");
        thread::sleep(interval);
        info!("running backup");
    }
}

fn run_once(cli: &Cli, current: &Mutex<Option<Arc<Repository>>>) -> Result<(), Box<dyn std::error::Error>> {
    let repo = Arc::new(Repository::open(&cli.repo, build_registry())?);
    *current.lock().unwrap() = Some(Arc::clone(&repo));

    let result = if cli.prune {
        prune::run(&repo)
    } else {
        store::run(
            &repo,
            &StoreRequest {
                save_everything: cli.everything,
                check_integrity: cli.integrity,
                workers: cli.concurrency,
            },
        )
    };

    *current.lock().unwrap() = None;
    result.map_err(Into::into)
}

fn run_authonly(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    println!("[Authorization Mode]");
    println!("No backups will be performed, but credentials will be obtained");
    println!("and stored in the repository index, so it can then run headless.");
    println!();

    let repo = Repository::open(&cli.repo, build_registry())?;
    repo.authorize_all_accounts()?;
    Ok(())
}

/// Arrange for the first SIGINT/SIGTERM to unlink any in-flight partial
/// downloads and exit cleanly.
///
/// The signal handler itself only writes one byte to a pipe (the sole
/// async-signal-safe thing it may do) and re-arms the default disposition
/// so a second signal kills the process outright. A dedicated thread
/// blocks on the pipe's read end and, once woken, runs the repository's
/// interrupt teardown.
fn spawn_interrupt_cleanup(current: Arc<Mutex<Option<Arc<Repository>>>>) {
    #[cfg(unix)]
    {
        let mut wake = match interrupt::install() {
            Ok(wake) => wake,
            Err(err) => {
                error!("cannot install signal handlers: {err}");
                return;
            }
        };
        thread::spawn(move || {
            use std::io::Read;
            let mut byte = [0u8; 1];
            let _ = wake.read(&mut byte);
            error!("interrupted; removing partial downloads and quitting");
            if let Some(repo) = current.lock().unwrap().take() {
                repo.close_unsafe();
            }
            std::process::exit(0);
        });
    }
    #[cfg(not(unix))]
    let _ = current;
}

#[cfg(unix)]
mod interrupt {
    use std::fs::File;
    use std::io;
    use std::os::fd::FromRawFd;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Write end of the wake pipe, stored where the signal handler can
    /// reach it.
    static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

    /// Install SIGINT/SIGTERM handlers and return the read end of the
    /// wake pipe. The returned file's `read` blocks until a signal
    /// arrives.
    pub fn install() -> io::Result<File> {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: plain pipe(2); the fds array outlives the call.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        WAKE_FD.store(fds[1], Ordering::SeqCst);
        // Safety: the handler performs only async-signal-safe calls.
        unsafe {
            libc::signal(libc::SIGINT, wake_and_disarm as *const () as libc::sighandler_t);
            libc::signal(libc::SIGTERM, wake_and_disarm as *const () as libc::sighandler_t);
        }
        // Safety: fds[0] is a freshly created fd owned by no one else.
        Ok(unsafe { File::from_raw_fd(fds[0]) })
    }

    extern "C" fn wake_and_disarm(sig: libc::c_int) {
        let fd = WAKE_FD.load(Ordering::SeqCst);
        if fd >= 0 {
            let byte = [1u8];
            // Safety: write(2) is async-signal-safe.
            unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
        }
        // Restore the default disposition so a second signal terminates
        // immediately even if cleanup hangs.
        unsafe { libc::signal(sig, libc::SIG_DFL) };
    }
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose { "info" } else { "warn" };
    let writer = match cli.log.as_str() {
        "stdout" => BoxMakeWriter::new(io::stdout),
        "stderr" => BoxMakeWriter::new(io::stderr),
        "" => BoxMakeWriter::new(io::sink),
        path => {
            let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("Error: opening log file {path}: {err}");
                    std::process::exit(1);
                }
            };
            BoxMakeWriter::new(Arc::new(file))
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .init();
}

/// Parse an interval like `30m`, `6h`, or `1d` (minimum one minute).
fn parse_every(every: &str) -> Result<Duration, String> {
    if every.is_empty() {
        return Err("no interval given".to_string());
    }
    if !every.is_ascii() {
        return Err(format!("bad interval '{every}'"));
    }
    let (number, unit) = every.split_at(every.len() - 1);
    let mut minutes: u64 = number
        .parse()
        .map_err(|_| format!("bad interval value '{number}'"))?;
    if minutes < 1 {
        return Err(format!("interval {minutes} is less than 1"));
    }
    match unit {
        "m" => {}
        "h" => minutes *= 60,
        "d" => minutes *= 60 * 24,
        _ => return Err(format!("unknown unit '{unit}': must be m, h, or d")),
    }
    Ok(Duration::from_secs(minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::parse_every;
    use std::time::Duration;

    #[test]
    fn parse_every_minutes() {
        assert_eq!(parse_every("30m").unwrap(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn parse_every_hours_and_days() {
        assert_eq!(parse_every("6h").unwrap(), Duration::from_secs(6 * 3600));
        assert_eq!(parse_every("1d").unwrap(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn parse_every_rejects_nonsense() {
        assert!(parse_every("").is_err());
        assert!(parse_every("10x").is_err());
        assert!(parse_every("m").is_err());
        assert!(parse_every("0m").is_err());
    }
}
