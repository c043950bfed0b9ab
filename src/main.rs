use anyhow::{bail, Context};
use clap::Parser;
use crust_dump::compel::{ProcMemAgent, SeizedTask};
use crust_dump::criu::proc_parse::parse_pid_maps;
use crust_dump::criu::stats::DumpCnt;
use crust_dump::{dump, DumpOpts, ImageDir, PageServer};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

// Global start time for dmesg-style logging
static START_TIME: OnceLock<Instant> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "crust-dump")]
#[command(about = "dump private memory of a running task", long_about = None)]
struct Args {
    /// PID of the task to dump
    #[arg(short = 't', long = "tree", value_name = "PID")]
    pid: libc::pid_t,

    /// Directory to write pagemap and pages images to
    #[arg(short = 'D', long, value_name = "DIR", default_value = ".")]
    images_dir: PathBuf,

    /// Send pages to a page server instead of the images directory
    #[arg(long)]
    page_server: bool,

    /// Page server address
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Page server port
    #[arg(long, default_value_t = 27)]
    port: u16,

    /// Pages moved per pipe round trip
    #[arg(long, value_name = "N")]
    pages_per_pipe: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    START_TIME.get_or_init(|| Instant::now());

    // Initialize logging with dmesg-style timestamps
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format(|buf, record| {
            use std::io::Write;

            let elapsed = START_TIME.get().unwrap().elapsed();
            let secs = elapsed.as_secs();
            let micros = elapsed.subsec_micros();

            // Format like dmesg: [  123.456789] LEVEL message
            writeln!(
                buf,
                "[{:5}.{:06}] {} {}",
                secs,
                micros,
                record.level(),
                record.args()
            )
        })
        .init();

    if args.pid <= 0 {
        bail!("Invalid pid {}", args.pid);
    }

    let mut opts = DumpOpts::default();
    if let Some(pages) = args.pages_per_pipe {
        opts = opts.with_pages_per_pipe(pages);
    }
    opts.validate().context("Bad dump options")?;

    log::info!("Dumping memory of {}", args.pid);

    // Detached when dropped, whatever the dump outcome
    let task = SeizedTask::seize(args.pid).context("Can't seize task")?;

    let vmas = parse_pid_maps(task.pid())
        .with_context(|| format!("Can't collect vmas of {}", task.pid()))?;
    log::info!(
        "Collected {} vmas, {} private pages",
        vmas.len(),
        vmas.priv_size
    );

    let mut agent = ProcMemAgent::open(task.pid()).context("Can't start memory agent")?;

    let stats = if args.page_server {
        let addr = SocketAddr::new(args.address, args.port);
        log::info!("Sending pages to page server at {}", addr);
        dump(task.pid(), &vmas, &PageServer::new(addr), &mut agent, &opts)?
    } else {
        let imgs = ImageDir::open(&args.images_dir).with_context(|| {
            format!("Can't open images directory {}", args.images_dir.display())
        })?;
        log::info!("Image directory: {}", imgs.path().display());
        dump(task.pid(), &vmas, &imgs, &mut agent, &opts)?
    };

    log::info!(
        "Dumped {} pages of {}",
        stats.cnt(DumpCnt::PagesWritten),
        task.pid()
    );

    Ok(())
}
