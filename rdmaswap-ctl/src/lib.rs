use std::{error::Error, fmt, io, time::Duration};

use bytesize::ByteSize;
use clap::{Parser, ValueEnum};
use rdmaswap_core::{IndexKind, Page, RdmaSwap, SwapConfig, SwapError, PAGE_SIZE};
use rdmaswap_transfer::{LoopbackBackend, PeerAddress, RdmaBackend, RemoteRegion, TransportConfig};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// In-process simulated peer.
    Loopback,
    /// libibverbs device; needs a build with the `rdma` feature.
    Rdma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IndexArg {
    Linear,
    Hashed,
}

impl From<IndexArg> for IndexKind {
    fn from(arg: IndexArg) -> Self {
        match arg {
            IndexArg::Linear => IndexKind::Linear,
            IndexArg::Hashed => IndexKind::Hashed,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "rdmaswap-ctl",
    about = "Bring up a remote swap tier, page a workload out and back in, and report"
)]
pub struct Cli {
    /// Transport backend
    #[arg(long, value_enum, default_value_t = BackendArg::Loopback)]
    pub backend: BackendArg,

    /// Directory capacity in pages
    #[arg(long, default_value_t = 1024)]
    pub capacity: usize,

    /// Number of page ids in the workload
    #[arg(long, default_value_t = 256)]
    pub pages: u64,

    /// Share of pages sent to the remote tier, in percent (clamped to 0..=100)
    #[arg(long, default_value_t = 50, allow_negative_numbers = true)]
    pub ratio: i32,

    /// Directory index
    #[arg(long, value_enum, default_value_t = IndexArg::Linear)]
    pub index: IndexArg,

    /// Completion wait bound in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,

    /// RDMA device name; the first device when omitted
    #[arg(long)]
    pub nic: Option<String>,

    /// Remote RC endpoint as hex (gid, lid, qp number, psn)
    #[arg(long)]
    pub peer: Option<PeerAddress>,

    /// Base address of the peer's registered region, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_u64)]
    pub remote_addr: Option<u64>,

    /// rkey of the peer's registered region, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_u32)]
    pub rkey: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print the directory before shutting down
    #[arg(long)]
    pub dump: bool,
}

fn parse_u64(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid number {value:?}: {e}"))
}

fn parse_u32(value: &str) -> Result<u32, String> {
    let parsed = parse_u64(value)?;
    u32::try_from(parsed).map_err(|_| format!("{value:?} does not fit in 32 bits"))
}

impl Cli {
    pub fn swap_config(&self) -> SwapConfig {
        let mut transport = TransportConfig::default();
        if let Some(nic) = &self.nic {
            transport = transport.with_nic(nic.clone());
        }
        if let Some(peer) = &self.peer {
            transport = transport.with_peer(peer.clone());
        }

        let mut config = SwapConfig::default()
            .with_capacity(self.capacity)
            .with_index(self.index.into())
            .with_initial_ratio(self.ratio.clamp(0, 100) as u8)
            .with_completion_timeout(Duration::from_millis(self.timeout_ms))
            .with_transport(transport);
        if let Some(base_addr) = self.remote_addr {
            let rkey = self.rkey.unwrap_or(RemoteRegion::PLACEHOLDER_RKEY);
            config = config.with_region(RemoteRegion::for_pages(base_addr, rkey, self.capacity));
        }
        config
    }
}

/// Deterministic stand-in for a probabilistic tiering decision: spreads ids
/// over 0..100 and compares with the ratio.
pub fn use_remote_for(local_id: u64, ratio: u8) -> bool {
    local_id.wrapping_mul(37) % 100 < u64::from(ratio)
}

/// Deterministic page contents for `local_id`.
pub fn workload_page(local_id: u64) -> Page {
    let mut page = Page::zeroed();
    for (offset, chunk) in page.as_bytes_mut().chunks_exact_mut(8).enumerate() {
        chunk.copy_from_slice(&(local_id ^ offset as u64).to_le_bytes());
    }
    page
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadReport {
    pub selected: u64,
    pub skipped: u64,
    pub stored: u64,
    pub exhausted: u64,
    pub store_failed: u64,
    pub verified: u64,
    pub mismatched: u64,
    pub fetch_failed: u64,
}

impl WorkloadReport {
    pub fn is_clean(&self) -> bool {
        self.store_failed == 0 && self.mismatched == 0 && self.fetch_failed == 0
    }
}

impl fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "selected={} skipped={} stored={} ({}) exhausted={} store_failed={} verified={} mismatched={} fetch_failed={}",
            self.selected,
            self.skipped,
            self.stored,
            ByteSize::b(self.stored * PAGE_SIZE as u64),
            self.exhausted,
            self.store_failed,
            self.verified,
            self.mismatched,
            self.fetch_failed
        )
    }
}

/// Pages out the ratio-selected share of `0..pages`, pages everything stored
/// back in and checks the contents.
pub fn run_workload<B: RdmaBackend>(swap: &RdmaSwap<B>, pages: u64) -> WorkloadReport {
    let mut report = WorkloadReport::default();
    let ratio = swap.get_rdma_swap_ratio();
    let mut stored_ids = Vec::new();

    for local_id in 0..pages {
        if !swap.use_rdma_swap() || !use_remote_for(local_id, ratio) {
            report.skipped += 1;
            continue;
        }
        report.selected += 1;
        match swap.store_page(local_id, &workload_page(local_id)) {
            Ok(()) => {
                report.stored += 1;
                stored_ids.push(local_id);
            }
            Err(err) if err.is_resource_exhausted() => report.exhausted += 1,
            Err(err) => {
                warn!(local_id, %err, "page-out failed");
                report.store_failed += 1;
            }
        }
    }

    for local_id in stored_ids {
        match swap.try_get_page(local_id) {
            Ok(page) if page == workload_page(local_id) => report.verified += 1,
            Ok(_) => {
                error!(local_id, "page-in returned different contents");
                report.mismatched += 1;
            }
            Err(err) => {
                warn!(local_id, %err, "page-in failed");
                report.fetch_failed += 1;
            }
        }
    }
    report
}

/// Brings the tier up over `backend`, runs the workload, reports to `out`
/// and shuts down.
pub fn drive<B: RdmaBackend>(
    cli: &Cli,
    config: SwapConfig,
    backend: B,
    out: &mut impl io::Write,
) -> Result<WorkloadReport, Box<dyn Error>> {
    let region = config.remote_region();
    let swap = RdmaSwap::new(config, backend)?;
    swap.init()?;
    info!(
        capacity = cli.capacity,
        ratio = swap.get_rdma_swap_ratio(),
        "remote region {:#x} rkey {:#x}, {} addressable",
        region.base_addr,
        region.rkey,
        ByteSize::b(region.len)
    );

    let report = run_workload(&swap, cli.pages);
    writeln!(out, "workload: {report}")?;
    writeln!(out, "stats: {}", swap.stats())?;
    if cli.dump {
        let mut dump = String::new();
        swap.debug_dump(&mut dump)?;
        out.write_all(dump.as_bytes())?;
    }
    swap.exit();

    if !report.is_clean() {
        return Err(format!("workload finished with errors: {report}").into());
    }
    Ok(report)
}

/// Runs the tool for an already parsed command line.
pub fn execute(cli: &Cli, out: &mut impl io::Write) -> Result<WorkloadReport, Box<dyn Error>> {
    let config = cli.swap_config();
    config.validate()?;
    match cli.backend {
        BackendArg::Loopback => {
            let backend = LoopbackBackend::new(config.remote_region());
            drive(cli, config, backend, out)
        }
        #[cfg(feature = "rdma")]
        BackendArg::Rdma => {
            let backend = rdmaswap_transfer::SidewayBackend::new();
            drive(cli, config, backend, out)
        }
        #[cfg(not(feature = "rdma"))]
        BackendArg::Rdma => Err("rdma backend not built in, rebuild with --features rdma".into()),
    }
}

fn init_logging(level: &str) {
    let filter = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => {
            eprintln!("Invalid log level: {}, defaulting to info", level);
            "info"
        }
    };
    rdmaswap_transfer::init_logging_with(filter);
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("Starting rdmaswap-ctl with {:?} backend", cli.backend);
    match execute(&cli, &mut io::stdout().lock()) {
        Ok(report) => {
            info!(%report, "rdmaswap-ctl finished");
            Ok(())
        }
        Err(e) => {
            if let Some(swap_err) = e.downcast_ref::<SwapError>() {
                error!(%swap_err, "swap tier error");
            }
            Err(e)
        }
    }
}
