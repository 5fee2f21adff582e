//! CLI entrypoint for the thread-private storage harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tps_core::{
    FaultReporting, MemoryBackend, MmapBackend, Protection, Region, SignalObserver, TPS_SIZE,
    TpsConfig, TpsDomain,
};
use tps_harness::{LogEmitter, ScenarioKind, run_scenario};

/// Scenario and fault tooling for thread-private storage.
#[derive(Debug, Parser)]
#[command(name = "tps-harness")]
#[command(about = "Scenario runner and fault-reporting harness for thread-private storage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run lifecycle scenarios and emit JSONL step logs.
    Run {
        /// Scenario to run (all of them if omitted).
        #[arg(long, value_enum)]
        scenario: Option<ScenarioKind>,
        /// JSONL log path (if omitted, logs go to stdout).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Touch a protected page directly. The process dies by signal.
    Fault {
        /// Touch an unrelated no-access mapping instead of a private page.
        #[arg(long)]
        foreign: bool,
        /// Touch the page from inside an operation, with the domain lock held.
        #[arg(long, conflicts_with = "foreign")]
        in_section: bool,
    },
    /// Print the configuration resolved from the environment.
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { scenario, log } => {
            let run_id = format!("run-{}", std::process::id());
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &run_id)?,
                None => LogEmitter::to_stdout(&run_id),
            };
            let config = TpsConfig::from_env();

            let mut failed = Vec::new();
            let kinds = scenario.map_or_else(|| ScenarioKind::ALL.to_vec(), |kind| vec![kind]);
            for kind in kinds {
                match run_scenario(kind, config, &mut emitter) {
                    Ok(report) => eprintln!(
                        "[pass] {} ({} steps, {} forks)",
                        kind.name(),
                        report.steps,
                        report.metrics.cow_forks
                    ),
                    Err(err) => {
                        eprintln!("[FAIL] {}: {err}", kind.name());
                        failed.push(kind.name());
                    }
                }
            }
            if let Some(path) = &log {
                eprintln!("Wrote step log to {}", path.display());
            }
            if !failed.is_empty() {
                return Err(format!("scenarios failed: {}", failed.join(", ")).into());
            }
        }
        Command::Fault {
            foreign,
            in_section,
        } => {
            fault(foreign, in_section)?;
        }
        Command::Config => {
            let config = TpsConfig::from_env();
            let report = serde_json::json!({
                "fault_reporting": config.fault_reporting.as_str(),
                "max_pages": config.max_pages,
                "tps_size": TPS_SIZE,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn fault(foreign: bool, in_section: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = TpsConfig::from_env().with_fault_reporting(FaultReporting::Report);
    let domain = if in_section {
        TpsDomain::builder()
            .backend(TouchBeforeProtect)
            .config(config)
            .build()
    } else {
        TpsDomain::with_config(config)
    };
    domain.init_from_config()?;
    if !SignalObserver::installed() {
        return Err("fault reporter is not installed".into());
    }
    domain.create()?;

    if in_section {
        eprintln!("writing through the gate; the backend touches the page first");
        domain.write(0, 1, b"x")?;
        return Err("write inside the critical section did not fault".into());
    }

    // Kept alive (and never released) until the process dies.
    let stray;
    let target = if foreign {
        stray = MmapBackend
            .reserve()
            .map_err(std::io::Error::from_raw_os_error)?;
        stray.addr()
    } else {
        domain.region_addr()?
    };

    eprintln!("touching {target:#x} (foreign: {foreign})");
    touch(target);

    Err(format!("write to {target:#x} did not fault").into())
}

/// Anonymous mappings that are written to while still sealed, just before
/// every protection change. The trap fires inside the domain's critical
/// section.
struct TouchBeforeProtect;

impl MemoryBackend for TouchBeforeProtect {
    fn reserve(&self) -> Result<Region, i32> {
        MmapBackend.reserve()
    }

    fn protect(&self, region: &Region, protection: Protection) -> Result<(), i32> {
        touch(region.addr());
        MmapBackend.protect(region, protection)
    }

    fn release(&self, region: Region) -> Result<(), i32> {
        MmapBackend.release(region)
    }
}

#[allow(unsafe_code)]
fn touch(addr: usize) {
    // SAFETY: deliberately writes to a no-access page. The write traps and
    // the installed handler terminates the process; it never returns here.
    unsafe { std::ptr::write_volatile(addr as *mut u8, 0x42) };
}
