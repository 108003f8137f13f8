use drm_testbed::core::config::Config;
use drm_testbed::core::exit::{self, ExitGuard};
use drm_testbed::crc::capture::{self, PipeCrc};
use drm_testbed::crc::{CrcSource, Pipe};
use drm_testbed::gpu::quiesce;
use drm_testbed::utils::logging;
use drm_testbed::{ChipsetMask, DeviceHandle, DrmError, DrmSession, Result};
use log::{error, info};
use std::env;
use std::process;

/// Exit status for "hardware not present", as understood by test runners
const EXIT_SKIP: i32 = 77;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let code = run(&args);
    process::exit(code);
}

/// Runs one command and maps the outcome to an exit status
///
/// The exit guard lives in here so the exit handlers finish before
/// `process::exit` tears the process down.
fn run(args: &[String]) -> i32 {
    let Some(command) = args.first() else {
        print_usage();
        return 2;
    };
    if command == "help" || command == "--help" || command == "-h" {
        print_usage();
        return 0;
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    let level = match config.log_filter() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    if let Err(e) = logging::init(level) {
        eprintln!("Cannot install logger: {}", e);
    }

    let _guard = ExitGuard::new(exit::global());
    let session = DrmSession::install_system(config);

    let result = match command.as_str() {
        "probe" => probe(session, has_flag(args, "--json")),
        "card" => card(session),
        "idle" => mask_arg(args).and_then(|mask| idle(session, mask)),
        "master" => mask_arg(args).and_then(|mask| session.open_driver_master(mask).map(report_handle)),
        "render" => mask_arg(args).and_then(|mask| session.open_driver_render(mask).map(report_handle)),
        "crc" => crc(session, args),
        "crc-check" => crc_check(session),
        other => {
            eprintln!("Unknown command '{}'\n", other);
            print_usage();
            return 2;
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) if e.is_skip() => {
            println!("SKIP: {}", e);
            EXIT_SKIP
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

fn print_usage() {
    println!("DRM Testbed {}", drm_testbed::VERSION);
    println!();
    println!("Usage: drm-testbed <command> [options]");
    println!();
    println!("Commands:");
    println!("  probe [--json]                 List every DRM node and its driver");
    println!("  card                           Print the index of the Intel card");
    println!("  idle [--mask M]                Open a node and idle its gpu");
    println!("  master [--mask M]              Open a node as DRM master");
    println!("  render [--mask M]              Open a render node");
    println!("  crc <A|B|C> [--count N] [--source S]");
    println!("                                 Capture pipe CRCs");
    println!("  crc-check                      Check the CRC control file grammar");
    println!();
    println!("Masks are comma separated: intel, vc4, vgem, virtio, any (default)");
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

/// Value following `flag`, if the flag is present
fn option_value<'a>(args: &'a [String], flag: &str) -> Result<Option<&'a str>> {
    match args.iter().position(|arg| arg == flag) {
        None => Ok(None),
        Some(i) => args
            .get(i + 1)
            .map(|value| Some(value.as_str()))
            .ok_or_else(|| DrmError::InvalidArgument(format!("{} needs a value", flag))),
    }
}

fn mask_arg(args: &[String]) -> Result<ChipsetMask> {
    option_value(args, "--mask")?
        .map(|mask| mask.parse())
        .unwrap_or(Ok(ChipsetMask::ANY))
}

fn report_handle(handle: DeviceHandle) {
    println!("{}", handle.path().display());
    match (handle.family(), handle.chipset()) {
        (_, Some(chipset)) => println!("  Chipset: {}", chipset),
        (Some(family), None) => println!("  Driver: {}", family),
        (None, None) => println!("  Driver: unknown"),
    }
}

fn probe(session: &DrmSession, json: bool) -> Result<()> {
    let nodes = session.resolver().probe_all();

    if json {
        let text = serde_json::to_string_pretty(&nodes)
            .map_err(|e| DrmError::InvalidArgument(format!("cannot encode probe results: {}", e)))?;
        println!("{}", text);
        return Ok(());
    }

    if nodes.is_empty() {
        println!("No DRM nodes found!");
        return Ok(());
    }

    println!("Found {} DRM node(s):", nodes.len());
    for node in &nodes {
        println!("\n{} ({})", node.path.display(), node.kind);
        println!("  Driver: {}", node.driver.as_deref().unwrap_or("unknown"));
        if let Some(chipset) = &node.chipset {
            println!("  Chipset: {}", chipset);
        }
        if let Some(gen) = node.generation {
            println!("  Generation: {}", gen);
        }
    }
    Ok(())
}

fn card(session: &DrmSession) -> Result<()> {
    let index = session
        .resolver()
        .intel_card_index()
        .ok_or(DrmError::NotFound { mask: ChipsetMask::INTEL })?;
    println!("{}", index);
    if let Some(chipset) = session.classifier().chipset() {
        info!("card{} is {} (device id {:#06x})", index, chipset, chipset.device_id);
    }
    Ok(())
}

fn idle(session: &DrmSession, mask: ChipsetMask) -> Result<()> {
    let handle = session.open_driver(mask)?;
    drm_testbed::require_intel(&handle)?;

    let report = quiesce::force_idle(&handle)?;
    println!("{} is idle", handle.path().display());
    println!("  Engines flushed: {}", report.submitted);
    println!("  Engines absent: {}", report.unsupported);
    if report.bsd2 {
        println!("  Second video engine flushed");
    }
    Ok(())
}

/// The debugfs directory of the Intel card
fn intel_debugfs(session: &DrmSession) -> Result<std::path::PathBuf> {
    let index = session
        .resolver()
        .intel_card_index()
        .ok_or(DrmError::NotFound { mask: ChipsetMask::INTEL })?;
    let config = session.config();
    config
        .debugfs_dir(&config.legacy_path(index))
        .ok_or_else(|| DrmError::Config(format!("cannot derive debugfs path for card {}", index)))
}

fn crc(session: &DrmSession, args: &[String]) -> Result<()> {
    let pipe: Pipe = args
        .get(1)
        .ok_or_else(|| DrmError::InvalidArgument("crc needs a pipe".to_string()))?
        .parse()?;
    let count = match option_value(args, "--count")? {
        Some(count) => count
            .parse::<usize>()
            .map_err(|_| DrmError::InvalidArgument(format!("bad count '{}'", count)))?,
        None => 1,
    };
    let source = match option_value(args, "--source")? {
        Some(source) => source.parse()?,
        None => CrcSource::Auto,
    };

    // Keep the device open while capturing
    let _handle = session.open_driver(ChipsetMask::INTEL)?;
    let mut pipe_crc = PipeCrc::new(&intel_debugfs(session)?, pipe, source)?;
    pipe_crc.start()?;
    let samples = pipe_crc.read(count);
    pipe_crc.stop()?;

    for sample in samples? {
        println!("{}", sample);
    }
    Ok(())
}

fn crc_check(session: &DrmSession) -> Result<()> {
    let _handle = session.open_driver(ChipsetMask::INTEL)?;
    let accepted = capture::check_control_grammar(&intel_debugfs(session)?)?;

    if accepted.is_empty() {
        println!("All malformed commands were rejected");
        return Ok(());
    }
    for command in &accepted {
        println!("Accepted malformed command: '{}'", command);
    }
    Err(DrmError::Requirement(format!("{} malformed command(s) accepted", accepted.len())))
}
