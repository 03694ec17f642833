//! `torusctl` — operator CLI for Torus ring files.
//!
//! Every invocation names a builder file first, then a verb:
//!
//! ```text
//! torusctl object.builder create 10 3 1
//! torusctl object.builder add r1z1-10.0.0.1:6200/sda1 100
//! torusctl object.builder rebalance
//! torusctl object.builder                    # summary
//! torusctl object.builder search z1
//! torusctl object.builder set_weight d0 120
//! torusctl object.builder remove d3
//! torusctl object.builder remove --ip 10.0.0.4 --device sda1
//! torusctl object.ring write_builder         # recover a lost builder
//! ```
//!
//! Exit codes: 0 success, 1 completed with warnings (partial rebalance,
//! nothing to do, capacity at risk), 2 error.

mod selector;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use torus_ring::{Device, DeviceSpec, RingBuilder, SearchCriteria, normalize_address};
use torus_store::{
    RingFreshness, builder_from_ring, load_builder, load_ring, ring_freshness, save_builder,
    write_ring,
};
use tracing::{info, warn};

use selector::{parse_add_spec, parse_info_changes, parse_search_token};

const EXIT_OK: u8 = 0;
const EXIT_WARNING: u8 = 1;
const EXIT_ERROR: u8 = 2;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "torusctl", version, about = "Torus ring builder and inspector")]
struct Cli {
    /// Builder file to operate on (ring file for `write_builder`).
    builder: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new builder file.
    Create {
        /// log2 of the partition count; fixed for the ring's lifetime.
        part_power: u32,
        /// Replicas per partition; may be fractional.
        replicas: f64,
        /// Minimum hours between moves of the same partition.
        min_part_hours: u32,
    },

    /// Add devices: either one or more `<device> <weight>` pairs, where a
    /// device is `[d<id>]r<region>z<zone>-<ip>:<port>[R<ip>:<port>]/<name>[_<meta>]`,
    /// or a single device given entirely by flags.
    Add {
        args: Vec<String>,

        #[command(flatten)]
        flags: AddFlags,
    },

    /// Flag one device for removal; its data drains on later rebalances.
    Remove {
        /// Selector token that must match exactly one device.
        search: Option<String>,

        #[command(flatten)]
        flags: SelectorFlags,
    },

    /// Set the weight of one device.
    #[command(name = "set_weight")]
    SetWeight {
        /// Selector token that must match exactly one device.
        search: Option<String>,
        new_weight: Option<String>,

        #[command(flatten)]
        flags: SelectorFlags,
    },

    /// Change identity fields of one device.
    #[command(name = "set_info")]
    SetInfo {
        /// Selector token that must match exactly one device.
        search: Option<String>,
        /// New values, `[-<ip>][:<port>][R<ip>:<port>][/<name>][_<meta>]`.
        change: Option<String>,

        #[command(flatten)]
        flags: SelectorFlags,
    },

    /// Change the minimum dwell time between partition moves.
    #[command(name = "set_min_part_hours")]
    SetMinPartHours { hours: u32 },

    /// Change the replica count.
    #[command(name = "set_replicas")]
    SetReplicas { replicas: f64 },

    /// Change the overload factor; accepts a fraction (`0.1`) or a
    /// percentage (`10%`).
    #[command(name = "set_overload")]
    SetOverload { overload: String },

    /// Reassign partitions and write the servable ring file.
    Rebalance {
        /// Seed for deterministic placement.
        #[arg(long)]
        seed: Option<u64>,
        /// Write the ring even when nothing was reassigned.
        #[arg(short, long)]
        force: bool,
    },

    /// Clear the move history so the next rebalance can move everything.
    #[command(name = "pretend_min_part_hours_passed")]
    PretendMinPartHoursPassed,

    /// Check the builder's internal consistency.
    Validate {
        /// Also fail on weighted devices too far from their ideal share.
        #[arg(long)]
        strict: bool,
    },

    /// List devices matching a selector.
    Search {
        /// Selector, `[d<id>][r<region>][z<zone>][-<ip>][:<port>][R<ip>[:<port>]][/<name>][_<meta>]`.
        search: Option<String>,

        #[command(flatten)]
        flags: SelectorFlags,
    },

    /// List partitions with replicas on matching devices.
    #[command(name = "list_parts")]
    ListParts {
        search: Vec<String>,

        #[command(flatten)]
        flags: SelectorFlags,
    },

    /// Show how well replicas spread over regions and zones.
    Dispersion {
        /// Also list the worst-dispersed partitions.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Write the servable ring file without rebalancing.
    #[command(name = "write_ring")]
    WriteRing,

    /// Recover a builder file from a ring file. The positional argument
    /// is the ring; the builder lands next to it.
    #[command(name = "write_builder")]
    WriteBuilder {
        /// Dwell time for the recovered builder.
        min_part_hours: Option<u32>,
    },
}

/// Flag spelling of the selector token. String fields match by
/// substring, numeric fields exactly, same as the compact form.
#[derive(Args, Default)]
struct SelectorFlags {
    /// Match by device id.
    #[arg(long)]
    id: Option<u32>,
    /// Match by region.
    #[arg(long)]
    region: Option<u32>,
    /// Match by zone.
    #[arg(long)]
    zone: Option<u32>,
    /// Match by address substring.
    #[arg(long)]
    ip: Option<String>,
    /// Match by listening port.
    #[arg(long)]
    port: Option<u16>,
    /// Match by replication address substring.
    #[arg(long)]
    replication_ip: Option<String>,
    /// Match by replication port.
    #[arg(long)]
    replication_port: Option<u16>,
    /// Match by device name substring.
    #[arg(long = "device")]
    name: Option<String>,
    /// Match by metadata substring.
    #[arg(long)]
    meta: Option<String>,
    /// Match by exact weight.
    #[arg(long)]
    weight: Option<f64>,
}

impl SelectorFlags {
    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.region.is_none()
            && self.zone.is_none()
            && self.ip.is_none()
            && self.port.is_none()
            && self.replication_ip.is_none()
            && self.replication_port.is_none()
            && self.name.is_none()
            && self.meta.is_none()
            && self.weight.is_none()
    }

    fn criteria(&self) -> Result<SearchCriteria> {
        Ok(SearchCriteria {
            id: self.id,
            region: self.region,
            zone: self.zone,
            ip: self.ip.as_deref().map(normalize_address).transpose()?,
            port: self.port,
            replication_ip: self
                .replication_ip
                .as_deref()
                .map(normalize_address)
                .transpose()?,
            replication_port: self.replication_port,
            name: self.name.clone(),
            meta: self.meta.clone(),
            weight: self.weight,
        })
    }
}

/// Either a compact token or selector flags, never both, never neither.
fn resolve_selector(token: Option<&str>, flags: &SelectorFlags) -> Result<SearchCriteria> {
    match (token, flags.is_empty()) {
        (Some(t), true) => parse_search_token(t),
        (None, false) => flags.criteria(),
        (Some(_), false) => bail!("give either a selector token or selector flags, not both"),
        (None, true) => bail!("a selector token or selector flags are required"),
    }
}

/// Flag spelling of the add spec; one device per invocation.
#[derive(Args, Default)]
struct AddFlags {
    /// Explicit device id.
    #[arg(long)]
    id: Option<u32>,
    #[arg(long)]
    region: Option<u32>,
    #[arg(long)]
    zone: Option<u32>,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Replication address; defaults to `--ip`.
    #[arg(long)]
    replication_ip: Option<String>,
    /// Replication port; defaults to `--port`.
    #[arg(long)]
    replication_port: Option<u16>,
    /// Device name on the host.
    #[arg(long = "device")]
    name: Option<String>,
    /// Free-form metadata.
    #[arg(long)]
    meta: Option<String>,
    /// Relative capacity.
    #[arg(long)]
    weight: Option<f64>,
}

impl AddFlags {
    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.region.is_none()
            && self.zone.is_none()
            && self.ip.is_none()
            && self.port.is_none()
            && self.replication_ip.is_none()
            && self.replication_port.is_none()
            && self.name.is_none()
            && self.meta.is_none()
            && self.weight.is_none()
    }

    fn spec(&self) -> Result<DeviceSpec> {
        let ip = self.ip.as_deref().context("--ip is required")?;
        Ok(DeviceSpec {
            id: self.id,
            region: self.region.context("--region is required")?,
            zone: self.zone.context("--zone is required")?,
            ip: normalize_address(ip)?,
            port: self.port.context("--port is required")?,
            replication_ip: self
                .replication_ip
                .as_deref()
                .map(normalize_address)
                .transpose()?,
            replication_port: self.replication_port,
            name: self.name.clone().context("--device is required")?,
            meta: self.meta.clone().unwrap_or_default(),
            weight: self.weight.context("--weight is required")?,
        })
    }
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

fn main() -> ExitCode {
    setup_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("torusctl: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Initialize the `tracing` subscriber. Respects `RUST_LOG` if set.
fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: Cli) -> Result<u8> {
    let path = cli.builder.as_path();
    match cli.command {
        None => cmd_summary(path),
        Some(Commands::Create {
            part_power,
            replicas,
            min_part_hours,
        }) => cmd_create(path, part_power, replicas, min_part_hours),
        Some(Commands::Add { args, flags }) => cmd_add(path, &args, &flags),
        Some(Commands::Remove { search, flags }) => cmd_remove(path, search.as_deref(), &flags),
        Some(Commands::SetWeight {
            search,
            new_weight,
            flags,
        }) => cmd_set_weight(path, search, new_weight, &flags),
        Some(Commands::SetInfo {
            search,
            change,
            flags,
        }) => cmd_set_info(path, search, change, &flags),
        Some(Commands::SetMinPartHours { hours }) => {
            let mut builder = open(path)?;
            builder.set_min_part_hours(hours);
            save_builder(&builder, path)?;
            println!("The minimum number of hours before a partition can be reassigned is now set to {hours}");
            Ok(EXIT_OK)
        }
        Some(Commands::SetReplicas { replicas }) => {
            let mut builder = open(path)?;
            builder.set_replicas(replicas)?;
            save_builder(&builder, path)?;
            println!("The replica count is now {replicas:.6}");
            println!("The change will take effect after the next rebalance.");
            Ok(EXIT_OK)
        }
        Some(Commands::SetOverload { overload }) => cmd_set_overload(path, &overload),
        Some(Commands::Rebalance { seed, force }) => cmd_rebalance(path, seed, force),
        Some(Commands::PretendMinPartHoursPassed) => {
            let mut builder = open(path)?;
            builder.pretend_min_part_hours_passed();
            save_builder(&builder, path)?;
            Ok(EXIT_OK)
        }
        Some(Commands::Validate { strict }) => {
            let builder = open(path)?;
            builder.validate(strict).context("validation failed")?;
            Ok(EXIT_OK)
        }
        Some(Commands::Search { search, flags }) => cmd_search(path, search.as_deref(), &flags),
        Some(Commands::ListParts { search, flags }) => cmd_list_parts(path, &search, &flags),
        Some(Commands::Dispersion { verbose }) => cmd_dispersion(path, verbose),
        Some(Commands::WriteRing) => {
            let builder = open(path)?;
            let ring_path = ring_path_for(path);
            write_ring(&builder, &ring_path)?;
            println!("Ring file {} written", ring_path.display());
            Ok(EXIT_OK)
        }
        Some(Commands::WriteBuilder { min_part_hours }) => cmd_write_builder(path, min_part_hours),
    }
}

fn open(path: &Path) -> Result<RingBuilder> {
    load_builder(path).with_context(|| format!("failed to load builder {}", path.display()))
}

fn ring_path_for(builder_path: &Path) -> PathBuf {
    builder_path.with_extension("ring")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// -----------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------

fn cmd_create(path: &Path, part_power: u32, replicas: f64, min_part_hours: u32) -> Result<u8> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let builder = RingBuilder::new(part_power, replicas, min_part_hours)?;
    save_builder(&builder, path)?;
    info!(path = %path.display(), part_power, replicas, "builder created");
    Ok(EXIT_OK)
}

fn cmd_add(path: &Path, args: &[String], flags: &AddFlags) -> Result<u8> {
    let mut specs = Vec::new();
    if flags.is_empty() {
        if args.is_empty() {
            bail!("add takes <device> <weight> pairs or device flags");
        }
        if args.len() % 2 != 0 {
            bail!("add takes <device> <weight> pairs, got {} arguments", args.len());
        }
        for pair in args.chunks_exact(2) {
            let weight: f64 = pair[1]
                .parse()
                .with_context(|| format!("bad weight {:?}", pair[1]))?;
            specs.push(parse_add_spec(&pair[0], weight)?);
        }
    } else {
        if !args.is_empty() {
            bail!("give either <device> <weight> pairs or device flags, not both");
        }
        specs.push(flags.spec()?);
    }

    let mut builder = open(path)?;
    for spec in specs {
        let id = builder.add_device(spec)?;
        let dev = builder
            .devices()
            .get(id)
            .context("freshly added device vanished")?;
        println!(
            "Device d{id}r{}z{}-{}:{}/{}_{:?} with {:.2} weight got id {id}",
            dev.region, dev.zone, dev.ip, dev.port, dev.name, dev.meta, dev.weight
        );
    }
    save_builder(&builder, path)?;
    Ok(EXIT_OK)
}

fn cmd_remove(path: &Path, search: Option<&str>, flags: &SelectorFlags) -> Result<u8> {
    let mut builder = open(path)?;
    let criteria = resolve_selector(search, flags)?;
    let id = builder.remove_device(&criteria)?;
    save_builder(&builder, path)?;
    println!("Device d{id} marked for removal and will be drained by the next rebalances");
    Ok(EXIT_OK)
}

/// When selector flags are used the selector token is absent, so the
/// lone positional argument holds the value to apply.
fn split_selector_and_value(
    first: Option<String>,
    second: Option<String>,
    flags: &SelectorFlags,
    what: &str,
) -> Result<(SearchCriteria, String)> {
    if flags.is_empty() {
        let token = first.context("a selector token or selector flags are required")?;
        let value = second.with_context(|| format!("a {what} is required"))?;
        Ok((parse_search_token(&token)?, value))
    } else {
        match (first, second) {
            (Some(value), None) => Ok((flags.criteria()?, value)),
            (None, None) => bail!("a {what} is required"),
            _ => bail!("give either a selector token or selector flags, not both"),
        }
    }
}

fn cmd_set_weight(
    path: &Path,
    search: Option<String>,
    new_weight: Option<String>,
    flags: &SelectorFlags,
) -> Result<u8> {
    let mut builder = open(path)?;
    let (criteria, raw) = split_selector_and_value(search, new_weight, flags, "weight")?;
    let weight: f64 = raw
        .parse()
        .with_context(|| format!("bad weight {raw:?}"))?;
    let id = builder.set_weight(&criteria, weight)?;
    save_builder(&builder, path)?;
    println!("Device d{id} weight set to {weight:.2}");
    Ok(EXIT_OK)
}

fn cmd_set_info(
    path: &Path,
    search: Option<String>,
    change: Option<String>,
    flags: &SelectorFlags,
) -> Result<u8> {
    let mut builder = open(path)?;
    let (criteria, raw) = split_selector_and_value(search, change, flags, "change token")?;
    let changes = parse_info_changes(&raw)?;
    let id = builder.set_info(&criteria, changes)?;
    save_builder(&builder, path)?;
    println!("Device d{id} updated");
    Ok(EXIT_OK)
}

fn cmd_set_overload(path: &Path, overload: &str) -> Result<u8> {
    let mut builder = open(path)?;
    let value = parse_overload(overload)?;
    builder.set_overload(value)?;
    save_builder(&builder, path)?;
    println!(
        "The overload factor is now {:.2}% ({:.6})",
        value * 100.0,
        value
    );
    println!("The change will take effect after the next rebalance.");
    Ok(EXIT_OK)
}

/// `0.1` and `10%` both mean ten percent.
fn parse_overload(raw: &str) -> Result<f64> {
    let (text, divisor) = match raw.strip_suffix('%') {
        Some(text) => (text, 100.0),
        None => (raw, 1.0),
    };
    let value: f64 = text
        .trim()
        .parse()
        .with_context(|| format!("bad overload value {raw:?}"))?;
    Ok(value / divisor)
}

fn cmd_rebalance(path: &Path, seed: Option<u64>, force: bool) -> Result<u8> {
    use torus_ring::RebalanceStatus::*;

    let mut builder = open(path)?;
    let report = builder.rebalance(seed)?;

    if report.status == NoOp && !force {
        println!(
            "No partitions could be reassigned.\n\
             There is no need to do so at this time, or the time between rebalances\n\
             must be increased before partitions can move again."
        );
        return Ok(EXIT_WARNING);
    }

    save_builder(&builder, path)?;
    let ring_path = ring_path_for(path);
    write_ring(&builder, &ring_path)?;
    println!(
        "Reassigned {} ({:.2}%) partition replicas in this pass; {:.2} balance, {:.2} dispersion",
        report.parts_moved,
        100.0 * report.parts_moved as f64 / builder.table().total_slots().max(1) as f64,
        report.balance,
        builder.dispersion().unwrap_or(0.0)
    );
    if report.deferred > 0 {
        println!(
            "{} moves were deferred; rebalance again in {} hours to continue",
            report.deferred,
            builder.min_part_hours()
        );
    }
    if report.unplaced > 0 {
        warn!(unplaced = report.unplaced, "some replicas found no device");
    }
    if report.overloaded > 0 {
        info!(overloaded = report.overloaded, "placements past the overload cap");
    }

    let mut code = match report.status {
        Balanced | NoOp => EXIT_OK,
        Partial => {
            if report.unplaced > 0 {
                println!(
                    "{} partition replicas could not be placed; add devices or weight\n\
                     and rebalance again.",
                    report.unplaced
                );
            } else {
                println!(
                    "The ring is unbalanced ({:.2} > {:.2}); rebalance again once the\n\
                     minimum dwell time has passed, or raise the overload factor.",
                    report.balance,
                    100.0 * builder.overload()
                );
            }
            EXIT_WARNING
        }
    };
    if builder.at_risk() {
        println!(
            "Total device weight exceeds the number of partition replicas; weights\n\
             cannot be honored exactly. Future rings need a higher partition power."
        );
        code = EXIT_WARNING;
    }
    Ok(code)
}

fn cmd_search(path: &Path, search: Option<&str>, flags: &SelectorFlags) -> Result<u8> {
    let builder = open(path)?;
    let criteria = resolve_selector(search, flags)?;
    let matched = builder.search(&criteria);
    if matched.is_empty() {
        println!("No matching devices found");
        return Ok(EXIT_ERROR);
    }
    print_device_table(&builder, matched.into_iter());
    Ok(EXIT_OK)
}

fn cmd_list_parts(path: &Path, search: &[String], flags: &SelectorFlags) -> Result<u8> {
    let criteria_list = if flags.is_empty() {
        if search.is_empty() {
            bail!("a selector token or selector flags are required");
        }
        search
            .iter()
            .map(|token| parse_search_token(token))
            .collect::<Result<Vec<_>>>()?
    } else {
        if !search.is_empty() {
            bail!("give either selector tokens or selector flags, not both");
        }
        vec![flags.criteria()?]
    };

    let builder = open(path)?;
    let mut merged: Vec<(u64, usize)> = Vec::new();
    for criteria in &criteria_list {
        for (part, count) in builder.list_parts(criteria)? {
            match merged.iter_mut().find(|(p, _)| *p == part) {
                Some((_, c)) => *c += count,
                None => merged.push((part, count)),
            }
        }
    }
    merged.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    println!("Partition   Matches");
    for (part, count) in merged {
        println!("{part:>9}   {count:>7}");
    }
    Ok(EXIT_OK)
}

fn cmd_dispersion(path: &Path, verbose: bool) -> Result<u8> {
    let builder = open(path)?;
    let report = builder.dispersion_report();
    println!(
        "Dispersion is {:.2}, Balance is {:.2}, Overload is {:.2}%",
        report.score,
        builder.balance(),
        builder.overload() * 100.0
    );
    if report.score > 0.0 {
        println!("Worst tier violations put multiple replicas in one region or zone;");
        println!("rebalance after the dwell time to let them spread.");
    }
    if verbose {
        println!("Partition   Violations");
        for (part, violations) in report.violations.iter().take(24) {
            println!("{part:>9}   {violations:>10}");
        }
    }
    Ok(EXIT_OK)
}

fn cmd_write_builder(ring_arg: &Path, min_part_hours: Option<u32>) -> Result<u8> {
    let builder_path = ring_arg.with_extension("builder");
    if builder_path.exists() {
        bail!(
            "{} already exists; refusing to overwrite it",
            builder_path.display()
        );
    }
    let artifact = load_ring(ring_arg)
        .with_context(|| format!("failed to load ring {}", ring_arg.display()))?;
    let builder = builder_from_ring(&artifact, min_part_hours.unwrap_or(24))?;
    save_builder(&builder, &builder_path)?;
    println!(
        "Builder {} recovered from ring (move history is lost; partitions may\n\
         move again immediately)",
        builder_path.display()
    );
    Ok(EXIT_OK)
}

// -----------------------------------------------------------------------
// Summary display
// -----------------------------------------------------------------------

fn cmd_summary(path: &Path) -> Result<u8> {
    let builder = open(path)?;

    let mut regions = BTreeSet::new();
    let mut zones = BTreeSet::new();
    for dev in builder.devices().iter() {
        regions.insert(dev.region);
        zones.insert((dev.region, dev.zone));
    }

    println!("{}, build version {}", path.display(), builder.version());
    println!(
        "{} partitions, {:.6} replicas, {} regions, {} zones, {} devices, {:.2} balance, {} dispersion",
        builder.parts(),
        builder.replicas(),
        regions.len(),
        zones.len(),
        builder.devices().len(),
        builder.balance(),
        match builder.dispersion() {
            Some(score) => format!("{score:.2}"),
            None => "unknown".to_string(),
        }
    );
    println!(
        "The minimum number of hours before a partition can be reassigned is {} ({} remaining)",
        builder.min_part_hours(),
        format_duration(builder.min_part_seconds_left(unix_now()))
    );
    println!(
        "The overload factor is {:.2}% ({:.6})",
        builder.overload() * 100.0,
        builder.overload()
    );

    let ring_path = ring_path_for(path);
    let state = match ring_freshness(&builder, &ring_path) {
        RingFreshness::UpToDate => "is up-to-date",
        RingFreshness::Obsolete => "is obsolete",
        RingFreshness::Missing => "not found, probably it hasn't been written yet",
        RingFreshness::Invalid => "is invalid",
    };
    println!("Ring file {} {state}", ring_path.display());

    print_device_table(&builder, builder.devices().iter());
    Ok(EXIT_OK)
}

fn print_device_table<'d>(builder: &RingBuilder, devices: impl Iterator<Item = &'d Device>) {
    println!(
        "Devices:   id region zone {:>21} {:>21} {:>6} {:>8} {:>10} {:>8} meta",
        "ip:port", "replication ip:port", "name", "weight", "partitions", "balance"
    );
    for dev in devices {
        let balance = builder.device_balance(dev.id);
        let flag = if dev.pending_removal { " DEL" } else { "" };
        println!(
            "{:>11} {:>6} {:>4} {:>21} {:>21} {:>6} {:>8.2} {:>10} {:>8.2} {}{flag}",
            dev.id,
            dev.region,
            dev.zone,
            format!("{}:{}", display_ip(&dev.ip), dev.port),
            format!("{}:{}", display_ip(&dev.replication_ip), dev.replication_port),
            dev.name,
            dev.weight,
            dev.parts,
            balance,
            dev.meta,
        );
    }
}

/// Re-bracket IPv6 literals for `ip:port` display.
fn display_ip(ip: &str) -> String {
    if ip.contains(':') {
        format!("[{ip}]")
    } else {
        ip.to_string()
    }
}

fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    format!("{hours}:{minutes:02}:{secs:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overload_forms() {
        assert_eq!(parse_overload("0.1").unwrap(), 0.1);
        assert_eq!(parse_overload("10%").unwrap(), 0.1);
        assert_eq!(parse_overload("0").unwrap(), 0.0);
        assert!(parse_overload("ten").is_err());
        assert!(parse_overload("%").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00:00");
        assert_eq!(format_duration(3661), "1:01:01");
        assert_eq!(format_duration(90000), "25:00:00");
    }

    #[test]
    fn test_selector_flags_resolve_and_reject_mixing() {
        let flags = SelectorFlags {
            zone: Some(2),
            ..Default::default()
        };
        let criteria = resolve_selector(None, &flags).unwrap();
        assert_eq!(criteria.zone, Some(2));
        assert!(resolve_selector(Some("d0"), &flags).is_err());
        assert!(resolve_selector(None, &SelectorFlags::default()).is_err());

        let token = resolve_selector(Some("d0"), &SelectorFlags::default()).unwrap();
        assert_eq!(token.id, Some(0));
    }

    #[test]
    fn test_add_flags_build_a_device_spec() {
        let flags = AddFlags {
            region: Some(1),
            zone: Some(2),
            ip: Some("10.0.0.1".to_string()),
            port: Some(6200),
            name: Some("sdb1".to_string()),
            weight: Some(50.0),
            ..Default::default()
        };
        let spec = flags.spec().unwrap();
        assert_eq!(spec.region, 1);
        assert_eq!(spec.zone, 2);
        assert_eq!(spec.name, "sdb1");
        assert_eq!(spec.weight, 50.0);

        let partial = AddFlags {
            region: Some(1),
            ..Default::default()
        };
        assert!(partial.spec().is_err());
    }

    #[test]
    fn test_ring_path_derivation() {
        assert_eq!(
            ring_path_for(Path::new("/etc/torus/object.builder")),
            PathBuf::from("/etc/torus/object.ring")
        );
    }

    #[test]
    fn test_create_then_add_then_rebalance_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.builder");

        assert_eq!(cmd_create(&path, 6, 3.0, 1).unwrap(), EXIT_OK);
        assert!(cmd_create(&path, 6, 3.0, 1).is_err(), "must refuse overwrite");

        // Weights kept under one per replica slot so the capacity warning
        // does not fire.
        let args: Vec<String> = (1..=4)
            .flat_map(|i| {
                vec![
                    format!("r1z{i}-10.0.0.{i}:6200/sda1"),
                    "10".to_string(),
                ]
            })
            .collect();
        assert_eq!(cmd_add(&path, &args, &AddFlags::default()).unwrap(), EXIT_OK);

        assert_eq!(cmd_rebalance(&path, Some(1), false).unwrap(), EXIT_OK);
        assert!(ring_path_for(&path).exists());

        // Nothing left to move: warning exit, unless forced.
        assert_eq!(cmd_rebalance(&path, Some(1), false).unwrap(), EXIT_WARNING);
        assert_eq!(cmd_rebalance(&path, Some(1), true).unwrap(), EXIT_OK);
    }

    #[test]
    fn test_write_builder_recovers_from_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.builder");
        cmd_create(&path, 5, 3.0, 1).unwrap();
        let args: Vec<String> = (1..=4)
            .flat_map(|i| {
                vec![
                    format!("r1z{i}-10.0.0.{i}:6200/sda1"),
                    "10".to_string(),
                ]
            })
            .collect();
        cmd_add(&path, &args, &AddFlags::default()).unwrap();
        cmd_rebalance(&path, Some(3), false).unwrap();

        let ring = ring_path_for(&path);
        // Recovery refuses to clobber a live builder.
        assert!(cmd_write_builder(&ring, None).is_err());

        std::fs::remove_file(&path).unwrap();
        assert_eq!(cmd_write_builder(&ring, Some(1)).unwrap(), EXIT_OK);
        let recovered = load_builder(&path).unwrap();
        assert_eq!(recovered.parts(), 32);
        assert_eq!(recovered.devices().len(), 4);
    }
}
