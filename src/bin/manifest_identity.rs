use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use axml_identity::{
    is_apk_path, scan_apk, scan_manifest_file, try_scan_apk, try_scan_manifest_file,
    ManifestIdentity, ScanResult,
};
use clap::Parser;
use log::LevelFilter;
use serde::Serialize;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

/// Print the package, application and component factory names declared by a
/// compiled AndroidManifest.xml.
#[derive(Parser, Debug)]
#[command(name = "manifest_identity", version, about)]
struct Args {
    /// Binary AndroidManifest.xml, or an APK when it ends in `.apk` or `.zip`.
    input: PathBuf,

    /// Treat the input as an APK regardless of its extension.
    #[arg(long, conflicts_with = "manifest")]
    apk: bool,

    /// Treat the input as a bare binary manifest regardless of its extension.
    #[arg(long)]
    manifest: bool,

    /// Fail when the document cannot be decoded instead of printing `null`.
    #[arg(long)]
    strict: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Serialize)]
struct Report {
    #[serde(flatten)]
    identity: ManifestIdentity,
    patched: bool,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // A logger can only be installed once; ignore the error if one already is.
    let _ = TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto);
}

fn scan(args: &Args) -> ScanResult<Option<ManifestIdentity>> {
    let as_apk = args.apk || (!args.manifest && is_apk_path(&args.input));
    match (as_apk, args.strict) {
        (true, true) => try_scan_apk(&args.input).map(Some),
        (true, false) => scan_apk(&args.input),
        (false, true) => try_scan_manifest_file(&args.input).map(Some),
        (false, false) => scan_manifest_file(&args.input),
    }
}

fn run(args: &Args) -> Result<()> {
    let identity = scan(args).with_context(|| format!("Failed to scan {}", args.input.display()))?;
    let report = identity.map(|identity| Report {
        patched: identity.uses_proxy_factory(),
        identity,
    });
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    println!("{json}");
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    if let Err(err) = run(&args) {
        eprintln!("{err:?}");
        exit(1);
    }
}
