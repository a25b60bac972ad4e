//! Runs the synchronization test groups against the soft device.
//!
//! ```text
//! vksync-runner [-h|--help] [-l|--list] [CONFIG.ron]
//! ```
//!
//! The configuration file is RON and every field is optional; see `default.ron` next to this
//! crate's manifest. Set `RUST_LOG` to control logging, for example `RUST_LOG=vksync=debug`.
//!
//! The process exits with status 0 if no case failed, 1 if any case failed and 2 if the run
//! couldn't start.

use anyhow::{bail, Context, Result};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Instant,
};
use vksync::{
    cases::{self, TestCase},
    config::Config,
    context::TestContext,
    provider::Provider,
    TestStatus,
};
use vksync_soft::{SoftDevice, SoftDeviceCreateInfo};

/// The contents of a configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct RunConfig {
    engine: Config,
    device: SoftDeviceCreateInfo,
    /// Where to write the JSON report, if anywhere.
    report: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    device: &'a str,
    seed: u64,
    summary: Summary,
    cases: Vec<CaseReport<'a>>,
}

#[derive(Debug, Serialize)]
struct CaseReport<'a> {
    name: &'a str,
    family: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

impl<'a> CaseReport<'a> {
    fn new(case: &'a TestCase, status: &'a TestStatus) -> Self {
        let (status_name, message) = match status {
            TestStatus::Pass => ("pass", None),
            TestStatus::Fail(message) => ("fail", Some(message.as_str())),
            TestStatus::NotSupported(message) => ("not_supported", Some(message.as_str())),
        };

        CaseReport {
            name: &case.name,
            family: case.family(),
            status: status_name,
            message,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
struct Summary {
    passed: usize,
    failed: usize,
    not_supported: usize,
}

impl Summary {
    fn add(&mut self, status: &TestStatus) {
        match status {
            TestStatus::Pass => self.passed += 1,
            TestStatus::Fail(_) => self.failed += 1,
            TestStatus::NotSupported(_) => self.not_supported += 1,
        }
    }

    fn total(&self) -> usize {
        self.passed + self.failed + self.not_supported
    }
}

const HELP: &str = "\
Usage: vksync-runner [--list] [CONFIG.ron]

Options:
  -h, --help  Print this help
  -l, --list  Print the names of the selected cases instead of running them
";

#[derive(Debug, PartialEq, Eq)]
struct Args {
    help: bool,
    list: bool,
    config: Option<PathBuf>,
}

impl Args {
    fn parse(mut args: pico_args::Arguments) -> Result<Self> {
        let help = args.contains(["-h", "--help"]);
        let list = args.contains(["-l", "--list"]);
        let config = args
            .opt_free_from_str::<PathBuf>()
            .context("invalid configuration path")?;
        let remaining = args.finish();

        if !remaining.is_empty() {
            bail!("unexpected arguments: {remaining:?}");
        }

        Ok(Args { help, list, config })
    }
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    let Some(path) = path else {
        return Ok(RunConfig::default());
    };

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: RunConfig = ron::de::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    Ok(config)
}

fn run(args: Args) -> Result<Summary> {
    let RunConfig {
        engine,
        device,
        report,
    } = load_config(args.config.as_deref())?;

    let cases = cases::enumerate(&engine);

    if args.list {
        for case in &cases {
            println!("{case}");
        }

        return Ok(Summary::default());
    }

    let device = SoftDevice::new(device).context("failed to create the soft device")?;
    let provider: Arc<dyn Provider> = Arc::new(device);
    let device_name = provider.properties().device_name.clone();
    let seed = engine.seed;
    let context = TestContext::new(provider, engine)?;

    info!("running {} case(s) on {device_name}", cases.len());

    let start = Instant::now();
    let mut summary = Summary::default();
    let statuses = cases
        .iter()
        .map(|case| {
            let status = cases::run_case(&context, case);
            summary.add(&status);

            if status.is_fail() {
                println!("{case}: {status}");
            }

            status
        })
        .collect::<Vec<_>>();

    println!(
        "{} case(s) in {:.2?}: {} passed, {} failed, {} not supported",
        summary.total(),
        start.elapsed(),
        summary.passed,
        summary.failed,
        summary.not_supported,
    );

    if let Some(path) = report {
        let report = Report {
            device: &device_name,
            seed,
            summary,
            cases: cases
                .iter()
                .zip(&statuses)
                .map(|(case, status)| CaseReport::new(case, status))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&report)?;

        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote the report to {}", path.display());
    }

    Ok(summary)
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::parse(pico_args::Arguments::from_env()) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {err:#}");
            eprintln!("{HELP}");
            return ExitCode::from(2);
        }
    };

    if args.help {
        println!("{HELP}");
        return ExitCode::SUCCESS;
    }

    match run(args) {
        Ok(summary) if summary.failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn default_config_parses() {
        let contents = include_str!("../default.ron");
        let config: RunConfig = ron::de::from_str(contents).unwrap();

        assert_eq!(config.engine, Config::default());
        assert_eq!(config.device, SoftDeviceCreateInfo::default());
        assert_eq!(config.report, Some(PathBuf::from("vksync-report.json")));
    }

    #[test]
    fn partial_configs_keep_defaults() {
        let config: RunConfig =
            ron::de::from_str("(engine: (seed: 7, families: [\"fan_out\"]))").unwrap();

        assert_eq!(config.engine.seed, 7);
        assert_eq!(config.engine.families, ["fan_out"]);
        assert_eq!(config.engine.iterations, Config::default().iterations);
        assert_eq!(config.report, None);
    }

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(pico_args::Arguments::from_vec(
            args.iter().map(OsString::from).collect(),
        ))
    }

    #[test]
    fn arguments() {
        assert_eq!(
            parse(&["--list", "run.ron"]).unwrap(),
            Args {
                help: false,
                list: true,
                config: Some(PathBuf::from("run.ron")),
            },
        );
        assert_eq!(
            parse(&[]).unwrap(),
            Args {
                help: false,
                list: false,
                config: None,
            },
        );
        assert!(parse(&["-h"]).unwrap().help);
        assert!(parse(&["a.ron", "b.ron"]).is_err());
    }

    #[test]
    fn config_errors_name_the_file() {
        let err = load_config(Some(Path::new("does/not/exist.ron"))).unwrap_err();

        assert!(format!("{err:#}").contains("failed to read does/not/exist.ron"));
    }

    #[test]
    fn case_reports() {
        let case = cases::enumerate(&Config::default()).remove(0);
        let status = TestStatus::Fail("mismatch".to_owned());
        let json = serde_json::to_value(CaseReport::new(&case, &status)).unwrap();

        assert_eq!(json["status"], "fail");
        assert_eq!(json["message"], "mismatch");
        assert_eq!(json["family"], case.family());
    }
}
