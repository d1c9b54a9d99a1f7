//! Build, load and dispatch one kernel, then verify what it wrote.
//!
//! Exit status: 0 when verification passed, 1 when it found wrong
//! elements, 2 when the dispatch timed out, 3 on any other error and 4
//! when the queue couldn't be recovered.

extern crate hsa_rt as hsa;
extern crate rmp_serde as rmps;
extern crate tracing as log;

use std::error::Error as StdError;
use std::fs;
use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;
use std::time::Duration;

use clap::{App, Arg, ArgMatches, value_t_or_exit, };

use hsa_dispatch::*;

use tracing_subscriber::EnvFilter;

const EXIT_VERIFY_FAILED: i32 = 1;
const EXIT_TIMED_OUT: i32 = 2;
const EXIT_ERROR: i32 = 3;
const EXIT_FATAL: i32 = 4;

/// `None` if absent; exits with clap's usage error if it doesn't parse.
fn optional<T>(matches: &ArgMatches, name: &str) -> Option<T>
  where T: FromStr,
{
  if matches.is_present(name) {
    Some(value_t_or_exit!(matches, name, T))
  } else {
    None
  }
}

fn program_source(matches: &ArgMatches) -> Option<Box<dyn ProgramSource>> {
  if let Some(path) = matches.value_of("binary") {
    return Some(Box::new(PrebuiltBinary(PathBuf::from(path))));
  }
  let command = matches.value_of("build-command")?;
  let output = matches.value_of("output")?;
  Some(Box::new(BuildCommand::new(command, output)))
}

fn workload(matches: &ArgMatches) -> Box<dyn Workload> {
  let length = value_t_or_exit!(matches, "length", u32);
  let source = program_source(matches);
  let workload: Box<dyn Workload> = match matches.value_of("workload") {
    Some("copy") => {
      Box::new(CopyRoundTrip::with_pattern(length as usize))
    },
    _ => match source {
      Some(source) => Box::new(VectorAdd::with_source(length, source)),
      None => Box::new(VectorAdd::new(length)),
    },
  };
  workload
}

fn write_report(path: &str, report: &RunReport) -> Result<(), Box<dyn StdError>> {
  let bytes = rmps::to_vec_named(report)?;
  fs::write(path, bytes)?;
  Ok(())
}

fn run(matches: &ArgMatches) -> Result<RunReport, Error> {
  let mut config = DispatcherConfig::from_env()?;
  if let Some(device) = optional(matches, "device") {
    config.device_index = device;
  }
  if let Some(ms) = optional(matches, "timeout") {
    config.timeout = Duration::from_millis(ms);
  }
  let mut options = RunOptions::new(config.timeout);
  if let Some(size) = optional::<usize>(matches, "debug-size") {
    let path = matches.value_of("debug-path").unwrap_or("debug.bin");
    options = options.with_debug(size, path);
  }

  let ctx = hsa::ApiContext::new();
  let mut dispatcher = Dispatcher::new(&ctx, config)?;
  let mut workload = workload(matches);
  let report = run_workload(&mut dispatcher, &mut *workload, &options);
  let shutdown = dispatcher.shutdown();

  let report = report?;
  shutdown?;
  Ok(report)
}

pub fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| EnvFilter::new("info") ))
    .init();

  let device = Arg::with_name("device")
    .long("device")
    .short("d")
    .help("index of the kernel dispatch agent to use")
    .takes_value(true);
  let length = Arg::with_name("length")
    .long("length")
    .short("n")
    .help("number of elements")
    .takes_value(true)
    .default_value("64");
  let timeout = Arg::with_name("timeout")
    .long("timeout-ms")
    .help("how long to wait for the dispatch before recreating the queue")
    .takes_value(true);
  let workload = Arg::with_name("workload")
    .long("workload")
    .short("w")
    .takes_value(true)
    .possible_values(&["vector-add", "copy"])
    .default_value("vector-add");

  let binary = Arg::with_name("binary")
    .long("binary")
    .help("vector-add only: load a prebuilt code object instead of the builtin one")
    .takes_value(true)
    .conflicts_with("build-command");
  let build_command = Arg::with_name("build-command")
    .long("build-command")
    .help("shell command producing the code object; `{isa}` and `{output}` are substituted")
    .takes_value(true)
    .requires("output");
  let output = Arg::with_name("output")
    .long("output")
    .short("o")
    .help("where the build command writes the code object")
    .takes_value(true);

  let debug_size = Arg::with_name("debug-size")
    .long("debug-size")
    .help("bytes of device debug buffer to hand to the build")
    .takes_value(true);
  let debug_path = Arg::with_name("debug-path")
    .long("debug-path")
    .help("where the debug buffer is written after the run")
    .takes_value(true)
    .requires("debug-size");
  let report = Arg::with_name("report")
    .long("report")
    .help("write a MessagePack run report here")
    .takes_value(true);

  let matches = App::new("HSA vector add")
    .version("0.1.0")
    .arg(device)
    .arg(length)
    .arg(timeout)
    .arg(workload)
    .arg(binary)
    .arg(build_command)
    .arg(output)
    .arg(debug_size)
    .arg(debug_path)
    .arg(report)
    .get_matches();

  let result = run(&matches);
  if let (Ok(report), Some(path)) = (&result, matches.value_of("report")) {
    if let Err(e) = write_report(path, report) {
      log::error!("failed to write the run report to {}: {}", path, e);
      exit(EXIT_ERROR);
    }
  }

  let code = match result {
    Ok(ref report) if report.passed() => {
      println!("PASSED in {:?}", report.elapsed);
      0
    },
    Ok(ref report) if report.status == DispatchStatus::TimedOut => {
      println!("TIMED OUT");
      EXIT_TIMED_OUT
    },
    Ok(_) => {
      println!("FAILED");
      EXIT_VERIFY_FAILED
    },
    Err(e) if e.is_fatal() => {
      log::error!("fatal: {}", e);
      EXIT_FATAL
    },
    Err(e) => {
      log::error!("{}", e);
      EXIT_ERROR
    },
  };
  exit(code);
}
