
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize, };

use crate::error::Error;

pub const DEVICE_ENV: &str = "HSA_DISPATCH_DEVICE";
pub const TIMEOUT_ENV: &str = "HSA_DISPATCH_TIMEOUT_MS";
pub const POLL_ENV: &str = "HSA_DISPATCH_POLL_US";

/// Argument block size held from the start; blocks only ever grow.
pub const KERNARG_INITIAL_SIZE: usize = 4096;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
  /// Which kernel dispatch agent, in enumeration order.
  pub device_index: usize,
  pub kernarg_initial_size: usize,
  /// Packets; `None` uses the agent's maximum queue size.
  pub queue_size: Option<u32>,
  /// How long one completion signal wait may block before the timeout
  /// is checked again.
  pub poll_interval: Duration,
  /// Used by callers which don't pass their own.
  pub timeout: Duration,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    DispatcherConfig {
      device_index: 0,
      kernarg_initial_size: KERNARG_INITIAL_SIZE,
      queue_size: None,
      poll_interval: Duration::from_millis(1),
      timeout: Duration::from_millis(1000),
    }
  }
}

fn parse_env<T>(var: &'static str) -> Result<Option<T>, Error>
  where T: FromStr,
{
  let value = match env::var(var) {
    Ok(value) => value,
    Err(env::VarError::NotPresent) => { return Ok(None); },
    Err(env::VarError::NotUnicode(value)) => {
      return Err(Error::InvalidEnv {
        var,
        value: value.to_string_lossy().into_owned(),
      });
    },
  };
  value.trim().parse()
    .map(Some)
    .map_err(|_| Error::InvalidEnv { var, value, })
}

impl DispatcherConfig {
  /// The defaults, overridden by `HSA_DISPATCH_DEVICE`,
  /// `HSA_DISPATCH_TIMEOUT_MS` and `HSA_DISPATCH_POLL_US`.
  pub fn from_env() -> Result<Self, Error> {
    DispatcherConfig::default().with_env()
  }
  pub fn with_env(mut self) -> Result<Self, Error> {
    if let Some(index) = parse_env(DEVICE_ENV)? {
      self.device_index = index;
    }
    if let Some(ms) = parse_env(TIMEOUT_ENV)? {
      self.timeout = Duration::from_millis(ms);
    }
    if let Some(us) = parse_env(POLL_ENV)? {
      self.poll_interval = Duration::from_micros(us);
    }
    Ok(self)
  }
}
