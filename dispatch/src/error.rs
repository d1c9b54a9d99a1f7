
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

pub use hsa_rt::error::Error as HsaError;
pub use hsa_rt::queue::Error as HsaQueueError;

use crate::catalog::RegionRole;
use crate::loader::ProgramHandle;
use crate::pipeline::Stage;

#[derive(Debug)]
pub enum LoadError {
  /// The blob isn't a code object.
  Deserialize(HsaError),
  /// The executable refused the code object, or freezing failed.
  Executable(HsaError),
  NoKernel,
  AmbiguousKernel(Vec<String>),
  /// The kernel symbol has no kernel object after freezing.
  NoKernelObject(String),
}

#[derive(Debug)]
pub enum Error {
  Hsa(HsaError),
  HsaQueue(HsaQueueError),
  Io(Option<PathBuf>, io::Error),

  NoSuchDevice {
    index: usize,
    found: usize,
  },
  MissingRegion(RegionRole),

  Load(LoadError),
  InvalidProgram(ProgramHandle),

  QueueCreate(HsaError),
  /// The queue and signal are gone; nothing can be dispatched.
  QueueDestroyed,
  /// The packet processor rejected or failed the dispatched packet.
  PacketFailed(HsaError),
  /// Timeout recovery couldn't recreate the queue. Fatal.
  RecoveryFailed(Box<Error>),

  InvalidEnv {
    var: &'static str,
    value: String,
  },
  Build {
    command: String,
    status: Option<i32>,
  },
  Stage(Stage, Box<Error>),
}

impl Error {
  /// Conditions after which no further dispatch can be trusted.
  pub fn is_fatal(&self) -> bool {
    match self {
      Error::RecoveryFailed(_) | Error::QueueDestroyed => true,
      Error::Stage(_, inner) => inner.is_fatal(),
      _ => false,
    }
  }
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      Error::Hsa(err) => Some(err),
      Error::HsaQueue(err) => Some(err),
      Error::Io(_, err) => Some(err),
      Error::QueueCreate(err) => Some(err),
      Error::PacketFailed(err) => Some(err),
      Error::RecoveryFailed(err) => Some(&**err),
      Error::Stage(_, err) => Some(&**err),
      Error::Load(LoadError::Deserialize(err)) => Some(err),
      Error::Load(LoadError::Executable(err)) => Some(err),
      _ => None,
    }
  }
}
impl From<HsaError> for Error {
  #[inline(always)]
  fn from(v: HsaError) -> Self {
    Error::Hsa(v)
  }
}
impl From<HsaQueueError> for Error {
  #[inline(always)]
  fn from(v: HsaQueueError) -> Self {
    Error::HsaQueue(v)
  }
}
impl From<LoadError> for Error {
  #[inline(always)]
  fn from(v: LoadError) -> Self {
    Error::Load(v)
  }
}
impl From<io::Error> for Error {
  #[inline(always)]
  fn from(v: io::Error) -> Self {
    Error::Io(None, v)
  }
}
impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}
impl fmt::Display for LoadError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}
impl StdError for LoadError { }
