use std::error::Error as StdError;
use std::fmt;
use std::result::Result;

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Error {
  General,
  IncompatibleArguments,
  InvalidAgent,
  InvalidAllocation,
  InvalidArgument,
  InvalidCodeObject,
  InvalidCodeSymbol,
  InvalidExecutable,
  InvalidIsa,
  InvalidPacketFormat,
  InvalidQueue,
  InvalidQueueCreation,
  InvalidRegion,
  InvalidSignal,
  OutOfResources,
  Overflow,
}

impl Error {
  /// Maps a boolean runtime check onto `Err(self)`.
  pub(crate) fn check(self, ok: bool) -> Result<(), Error> {
    if ok {
      Ok(())
    } else {
      Err(self)
    }
  }
}

impl StdError for Error { }
impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}
