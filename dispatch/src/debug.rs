//! The debug buffer: device memory a program may trace into, whose
//! address is known before the program is built and whose contents are
//! written to a file once the run is over.

use std::fs;
use std::path::{Path, PathBuf, };

use hsa_rt::mem::DevicePtr;

use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::mem::Buffer;

/// Build steps which need the debug buffer address at compile time find
/// it in this environment variable. It is set on the build step's
/// process only.
pub const DEBUG_BUFFER_ENV: &str = "ASM_DBG_BUF_ADDR";

#[derive(Debug)]
pub struct DebugBuffer {
  buffer: Buffer,
  path: PathBuf,
}

impl DebugBuffer {
  pub fn new<P>(dispatcher: &Dispatcher, size: usize, path: P) -> Result<Self, Error>
    where P: Into<PathBuf>,
  {
    let buffer = dispatcher.allocate_buffer(size)?;
    // traces are sparse; start from zeros rather than stale data.
    dispatcher.write_buffer(&buffer, &vec![0u8; size])?;
    dispatcher.copy_to_device(&buffer)?;
    log::debug!("debug buffer of {} bytes at {}", size, buffer.device_ptr());
    Ok(DebugBuffer {
      buffer,
      path: path.into(),
    })
  }

  pub fn address(&self) -> DevicePtr { self.buffer.device_ptr() }
  pub fn size(&self) -> usize { self.buffer.size() }
  pub fn path(&self) -> &Path { &self.path }

  /// The address as the build step expects it in `DEBUG_BUFFER_ENV`.
  pub fn env_value(&self) -> String {
    format!("{:#x}", self.address().addr())
  }

  /// Copy the buffer back and write it to `path`. Returns the number of
  /// bytes written.
  pub fn drain(&self, dispatcher: &Dispatcher) -> Result<usize, Error> {
    dispatcher.copy_from_device(&self.buffer)?;
    let bytes = dispatcher.read_buffer(&self.buffer)?;
    fs::write(&self.path, &bytes)
      .map_err(|err| Error::Io(Some(self.path.clone()), err) )?;
    log::info!("wrote {} debug buffer bytes to {}", bytes.len(), self.path.display());
    Ok(bytes.len())
  }

  pub fn free(self, dispatcher: &Dispatcher) -> Result<(), Error> {
    dispatcher.free_buffer(self.buffer)
  }
}
