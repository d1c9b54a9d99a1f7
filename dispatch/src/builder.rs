//! Where program binaries come from. The dispatcher only ever sees the
//! bytes; producing them is up to a `ProgramSource`.

use std::fs;
use std::path::{Path, PathBuf, };
use std::process::Command;

use hsa_rt::code_object::{CodeObject, SymbolDesc, SymbolKind, };
use hsa_rt::mem::DevicePtr;

use crate::debug::DEBUG_BUFFER_ENV;
use crate::error::Error;

/// What a build step is told about its target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildRequest {
  /// The target agent's ISA name.
  pub isa: String,
  /// Device address of the debug buffer, when there is one.
  pub debug_buffer: Option<DevicePtr>,
}

pub trait ProgramSource {
  fn describe(&self) -> String;
  /// Produce a loadable code object for `request`.
  fn build(&self, request: &BuildRequest) -> Result<Vec<u8>, Error>;
}

fn read_binary(path: &Path) -> Result<Vec<u8>, Error> {
  fs::read(path)
    .map_err(|err| Error::Io(Some(path.to_path_buf()), err) )
}

/// A code object already on disk.
#[derive(Clone, Debug)]
pub struct PrebuiltBinary(pub PathBuf);

impl ProgramSource for PrebuiltBinary {
  fn describe(&self) -> String {
    format!("prebuilt {}", self.0.display())
  }
  fn build(&self, _request: &BuildRequest) -> Result<Vec<u8>, Error> {
    read_binary(&self.0)
  }
}

/// Runs `command` with `sh -c`, then reads `output`. `{isa}` and
/// `{output}` in the command are replaced with the target ISA and the
/// output path. The debug buffer address, if any, is passed in the
/// child's environment as `ASM_DBG_BUF_ADDR`.
#[derive(Clone, Debug)]
pub struct BuildCommand {
  pub command: String,
  pub output: PathBuf,
}

impl BuildCommand {
  pub fn new<T, P>(command: T, output: P) -> Self
    where T: Into<String>,
          P: Into<PathBuf>,
  {
    BuildCommand {
      command: command.into(),
      output: output.into(),
    }
  }

  pub fn expand(&self, request: &BuildRequest) -> String {
    self.command
      .replace("{isa}", &request.isa)
      .replace("{output}", &self.output.to_string_lossy())
  }
}

impl ProgramSource for BuildCommand {
  fn describe(&self) -> String {
    format!("`{}`", self.command)
  }
  fn build(&self, request: &BuildRequest) -> Result<Vec<u8>, Error> {
    let command = self.expand(request);
    log::info!("execute: {}", command);

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&command);
    if let Some(addr) = request.debug_buffer {
      cmd.env(DEBUG_BUFFER_ENV, format!("{:#x}", addr.addr()));
    }
    let status = cmd.status()?;
    if !status.success() {
      log::error!("kernel build failed: {}", command);
      return Err(Error::Build {
        command,
        status: status.code(),
      });
    }
    read_binary(&self.output)
  }
}

/// A code object for the soft agent, made in memory: one kernel symbol
/// whose entry is a native routine the agent knows.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuiltinProgram {
  pub kernel: String,
  pub entry: String,
  pub kernarg_segment_size: u32,
  pub group_segment_size: u32,
  pub private_segment_size: u32,
}

impl BuiltinProgram {
  pub fn new<T, U>(kernel: T, entry: U, kernarg_segment_size: u32) -> Self
    where T: Into<String>,
          U: Into<String>,
  {
    BuiltinProgram {
      kernel: kernel.into(),
      entry: entry.into(),
      kernarg_segment_size,
      group_segment_size: 0,
      private_segment_size: 0,
    }
  }
  pub fn with_group_segment_size(mut self, size: u32) -> Self {
    self.group_segment_size = size;
    self
  }
  pub fn with_private_segment_size(mut self, size: u32) -> Self {
    self.private_segment_size = size;
    self
  }

  pub fn code_object(&self, request: &BuildRequest) -> CodeObject {
    CodeObject::new(request.isa.clone())
      .with_symbol(SymbolDesc {
        name: self.kernel.clone(),
        kind: SymbolKind::Kernel,
        entry: self.entry.clone(),
        group_segment_size: self.group_segment_size,
        private_segment_size: self.private_segment_size,
        kernarg_segment_size: self.kernarg_segment_size,
      })
      .with_debug_buffer(request.debug_buffer)
  }
}

impl ProgramSource for BuiltinProgram {
  fn describe(&self) -> String {
    format!("builtin {} ({})", self.kernel, self.entry)
  }
  fn build(&self, request: &BuildRequest) -> Result<Vec<u8>, Error> {
    Ok(self.code_object(request).serialize()?)
  }
}
