
use std::fmt;

use serde::{Deserialize, Serialize, };

use hsa_rt::agent::Agent;
use hsa_rt::code_object::{CodeObjectReader, SymbolKind, };
use hsa_rt::executable::{CommonExecutable, Executable, FrozenExecutable, };

use crate::error::{Error, LoadError, };

/// Names a loaded program. Handles are handed out in load order and are
/// never reused, even after the program is destroyed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub struct ProgramHandle(pub usize);

/// A frozen executable and what dispatching its kernel needs.
pub struct Program {
  name: String,
  kernel_object: u64,
  group_segment_size: u32,
  private_segment_size: u32,
  kernarg_segment_size: u32,
  _exe: FrozenExecutable,
}

impl Program {
  pub fn name(&self) -> &str { &self.name }
  pub fn kernel_object(&self) -> u64 { self.kernel_object }
  /// Static group (LDS) memory the kernel needs.
  pub fn group_segment_size(&self) -> u32 { self.group_segment_size }
  /// Private (scratch) memory per work-item.
  pub fn private_segment_size(&self) -> u32 { self.private_segment_size }
  pub fn kernarg_segment_size(&self) -> u32 { self.kernarg_segment_size }
}
impl fmt::Debug for Program {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Program")
      .field("name", &self.name)
      .field("kernel_object", &format_args!("0x{:x}", self.kernel_object))
      .field("group_segment_size", &self.group_segment_size)
      .field("private_segment_size", &self.private_segment_size)
      .finish()
  }
}

/// Turns code object blobs into programs bound to one agent.
pub struct ProgramLoader {
  agent: Agent,
  programs: Vec<Option<Program>>,
}

impl ProgramLoader {
  pub fn new(agent: &Agent) -> Self {
    ProgramLoader {
      agent: agent.clone(),
      programs: vec![],
    }
  }

  /// Deserialize, load and freeze `bytes`, which must hold exactly one
  /// kernel. Nothing created along the way outlives a failure.
  pub fn load(&mut self, bytes: &[u8]) -> Result<ProgramHandle, Error> {
    let program = load_program(&self.agent, bytes)?;
    let handle = ProgramHandle(self.programs.len());
    log::info!("kernel loaded: {} as {:?}", program.name, handle);
    self.programs.push(Some(program));
    Ok(handle)
  }

  pub fn get(&self, handle: ProgramHandle) -> Result<&Program, Error> {
    self.programs.get(handle.0)
      .and_then(|p| p.as_ref() )
      .ok_or(Error::InvalidProgram(handle))
  }

  /// Release the program's executable. Destroying a handle twice, or one
  /// that was never loaded, is an error.
  pub fn destroy(&mut self, handle: ProgramHandle) -> Result<(), Error> {
    let program = self.programs.get_mut(handle.0)
      .and_then(|p| p.take() )
      .ok_or(Error::InvalidProgram(handle))?;
    log::debug!("destroying {:?} ({})", handle, program.name);
    Ok(())
  }

  /// Programs which are loaded and not destroyed.
  pub fn live(&self) -> usize {
    self.programs.iter()
      .filter(|p| p.is_some() )
      .count()
  }
}

impl fmt::Debug for ProgramLoader {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ProgramLoader")
      .field("agent", &self.agent)
      .field("loaded", &self.programs.len())
      .field("live", &self.live())
      .finish()
  }
}

fn load_program(agent: &Agent, bytes: &[u8]) -> Result<Program, Error> {
  let reader = CodeObjectReader::create(bytes)
    .map_err(LoadError::Deserialize)?;

  // `exe` is dropped on every early return below, which unregisters
  // whatever it had loaded.
  let mut exe = Executable::new(agent.ctx())
    .map_err(LoadError::Executable)?;
  exe.load_agent_code_object(agent, &reader)
    .map_err(LoadError::Executable)?;
  let exe = exe.freeze()
    .map_err(LoadError::Executable)?;

  let mut kernels = Vec::new();
  for symbol in exe.agent_symbols(agent)? {
    if symbol.kind()? == SymbolKind::Kernel {
      kernels.push(symbol.name()?);
    }
  }
  let name = match kernels.len() {
    0 => { return Err(LoadError::NoKernel.into()); },
    1 => kernels.remove(0),
    _ => { return Err(LoadError::AmbiguousKernel(kernels).into()); },
  };

  let (kernel_object, group_segment_size, private_segment_size,
    kernarg_segment_size) =
  {
    let symbol = exe.symbol_by_linker_name(&name, Some(agent))?;
    let kernel_object = symbol.kernel_object()?
      .ok_or_else(|| LoadError::NoKernelObject(name.clone()) )?;
    (kernel_object, symbol.group_segment_size()?,
     symbol.private_segment_size()?, symbol.kernarg_segment_size()?)
  };

  Ok(Program {
    name,
    kernel_object,
    group_segment_size,
    private_segment_size,
    kernarg_segment_size,
    _exe: exe,
  })
}
