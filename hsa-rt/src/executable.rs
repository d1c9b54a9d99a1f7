
use std::fmt;
use std::sync::Arc;

use crate::{ApiContext, LoadedKernel, };
use crate::agent::Agent;
use crate::code_object::{CodeObjectReader, LoadedCodeObject, SymbolDesc, SymbolKind, };
use crate::error::Error;
use crate::mem::DevicePtr;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum State {
  Unfrozen,
  Frozen,
}

struct LoadedSymbol {
  agent: usize,
  code_object: LoadedCodeObject,
  desc: SymbolDesc,
  debug_buffer: DevicePtr,
  /// Assigned on freeze, kernels only.
  kernel_object: Option<u64>,
}

pub struct Executable {
  ctx: ApiContext,
  code_objects: usize,
  symbols: Vec<LoadedSymbol>,
}

impl Executable {
  pub fn new(ctx: &ApiContext) -> Result<Executable, Error> {
    Ok(Executable {
      ctx: ctx.clone(),
      code_objects: 0,
      symbols: vec![],
    })
  }

  /// Load `reader`'s code object for `agent`. The code object's ISA must
  /// be the agent's and every kernel's entry routine must be known to it.
  pub fn load_agent_code_object(&mut self, agent: &Agent,
                                reader: &CodeObjectReader)
    -> Result<LoadedCodeObject, Error>
  {
    Error::IncompatibleArguments.check(agent.ctx().same_runtime(&self.ctx))?;
    let code = reader.code_object();
    let isa = agent.isa_name()?;
    if code.isa != isa {
      log::debug!("code object for `{}` can't load on `{}`", code.isa, isa);
      return Err(Error::IncompatibleArguments);
    }
    for kernel in code.kernels() {
      if self.ctx.0.kernels.get(&kernel.entry).is_none() {
        log::debug!("kernel `{}`: unknown entry `{}`", kernel.name, kernel.entry);
        return Err(Error::InvalidCodeSymbol);
      }
    }

    let loaded = LoadedCodeObject(self.code_objects);
    self.code_objects += 1;
    let debug_buffer = code.debug_buffer.unwrap_or_default();
    self.symbols.extend(code.symbols.iter().map(|desc| LoadedSymbol {
      agent: agent.index(),
      code_object: loaded,
      desc: desc.clone(),
      debug_buffer,
      kernel_object: None,
    }));
    Ok(loaded)
  }

  /// After freezing no more code objects can be loaded. Every kernel
  /// symbol gets a kernel object usable in dispatch packets.
  pub fn freeze(mut self) -> Result<FrozenExecutable, Error> {
    let ctx = self.ctx.clone();
    let mut kernels = Vec::new();
    for (idx, symbol) in self.symbols.iter().enumerate() {
      if symbol.desc.kind != SymbolKind::Kernel {
        continue;
      }
      let entry = ctx.0.kernels.get(&symbol.desc.entry)
        .ok_or(Error::InvalidCodeSymbol)?;
      kernels.push((idx, Arc::new(LoadedKernel {
        agent: symbol.agent,
        name: symbol.desc.name.clone(),
        entry,
        kernarg_segment_size: symbol.desc.kernarg_segment_size,
        debug_buffer: symbol.debug_buffer,
      })));
    }

    {
      let mut code = ctx.0.code.write();
      for (idx, kernel) in kernels {
        let kernel_object = ctx.next_kernel_object();
        log::trace!("kernel `{}` -> object 0x{:x}", kernel.name, kernel_object);
        code.insert(kernel_object, kernel);
        self.symbols[idx].kernel_object = Some(kernel_object);
      }
    }
    Ok(FrozenExecutable(self))
  }
}

impl fmt::Debug for Executable {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Executable")
      .field("code_objects", &self.code_objects)
      .field("symbols", &self.symbols.len())
      .finish()
  }
}

impl Drop for Executable {
  fn drop(&mut self) {
    let objects: Vec<_> = self.symbols.iter()
      .filter_map(|s| s.kernel_object )
      .collect();
    if objects.is_empty() {
      return;
    }
    let mut code = self.ctx.0.code.write();
    for object in objects {
      code.remove(&object);
    }
  }
}

#[derive(Debug)]
pub struct FrozenExecutable(Executable);

pub trait CommonExecutable {
  #[doc(hidden)]
  fn sys(&self) -> &Executable;

  fn state(&self) -> Result<State, Error>;

  fn agent_symbols(&self, agent: &Agent) -> Result<Vec<Symbol>, Error> {
    Ok(self.sys().symbols.iter()
      .filter(|s| s.agent == agent.index() )
      .map(|s| Symbol(s) )
      .collect())
  }

  fn symbol_by_linker_name<T>(&self, name: T, agent: Option<&Agent>)
    -> Result<Symbol, Error>
    where T: AsRef<str>,
  {
    let name = name.as_ref();
    self.sys().symbols.iter()
      .filter(|s| agent.map(|a| a.index() == s.agent ).unwrap_or(true) )
      .find(|s| s.desc.name == name )
      .map(Symbol)
      .ok_or(Error::InvalidCodeSymbol)
  }
}

impl CommonExecutable for Executable {
  #[doc(hidden)]
  fn sys(&self) -> &Executable { self }
  fn state(&self) -> Result<State, Error> { Ok(State::Unfrozen) }
}
impl CommonExecutable for FrozenExecutable {
  #[doc(hidden)]
  fn sys(&self) -> &Executable { &self.0 }
  fn state(&self) -> Result<State, Error> { Ok(State::Frozen) }
}

#[derive(Clone, Copy)]
pub struct Symbol<'a>(&'a LoadedSymbol);

impl<'a> Symbol<'a> {
  pub fn name(&self) -> Result<String, Error> {
    Ok(self.0.desc.name.clone())
  }
  pub fn kind(&self) -> Result<SymbolKind, Error> {
    Ok(self.0.desc.kind)
  }
  pub fn code_object(&self) -> LoadedCodeObject { self.0.code_object }
  /// `None` until the executable is frozen, and for non-kernel symbols.
  pub fn kernel_object(&self) -> Result<Option<u64>, Error> {
    Ok(self.0.kernel_object)
  }
  pub fn group_segment_size(&self) -> Result<u32, Error> {
    Ok(self.0.desc.group_segment_size)
  }
  pub fn private_segment_size(&self) -> Result<u32, Error> {
    Ok(self.0.desc.private_segment_size)
  }
  pub fn kernarg_segment_size(&self) -> Result<u32, Error> {
    Ok(self.0.desc.kernarg_segment_size)
  }
}
impl<'a> fmt::Debug for Symbol<'a> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Symbol")
      .field("name", &self.0.desc.name)
      .field("kind", &self.0.desc.kind)
      .field("kernel_object", &self.0.kernel_object)
      .finish()
  }
}
