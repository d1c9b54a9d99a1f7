
use serde::{Deserialize, Serialize, };

use crate::rmps::decode::{from_slice as rmps_from_slice, };

use crate::error::Error;
use crate::mem::DevicePtr;

/// Leading bytes of every serialized code object.
pub const CODE_OBJECT_MAGIC: &[u8; 4] = b"HSCO";
pub const CODE_OBJECT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum SymbolKind {
  Kernel,
  Variable,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize)]
pub struct SymbolDesc {
  pub name: String,
  pub kind: SymbolKind,
  /// Name of the native routine implementing a kernel symbol.
  pub entry: String,
  pub group_segment_size: u32,
  pub private_segment_size: u32,
  pub kernarg_segment_size: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize)]
pub struct CodeObject {
  /// The ISA this was built for; must match the loading agent's.
  pub isa: String,
  pub symbols: Vec<SymbolDesc>,
  /// Device address the program was built to trace into, if any.
  pub debug_buffer: Option<DevicePtr>,
}

impl CodeObject {
  pub fn new<T>(isa: T) -> Self
    where T: Into<String>,
  {
    CodeObject {
      isa: isa.into(),
      symbols: vec![],
      debug_buffer: None,
    }
  }

  pub fn with_kernel(mut self, name: &str, entry: &str,
                     kernarg_segment_size: u32) -> Self
  {
    self.symbols.push(SymbolDesc {
      name: name.into(),
      kind: SymbolKind::Kernel,
      entry: entry.into(),
      group_segment_size: 0,
      private_segment_size: 0,
      kernarg_segment_size,
    });
    self
  }
  pub fn with_symbol(mut self, symbol: SymbolDesc) -> Self {
    self.symbols.push(symbol);
    self
  }
  pub fn with_debug_buffer(mut self, debug_buffer: Option<DevicePtr>) -> Self {
    self.debug_buffer = debug_buffer;
    self
  }

  pub fn kernels(&self) -> impl Iterator<Item = &SymbolDesc> {
    self.symbols.iter()
      .filter(|s| s.kind == SymbolKind::Kernel )
  }

  pub fn serialize(&self) -> Result<Vec<u8>, Error> {
    let payload = crate::rmps::to_vec_named(self)
      .map_err(|err| {
        log::error!("code object encode failed: {}", err);
        Error::InvalidCodeObject
      })?;
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(CODE_OBJECT_MAGIC);
    out.extend_from_slice(&CODE_OBJECT_VERSION.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
  }

  pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
    Error::InvalidCodeObject.check(bytes.len() >= 8)?;
    Error::InvalidCodeObject.check(&bytes[..4] == CODE_OBJECT_MAGIC)?;
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != CODE_OBJECT_VERSION {
      log::debug!("unsupported code object version {}", version);
      return Err(Error::InvalidCodeObject);
    }
    rmps_from_slice(&bytes[8..])
      .map_err(|err| {
        log::debug!("code object decode failed: {}", err);
        Error::InvalidCodeObject
      })
  }
}

/// A deserialized code object, ready to be loaded into an executable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeObjectReader {
  code: CodeObject,
}
impl CodeObjectReader {
  pub fn create(from: &[u8]) -> Result<Self, Error> {
    Ok(CodeObjectReader {
      code: CodeObject::deserialize(from)?,
    })
  }
  pub fn from_code_object(code: CodeObject) -> Self {
    CodeObjectReader { code, }
  }
  pub fn code_object(&self) -> &CodeObject { &self.code }
}

/// Identifies one code object loaded into an executable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LoadedCodeObject(pub(crate) usize);
