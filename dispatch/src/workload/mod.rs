//! The workloads the `vector-add` tool can run.

pub use self::copy::CopyRoundTrip;
pub use self::vector_add::VectorAdd;

pub mod copy;
pub mod vector_add;
