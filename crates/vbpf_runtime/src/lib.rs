//! Program objects and everything that runs them: instruction patching, constant
//! blinding, the interpreter, JIT backends and program arrays.

mod error;

pub mod backend;
pub mod blind;
pub mod interp;
pub mod map;
pub mod patch;
pub mod prog_array;
pub mod prog_aux;
pub mod program;
pub mod release;
pub mod runtime;
pub mod stats;

pub use backend::{JitBackend, JitContext, LinearX64Backend};
pub use blind::blind;
pub use error::{Result, RuntimeError};
pub use interp::{HelperCtx, HelperFn, HelperTable, Interpreter};
pub use map::{Map, MapOwner, MapType, ProgArrayMap};
pub use patch::{patch, remove};
pub use prog_array::{ProgArray, ProgArrayCell, ProgArrayItem};
pub use prog_aux::{LineInfo, PokeDescriptor, ProgramAux, Subprog};
pub use program::{Entry, ProgType, Program, ProgramFlags};
pub use runtime::Runtime;
pub use stats::StatsSnapshot;
