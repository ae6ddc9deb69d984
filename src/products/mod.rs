//! Data products
//!
//! Kind dispatch, decoding, merge-on-append, the on-disk container and the
//! archive layout, plus the aspect solver driver.

pub mod archive;
pub mod aspect;
pub mod decode;
pub mod format;
pub mod kinds;
pub mod merge;

pub use archive::{ArchiveError, ProductArchive};
pub use aspect::{solve_in_batches, AspectOffset, AspectSample, AspectSolution, AspectSolver, SolverError};
pub use decode::{DecodeError, DecoderRegistry, LevelBinaryDecoder, PacketDecoder};
pub use format::{EnvelopeFormat, EnvelopeHeader, FormatError, ProductFormat};
pub use kinds::{ControlKeyPolicy, FileGrouping, KindError, KindRegistry, ProductKind};
pub use merge::{MergeError, ProductMerger, TIME_EPSILON};
