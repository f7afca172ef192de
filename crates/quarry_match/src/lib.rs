//! Parser matching: map a file path and its initial bytes to at most one
//! parser, and the contracts parsers and normalizers are invoked through.

pub mod builtin;
pub mod matcher;
pub mod normalize;
pub mod parser;
pub mod registry;
pub mod spec;

pub use matcher::Matcher;
pub use normalize::{default_normalizers, Normalizer, SystemNormalizer};
pub use parser::{LogLevel, LogRecord, ParseLogger, Parser, RecordingLogger};
pub use registry::ParserRegistry;
pub use spec::ParserSpec;
