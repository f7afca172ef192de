//! The parser registry.
//!
//! Constructed once at process start and read-only thereafter; matching
//! order is the registration order. Renamed parsers keep their old names as
//! aliases so a rename does not count as a parser change during reprocess.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builtin::{ArchiveFileParser, ChaosParser, EmptyParser, PhonopyParser, TemplateParser};
use crate::parser::Parser;
use crate::spec::ParserSpec;

pub struct RegisteredParser {
    pub spec: ParserSpec,
    pub parser: Arc<dyn Parser>,
}

pub struct ParserRegistry {
    parsers: Vec<RegisteredParser>,
    aliases: HashMap<&'static str, &'static str>,
}

impl ParserRegistry {
    /// The built-in registry.
    pub fn default_registry() -> Self {
        let mut registry = Self {
            parsers: Vec::new(),
            aliases: HashMap::new(),
        };

        registry.register(
            ParserSpec::new("parsers/phonopy").name_re(r"(.*/)?phonopy[^/]*\.ya?ml"),
            Arc::new(PhonopyParser),
        );
        registry.register(
            ParserSpec::new("parsers/template").name_re(r".*template[^/]*\.json"),
            Arc::new(TemplateParser),
        );
        registry.register(
            ParserSpec::new("parsers/chaos").name_re(r".*chaos\.json"),
            Arc::new(ChaosParser),
        );
        registry.register(
            ParserSpec::new("parsers/vasp")
                .mime_re(r"(application/.*)|(text/.*)")
                .contents_re(
                    r#"(?s)^\s*<\?xml version="1\.0" encoding="ISO-8859-1"\?>\s*.{0,500}<modeling>|^\s?vasp"#,
                )
                .compressions(&["gz", "bz2", "xz"]),
            Arc::new(EmptyParser),
        );
        registry.register(
            ParserSpec::new("parsers/archive").name_re(r".*\.archive\.json"),
            Arc::new(ArchiveFileParser),
        );

        // Placeholders for legacy identifiers, offered only when strict
        // matching is off.
        registry.register(
            ParserSpec::new("missing/octopus")
                .name_re(r"(inp)|(.*/inp)")
                .placeholder(),
            Arc::new(EmptyParser),
        );
        registry.register(
            ParserSpec::new("missing/crystal")
                .name_re(r".*\.cryst\.out")
                .placeholder(),
            Arc::new(EmptyParser),
        );

        registry.alias("parser/template", "parsers/template");
        registry.alias("parser/chaos", "parsers/chaos");
        registry.alias("parser/phonopy", "parsers/phonopy");

        registry
    }

    pub fn register(&mut self, spec: ParserSpec, parser: Arc<dyn Parser>) {
        self.parsers.push(RegisteredParser { spec, parser });
    }

    pub fn alias(&mut self, old_name: &'static str, name: &'static str) {
        self.aliases.insert(old_name, name);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredParser> {
        self.parsers.iter()
    }

    /// Resolve a (possibly legacy) parser name to its canonical spelling.
    pub fn canonical_name<'a>(&self, name: &'a str) -> &'a str {
        self.aliases.get(name).copied().unwrap_or(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredParser> {
        let canonical = self.canonical_name(name);
        self.parsers
            .iter()
            .find(|registered| registered.spec.name == canonical)
    }

    /// True when the two names identify the same parser, treating a renamed
    /// parser as unchanged.
    pub fn same_parser(&self, a: &str, b: &str) -> bool {
        self.canonical_name(a) == self.canonical_name(b)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::default_registry()
    }
}
