//! Built-in parsers.
//!
//! The real domain parsers are external; these cover the artificial inputs
//! used by tests and migration (template, chaos, pre-parsed archives) plus
//! the placeholder parser producing stub entries for legacy identifiers.

use quarry_protocol::{QuarryError, Result};
use std::path::Path;

use crate::parser::{ParseLogger, Parser};

fn read_json(mainfile: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(mainfile)?;
    serde_json::from_str(&content).map_err(|e| QuarryError::ParserFailure {
        parser: String::new(),
        message: format!("mainfile is not valid json: {e}"),
    })
}

/// Parses `*template*.json` files: the file content becomes the archive.
pub struct TemplateParser;

impl Parser for TemplateParser {
    fn parse(
        &self,
        mainfile: &Path,
        archive: &mut serde_json::Value,
        logger: &mut dyn ParseLogger,
    ) -> Result<()> {
        let content = read_json(mainfile)?;
        merge_into(archive, content);
        logger.info("template parser executed");
        Ok(())
    }
}

/// Always fails, with the failure mode taken from the mainfile. Exercises
/// the entry failure paths.
pub struct ChaosParser;

impl Parser for ChaosParser {
    fn parse(
        &self,
        mainfile: &Path,
        _archive: &mut serde_json::Value,
        logger: &mut dyn ParseLogger,
    ) -> Result<()> {
        let chaos = read_json(mainfile)
            .ok()
            .and_then(|value| value.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "exception".to_string());
        logger.error("chaos parser raises");
        Err(QuarryError::ParserFailure {
            parser: "parsers/chaos".to_string(),
            message: format!("chaos: {chaos}"),
        })
    }
}

/// Reads `*.archive.json` files that already contain a full archive.
pub struct ArchiveFileParser;

impl Parser for ArchiveFileParser {
    fn parse(
        &self,
        mainfile: &Path,
        archive: &mut serde_json::Value,
        logger: &mut dyn ParseLogger,
    ) -> Result<()> {
        *archive = read_json(mainfile)?;
        logger.info("archive parser executed");
        Ok(())
    }
}

/// Parses phonon calculations; the archive records the path of the entry it
/// references so the post-join step can merge method information from it.
pub struct PhonopyParser;

impl Parser for PhonopyParser {
    fn parse(
        &self,
        mainfile: &Path,
        archive: &mut serde_json::Value,
        logger: &mut dyn ParseLogger,
    ) -> Result<()> {
        let content = read_json(mainfile)?;
        merge_into(archive, content);
        if archive.get("references").is_none() {
            logger.warning("phonon calculation has no reference");
        }
        archive["run"] = serde_json::json!({"program_name": "Phonopy"});
        logger.info("phonopy parser executed");
        Ok(())
    }
}

/// Produces a stub entry and an empty archive; used to keep legacy
/// identifiers for mainfiles no real parser matches anymore.
pub struct EmptyParser;

impl Parser for EmptyParser {
    fn parse(
        &self,
        _mainfile: &Path,
        _archive: &mut serde_json::Value,
        logger: &mut dyn ParseLogger,
    ) -> Result<()> {
        logger.info("empty parser produced a stub entry");
        Ok(())
    }
}

fn merge_into(archive: &mut serde_json::Value, content: serde_json::Value) {
    match (archive.as_object_mut(), content) {
        (Some(target), serde_json::Value::Object(source)) => {
            for (key, value) in source {
                target.insert(key, value);
            }
        }
        (_, content) => *archive = content,
    }
}
