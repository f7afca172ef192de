//! The normalizer contract.
//!
//! Normalizers run after parsing, in registration order, against the parsed
//! archive. A normalizer declares the parser domain it applies to; `None`
//! applies to every domain. Any error fails the entry.

use quarry_protocol::{QuarryError, Result};

use crate::parser::ParseLogger;

pub trait Normalizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// The parser domain this normalizer applies to; `None` for all.
    fn domain(&self) -> Option<&'static str> {
        None
    }

    fn normalize(
        &self,
        archive: &mut serde_json::Value,
        logger: &mut dyn ParseLogger,
    ) -> Result<()>;
}

/// Derives the `results` summary section from the parsed run data.
pub struct SystemNormalizer;

impl Normalizer for SystemNormalizer {
    fn name(&self) -> &'static str {
        "SystemNormalizer"
    }

    fn domain(&self) -> Option<&'static str> {
        Some("computation")
    }

    fn normalize(
        &self,
        archive: &mut serde_json::Value,
        logger: &mut dyn ParseLogger,
    ) -> Result<()> {
        let program_name = archive
            .get("run")
            .and_then(|run| run.get("program_name"))
            .and_then(|name| name.as_str())
            .map(|name| name.to_string());

        let object = archive
            .as_object_mut()
            .ok_or_else(|| QuarryError::NormalizerFailure {
                normalizer: self.name().to_string(),
                message: "archive is not an object".to_string(),
            })?;

        let results = object
            .entry("results")
            .or_insert_with(|| serde_json::json!({}));
        if !results.is_object() {
            *results = serde_json::json!({});
        }
        if let Some(program_name) = program_name {
            results["program_name"] = serde_json::Value::String(program_name);
        }
        logger.info("system normalizer completed");
        Ok(())
    }
}

/// The built-in normalizer chain.
pub fn default_normalizers() -> Vec<Box<dyn Normalizer>> {
    vec![Box::new(SystemNormalizer)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RecordingLogger;

    #[test]
    fn test_system_normalizer_derives_results() {
        let mut archive = serde_json::json!({"run": {"program_name": "Template"}});
        let mut logger = RecordingLogger::new();
        SystemNormalizer
            .normalize(&mut archive, &mut logger)
            .unwrap();
        assert_eq!(archive["results"]["program_name"], "Template");
    }

    #[test]
    fn test_system_normalizer_rejects_non_object() {
        let mut archive = serde_json::json!(42);
        let mut logger = RecordingLogger::new();
        let err = SystemNormalizer
            .normalize(&mut archive, &mut logger)
            .unwrap_err();
        assert!(matches!(err, QuarryError::NormalizerFailure { .. }));
    }
}
