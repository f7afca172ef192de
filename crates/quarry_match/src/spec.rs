//! Matching specification of a single parser.

use quarry_files::stream::Compression;
use regex::Regex;

/// The 4-tuple a parser is matched by: filename regex, mime regex, content
/// regex, and the compressions it can read through. The first registered
/// parser whose spec matches wins.
#[derive(Debug, Clone)]
pub struct ParserSpec {
    pub name: &'static str,
    /// Domain the parser's output belongs to; normalizers declare the
    /// domains they apply to.
    pub domain: &'static str,
    /// Matched against the whole upload-relative path (anchored).
    pub mainfile_name_re: Option<Regex>,
    pub mainfile_mime_re: Option<Regex>,
    /// Searched in the decoded head of the file.
    pub mainfile_contents_re: Option<Regex>,
    pub supported_compressions: &'static [&'static str],
    /// Placeholder parsers produce stub entries for legacy identifiers and
    /// are only offered when the caller does not request strict matching.
    pub placeholder: bool,
}

impl ParserSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            domain: "computation",
            mainfile_name_re: None,
            mainfile_mime_re: None,
            mainfile_contents_re: None,
            supported_compressions: &[],
            placeholder: false,
        }
    }

    pub fn name_re(mut self, pattern: &str) -> Self {
        let anchored = format!("^(?:{pattern})$");
        self.mainfile_name_re = Some(Regex::new(&anchored).expect("valid mainfile name regex"));
        self
    }

    pub fn mime_re(mut self, pattern: &str) -> Self {
        self.mainfile_mime_re = Some(Regex::new(pattern).expect("valid mime regex"));
        self
    }

    pub fn contents_re(mut self, pattern: &str) -> Self {
        self.mainfile_contents_re = Some(Regex::new(pattern).expect("valid contents regex"));
        self
    }

    pub fn compressions(mut self, compressions: &'static [&'static str]) -> Self {
        self.supported_compressions = compressions;
        self
    }

    pub fn domain(mut self, domain: &'static str) -> Self {
        self.domain = domain;
        self
    }

    /// Mark as a placeholder offered only in non-strict matching.
    pub fn placeholder(mut self) -> Self {
        self.placeholder = true;
        self
    }

    /// Evaluate the spec against a candidate mainfile.
    pub fn is_mainfile(
        &self,
        path: &str,
        mime: &str,
        decoded_head: Option<&str>,
        compression: Option<Compression>,
    ) -> bool {
        if let Some(compression) = compression {
            if !self.supported_compressions.contains(&compression.as_str()) {
                return false;
            }
        }
        if self.mainfile_name_re.is_none()
            && self.mainfile_mime_re.is_none()
            && self.mainfile_contents_re.is_none()
        {
            return false;
        }
        if let Some(re) = &self.mainfile_name_re {
            if !re.is_match(path) {
                return false;
            }
        }
        if let Some(re) = &self.mainfile_mime_re {
            if !re.is_match(mime) {
                return false;
            }
        }
        if let Some(re) = &self.mainfile_contents_re {
            match decoded_head {
                Some(head) => {
                    if !re.is_match(head) {
                        return false;
                    }
                }
                // Binary files cannot satisfy a contents regex.
                None => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_re_is_anchored() {
        let spec = ParserSpec::new("parsers/template").name_re(r".*template[^/]*\.json");
        assert!(spec.is_mainfile("a/template.json", "application/json", Some("{}"), None));
        assert!(spec.is_mainfile("template-2.json", "application/json", Some("{}"), None));
        assert!(!spec.is_mainfile("a/template.json.bak", "application/json", Some("{}"), None));
    }

    #[test]
    fn test_contents_re_requires_decodable_file() {
        let spec = ParserSpec::new("parsers/vasp").contents_re(r"vasp");
        assert!(spec.is_mainfile("OUTCAR", "text/plain", Some(" vasp 5.4.4"), None));
        assert!(!spec.is_mainfile("OUTCAR", "application/octet-stream", None, None));
    }

    #[test]
    fn test_compression_gate() {
        let spec = ParserSpec::new("parsers/vasp")
            .contents_re(r"vasp")
            .compressions(&["gz"]);
        assert!(spec.is_mainfile("OUTCAR.gz", "text/plain", Some("vasp"), Some(Compression::Gzip)));
        assert!(!spec.is_mainfile(
            "OUTCAR.xz",
            "text/plain",
            Some("vasp"),
            Some(Compression::Xz)
        ));
    }

    #[test]
    fn test_spec_without_rules_never_matches() {
        let spec = ParserSpec::new("parsers/nothing");
        assert!(!spec.is_mainfile("anything", "text/plain", Some("content"), None));
    }
}
