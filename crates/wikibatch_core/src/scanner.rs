use std::collections::BTreeMap;

use regex::Regex;

/// One matched submission line, keyed by the pattern's named groups.
pub type ScanResult = BTreeMap<String, String>;

/// Turns request page text into structured submissions using one named-group pattern.
#[derive(Debug, Clone)]
pub struct RequestScanner {
    pattern: Regex,
    results: Vec<ScanResult>,
}

impl RequestScanner {
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            results: Vec::new(),
        }
    }

    /// Match `text` line by line. Lines that do not match are skipped.
    /// Groups that did not take part in a match map to an empty string.
    pub fn scan(&mut self, text: &str) -> &[ScanResult] {
        let names: Vec<&str> = self.pattern.capture_names().flatten().collect();
        self.results = text
            .lines()
            .filter_map(|line| self.pattern.captures(line.trim_end()))
            .map(|captures| {
                names
                    .iter()
                    .map(|name| {
                        let value = captures
                            .name(name)
                            .map(|group| group.as_str().trim().to_string())
                            .unwrap_or_default();
                        (name.to_string(), value)
                    })
                    .collect()
            })
            .collect();
        &self.results
    }

    pub fn results(&self) -> &[ScanResult] {
        &self.results
    }

    pub fn have_requests(&self) -> bool {
        !self.results.is_empty()
    }
}
