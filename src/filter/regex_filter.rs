use super::{LineFilter, LogLine};
use regex::RegexBuilder;

/// Regex match over the line's content.
pub struct RegexFilter {
    regex: regex::Regex,
}

impl RegexFilter {
    pub fn new(pattern: &str, case_sensitive: bool) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()?;
        Ok(Self { regex })
    }
}

impl LineFilter for RegexFilter {
    fn matches(&self, line: &LogLine) -> bool {
        self.regex.is_match(&line.content)
    }
}
