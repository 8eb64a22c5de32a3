use super::{LineFilter, LogLine};

/// Substring match over the line's content.
pub struct SubstringFilter {
    pattern: String,
    case_sensitive: bool,
}

impl SubstringFilter {
    pub fn new(pattern: &str, case_sensitive: bool) -> Self {
        Self {
            pattern: if case_sensitive {
                pattern.to_string()
            } else {
                pattern.to_lowercase()
            },
            case_sensitive,
        }
    }
}

impl LineFilter for SubstringFilter {
    fn matches(&self, line: &LogLine) -> bool {
        if self.case_sensitive {
            line.content.contains(&self.pattern)
        } else {
            line.content.to_lowercase().contains(&self.pattern)
        }
    }
}
