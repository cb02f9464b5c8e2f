//! Source location tracking, attached to every execution-tree node.

use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

/// A `{file, first_line, last_line}` triple produced by the parser and carried
/// by every constructed node purely for error annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Rc<PathBuf>,
    pub first_line: u32,
    pub last_line: u32,
}

impl SourceLocation {
    pub fn new(file: Rc<PathBuf>, first_line: u32, last_line: u32) -> Self {
        Self {
            file,
            first_line,
            last_line,
        }
    }

    /// A location for synthetic/builtin nodes that have no script origin.
    pub fn builtin() -> Self {
        Self {
            file: Rc::new(PathBuf::from("<builtin>")),
            first_line: 0,
            last_line: 0,
        }
    }

    pub fn single_line(file: Rc<PathBuf>, line: u32) -> Self {
        Self::new(file, line, line)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first_line == self.last_line {
            write!(f, "{}:{}", self.file.display(), self.first_line)
        } else {
            write!(
                f,
                "{}:{}-{}",
                self.file.display(),
                self.first_line,
                self.last_line
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_location_omits_the_range() {
        let loc = SourceLocation::single_line(Rc::new(PathBuf::from("a.mp")), 7);
        assert_eq!(loc.to_string(), "a.mp:7");
    }

    #[test]
    fn multi_line_location_shows_the_range() {
        let loc = SourceLocation::new(Rc::new(PathBuf::from("a.mp")), 3, 5);
        assert_eq!(loc.to_string(), "a.mp:3-5");
    }
}
