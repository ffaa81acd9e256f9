use std::fmt::Display;
use std::path::Path;

/// Render a filesystem path for human consumption, quoted with shell
/// rules when it contains whitespace or other special characters.
///
/// Non UTF-8 paths fall back to the `Debug` representation.
#[derive(Debug)]
pub struct PathQuotedDisplay<'a> {
    path: &'a Path,
}

impl<'a> PathQuotedDisplay<'a> {
    /// Wrap a path for display.
    pub fn new<P: AsRef<Path> + ?Sized>(path: &'a P) -> Self {
        Self {
            path: path.as_ref(),
        }
    }
}

impl Display for PathQuotedDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(s) = self.path.to_str() {
            if let Ok(quoted) = shlex::try_quote(s) {
                return f.write_str(&quoted);
            }
        }
        write!(f, "{:?}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_display() {
        for (input, expected) in [
            ("/boot/grub", "/boot/grub"),
            ("/media/My Movies/live.iso", "'/media/My Movies/live.iso'"),
            ("", "''"),
        ] {
            let quoted = PathQuotedDisplay::new(input).to_string();
            similar_asserts::assert_eq!(quoted, expected);
        }
    }
}
