use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Cpp,
    Java,
    Python,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Cpp,
        Language::Java,
        Language::Python,
        Language::JavaScript,
    ];

    /// Name used on the wire
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpp => "cpp",
            Self::Java => "java",
            Self::Python => "python",
            Self::JavaScript => "javascript",
        }
    }

    /// Fixed file the submitted source is written to
    pub fn source_file(self) -> &'static str {
        match self {
            Self::Cpp => "main.cpp",
            // javac requires the public class and file name to match
            Self::Java => "Main.java",
            Self::Python => "main.py",
            Self::JavaScript => "main.js",
        }
    }

    pub fn is_compiled(self) -> bool {
        matches!(self, Self::Cpp | Self::Java)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|language| language.name() == s)
            .ok_or_else(|| anyhow!("Unsupported language: {s}"))
    }
}
