//! Transfer parameters and file masks

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::path_utils::unix_extract_file_name;
use crate::session::OperationSide;

/// One glob of a file mask
#[derive(Debug, Clone)]
struct MaskPattern {
    pattern: glob::Pattern,
    /// Pattern ended with `/` and applies to directories only
    directory: bool,
}

impl MaskPattern {
    fn parse(text: &str) -> Result<Self, glob::PatternError> {
        let (text, directory) = match text.strip_suffix('/') {
            Some(stripped) => (stripped, true),
            None => (text, false),
        };
        Ok(Self {
            pattern: glob::Pattern::new(text)?,
            directory,
        })
    }

    fn matches(&self, name: &str) -> bool {
        self.pattern.matches_with(
            name,
            glob::MatchOptions {
                case_sensitive: false,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
        )
    }
}

/// Include/exclude file mask.
///
/// Format: `include1; include2 | exclude1; exclude2`. Masks are separated by `;` or `,`.
/// A mask ending with `/` applies to directories, others apply to files only.
#[derive(Debug, Clone, Default)]
pub struct FileMask {
    text: String,
    includes: Vec<MaskPattern>,
    excludes: Vec<MaskPattern>,
}

impl FileMask {
    pub fn parse(text: &str) -> Result<Self, glob::PatternError> {
        let (include_part, exclude_part) = match text.split_once('|') {
            Some((inc, exc)) => (inc, exc),
            None => (text, ""),
        };
        let split = |part: &str| -> Result<Vec<MaskPattern>, glob::PatternError> {
            part.split([';', ','])
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(MaskPattern::parse)
                .collect()
        };
        Ok(Self {
            text: text.to_string(),
            includes: split(include_part)?,
            excludes: split(exclude_part)?,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    /// Does a file or directory name pass the mask
    pub fn matches(&self, name: &str, is_directory: bool) -> bool {
        let relevant = |p: &&MaskPattern| p.directory == is_directory;
        let mut includes = self.includes.iter().filter(relevant).peekable();
        let included = includes.peek().is_none() || includes.any(|p| p.matches(name));
        included && !self.excludes.iter().filter(relevant).any(|p| p.matches(name))
    }
}

impl Serialize for FileMask {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for FileMask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        FileMask::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Case conversion of target file names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNameCase {
    #[default]
    Preserve,
    Upper,
    Lower,
    /// Lower case only for names that are all upper case
    LowerCaseShort,
}

/// Parameters of a copy (upload/download) operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyParams {
    pub file_mask: FileMask,
    pub file_name_case: FileNameCase,
    /// Keep source modification time on the target
    pub preserve_time: bool,
    /// Set these permission bits on uploaded files
    pub rights: Option<u32>,
    /// Transfer only files newer than the target
    pub newer_only: bool,
    /// Skip overwrite confirmation
    pub no_confirmation: bool,
    /// Compute the total size before transferring
    pub calculate_size: bool,
}

impl Default for CopyParams {
    fn default() -> Self {
        Self {
            file_mask: FileMask::default(),
            file_name_case: FileNameCase::Preserve,
            preserve_time: true,
            rights: None,
            newer_only: false,
            no_confirmation: false,
            calculate_size: false,
        }
    }
}

impl CopyParams {
    pub fn with_mask(mut self, mask: &str) -> Self {
        match FileMask::parse(mask) {
            Ok(mask) => self.file_mask = mask,
            Err(e) => warn!("Ignoring invalid file mask '{}': {}", mask, e),
        }
        self
    }

    /// Should the file at `path` be transferred
    pub fn allow_transfer(&self, path: &str, _side: OperationSide, is_directory: bool) -> bool {
        let normalized = path.replace('\\', "/");
        let name = unix_extract_file_name(normalized.trim_end_matches('/'));
        self.file_mask.matches(&name, is_directory)
    }

    /// Target name of a transferred file
    pub fn change_file_name(&self, name: &str, _side: OperationSide, _first_level: bool) -> String {
        match self.file_name_case {
            FileNameCase::Preserve => name.to_string(),
            FileNameCase::Upper => name.to_uppercase(),
            FileNameCase::Lower => name.to_lowercase(),
            FileNameCase::LowerCaseShort => {
                if name.chars().any(|c| c.is_lowercase()) {
                    name.to_string()
                } else {
                    name.to_lowercase()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mask_matches_everything() {
        let mask = FileMask::default();
        assert!(mask.matches("a.txt", false));
        assert!(mask.matches("dir", true));
    }

    #[test]
    fn test_include_exclude() {
        let mask = FileMask::parse("*.txt; *.md | secret*").unwrap();
        assert!(mask.matches("a.txt", false));
        assert!(mask.matches("README.MD", false));
        assert!(!mask.matches("a.rs", false));
        assert!(!mask.matches("secret.txt", false));
        // file masks do not filter directories
        assert!(mask.matches("src", true));
    }

    #[test]
    fn test_directory_mask() {
        let mask = FileMask::parse("| .git/, target/").unwrap();
        assert!(!mask.matches(".git", true));
        assert!(!mask.matches("target", true));
        assert!(mask.matches("target", false));
        assert!(mask.matches("src", true));
    }

    #[test]
    fn test_allow_transfer_uses_name() {
        let params = CopyParams::default().with_mask("*.txt");
        assert!(params.allow_transfer("/remote/dir/a.txt", OperationSide::Remote, false));
        assert!(!params.allow_transfer("C:\\local\\b.bin", OperationSide::Local, false));
    }

    #[test]
    fn test_change_file_name() {
        let mut params = CopyParams::default();
        assert_eq!(params.change_file_name("ReadMe", OperationSide::Local, true), "ReadMe");
        params.file_name_case = FileNameCase::LowerCaseShort;
        assert_eq!(params.change_file_name("README", OperationSide::Local, true), "readme");
        assert_eq!(params.change_file_name("ReadMe", OperationSide::Local, true), "ReadMe");
    }

    #[test]
    fn test_mask_serde() {
        let params: CopyParams = serde_json::from_str(r#"{"file_mask":"*.txt|b*"}"#).unwrap();
        assert_eq!(params.file_mask.text(), "*.txt|b*");
        assert!(params.preserve_time);
        assert!(serde_json::from_str::<CopyParams>(r#"{"file_mask":"[a"}"#).is_err());
    }
}
