use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Language keys served by the fast, cheap translation path.
/// Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct MainstreamLanguages {
    languages: HashSet<String>,
}

#[derive(Deserialize)]
struct LanguageFile {
    languages: Vec<String>,
}

impl MainstreamLanguages {
    /// Parse a `{"languages": [...]}` document.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let file: LanguageFile = serde_json::from_str(raw)?;
        Ok(file.languages.into_iter().collect())
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn contains(&self, language_key: &str) -> bool {
        self.languages.contains(language_key)
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for MainstreamLanguages {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            languages: iter
                .into_iter()
                .map(|l| {
                    let l: String = l.into();
                    l.trim().to_string()
                })
                .filter(|l| !l.is_empty())
                .collect(),
        }
    }
}

/// Split a compound `language-style` key at its first hyphen.
/// Both halves must be non-empty.
pub fn split_style(language_key: &str) -> Option<(&str, &str)> {
    let (language, style) = language_key.split_once('-')?;
    let (language, style) = (language.trim(), style.trim());
    if language.is_empty() || style.is_empty() {
        return None;
    }
    Some((language, style))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_language_file() {
        let langs =
            MainstreamLanguages::from_json_str(r#"{"languages": ["English", "Français", " "]}"#)
                .unwrap();
        assert_eq!(langs.len(), 2);
        assert!(langs.contains("Français"));
        assert!(!langs.contains("Klingon"));
    }

    #[test]
    fn rejects_malformed_file() {
        assert!(MainstreamLanguages::from_json_str(r#"["English"]"#).is_err());
    }

    #[test]
    fn splits_compound_keys() {
        assert_eq!(split_style("English-Shakespeare"), Some(("English", "Shakespeare")));
        assert_eq!(split_style("中文-文言文-古风"), Some(("中文", "文言文-古风")));
        assert_eq!(split_style("English"), None);
        assert_eq!(split_style("-pirate"), None);
        assert_eq!(split_style("English-"), None);
    }
}
