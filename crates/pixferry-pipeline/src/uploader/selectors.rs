//! Upload-control selector candidates.
//!
//! The ordered list ships bundled with the binary; operators can override it
//! by dropping an `upload_selectors.json` next to the session file. The
//! config-level selector override, when set, is always tried before any of
//! these.

use std::path::Path;

use serde::Deserialize;

const BUNDLED: &str = include_str!("upload_selectors.json");
const OVERRIDE_FILENAME: &str = "upload_selectors.json";

#[derive(Debug, Deserialize)]
struct SelectorFile {
    #[serde(rename = "uploadButtonSelectors")]
    upload_button_selectors: Vec<String>,
}

/// The ordered candidate list: the operator's file when present and
/// parseable, the bundled list otherwise.
pub fn candidate_selectors(session_file: &Path) -> Vec<String> {
    if let Some(dir) = session_file.parent() {
        let override_path = dir.join(OVERRIDE_FILENAME);
        if let Ok(raw) = std::fs::read_to_string(&override_path) {
            match serde_json::from_str::<SelectorFile>(&raw) {
                Ok(parsed) => {
                    tracing::info!(
                        path = %override_path.display(),
                        count = parsed.upload_button_selectors.len(),
                        "using operator selector list"
                    );
                    return parsed.upload_button_selectors;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %override_path.display(),
                        error = %e,
                        "ignoring malformed selector file"
                    );
                }
            }
        }
    }
    bundled_selectors()
}

pub fn bundled_selectors() -> Vec<String> {
    serde_json::from_str::<SelectorFile>(BUNDLED)
        .map(|f| f.upload_button_selectors)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_list_parses_and_is_ordered() {
        let selectors = bundled_selectors();
        assert!(!selectors.is_empty());
        assert_eq!(selectors[0], "input[type='file']");
    }

    #[test]
    fn test_operator_file_overrides_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("session.json");
        std::fs::write(
            dir.path().join(OVERRIDE_FILENAME),
            r##"{"uploadButtonSelectors": ["#only-this"]}"##,
        )
        .unwrap();

        assert_eq!(candidate_selectors(&session), vec!["#only-this"]);
    }

    #[test]
    fn test_malformed_operator_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("session.json");
        std::fs::write(dir.path().join(OVERRIDE_FILENAME), "not json").unwrap();

        assert_eq!(candidate_selectors(&session), bundled_selectors());
    }
}
