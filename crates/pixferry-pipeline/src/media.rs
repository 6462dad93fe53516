//! Media type classification by extension.

use std::path::Path;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tiff"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v", "3gp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Video,
    Other,
}

impl MediaType {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Video
        } else {
            MediaType::Other
        }
    }

    /// Whether the ingest scanners should pick this file up at all.
    pub fn is_media(path: &Path) -> bool {
        !matches!(Self::from_path(path), MediaType::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_classification() {
        assert_eq!(MediaType::from_path(&PathBuf::from("a.JPG")), MediaType::Image);
        assert_eq!(MediaType::from_path(&PathBuf::from("b.mov")), MediaType::Video);
        assert_eq!(MediaType::from_path(&PathBuf::from("c.txt")), MediaType::Other);
        assert_eq!(MediaType::from_path(&PathBuf::from("noext")), MediaType::Other);
        assert!(MediaType::is_media(&PathBuf::from("x.heic")));
        assert!(!MediaType::is_media(&PathBuf::from("x.pdf")));
    }
}
