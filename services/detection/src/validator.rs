use crate::error::DetectionError;

/// Extensions accepted for upload, compared lower-cased
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Validate an upload by filename only.
///
/// Returns the extension exactly as the client wrote it so staged and
/// published files keep the original spelling (`photo.JPG` -> `<id>.JPG`).
/// The file content is not inspected.
pub fn validate_file_name(file_name: &str) -> Result<&str, DetectionError> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| is_allowed_extension(ext));

    extension.ok_or_else(|| DetectionError::UnsupportedFormat(file_name.to_string()))
}

/// Check an extension against the allow-set
pub fn is_allowed_extension(extension: &str) -> bool {
    let lower = extension.to_lowercase();
    ALLOWED_EXTENSIONS.contains(&lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_allowed_extensions_any_case() {
        for name in [
            "photo.jpg",
            "photo.JPG",
            "photo.Jpeg",
            "frame.png",
            "frame.PNG",
            "archive.tar.jpeg",
            ".png",
        ] {
            assert!(validate_file_name(name).is_ok(), "{} should be accepted", name);
        }
    }

    #[test]
    fn test_returns_original_extension() {
        assert_eq!(validate_file_name("photo.JPG").unwrap(), "JPG");
        assert_eq!(validate_file_name("a.b.png").unwrap(), "png");
    }

    #[test]
    fn test_rejects_unsupported_or_missing_extension() {
        for name in [
            "doc.pdf",
            "photo",
            "",
            "photo.",
            "photo.jpg.exe",
            "photo.gif",
            "jpg",
        ] {
            assert!(
                matches!(
                    validate_file_name(name),
                    Err(DetectionError::UnsupportedFormat(_))
                ),
                "{} should be rejected",
                name
            );
        }
    }
}
