//! Checks applied to operator-supplied images before they reach storage.

use thiserror::Error;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please upload an image")]
    Empty,

    #[error("Please upload an image file")]
    NotAnImage,

    #[error("File size must be less than {limit_mb} MB")]
    TooLarge { limit_mb: usize },

    #[error("Please upload a PNG file only")]
    NotPng,
}

/// Any `image/*` up to `max_bytes`
pub fn validate_image(data: &[u8], content_type: &str, max_bytes: usize) -> Result<(), ValidationError> {
    if data.is_empty() {
        return Err(ValidationError::Empty);
    }
    if !content_type.trim().to_ascii_lowercase().starts_with("image/") {
        return Err(ValidationError::NotAnImage);
    }
    if data.len() > max_bytes {
        return Err(ValidationError::TooLarge {
            limit_mb: max_bytes.div_ceil(1024 * 1024),
        });
    }
    Ok(())
}

/// PNG by declared type and by signature
pub fn validate_png(data: &[u8], content_type: &str, max_bytes: usize) -> Result<(), ValidationError> {
    validate_image(data, content_type, max_bytes)?;

    if !content_type.trim().eq_ignore_ascii_case("image/png") || !data.starts_with(PNG_SIGNATURE) {
        return Err(ValidationError::NotPng);
    }
    Ok(())
}
