use axum::extract::{FromRequest, Multipart, Request};
use image::ImageFormat;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::error::ApiError;
use crate::inference::InputImage;

pub const IMAGE_FIELD: &str = "image";
pub const MAX_FILE_NAME_CHARS: usize = 255;
pub const ALLOWED_IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/gif"];

static DANGEROUS_FILE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap());
static RESERVED_FILE_NAMES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(CON|PRN|AUX|NUL|COM[1-9]|LPT[1-9])(\.|$)").unwrap());

/// Why an uploaded file was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRejection {
    SuspiciousFileName,
    InvalidUpload(Vec<String>),
    InvalidContent,
}

impl FileRejection {
    fn event(&self) -> &'static str {
        match self {
            FileRejection::SuspiciousFileName => "suspicious_filename",
            FileRejection::InvalidUpload(_) => "invalid_file_upload",
            FileRejection::InvalidContent => "invalid_image_content",
        }
    }

    fn message(&self) -> String {
        match self {
            FileRejection::SuspiciousFileName => "File name contains forbidden characters".into(),
            FileRejection::InvalidUpload(errors) => {
                format!("File validation failed: {}", errors.join(", "))
            }
            FileRejection::InvalidContent => "File content is not a supported image".into(),
        }
    }
}

pub fn is_safe_file_name(name: &str) -> bool {
    !DANGEROUS_FILE_NAME_CHARS.is_match(name)
        && !RESERVED_FILE_NAMES.is_match(name)
        && name.chars().count() <= MAX_FILE_NAME_CHARS
        && !name.contains("..")
}

/// Sniffs the leading bytes; only JPEG, PNG, WEBP and GIF pass.
pub fn is_supported_image_data(data: &[u8], max_bytes: u64) -> bool {
    if data.is_empty() || data.len() as u64 > max_bytes {
        return false;
    }
    matches!(
        image::guess_format(data),
        Ok(ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP | ImageFormat::Gif)
    )
}

/// A file pulled out of a multipart body, not yet validated.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl UploadedFile {
    /// Name, declared type, size and content checks, in that order.
    pub fn validate(self, max_bytes: u64) -> Result<InputImage, FileRejection> {
        if let Some(name) = &self.file_name {
            if !is_safe_file_name(name) {
                return Err(FileRejection::SuspiciousFileName);
            }
        }

        let content_type = self
            .content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();
        let mut errors = Vec::new();
        if self.data.len() as u64 > max_bytes {
            errors.push(format!("file size must not exceed {} bytes", max_bytes));
        }
        if !ALLOWED_IMAGE_TYPES.contains(&content_type.as_str()) {
            errors.push("only JPG, PNG, WEBP and GIF images are supported".to_string());
        }
        if !errors.is_empty() {
            return Err(FileRejection::InvalidUpload(errors));
        }

        if !is_supported_image_data(&self.data, max_bytes) {
            return Err(FileRejection::InvalidContent);
        }

        Ok(InputImage {
            bytes: self.data,
            content_type,
        })
    }
}

/// Reads the single `image` field from a multipart request. Other fields are ignored.
pub async fn extract_multipart_image(request: Request) -> Result<UploadedFile, ApiError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to process multipart request: {}", e)))?;

    let mut upload: Option<UploadedFile> = None;
    let mut ignored_fields = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to process multipart field: {}", e)))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            ignored_fields += 1;
            continue;
        }
        if upload.is_some() {
            return Err(ApiError::BadRequest(
                "Only one 'image' field may be uploaded.".to_string(),
            ));
        }

        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read file data: {}", e)))?
            .to_vec();
        debug!(
            "Received upload {:?} ({:?}, {} bytes)",
            file_name,
            content_type,
            data.len()
        );

        upload = Some(UploadedFile {
            file_name,
            content_type,
            data,
        });
    }

    if ignored_fields > 0 {
        debug!("Ignored {} non-image multipart field(s)", ignored_fields);
    }

    upload.ok_or_else(|| ApiError::BadRequest("No image uploaded".to_string()))
}

/// Extracts and validates the uploaded image, logging refusals as security events.
pub async fn extract_request_image(
    request: Request,
    max_bytes: u64,
    user: &str,
    ip: &str,
) -> Result<InputImage, ApiError> {
    let upload = extract_multipart_image(request).await?;
    let file_name = upload.file_name.clone().unwrap_or_default();
    let size = upload.data.len();

    upload.validate(max_bytes).map_err(|rejection| {
        warn!(
            target: "security",
            event = rejection.event(),
            user = %user,
            ip = %ip,
            filename = %file_name,
            size,
            "Upload rejected"
        );
        ApiError::BadRequest(rejection.message())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    const MAX: u64 = 5 * 1024 * 1024;

    fn upload(name: &str, content_type: &str, data: &[u8]) -> UploadedFile {
        UploadedFile {
            file_name: Some(name.to_string()),
            content_type: Some(content_type.to_string()),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_file_name_rules() {
        assert!(is_safe_file_name("holiday photo.png"));
        assert!(!is_safe_file_name("../etc/passwd"));
        assert!(!is_safe_file_name("a<b>.png"));
        assert!(!is_safe_file_name("dir\\file.png"));
        assert!(!is_safe_file_name("CON.png"));
        assert!(!is_safe_file_name("lpt1"));
        assert!(is_safe_file_name("console.png"));
        assert!(!is_safe_file_name("bad\u{1}.png"));
        assert!(!is_safe_file_name(&"a".repeat(256)));
        assert!(!is_safe_file_name("a..b.png"));
    }

    #[test]
    fn test_magic_bytes() {
        assert!(is_supported_image_data(&PNG_MAGIC, MAX));
        assert!(is_supported_image_data(&[0xFF, 0xD8, 0xFF, 0xE0], MAX));
        assert!(is_supported_image_data(b"GIF89a....", MAX));
        assert!(is_supported_image_data(b"RIFF\x10\0\0\0WEBPVP8 ", MAX));
        assert!(!is_supported_image_data(b"%PDF-1.7", MAX));
        assert!(!is_supported_image_data(&[], MAX));
        assert!(!is_supported_image_data(&PNG_MAGIC, 4));
    }

    #[test]
    fn test_validate_accepts_png() {
        let image = upload("x.png", "image/png", &PNG_MAGIC).validate(MAX).unwrap();
        assert_eq!(image.content_type, "image/png");
        assert_eq!(image.bytes, PNG_MAGIC);
    }

    #[test]
    fn test_validate_order_and_kinds() {
        assert_eq!(
            upload("../x.png", "text/plain", b"nope").validate(MAX).err(),
            Some(FileRejection::SuspiciousFileName)
        );
        assert!(matches!(
            upload("x.txt", "text/plain", &PNG_MAGIC).validate(MAX),
            Err(FileRejection::InvalidUpload(_))
        ));
        assert_eq!(
            upload("x.png", "image/png", b"not really a png").validate(MAX).err(),
            Some(FileRejection::InvalidContent)
        );
    }

    #[test]
    fn test_validate_reports_all_declared_problems() {
        let big = vec![0u8; 16];
        match upload("x.bin", "application/octet-stream", &big).validate(8) {
            Err(FileRejection::InvalidUpload(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
