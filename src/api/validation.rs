use std::collections::HashMap;
use std::path::Path;

use axum::extract::Multipart;

use crate::api::errors::ApiError;

#[derive(Debug)]
pub(crate) struct UploadedFile {
    pub(crate) field: String,
    pub(crate) file_name: String,
    pub(crate) content_type: Option<String>,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct MultipartForm {
    pub(crate) fields: HashMap<String, String>,
    pub(crate) files: Vec<UploadedFile>,
}

impl MultipartForm {
    pub(crate) fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str).map(str::trim).filter(|value| !value.is_empty())
    }

    pub(crate) fn flag(&self, name: &str) -> bool {
        self.text(name)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }
}

/// Drains a multipart body. Parts with a file name are files; the total size is capped.
pub(crate) async fn read_multipart(
    multipart: &mut Multipart,
    max_bytes: u64,
) -> Result<MultipartForm, ApiError> {
    let mut form = MultipartForm::default();
    let mut total = 0_u64;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        let Some(file_name) = field.file_name().map(str::to_string) else {
            let text = field
                .text()
                .await
                .map_err(|_| ApiError::BadRequest(format!("Invalid form field '{name}'")))?;
            form.fields.insert(name, text);
            continue;
        };

        let content_type = field.content_type().map(str::to_string);
        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|_| ApiError::BadRequest("Failed to read file".to_string()))?
        {
            total += chunk.len() as u64;
            if total > max_bytes {
                return Err(ApiError::PayloadTooLarge(format!(
                    "Upload exceeds {}MB limit",
                    max_bytes / (1024 * 1024)
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        form.files.push(UploadedFile { field: name, file_name, content_type, bytes });
    }

    Ok(form)
}

pub(crate) fn validate_image_upload(
    file: &UploadedFile,
    allowed_extensions: &[String],
) -> Result<(), ApiError> {
    let extension = extension_of(&file.file_name)
        .ok_or_else(|| ApiError::BadRequest(format!("File '{}' has no extension", file.file_name)))?;

    if !allowed_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&extension)) {
        return Err(ApiError::BadRequest(format!("File extension '{extension}' is not allowed")));
    }
    if file.bytes.is_empty() {
        return Err(ApiError::BadRequest(format!("File '{}' is empty", file.file_name)));
    }

    let mime = file.content_type.as_deref().unwrap_or("").trim().to_ascii_lowercase();
    if mime.is_empty() || mime == "application/octet-stream" || mime_allowed_for_extension(&mime, &extension) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "MIME type '{mime}' does not match extension '.{extension}'"
        )))
    }
}

pub(crate) fn validate_archive_upload(file: &UploadedFile) -> Result<(), ApiError> {
    match extension_of(&file.file_name).as_deref() {
        Some("zip") if !file.bytes.is_empty() => Ok(()),
        Some("zip") => Err(ApiError::BadRequest("Archive is empty".to_string())),
        _ => Err(ApiError::BadRequest("Batch upload must be a .zip archive".to_string())),
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn mime_allowed_for_extension(mime: &str, extension: &str) -> bool {
    match extension {
        "jpg" | "jpeg" => matches!(mime, "image/jpeg" | "image/jpg"),
        "png" => mime == "image/png",
        "gif" => mime == "image/gif",
        "bmp" => matches!(mime, "image/bmp" | "image/x-ms-bmp"),
        "tif" | "tiff" => mime == "image/tiff",
        "webp" => mime == "image/webp",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, content_type: Option<&str>) -> UploadedFile {
        UploadedFile {
            field: "pages".to_string(),
            file_name: name.to_string(),
            content_type: content_type.map(str::to_string),
            bytes: vec![1, 2, 3],
        }
    }

    fn allowed() -> Vec<String> {
        vec!["jpg".to_string(), "png".to_string()]
    }

    #[test]
    fn image_upload_rules() {
        assert!(validate_image_upload(&file("p1.JPG", Some("image/jpeg")), &allowed()).is_ok());
        assert!(validate_image_upload(&file("p1.png", None), &allowed()).is_ok());
        assert!(validate_image_upload(&file("p1.png", Some("image/jpeg")), &allowed()).is_err());
        assert!(validate_image_upload(&file("notes.txt", None), &allowed()).is_err());
        assert!(validate_image_upload(&file("noext", None), &allowed()).is_err());
    }

    #[test]
    fn archive_upload_rules() {
        assert!(validate_archive_upload(&file("class.zip", None)).is_ok());
        assert!(validate_archive_upload(&file("class.tar", None)).is_err());
    }
}
