use std::path::{Path, PathBuf};

use crate::core::errors::{ExtractionError, PersistenceError};

/// One scanned page ready to be sent to the OCR capability.
#[derive(Debug, Clone)]
pub(crate) struct PageImage {
    pub(crate) label: String,
    pub(crate) bytes: Vec<u8>,
}

impl PageImage {
    pub(crate) fn mime_type(&self) -> &'static str {
        let extension = Path::new(&self.label)
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase());
        match extension.as_deref() {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            Some("bmp") => "image/bmp",
            Some("tiff") => "image/tiff",
            _ => "image/jpeg",
        }
    }
}

/// Local directory holding uploaded page images, referenced by path.
#[derive(Debug, Clone)]
pub(crate) struct PageStore {
    root: PathBuf,
}

impl PageStore {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Writes one page under `<root>/<scope>/<student>/` and returns its stored path.
    ///
    /// The page index prefix keeps lexical order equal to page order.
    pub(crate) async fn save_page(
        &self,
        scope: &str,
        student_id: &str,
        index: usize,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, PersistenceError> {
        let dir = self.root.join(sanitize_component(scope)).join(sanitize_component(student_id));
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{index:03}_{}", sanitize_component(file_name)));
        tokio::fs::write(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    pub(crate) async fn load_page(&self, path: &str) -> Result<PageImage, ExtractionError> {
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            ExtractionError::PageUnreadable { page: path.to_string(), reason: err.to_string() }
        })?;
        if bytes.is_empty() {
            return Err(ExtractionError::PageUnreadable {
                page: path.to_string(),
                reason: "file is empty".to_string(),
            });
        }
        Ok(PageImage { label: path.to_string(), bytes })
    }
}

pub(crate) fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') { ch } else { '_' })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_component_blocks_traversal() {
        assert_eq!(sanitize_component("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_component("S-001"), "S-001");
        assert_eq!(sanitize_component(".."), "_");
    }

    #[test]
    fn mime_type_follows_extension() {
        let page = PageImage { label: "scan.PNG".to_string(), bytes: vec![1] };
        assert_eq!(page.mime_type(), "image/png");
        let page = PageImage { label: "scan".to_string(), bytes: vec![1] };
        assert_eq!(page.mime_type(), "image/jpeg");
    }

    #[tokio::test]
    async fn save_then_load_page() {
        let root = std::env::temp_dir().join(format!("grader-pages-{}", uuid::Uuid::new_v4()));
        let store = PageStore::new(&root);
        let path = store.save_page("batch", "S1", 2, "page.jpg", b"jpeg").await.expect("save");
        assert!(path.ends_with("002_page.jpg"));

        let page = store.load_page(&path).await.expect("load");
        assert_eq!(page.bytes, b"jpeg");

        let missing = store.load_page(&format!("{path}.missing")).await;
        assert!(matches!(missing, Err(ExtractionError::PageUnreadable { .. })));
        let _ = tokio::fs::remove_dir_all(root).await;
    }
}
