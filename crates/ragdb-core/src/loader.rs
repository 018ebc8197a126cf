use async_trait::async_trait;
use regex::Regex;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::types::{Document, DocumentFormat, Meta};

impl DocumentFormat {
    /// Pick a format from the file extension. Files without an extension
    /// (`Modelfile`, `Makefile`, ...) are read as plain text.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = match path.extension() {
            None => return Ok(Self::Text),
            Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
        };
        match ext.as_str() {
            "txt" | "text" => Ok(Self::Text),
            "md" | "markdown" => Ok(Self::Markdown),
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            other => Err(Error::UnsupportedFormat(format!("{} ({})", other, path.display()))),
        }
    }

    pub fn loader(self) -> &'static dyn DocumentLoader {
        match self {
            Self::Text => &TextLoader,
            Self::Markdown => &MarkdownLoader,
            Self::Pdf => &PdfLoader,
            Self::Docx => &DocxLoader,
        }
    }
}

/// Extracts the text of one file.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String>;
}

pub struct TextLoader;
pub struct MarkdownLoader;
pub struct PdfLoader;
pub struct DocxLoader;

fn read_lossy(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

#[async_trait]
impl DocumentLoader for TextLoader {
    async fn extract(&self, path: &Path) -> Result<String> {
        read_lossy(path)
    }
}

#[async_trait]
impl DocumentLoader for MarkdownLoader {
    async fn extract(&self, path: &Path) -> Result<String> {
        read_lossy(path)
    }
}

#[async_trait]
impl DocumentLoader for PdfLoader {
    async fn extract(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path)?;
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
            .map_err(|e| Error::UnsupportedFormat(format!("pdf extraction failed: {}", e)))
    }
}

#[async_trait]
impl DocumentLoader for DocxLoader {
    async fn extract(&self, path: &Path) -> Result<String> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || docx_text(&path))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

fn docx_text(path: &Path) -> Result<String> {
    let file = fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::UnsupportedFormat(format!("not a docx container: {}", e)))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| Error::UnsupportedFormat(format!("docx without document body: {}", e)))?
        .read_to_string(&mut xml)?;
    xml_to_text(&xml)
}

fn xml_to_text(xml: &str) -> Result<String> {
    let tags = Regex::new(r"<[^>]+>").map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let with_breaks = xml.replace("</w:p>", "\n").replace("<w:tab/>", "\t");
    let stripped = tags.replace_all(&with_breaks, "");
    let text = stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    Ok(text.trim().to_string())
}

/// Document id for `path`: relative to `root` when it lives under it,
/// otherwise the file name.
pub fn document_id(path: &Path, root: Option<&Path>) -> String {
    let rel = root.and_then(|r| path.strip_prefix(r).ok()).filter(|p| !p.as_os_str().is_empty());
    match rel {
        Some(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        None => path
            .file_name()
            .map_or_else(|| path.to_string_lossy().into_owned(), |n| n.to_string_lossy().into_owned()),
    }
}

/// Load one file into a `Document`.
pub async fn load_document(path: &Path, root: Option<&Path>) -> Result<Document> {
    let format = DocumentFormat::from_path(path)?;
    let raw_text = format.loader().extract(path).await?;
    let size = fs::metadata(path)?.len();

    let mut source_metadata = Meta::new();
    source_metadata.insert(
        "file_name".into(),
        path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
    );
    source_metadata.insert("file_path".into(), path.to_string_lossy().into_owned());
    source_metadata.insert(
        "file_type".into(),
        path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default(),
    );
    source_metadata.insert("file_size".into(), size.to_string());
    source_metadata.insert("format".into(), format.to_string());

    tracing::debug!(path = %path.display(), %format, chars = raw_text.chars().count(), "loaded document");
    Ok(Document { id: document_id(path, root), raw_text, source_metadata, format })
}

/// Every supported file under `root`, sorted by path. Hidden files are skipped.
pub fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(walkdir::DirEntry::into_path)
        .filter(|p| DocumentFormat::from_path(p).is_ok())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("a/b.TXT")).unwrap(), DocumentFormat::Text);
        assert_eq!(DocumentFormat::from_path(Path::new("Modelfile")).unwrap(), DocumentFormat::Text);
        assert_eq!(DocumentFormat::from_path(Path::new("x.md")).unwrap(), DocumentFormat::Markdown);
        assert_eq!(DocumentFormat::from_path(Path::new("x.pdf")).unwrap(), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_path(Path::new("x.docx")).unwrap(), DocumentFormat::Docx);
        assert!(matches!(
            DocumentFormat::from_path(Path::new("x.png")),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn xml_paragraphs_become_lines() {
        let xml = "<w:body><w:p><w:r><w:t>Fish &amp; chips</w:t></w:r></w:p><w:p><w:t>Second</w:t></w:p></w:body>";
        assert_eq!(xml_to_text(xml).unwrap(), "Fish & chips\nSecond");
    }

    #[test]
    fn document_ids() {
        let root = Path::new("/data/docs");
        assert_eq!(document_id(Path::new("/data/docs/a/b.txt"), Some(root)), "a/b.txt");
        assert_eq!(document_id(Path::new("/elsewhere/c.md"), Some(root)), "c.md");
        assert_eq!(document_id(Path::new("/elsewhere/c.md"), None), "c.md");
    }
}
