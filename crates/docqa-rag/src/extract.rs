//! 文本抽取
//!
//! 入库流水线的第一步:拿到原始字节与媒体类型,产出纯文本。
//! 纯文本/Markdown 直接按 UTF-8 读,PDF 走 pdf-extract,
//! DOCX 解包 `word/document.xml` 后收集 `w:t` 文本节点,
//! 段落结束补换行,便于后续分段器识别段落边界。

use std::io::Read;

use docqa_error::{DocqaError, Result};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// 单个 ZIP 条目解压上限,防 zip 炸弹
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// 根据文件扩展名推断媒体类型,上传时 content-type 缺失的兜底
pub fn media_type_for(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "txt" => Some(MIME_TEXT),
        "md" | "markdown" => Some(MIME_MARKDOWN),
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        _ => None,
    }
}

pub fn is_supported(media_type: &str) -> bool {
    matches!(media_type, MIME_TEXT | MIME_MARKDOWN | MIME_PDF | MIME_DOCX)
}

/// 同步实现,调用方应放进 `spawn_blocking`,PDF 解析可能耗时较长
pub fn extract_text(bytes: &[u8], media_type: &str) -> Result<String> {
    match media_type {
        MIME_TEXT | MIME_MARKDOWN => Ok(String::from_utf8_lossy(bytes).into_owned()),
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        other => Err(DocqaError::Extraction {
            media_type: other.to_string(),
            message: "unsupported media type".to_string(),
        }),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| DocqaError::Extraction {
        media_type: MIME_PDF.to_string(),
        message: e.to_string(),
    })
}

fn docx_err(message: impl ToString) -> DocqaError {
    DocqaError::Extraction {
        media_type: MIME_DOCX.to_string(),
        message: message.to_string(),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| docx_err(e))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| docx_err("word/document.xml not found"))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| docx_err(e))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(docx_err("word/document.xml exceeds size limit"));
    }
    collect_paragraph_text(&doc_xml)
}

/// 收集 `w:t` 文本节点,`w:p` 段落结束处补换行
fn collect_paragraph_text(xml: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !out.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(docx_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let out = extract_text("hello world".as_bytes(), MIME_TEXT).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn markdown_is_treated_as_text() {
        let out = extract_text("# Title\n\nbody".as_bytes(), MIME_MARKDOWN).unwrap();
        assert_eq!(out, "# Title\n\nbody");
    }

    #[test]
    fn unsupported_media_type_is_rejected() {
        let err = extract_text(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, DocqaError::Extraction { .. }));
    }

    #[test]
    fn invalid_pdf_returns_extraction_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, DocqaError::Extraction { .. }));
    }

    #[test]
    fn invalid_zip_returns_extraction_error_for_docx() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, DocqaError::Extraction { .. }));
    }

    #[test]
    fn docx_paragraphs_become_newlines() {
        let xml = br#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
                <w:p><w:r><w:t>Second paragraph.</w:t></w:r></w:p>
              </w:body>
            </w:document>"#;
        let out = collect_paragraph_text(xml).unwrap();
        assert_eq!(out, "First paragraph.\nSecond paragraph.\n");
    }

    #[test]
    fn media_type_inference_from_extension() {
        assert_eq!(media_type_for("notes.TXT"), Some(MIME_TEXT));
        assert_eq!(media_type_for("readme.md"), Some(MIME_MARKDOWN));
        assert_eq!(media_type_for("paper.pdf"), Some(MIME_PDF));
        assert_eq!(media_type_for("report.docx"), Some(MIME_DOCX));
        assert_eq!(media_type_for("archive.bin"), None);
    }
}
