//! Format-aware text extraction for repository objects.
//!
//! The reindex pass picks a [`ContentClass`] for every object (from its path
//! and, for unknown extensions, from its leading bytes) and hands the raw
//! bytes here. Each extractor applies its own size policy and returns plain
//! UTF-8 text or a typed [`ExtractError`]; extraction never panics.

use std::path::Path;

use lopdf::content::Content;
use lopdf::{Document, Object};
use thiserror::Error;

use crate::models::ExtractedContent;

/// Header length of a fixed-header binary (NEV) file.
pub const FIXED_HEADER_LEN: usize = 332;
/// Byte range of the free-text comment inside the fixed header.
const FIXED_HEADER_COMMENT: std::ops::Range<usize> = 76..FIXED_HEADER_LEN;
/// Number of leading bytes inspected when sniffing for binary content.
const SNIFF_LEN: usize = 8000;
/// `TJ` offsets (thousandths of a text unit) wider than this are treated as word gaps.
const TJ_SPACE_THRESHOLD: f64 = 200.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("content size {size} exceeds limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64 },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("PDF document is encrypted")]
    EncryptedDocument,

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("truncated header: need {FIXED_HEADER_LEN} bytes, got {len}")]
    TruncatedHeader { len: usize },
}

impl ExtractError {
    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::SizeLimitExceeded { .. } => "size_limit_exceeded",
            ExtractError::UnsupportedFormat(_) => "unsupported_format",
            ExtractError::EncryptedDocument => "encrypted_document",
            ExtractError::MalformedDocument(_) => "malformed_document",
            ExtractError::TruncatedHeader { .. } => "truncated_header",
        }
    }
}

/// Size limits in bytes, configured independently per format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub text: u64,
    pub pdf: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    PlainText,
    PdfDocument,
    FixedHeaderBinary,
    Unsupported,
}

impl ContentClass {
    /// Classification decided by the file extension alone. `None` means the
    /// leading bytes have to be inspected with [`ContentClass::sniff`].
    pub fn from_path(path: &str) -> Option<ContentClass> {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())?;
        match ext.as_str() {
            "pdf" => Some(ContentClass::PdfDocument),
            "nev" => Some(ContentClass::FixedHeaderBinary),
            _ => None,
        }
    }

    /// Text unless a NUL byte appears in the leading bytes.
    pub fn sniff(bytes: &[u8]) -> ContentClass {
        let head = &bytes[..bytes.len().min(SNIFF_LEN)];
        if head.contains(&0) {
            ContentClass::Unsupported
        } else {
            ContentClass::PlainText
        }
    }

    /// Limit applied before any content of this class is read.
    pub fn read_limit(&self, limits: &SizeLimits) -> u64 {
        match self {
            ContentClass::PdfDocument => limits.pdf,
            ContentClass::FixedHeaderBinary => FIXED_HEADER_LEN as u64,
            ContentClass::PlainText | ContentClass::Unsupported => limits.text,
        }
    }
}

/// Runs the extractor for `class` and folds the outcome into an [`ExtractedContent`].
pub fn extract(class: ContentClass, bytes: &[u8], limits: &SizeLimits) -> ExtractedContent {
    let result = match class {
        ContentClass::PlainText => extract_plain_text(bytes, limits.text),
        ContentClass::PdfDocument => extract_pdf_text(bytes, limits.pdf),
        ContentClass::FixedHeaderBinary => extract_fixed_header_comment(bytes),
        ContentClass::Unsupported => Err(ExtractError::UnsupportedFormat(
            "binary content".to_string(),
        )),
    };
    match result {
        Ok(text) => ExtractedContent::ok(text),
        Err(e) => ExtractedContent::from_error(&e),
    }
}

fn check_size(len: usize, limit: u64) -> Result<(), ExtractError> {
    let size = len as u64;
    if size > limit {
        return Err(ExtractError::SizeLimitExceeded { size, limit });
    }
    Ok(())
}

pub fn extract_plain_text(bytes: &[u8], size_limit: u64) -> Result<String, ExtractError> {
    check_size(bytes.len(), size_limit)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Extracts the text of every page, in document order.
///
/// Each page's content streams are concatenated in their listed order before
/// the text-showing operators are collected. Encrypted documents are refused
/// before the parser gets a chance to decrypt them.
pub fn extract_pdf_text(bytes: &[u8], size_limit: u64) -> Result<String, ExtractError> {
    check_size(bytes.len(), size_limit)?;
    if declares_encryption(bytes) {
        return Err(ExtractError::EncryptedDocument);
    }

    let doc =
        Document::load_mem(bytes).map_err(|e| ExtractError::MalformedDocument(e.to_string()))?;
    if doc.is_encrypted() {
        return Err(ExtractError::EncryptedDocument);
    }

    let mut pages_text = Vec::new();
    for (page_num, page_id) in doc.get_pages() {
        let stream = doc.get_page_content(page_id).map_err(|e| {
            ExtractError::MalformedDocument(format!("page {}: {}", page_num, e))
        })?;
        let text = content_stream_text(&stream)?;
        if !text.is_empty() {
            pages_text.push(text);
        }
    }

    if pages_text.is_empty() {
        return Err(ExtractError::MalformedDocument(
            "no text could be extracted from any page".to_string(),
        ));
    }
    Ok(pages_text.join("\n"))
}

/// Looks for an `/Encrypt` entry in a trailer or cross-reference stream.
fn declares_encryption(bytes: &[u8]) -> bool {
    const KEY: &[u8] = b"/Encrypt";
    bytes.windows(KEY.len()).enumerate().any(|(i, w)| {
        w == KEY
            && bytes
                .get(i + KEY.len())
                .map_or(true, |b| b.is_ascii_whitespace() || b"/<[(0123456789".contains(b))
    })
}

fn content_stream_text(stream: &[u8]) -> Result<String, ExtractError> {
    let content =
        Content::decode(stream).map_err(|e| ExtractError::MalformedDocument(e.to_string()))?;

    let mut out = String::new();
    for op in &content.operations {
        match op.operator.as_str() {
            "Tj" => {
                if let Some(Object::String(s, _)) = op.operands.first() {
                    out.push_str(&decode_pdf_string(s));
                }
            }
            "'" | "\"" => {
                line_break(&mut out);
                if let Some(Object::String(s, _)) = op.operands.last() {
                    out.push_str(&decode_pdf_string(s));
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    for item in items {
                        match item {
                            Object::String(s, _) => out.push_str(&decode_pdf_string(s)),
                            Object::Integer(n) if -(*n as f64) > TJ_SPACE_THRESHOLD => {
                                out.push(' ')
                            }
                            Object::Real(n) if -(*n as f64) > TJ_SPACE_THRESHOLD => out.push(' '),
                            _ => {}
                        }
                    }
                }
            }
            "Td" | "TD" | "T*" | "ET" => line_break(&mut out),
            _ => {}
        }
    }
    Ok(out.trim().to_string())
}

fn line_break(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

/// UTF-16BE when the string carries a byte-order mark, Latin-1 otherwise.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

/// Reads the comment field of a fixed-length binary header.
pub fn extract_fixed_header_comment(bytes: &[u8]) -> Result<String, ExtractError> {
    let comment = bytes
        .get(FIXED_HEADER_COMMENT)
        .ok_or(ExtractError::TruncatedHeader { len: bytes.len() })?;
    let comment = String::from_utf8_lossy(comment);
    Ok(comment.trim_end_matches('\0').trim_end().to_string())
}
