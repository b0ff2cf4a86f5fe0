//! PDF→markdown conversion through the external converter service.
//!
//! Before upload, the top and bottom page margins are cropped by the
//! configured point offsets so running headers and footers never reach
//! the tokenizer. Cropping only rewrites each page's `CropBox`; page
//! content streams are untouched.

use lopdf::{Document as PdfDocument, Object, ObjectId};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Errors raised while converting a source file.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to read source file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to crop pdf: {0}")]
    Pdf(String),
    #[error("converter unavailable: {0}")]
    Unavailable(String),
    #[error("malformed converter response: {0}")]
    MalformedResponse(String),
}

/// Client for the markdown converter service.
pub struct PdfConverter {
    http: reqwest::Client,
    url: String,
    crop_top_pt: f32,
    crop_bottom_pt: f32,
}

#[derive(Deserialize)]
struct ConvertResponse {
    document: ConvertedDocument,
}

#[derive(Deserialize)]
struct ConvertedDocument {
    md_content: String,
}

impl PdfConverter {
    pub fn new(url: String, crop_top_pt: f32, crop_bottom_pt: f32) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            crop_top_pt,
            crop_bottom_pt,
        }
    }

    /// Crop headers/footers and submit the file for conversion; returns
    /// the converter's markdown rendering.
    pub async fn convert(&self, path: &Path) -> Result<String, ConvertError> {
        let bytes = tokio::fs::read(path).await?;
        let bytes = if self.crop_top_pt > 0.0 || self.crop_bottom_pt > 0.0 {
            crop_page_boxes(&bytes, self.crop_top_pt, self.crop_bottom_pt)?
        } else {
            bytes
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.pdf".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")
            .map_err(|e| ConvertError::Unavailable(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ConvertError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConvertError::Unavailable(format!(
                "status {status}: {body}"
            )));
        }

        let body: ConvertResponse = response
            .json()
            .await
            .map_err(|e| ConvertError::MalformedResponse(e.to_string()))?;
        Ok(body.document.md_content)
    }
}

/// Rewrite every page's `CropBox`, inset from its `MediaBox` by `top`
/// points at the top edge and `bottom` points at the bottom edge.
fn crop_page_boxes(bytes: &[u8], top: f32, bottom: f32) -> Result<Vec<u8>, ConvertError> {
    let mut doc = PdfDocument::load_mem(bytes).map_err(|e| ConvertError::Pdf(e.to_string()))?;

    let mut crops: Vec<(ObjectId, [f32; 4])> = Vec::new();
    for page_id in doc.get_pages().values() {
        let media = doc
            .get_object(*page_id)
            .ok()
            .and_then(|obj| obj.as_dict().ok())
            .and_then(|dict| dict.get(b"MediaBox").ok())
            .and_then(rect_values)
            // US Letter, the converter's assumption for box-less pages
            .unwrap_or([0.0, 0.0, 612.0, 792.0]);
        crops.push((*page_id, cropped_box(media, top, bottom)));
    }

    for (page_id, rect) in crops {
        let dict = doc
            .get_object_mut(page_id)
            .and_then(Object::as_dict_mut)
            .map_err(|e| ConvertError::Pdf(e.to_string()))?;
        dict.set(
            "CropBox",
            Object::Array(rect.iter().map(|v| Object::Real((*v).into())).collect()),
        );
    }

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| ConvertError::Pdf(e.to_string()))?;
    Ok(out)
}

/// Shrink a media box by the given top and bottom offsets. The result
/// never inverts: offsets larger than the page collapse to a zero-height
/// box at the centre rather than a negative one.
fn cropped_box(media: [f32; 4], top: f32, bottom: f32) -> [f32; 4] {
    let [x0, y0, x1, y1] = media;
    let mut low = y0 + bottom;
    let mut high = y1 - top;
    if low > high {
        let mid = (y0 + y1) / 2.0;
        low = mid;
        high = mid;
    }
    [x0, low, x1, high]
}

fn rect_values(obj: &Object) -> Option<[f32; 4]> {
    let arr = obj.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let mut out = [0.0f32; 4];
    for (i, value) in arr.iter().enumerate() {
        out[i] = match value {
            Object::Integer(n) => *n as f32,
            Object::Real(r) => *r as f32,
            _ => return None,
        };
    }
    Some(out)
}
