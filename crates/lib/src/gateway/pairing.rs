//! Pairing code rendering for the status page: QR code as SVG, optionally as a data URL.

use anyhow::{anyhow, Result};
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;

const QR_MIN_SIZE: u32 = 500;

/// Render a pairing payload into an SVG QR code.
pub fn render_svg(payload: &str) -> Result<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("pairing payload is empty");
    }
    let qr = QrCode::new(payload.as_bytes())
        .map_err(|e| anyhow!("failed to encode pairing payload as QR: {e}"))?;
    Ok(qr
        .render::<svg::Color>()
        .min_dimensions(QR_MIN_SIZE, QR_MIN_SIZE)
        .quiet_zone(true)
        .build())
}

/// `data:image/svg+xml;base64,...` for embedding in JSON or an `<img>` tag.
pub fn svg_data_url(payload: &str) -> Result<String> {
    let svg = render_svg(payload)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(svg.as_bytes());
    Ok(format!("data:image/svg+xml;base64,{}", encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_payload() {
        assert!(render_svg("   ").is_err());
    }

    #[test]
    fn renders_svg_document() {
        let svg = render_svg("2@abcdef,ghijkl,mnopqr").unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("</svg>"));
    }

    #[test]
    fn data_url_prefix() {
        let url = svg_data_url("2@abcdef").unwrap();
        assert!(url.starts_with("data:image/svg+xml;base64,"));
        assert!(url.len() > "data:image/svg+xml;base64,".len());
    }
}
