use std::io::Cursor;

use http::HeaderMap;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;

use crate::{
    config::Config,
    error::{AppError, Result},
};

/// Picks the public origin the sender's phone should reach.
///
/// Order: `FORCE_QR_ORIGIN`, then `FRONTEND_BASE`, then the request's own
/// forwarded or direct host.
pub fn public_origin(config: &Config, headers: &HeaderMap) -> String {
    if let Some(origin) = config.force_qr_origin.as_ref().or(config.frontend_base.as_ref()) {
        return origin.clone();
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let proto = header("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header("x-forwarded-host")
        .or_else(|| header("host"))
        .unwrap_or_else(|| format!("localhost:{}", config.bind_addr.port()));

    format!("{}://{}", proto, host)
}

/// `<origin>/join?sessionId=..&t=..`. Both values are server-issued and URL safe.
pub fn join_url(origin: &str, session_id: &str, sender_token: &str) -> String {
    format!(
        "{}/join?sessionId={}&t={}",
        origin.trim_end_matches('/'),
        session_id,
        sender_token
    )
}

/// Renders `data` as a black-on-white PNG QR code.
pub fn render_png(data: &str) -> Result<Vec<u8>> {
    let code = QrCode::new(data.as_bytes())
        .map_err(|e| AppError::Internal(format!("QR encoding failed: {}", e)))?;

    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(240, 240)
        .quiet_zone(true)
        .build();

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| AppError::Internal(format!("PNG encoding failed: {}", e)))?;

    Ok(png)
}
