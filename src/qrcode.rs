use crate::errors::Error;
use image::png::PNGEncoder;
use image::{Luma, Pixel};
use qrcode::{EcLevel, QrCode};

pub fn as_png(s: &str) -> Result<Vec<u8>, Error> {
    let qrcode =
        QrCode::with_error_correction_level(s, EcLevel::M).map_err(|e| Error::General(s!(e)))?;
    let png = qrcode.render::<Luma<u8>>().module_dimensions(4, 4).build();
    let mut buf: Vec<u8> = Vec::new();
    PNGEncoder::new(&mut buf)
        .encode(&png, png.width(), png.height(), Luma::<u8>::color_type())
        .map_err(|e| Error::General(format!("Cannot write PNG file: {}", e)))?;
    Ok(buf)
}

/// Inline `data:` URL for the deposit-address QR on the order page. An
/// empty string on failure just drops the image from the page.
pub fn as_data_url(s: &str) -> String {
    match as_png(s) {
        Ok(png) => format!("data:image/png;base64,{}", base64::encode(&png)),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_png_data_url() {
        let url = as_data_url("bc1qexampledepositaddress");
        assert!(url.starts_with("data:image/png;base64,"));
        let png = base64::decode(&url["data:image/png;base64,".len()..]).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
}
