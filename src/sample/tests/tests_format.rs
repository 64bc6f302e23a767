use crate::sample::{CodecError, ImageFormat};

#[test]
fn sniffs_png_magic() {
    let bytes = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0];
    assert_eq!(ImageFormat::sniff(&bytes).unwrap(), ImageFormat::Png);
}

#[test]
fn sniffs_jpeg_magic() {
    let bytes = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0];
    assert_eq!(ImageFormat::sniff(&bytes).unwrap(), ImageFormat::Jpeg);
}

#[test]
fn unrecognised_magic_is_unsupported_format() {
    let bytes = [b'G', b'I', b'F', b'8', b'9', b'a'];
    let err = ImageFormat::sniff(&bytes).unwrap_err();
    assert!(matches!(err, CodecError::UnsupportedFormat(_)));
}

#[test]
fn empty_bytes_is_unsupported_format() {
    let err = ImageFormat::sniff(&[]).unwrap_err();
    assert!(matches!(err, CodecError::UnsupportedFormat(0)));
}

#[test]
fn extensions_match_format() {
    assert_eq!(ImageFormat::Png.extension(), "png");
    assert_eq!(ImageFormat::Jpeg.extension(), "jpeg");
}
