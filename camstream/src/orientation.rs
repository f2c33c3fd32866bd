use exif::experimental::Writer;
use exif::{Field, In, Tag, Value};
use image::{RgbaImage, imageops};
use std::io::Cursor;

const EXIF_HEADER: &[u8] = b"Exif\0\0";
const APP0: u8 = 0xE0;
const APP1: u8 = 0xE1;

/// EXIF Orientation value for a clockwise mount rotation in degrees
pub fn exif_orientation(rotation: u32) -> u16 {
    match rotation % 360 {
        90 => 6,
        180 => 3,
        270 => 8,
        _ => 1,
    }
}

/// Turn native sensor pixels upright for a camera mounted at `rotation`
/// degrees clockwise. Viewers do the same when they honour
/// [`exif_orientation`].
pub fn upright(image: RgbaImage, rotation: u32) -> RgbaImage {
    match rotation % 360 {
        90 => imageops::rotate90(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate270(&image),
        _ => image,
    }
}

/// Inverse of [`upright`]
pub fn native(image: RgbaImage, rotation: u32) -> RgbaImage {
    match rotation % 360 {
        90 => imageops::rotate270(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate90(&image),
        _ => image,
    }
}

/// Insert an EXIF APP1 segment carrying the Orientation tag into a JPEG.
/// It goes right after SOI, or after the JFIF APP0 segment when there is one.
pub fn embed_orientation(jpeg: &[u8], rotation: u32) -> Result<Vec<u8>, exif::Error> {
    if jpeg.len() < 4 || jpeg[..2] != [0xFF, 0xD8] {
        return Err(exif::Error::InvalidFormat("not a JPEG image"));
    }

    let field = Field {
        tag: Tag::Orientation,
        ifd_num: In::PRIMARY,
        value: Value::Short(vec![exif_orientation(rotation)]),
    };
    let mut writer = Writer::new();
    writer.push_field(&field);
    let mut tiff = Cursor::new(Vec::new());
    writer.write(&mut tiff, false)?;
    let tiff = tiff.into_inner();

    let length = u16::try_from(2 + EXIF_HEADER.len() + tiff.len())
        .map_err(|_| exif::Error::TooBig("EXIF segment"))?;

    let mut insert_at = 2;
    if jpeg[2] == 0xFF && jpeg[3] == APP0 && jpeg.len() >= 6 {
        let app0_len = u16::from_be_bytes([jpeg[4], jpeg[5]]) as usize;
        if 4 + app0_len <= jpeg.len() {
            insert_at = 4 + app0_len;
        }
    }

    let mut out = Vec::with_capacity(jpeg.len() + length as usize + 2);
    out.extend_from_slice(&jpeg[..insert_at]);
    out.extend_from_slice(&[0xFF, APP1]);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);
    out.extend_from_slice(&tiff);
    out.extend_from_slice(&jpeg[insert_at..]);
    Ok(out)
}

/// Orientation tag of an encoded image, if it has one
pub fn read_orientation(data: &[u8]) -> Option<u16> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(data))
        .ok()?;
    let field = exif.get_field(Tag::Orientation, In::PRIMARY)?;
    field.value.get_uint(0).and_then(|v| u16::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::pattern_jpeg;

    #[test]
    fn test_rotation_to_orientation() {
        assert_eq!(exif_orientation(0), 1);
        assert_eq!(exif_orientation(90), 6);
        assert_eq!(exif_orientation(180), 3);
        assert_eq!(exif_orientation(270), 8);
    }

    #[test]
    fn test_embed_and_read_back() {
        let jpeg = pattern_jpeg(64, 32);
        assert_eq!(read_orientation(&jpeg), None);

        let tagged = embed_orientation(&jpeg, 270).unwrap();
        assert_eq!(read_orientation(&tagged), Some(8));

        // Pixels are untouched
        let decoded = image::load_from_memory(&tagged).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
    }

    #[test]
    fn test_upright_and_back() {
        let mut sensor = RgbaImage::new(4, 2);
        sensor.put_pixel(3, 0, image::Rgba([255, 0, 0, 255]));

        for rotation in [0, 90, 180, 270] {
            let shown = upright(sensor.clone(), rotation);
            let expected = if rotation % 180 == 0 { (4, 2) } else { (2, 4) };
            assert_eq!(shown.dimensions(), expected);
            assert_eq!(native(shown, rotation), sensor);
        }

        // Mounted at 270, the sensor's top-right corner is shown top-left
        assert_eq!(upright(sensor, 270).get_pixel(0, 0).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_embed_rejects_non_jpeg() {
        assert!(embed_orientation(b"\x89PNG\r\n", 90).is_err());
    }
}
