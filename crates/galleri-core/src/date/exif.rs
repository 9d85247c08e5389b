use chrono::NaiveDateTime;
use exif::{In, Reader, Tag, Value};
use std::io::Cursor;

/// EXIF tags that record when a photo was taken, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTag {
    DateTimeOriginal,
    DateTimeDigitized,
}

impl CaptureTag {
    pub const ALL: [CaptureTag; 2] = [CaptureTag::DateTimeOriginal, CaptureTag::DateTimeDigitized];

    fn exif_tag(self) -> Tag {
        match self {
            CaptureTag::DateTimeOriginal => Tag::DateTimeOriginal,
            CaptureTag::DateTimeDigitized => Tag::DateTimeDigitized,
        }
    }
}

/// Reads a single tag out of an image container. Parse failures are
/// reported as `None`.
pub trait ExifReader: Send + Sync {
    fn read_tag(&self, bytes: &[u8], tag: CaptureTag) -> Option<String>;
}

/// `ExifReader` backed by kamadak-exif.
#[derive(Debug, Clone, Copy, Default)]
pub struct KamadakExif;

impl ExifReader for KamadakExif {
    fn read_tag(&self, bytes: &[u8], tag: CaptureTag) -> Option<String> {
        let exif = Reader::new().read_from_container(&mut Cursor::new(bytes)).ok()?;
        let field = exif.get_field(tag.exif_tag(), In::PRIMARY)?;
        match &field.value {
            Value::Ascii(parts) => parts
                .first()
                .map(|raw| String::from_utf8_lossy(raw).trim_end_matches('\0').to_string()),
            _ => Some(field.display_value().to_string()),
        }
    }
}

/// First capture tag that parses as a timestamp.
/// EXIF datetimes have no timezone info - they are local time as-is.
pub fn extract_capture_time(reader: &dyn ExifReader, bytes: &[u8]) -> Option<NaiveDateTime> {
    CaptureTag::ALL
        .iter()
        .filter_map(|tag| reader.read_tag(bytes, *tag))
        .find_map(|raw| parse_exif_datetime(&raw))
}

pub fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    let cleaned = s
        .trim()
        .replace('-', ":")
        .replace('/', ":")
        .replace('\\', ":")
        .replace('.', ":");

    if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, "%Y:%m:%d %H:%M:%S") {
        return Some(dt);
    }

    if let Ok(d) = chrono::NaiveDate::parse_from_str(cleaned.split(' ').next()?, "%Y:%m:%d") {
        return d.and_hms_opt(0, 0, 0);
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal JPEG carrying one EXIF DateTimeOriginal field.
    pub(crate) fn jpeg_with_capture_time(datetime: &str) -> Vec<u8> {
        assert_eq!(datetime.len(), 19);
        let mut tiff: Vec<u8> = Vec::new();
        // Header: little endian, IFD0 at offset 8
        tiff.extend_from_slice(b"II\x2a\x00\x08\x00\x00\x00");
        // IFD0: one entry pointing at the Exif IFD (offset 26)
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend_from_slice(&0x8769u16.to_le_bytes());
        tiff.extend_from_slice(&4u16.to_le_bytes());
        tiff.extend_from_slice(&1u32.to_le_bytes());
        tiff.extend_from_slice(&26u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());
        // Exif IFD: DateTimeOriginal, ASCII, 20 bytes at offset 44
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend_from_slice(&0x9003u16.to_le_bytes());
        tiff.extend_from_slice(&2u16.to_le_bytes());
        tiff.extend_from_slice(&20u32.to_le_bytes());
        tiff.extend_from_slice(&44u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());
        tiff.extend_from_slice(datetime.as_bytes());
        tiff.push(0);

        let mut app1 = b"Exif\0\0".to_vec();
        app1.extend_from_slice(&tiff);

        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE1];
        jpeg.extend_from_slice(&((app1.len() + 2) as u16).to_be_bytes());
        jpeg.extend_from_slice(&app1);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn test_parse_exif_datetime() {
        let dt = parse_exif_datetime("2021:07:14 09:30:00").unwrap();
        assert_eq!(dt.to_string(), "2021-07-14 09:30:00");
        assert!(parse_exif_datetime("2021-07-14 09:30:00").is_some());
        assert_eq!(
            parse_exif_datetime("2021:07:14").unwrap().to_string(),
            "2021-07-14 00:00:00"
        );
        assert!(parse_exif_datetime("0000:00:00 00:00:00").is_none());
        assert!(parse_exif_datetime("    ").is_none());
    }

    #[test]
    fn test_kamadak_reads_date_time_original() {
        let jpeg = jpeg_with_capture_time("2021:07:14 09:30:00");
        let raw = KamadakExif.read_tag(&jpeg, CaptureTag::DateTimeOriginal).unwrap();
        assert_eq!(raw, "2021:07:14 09:30:00");
        assert!(KamadakExif.read_tag(&jpeg, CaptureTag::DateTimeDigitized).is_none());

        let dt = extract_capture_time(&KamadakExif, &jpeg).unwrap();
        assert_eq!(dt.to_string(), "2021-07-14 09:30:00");
    }

    #[test]
    fn test_garbage_is_absent() {
        assert!(KamadakExif.read_tag(b"not an image", CaptureTag::DateTimeOriginal).is_none());
        assert!(KamadakExif.read_tag(&[0xFF, 0xD8, 0xFF], CaptureTag::DateTimeOriginal).is_none());
        assert!(extract_capture_time(&KamadakExif, &[]).is_none());
    }
}
