//! Structural validation of metadata chunk payloads.
//!
//! Validation is shallow and never fatal: the payloads stay opaque byte
//! slices and anomalies are reported alongside them, leaving policy to the
//! caller.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

/// A chunk the decoder does not recognize, preserved in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChunk {
    /// The chunk's fourcc tag.
    pub fourcc: [u8; 4],
    /// The raw chunk payload.
    pub data: Vec<u8>,
}

/// A structural anomaly in a metadata chunk payload.
///
/// These never abort a decode; they are surfaced by
/// [`WebPDecoder::validate_metadata`](crate::WebPDecoder::validate_metadata).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MetadataIssue {
    /// ICC profiles carry a fixed 128-byte header.
    #[error("ICC payload too short: {0} bytes")]
    IccTooShort(usize),

    /// The profile signature at offset 36 was not `acsp`.
    #[error("ICC profile signature missing")]
    IccSignatureMissing,

    /// The profile's declared size disagrees with the chunk payload.
    #[error("ICC declared size {declared} != payload size {actual}")]
    IccSizeMismatch {
        /// Size from the profile header.
        declared: u32,
        /// Actual payload length.
        actual: usize,
    },

    /// EXIF payloads start with an 8-byte TIFF header.
    #[error("EXIF payload too short: {0} bytes")]
    ExifTooShort(usize),

    /// The TIFF byte-order mark was neither `II` nor `MM`.
    #[error("EXIF byte order invalid: {0:x?}")]
    ExifByteOrderInvalid([u8; 2]),

    /// The 16-bit TIFF magic was not 42.
    #[error("EXIF magic invalid: {0}")]
    ExifMagicInvalid(u16),

    /// XMP payloads must not be empty.
    #[error("XMP payload is empty")]
    XmpEmpty,

    /// XMP must decode as UTF-8.
    #[error("XMP payload is not valid UTF-8")]
    XmpNotUtf8,

    /// The `<?xpacket` processing instruction was missing.
    #[error("XMP xpacket wrapper missing")]
    XmpPacketMissing,

    /// The `x:xmpmeta` element was missing.
    #[error("XMP x:xmpmeta element missing")]
    XmpMetaElementMissing,
}

pub(crate) fn validate_icc(data: &[u8], issues: &mut Vec<MetadataIssue>) {
    if data.len() < 128 {
        issues.push(MetadataIssue::IccTooShort(data.len()));
        return;
    }
    if &data[36..40] != b"acsp" {
        issues.push(MetadataIssue::IccSignatureMissing);
    }
    let declared = BigEndian::read_u32(&data[0..4]);
    if declared as usize != data.len() {
        issues.push(MetadataIssue::IccSizeMismatch {
            declared,
            actual: data.len(),
        });
    }
}

pub(crate) fn validate_exif(data: &[u8], issues: &mut Vec<MetadataIssue>) {
    if data.len() < 8 {
        issues.push(MetadataIssue::ExifTooShort(data.len()));
        return;
    }
    let magic = match &data[0..2] {
        b"II" => LittleEndian::read_u16(&data[2..4]),
        b"MM" => BigEndian::read_u16(&data[2..4]),
        other => {
            issues.push(MetadataIssue::ExifByteOrderInvalid([other[0], other[1]]));
            return;
        }
    };
    if magic != 42 {
        issues.push(MetadataIssue::ExifMagicInvalid(magic));
    }
}

pub(crate) fn validate_xmp(data: &[u8], issues: &mut Vec<MetadataIssue>) {
    if data.is_empty() {
        issues.push(MetadataIssue::XmpEmpty);
        return;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        issues.push(MetadataIssue::XmpNotUtf8);
        return;
    };
    if !text.contains("<?xpacket") {
        issues.push(MetadataIssue::XmpPacketMissing);
    }
    if !text.contains("x:xmpmeta") {
        issues.push(MetadataIssue::XmpMetaElementMissing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icc_payload(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        BigEndian::write_u32(&mut data[0..4], len as u32);
        data[36..40].copy_from_slice(b"acsp");
        data
    }

    #[test]
    fn well_formed_icc_has_no_issues() {
        let mut issues = Vec::new();
        validate_icc(&icc_payload(128), &mut issues);
        assert!(issues.is_empty());
    }

    #[test]
    fn short_icc_reports_only_the_length() {
        let mut issues = Vec::new();
        validate_icc(&[0; 40], &mut issues);
        assert_eq!(issues, vec![MetadataIssue::IccTooShort(40)]);
    }

    #[test]
    fn icc_size_field_must_match_payload() {
        let mut data = icc_payload(130);
        BigEndian::write_u32(&mut data[0..4], 200);
        let mut issues = Vec::new();
        validate_icc(&data, &mut issues);
        assert_eq!(
            issues,
            vec![MetadataIssue::IccSizeMismatch {
                declared: 200,
                actual: 130
            }]
        );
    }

    #[test]
    fn exif_accepts_both_byte_orders() {
        let mut issues = Vec::new();
        validate_exif(b"II\x2a\x00\x08\x00\x00\x00", &mut issues);
        validate_exif(b"MM\x00\x2a\x00\x00\x00\x08", &mut issues);
        assert!(issues.is_empty());
    }

    #[test]
    fn exif_rejects_wrong_magic_per_byte_order() {
        let mut issues = Vec::new();
        validate_exif(b"MM\x2a\x00\x00\x00\x00\x08", &mut issues);
        assert_eq!(issues, vec![MetadataIssue::ExifMagicInvalid(0x2a00)]);
    }

    #[test]
    fn xmp_needs_packet_and_meta_element() {
        let mut issues = Vec::new();
        validate_xmp(b"<?xpacket begin=\"\"?><x:xmpmeta/>", &mut issues);
        assert!(issues.is_empty());

        validate_xmp(b"<x:xmpmeta/>", &mut issues);
        assert_eq!(issues, vec![MetadataIssue::XmpPacketMissing]);
    }

    #[test]
    fn xmp_rejects_invalid_utf8() {
        let mut issues = Vec::new();
        validate_xmp(&[0xff, 0xfe, 0x00], &mut issues);
        assert_eq!(issues, vec![MetadataIssue::XmpNotUtf8]);
    }
}
