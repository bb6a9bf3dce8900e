use crate::boxes::generic::BoxHeader;
use crate::{format_fourcc, BoxError, FourCc, Result};

/// File Type Box (`ftyp`) or Segment Type Box (`styp`). Carries the major
/// brand plus the compatible-brand list used to decide whether a file is
/// something we can play at all.
#[derive(Clone)]
pub struct FtypBox {
    pub major_brand: FourCc,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCc>,
}

/// Brands accepted by the player: the OMAF brands plus the generic ISOBMFF
/// family.
const SUPPORTED_BRANDS: &[&FourCc] = &[
    b"hevi", b"hevd", b"isom", b"iso2", b"iso3", b"iso4", b"iso5", b"iso6", b"iso7", b"iso8",
    b"iso9", b"mp41", b"mp42", b"dash", b"avc1",
];

impl FtypBox {
    pub fn read_box(data: &[u8]) -> Result<(Self, usize)> {
        let header = BoxHeader::read(data)?;
        if &header.box_type != b"ftyp" && &header.box_type != b"styp" {
            return Err(BoxError::Malformed(
                "ftyp",
                format!("unexpected type {}", format_fourcc(&header.box_type)),
            ));
        }
        let payload = header.payload(data);
        if payload.len() < 8 {
            return Err(BoxError::Truncated("ftyp"));
        }
        let major_brand: FourCc = payload[0..4].try_into().unwrap();
        let minor_version = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        let mut compatible_brands = Vec::new();
        let mut offset = 8;
        while offset + 4 <= payload.len() {
            compatible_brands.push(payload[offset..offset + 4].try_into().unwrap());
            offset += 4;
        }
        Ok((
            FtypBox {
                major_brand,
                minor_version,
                compatible_brands,
            },
            header.total_size,
        ))
    }

    /// True when the major brand or any compatible brand is one the player
    /// handles.
    pub fn is_supported(&self) -> bool {
        SUPPORTED_BRANDS.iter().any(|b| **b == self.major_brand)
            || self
                .compatible_brands
                .iter()
                .any(|c| SUPPORTED_BRANDS.iter().any(|b| *b == c))
    }

    /// True when the file declares one of the OMAF viewport-dependent
    /// brands.
    pub fn is_omaf(&self) -> bool {
        self.major_brand == *b"hevi"
            || self.major_brand == *b"hevd"
            || self
                .compatible_brands
                .iter()
                .any(|c| c == b"hevi" || c == b"hevd")
    }
}

impl std::fmt::Debug for FtypBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtypBox")
            .field("major_brand", &format_fourcc(&self.major_brand))
            .field("minor_version", &self.minor_version)
            .field(
                "compatible_brands",
                &self
                    .compatible_brands
                    .iter()
                    .map(format_fourcc)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftyp(major: &[u8; 4], compat: &[&[u8; 4]]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(major);
        payload.extend_from_slice(&0u32.to_be_bytes());
        for c in compat {
            payload.extend_from_slice(*c);
        }
        let mut out = Vec::new();
        out.extend_from_slice(&((payload.len() as u32) + 8).to_be_bytes());
        out.extend_from_slice(b"ftyp");
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn omaf_brand_detected() {
        let data = ftyp(b"hevi", &[b"isom"]);
        let (parsed, _) = FtypBox::read_box(&data).unwrap();
        assert!(parsed.is_supported());
        assert!(parsed.is_omaf());
    }

    #[test]
    fn unknown_brand_rejected() {
        let data = ftyp(b"qt  ", &[]);
        let (parsed, _) = FtypBox::read_box(&data).unwrap();
        assert!(!parsed.is_supported());
    }
}
