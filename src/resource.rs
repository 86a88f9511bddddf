//! Resource (granule) name handling.
//!
//! ATL03 granule names follow a fixed layout:
//!
//! ```text
//! ATL0x_YYYYMMDDHHMMSS_ttttccrr_vvv_ee
//!     tttt - reference ground track
//!     cc   - cycle
//!     rr   - region
//! ```
//!
//! The companion ATL08 granule shares the name with character 4 set to '8'.

use crate::error::{Result, SubsetError};

/// Orbital identifiers parsed out of a granule name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceIds {
    pub rgt: u16,
    pub cycle: u8,
    pub region: u8,
}

/// Parse `(rgt, cycle, region)` from a granule name.
///
/// Names shorter than 29 characters yield all zeros; a non-numeric substring
/// in a long-enough name is an error. Callers relying on the zeros path
/// should prefer validating the name up front.
pub fn parse_resource(resource: &str) -> Result<ResourceIds> {
    let bytes = resource.as_bytes();
    if bytes.len() < 29 {
        return Ok(ResourceIds::default());
    }

    let field = |range: std::ops::Range<usize>, name: &'static str| -> Result<u32> {
        let text = &resource[range];
        text.parse::<u32>().map_err(|_| SubsetError::Parse {
            resource: resource.to_string(),
            field: name,
            text: text.to_string(),
        })
    };

    Ok(ResourceIds {
        rgt: field(21..25, "rgt")? as u16,
        cycle: field(25..27, "cycle")? as u8,
        region: field(27..29, "region")? as u8,
    })
}

/// Derive the companion ATL08 granule name (character 4 replaced by '8').
pub fn atl08_companion(resource: &str) -> String {
    let mut name: Vec<u8> = resource.bytes().collect();
    if name.len() > 4 {
        name[4] = b'8';
    }
    String::from_utf8(name).unwrap_or_else(|_| resource.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCE: &str = "ATL03_20181019065445_03150111_005_01.h5";

    #[test]
    fn test_parse_canonical() {
        let ids = parse_resource(RESOURCE).unwrap();
        assert_eq!(ids.rgt, 315);
        assert_eq!(ids.cycle, 1);
        assert_eq!(ids.region, 11);
    }

    #[test]
    fn test_parse_round_trip() {
        let ids = parse_resource(RESOURCE).unwrap();
        let reformatted = format!(
            "ATL03_20181019065445_{:04}{:02}{:02}_005_01.h5",
            ids.rgt, ids.cycle, ids.region
        );
        assert_eq!(reformatted, RESOURCE);
        assert_eq!(parse_resource(&reformatted).unwrap(), ids);
    }

    #[test]
    fn test_parse_short_name_yields_zeros() {
        let ids = parse_resource("ATL03_shortname").unwrap();
        assert_eq!(ids, ResourceIds::default());
    }

    #[test]
    fn test_parse_non_numeric_is_error() {
        let bad = "ATL03_20181019065445_03xx0111_005_01.h5";
        assert!(matches!(
            parse_resource(bad),
            Err(SubsetError::Parse { field: "rgt", .. })
        ));
    }

    #[test]
    fn test_atl08_companion() {
        assert_eq!(
            atl08_companion(RESOURCE),
            "ATL08_20181019065445_03150111_005_01.h5"
        );
    }
}
