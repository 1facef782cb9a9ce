//! Device catalog: product ids, families, and family-specific registers.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use crate::link::Parity;

/// Device family recognised by the AN2606 catalog.
///
/// A family groups parts that share a flash map and register layout. The
/// protocol works without one (read, write and erase take caller-supplied
/// addresses), but flash-size and UID introspection need it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Family {
    F0,
    F1,
    F2,
    F3,
    F4,
    F7,
    H7,
    L0,
    L1,
    L4,
    G0,
    G4,
    WB,
    WL,
    /// BlueNRG-1/2, the AN4872 no-parity variant
    BlueNrg,
    /// Wiznet W7500, an STM32-compatible third-party part
    W7500,
}

/// Product id to family, from the device-dependent parameters table in
/// AN2606. The high four bits of an id are always zero on ST parts.
const PRODUCT_IDS: &[(u16, Family)] = &[
    (0x440, Family::F0), // F05x / F030x8
    (0x442, Family::F0), // F09x / F030xC
    (0x444, Family::F0), // F03x
    (0x445, Family::F0), // F04x / F070x6
    (0x448, Family::F0), // F070xB / F071 / F072
    (0x410, Family::F1), // F10x medium-density
    (0x412, Family::F1), // F10x low-density
    (0x414, Family::F1), // F10x high-density
    (0x418, Family::F1), // F105 / F107
    (0x420, Family::F1), // F10x medium-density value line
    (0x428, Family::F1), // F10x high-density value line
    (0x430, Family::F1), // F10x XL-density
    (0x411, Family::F2),
    (0x422, Family::F3), // F302xB(C) / F303xB(C) / F358
    (0x432, Family::F3), // F373 / F378
    (0x438, Family::F3), // F303x4(6/8) / F334 / F328
    (0x439, Family::F3), // F301 / F302x4(6/8) / F318
    (0x446, Family::F3), // F302xD(E) / F303xD(E) / F398
    (0x413, Family::F4), // F40x / F41x
    (0x419, Family::F4), // F42x / F43x
    (0x421, Family::F4), // F446
    (0x423, Family::F4), // F401xB(C)
    (0x431, Family::F4), // F411
    (0x433, Family::F4), // F401xD(E)
    (0x434, Family::F4), // F469 / F479
    (0x441, Family::F4), // F412
    (0x458, Family::F4), // F410
    (0x463, Family::F4), // F413 / F423
    (0x449, Family::F7), // F74x / F75x
    (0x451, Family::F7), // F76x / F77x
    (0x452, Family::F7), // F72x / F73x
    (0x450, Family::H7), // H743 / H753 / H750
    (0x480, Family::H7), // H7A3 / H7B3
    (0x483, Family::H7), // H72x / H73x
    (0x417, Family::L0), // L05x / L06x
    (0x425, Family::L0), // L031 / L041
    (0x447, Family::L0), // L07x / L08x
    (0x457, Family::L0), // L01x / L02x
    (0x416, Family::L1), // L1 cat.1
    (0x427, Family::L1), // L1 cat.3
    (0x429, Family::L1), // L1 cat.2
    (0x436, Family::L1), // L1 cat.4
    (0x437, Family::L1), // L1 cat.5
    (0x415, Family::L4), // L47x / L48x
    (0x435, Family::L4), // L43x / L44x
    (0x461, Family::L4), // L496 / L4A6
    (0x462, Family::L4), // L45x / L46x
    (0x470, Family::L4), // L4Rx / L4Sx
    (0x471, Family::L4), // L4P5 / L4Q5
    (0x456, Family::G0), // G05x / G06x
    (0x460, Family::G0), // G07x / G08x
    (0x466, Family::G0), // G03x / G04x
    (0x467, Family::G0), // G0B1 / G0C1
    (0x468, Family::G4), // G431 / G441
    (0x469, Family::G4), // G47x / G48x
    (0x479, Family::G4), // G491 / G4A1
    (0x495, Family::WB), // WB55 / WB35
    (0x497, Family::WL), // WL54 / WL55 / WLE4 / WLE5
    (0x003, Family::BlueNrg),
    (0x801, Family::W7500),
];

impl Family {
    /// Look a product id up in the catalog.
    pub fn from_product_id(id: u16) -> Option<Self> {
        PRODUCT_IDS
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, family)| *family)
    }

    /// Wire parity this family's bootloader expects.
    #[inline]
    pub fn parity(&self) -> Parity {
        match *self {
            Family::BlueNrg => Parity::None,
            _ => Parity::Even,
        }
    }

    /// Address of the flash-size register, when one is documented.
    pub fn flash_size_register(&self) -> Option<u32> {
        match *self {
            Family::F0 | Family::F3 => Some(0x1FFF_F7CC),
            Family::F1 => Some(0x1FFF_F7E0),
            Family::F2 | Family::F4 => Some(0x1FFF_7A22),
            Family::F7 => Some(0x1FF0_F442),
            Family::H7 => Some(0x1FF1_E880),
            Family::L0 => Some(0x1FF8_007C),
            // cat.3 and later parts move this to 0x1FF8_00CC
            Family::L1 => Some(0x1FF8_004C),
            Family::L4 | Family::G0 | Family::G4 | Family::WB | Family::WL => Some(0x1FFF_75E0),
            Family::BlueNrg => Some(0x4010_0014),
            Family::W7500 => None,
        }
    }

    /// Address of the 96-bit unique device id, when one is documented.
    pub fn uid_register(&self) -> Option<u32> {
        match *self {
            Family::F0 | Family::F3 => Some(0x1FFF_F7AC),
            Family::F1 => Some(0x1FFF_F7E8),
            Family::F2 | Family::F4 => Some(0x1FFF_7A10),
            Family::F7 => Some(0x1FF0_F420),
            Family::H7 => Some(0x1FF1_E800),
            Family::L0 | Family::L1 => Some(0x1FF8_0050),
            Family::L4 | Family::G0 | Family::G4 | Family::WB | Family::WL => Some(0x1FFF_7590),
            Family::BlueNrg | Family::W7500 => None,
        }
    }

    /// Width in bytes of the flash-size register.
    pub fn flash_size_register_width(&self) -> usize {
        match *self {
            Family::BlueNrg => 4,
            _ => 2,
        }
    }

    /// Decode the raw register contents into a flash size in bytes.
    ///
    /// STM32 parts store the size in KiB in a 16-bit little-endian register;
    /// BlueNRG stores the word count minus one.
    pub fn decode_flash_size(&self, raw: &[u8]) -> u32 {
        match *self {
            Family::BlueNrg => {
                let words = u32::from_le_bytes(raw[..4].try_into().unwrap());
                (words + 1) * 4
            }
            _ => {
                let kib = u16::from_le_bytes(raw[..2].try_into().unwrap());
                u32::from(kib) * 1024
            }
        }
    }
}

impl Display for Family {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Family::F0 => "F0",
            Family::F1 => "F1",
            Family::F2 => "F2",
            Family::F3 => "F3",
            Family::F4 => "F4",
            Family::F7 => "F7",
            Family::H7 => "H7",
            Family::L0 => "L0",
            Family::L1 => "L1",
            Family::L4 => "L4",
            Family::G0 => "G0",
            Family::G4 => "G4",
            Family::WB => "WB",
            Family::WL => "WL",
            Family::BlueNrg => "BlueNRG",
            Family::W7500 => "W7500",
        };
        fmt.write_str(name)
    }
}

#[derive(Debug)]
pub struct ParseFamilyError;

impl Display for ParseFamilyError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "invalid family, expected one of: F0, F1, F2, F3, F4, F7, H7, L0, L1, L4, G0, G4, WB, WL, NRG, W7500"
        )
    }
}

impl std::error::Error for ParseFamilyError {}

impl FromStr for Family {
    type Err = ParseFamilyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "F0" => Ok(Family::F0),
            "F1" => Ok(Family::F1),
            "F2" => Ok(Family::F2),
            "F3" => Ok(Family::F3),
            "F4" => Ok(Family::F4),
            "F7" => Ok(Family::F7),
            "H7" => Ok(Family::H7),
            "L0" => Ok(Family::L0),
            "L1" => Ok(Family::L1),
            "L4" => Ok(Family::L4),
            "G0" => Ok(Family::G0),
            "G4" => Ok(Family::G4),
            "WB" => Ok(Family::WB),
            "WL" => Ok(Family::WL),
            "NRG" | "BLUENRG" => Ok(Family::BlueNrg),
            "W7500" => Ok(Family::W7500),
            _ => Err(ParseFamilyError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[Family] = &[
        Family::F0,
        Family::F1,
        Family::F2,
        Family::F3,
        Family::F4,
        Family::F7,
        Family::H7,
        Family::L0,
        Family::L1,
        Family::L4,
        Family::G0,
        Family::G4,
        Family::WB,
        Family::WL,
        Family::BlueNrg,
        Family::W7500,
    ];

    #[test]
    fn known_product_ids_resolve() {
        assert_eq!(Some(Family::F0), Family::from_product_id(0x440));
        assert_eq!(Some(Family::F1), Family::from_product_id(0x410));
        assert_eq!(Some(Family::F4), Family::from_product_id(0x413));
        assert_eq!(Some(Family::H7), Family::from_product_id(0x450));
        assert_eq!(Some(Family::WL), Family::from_product_id(0x497));
        assert_eq!(Some(Family::W7500), Family::from_product_id(0x801));
        assert_eq!(None, Family::from_product_id(0xFFF));
    }

    #[test]
    fn every_catalog_entry_has_register_data_or_is_marked_unknown() {
        for (id, family) in PRODUCT_IDS {
            // families without documented registers are an explicit decision,
            // not a table gap
            let introspectable =
                family.flash_size_register().is_some() && family.uid_register().is_some();
            let marked_unknown = matches!(family, Family::BlueNrg | Family::W7500);
            assert!(
                introspectable || marked_unknown,
                "product id {id:#05X} ({family}) has incomplete register data"
            );
        }
    }

    #[test]
    fn every_family_appears_in_the_product_id_table() {
        for family in ALL {
            assert!(
                PRODUCT_IDS.iter().any(|(_, f)| f == family),
                "{family} has no product id entry"
            );
        }
    }

    #[test]
    fn parity_is_even_except_for_bluenrg() {
        for family in ALL {
            let expected = if *family == Family::BlueNrg {
                Parity::None
            } else {
                Parity::Even
            };
            assert_eq!(expected, family.parity(), "{family}");
        }
    }

    #[test]
    fn flash_size_decoding() {
        // 0x0400 KiB on an F4 is 1 MiB
        assert_eq!(1024 * 1024, Family::F4.decode_flash_size(&[0x00, 0x04]));
        // BlueNRG-2: 0x3FFFF words - 1 decodes to 256 KiB
        assert_eq!(
            256 * 1024,
            Family::BlueNrg.decode_flash_size(&[0xFF, 0xFF, 0x03, 0x00])
        );
        assert_eq!(4, Family::BlueNrg.flash_size_register_width());
        assert_eq!(2, Family::F1.flash_size_register_width());
    }

    #[test]
    fn family_parses_cli_spellings() {
        assert_eq!(Family::F4, "f4".parse().unwrap());
        assert_eq!(Family::BlueNrg, "NRG".parse().unwrap());
        assert_eq!(Family::W7500, "w7500".parse().unwrap());
        assert!("STM8".parse::<Family>().is_err());
    }
}
