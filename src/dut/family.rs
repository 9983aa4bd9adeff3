//! Product families and their family-specific behaviour.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StationError;

/// Product family, resolved once from the product type of the barcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductFamily {
    Pearl,
    Amber,
    Amber2,
    Garnet,
    Jamber,
}

impl ProductFamily {
    /// Map a product type (`AGIGA98xx`) to its family.
    pub fn from_product_type(product_type: &str) -> Result<Self, StationError> {
        match product_type {
            "AGIGA9821" => Ok(ProductFamily::Pearl),
            "AGIGA9822" | "AGIGA9823" | "AGIGA9824" => Ok(ProductFamily::Amber),
            "AGIGA9831" => Ok(ProductFamily::Garnet),
            "AGIGA9832" => Ok(ProductFamily::Amber2),
            "AGIGA9834" => Ok(ProductFamily::Jamber),
            other => Err(StationError::UnknownProductType(other.to_string())),
        }
    }

    /// Product-type code programmed into the fixture controller for the slot.
    ///
    /// Amber2 and Jamber run on the Amber fixture profile.
    pub fn fixture_code(self) -> u8 {
        match self {
            ProductFamily::Pearl => 0x00,
            ProductFamily::Amber | ProductFamily::Amber2 | ProductFamily::Jamber => 0x01,
            ProductFamily::Garnet => 0x02,
        }
    }

    /// Capacitance measurement is started through the extended command register.
    pub fn uses_extended_cap_start(self) -> bool {
        matches!(self, ProductFamily::Jamber)
    }

    /// Discharge checks the boost bypass path and samples without delay near the threshold.
    pub fn has_bypass_check(self) -> bool {
        matches!(self, ProductFamily::Garnet)
    }
}

impl fmt::Display for ProductFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProductFamily::Pearl => "Pearl",
            ProductFamily::Amber => "Amber",
            ProductFamily::Amber2 => "Amber2",
            ProductFamily::Garnet => "Garnet",
            ProductFamily::Jamber => "Jamber",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_table() {
        let cases = [
            ("AGIGA9821", ProductFamily::Pearl, 0x00),
            ("AGIGA9822", ProductFamily::Amber, 0x01),
            ("AGIGA9823", ProductFamily::Amber, 0x01),
            ("AGIGA9824", ProductFamily::Amber, 0x01),
            ("AGIGA9831", ProductFamily::Garnet, 0x02),
            ("AGIGA9832", ProductFamily::Amber2, 0x01),
            ("AGIGA9834", ProductFamily::Jamber, 0x01),
        ];
        for (pt, family, code) in cases {
            let resolved = ProductFamily::from_product_type(pt).unwrap();
            assert_eq!(resolved, family, "{pt}");
            assert_eq!(resolved.fixture_code(), code, "{pt}");
        }
    }

    #[test]
    fn test_unknown_product_type() {
        assert!(matches!(
            ProductFamily::from_product_type("AGIGA9603"),
            Err(StationError::UnknownProductType(_))
        ));
    }

    #[test]
    fn test_family_specific_flags() {
        assert!(ProductFamily::Jamber.uses_extended_cap_start());
        assert!(!ProductFamily::Amber.uses_extended_cap_start());
        assert!(ProductFamily::Garnet.has_bypass_check());
        for family in [
            ProductFamily::Pearl,
            ProductFamily::Amber,
            ProductFamily::Amber2,
            ProductFamily::Jamber,
        ] {
            assert!(!family.has_bypass_check());
        }
    }
}
