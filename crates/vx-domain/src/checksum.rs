use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Hash algorithms accepted in model checksum declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgo {
    Sha256,
    Sha512,
}

impl ChecksumAlgo {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// A declared content checksum, `<algo>:<hex>`.
///
/// A bare hex string is accepted and treated as sha256 for compatibility with
/// older spec files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    pub algo: ChecksumAlgo,
    pub hex: String,
}

impl Checksum {
    /// Parse and normalize a checksum declaration.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message when the algorithm is unknown or the
    /// digest is not hex of the expected length.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (algo_str, hex_part) = match raw.split_once(':') {
            Some((algo, hex)) => (algo.trim().to_ascii_lowercase(), hex.trim()),
            None => ("sha256".to_string(), raw),
        };
        let algo = match algo_str.as_str() {
            "sha256" => ChecksumAlgo::Sha256,
            "sha512" => ChecksumAlgo::Sha512,
            other => return Err(format!("unsupported checksum algorithm '{other}'")),
        };
        let hex = hex_part.to_ascii_lowercase();
        if hex.len() != algo.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!(
                "checksum digest must be {} hex characters for {}",
                algo.hex_len(),
                algo.as_str()
            ));
        }
        Ok(Self { algo, hex })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo.as_str(), self.hex)
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
