//! Device fingerprinting.
//!
//! A fingerprint captures stable device attributes in four sections,
//! hashes each section, and can score how similar two fingerprints are.
//! The similarity score weights hardware highest because it changes least:
//! hardware 40%, display 30%, sensors 20%, network 10%.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crypto::sha256_hex;

/// Hardware identity of the device. Field weights in similarity scoring
/// reflect how strongly each field identifies a physical device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareAttributes {
    /// Device manufacturer.
    pub manufacturer: String,
    /// Marketing model name.
    pub model: String,
    /// Internal device code name.
    pub device: String,
    /// Board name.
    pub board: String,
    /// Primary CPU architecture.
    pub cpu_arch: String,
    /// Brand name.
    pub brand: String,
}

/// Display characteristics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayAttributes {
    /// Width in physical pixels.
    pub width_px: u32,
    /// Height in physical pixels.
    pub height_px: u32,
    /// Density in dots per inch.
    pub density_dpi: u32,
}

/// Network stack characteristics. Deliberately coarse; no identifiers that
/// change per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttributes {
    /// Network country code of the SIM operator, if present.
    pub network_country: String,
    /// Name of the SIM operator, if present.
    pub network_operator: String,
    /// Phone radio type (gsm, cdma, none).
    pub phone_type: String,
}

/// A complete device fingerprint: raw sections plus per-section hashes and
/// the composite hash sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFingerprint {
    /// Hardware section.
    pub hardware: HardwareAttributes,
    /// Display section.
    pub display: DisplayAttributes,
    /// Sorted sensor type identifiers present on the device.
    pub sensors: BTreeSet<String>,
    /// Network section.
    pub network: NetworkAttributes,
    /// Hex SHA-256 of the hardware section.
    pub hardware_hash: String,
    /// Hex SHA-256 of the display section.
    pub display_hash: String,
    /// Hex SHA-256 of the sensor list.
    pub sensors_hash: String,
    /// Hex SHA-256 of the network section.
    pub network_hash: String,
    /// Hex SHA-256 over all section hashes.
    pub composite_hash: String,
}

const WEIGHT_HARDWARE: f64 = 0.40;
const WEIGHT_DISPLAY: f64 = 0.30;
const WEIGHT_SENSORS: f64 = 0.20;
const WEIGHT_NETWORK: f64 = 0.10;

impl DeviceFingerprint {
    /// Builds a fingerprint from collected attributes, computing all
    /// hashes.
    #[must_use]
    pub fn new(
        hardware: HardwareAttributes,
        display: DisplayAttributes,
        sensors: BTreeSet<String>,
        network: NetworkAttributes,
    ) -> Self {
        let hardware_hash = sha256_hex(hardware_canonical(&hardware).as_bytes());
        let display_hash = sha256_hex(
            format!(
                "{}x{}@{}",
                display.width_px, display.height_px, display.density_dpi
            )
            .as_bytes(),
        );
        let sensors_canonical = sensors.iter().cloned().collect::<Vec<_>>().join(",");
        let sensors_hash = sha256_hex(sensors_canonical.as_bytes());
        let network_hash = sha256_hex(
            format!(
                "{}|{}|{}",
                network.network_country, network.network_operator, network.phone_type
            )
            .as_bytes(),
        );
        let composite_hash = sha256_hex(
            format!("{hardware_hash}{display_hash}{sensors_hash}{network_hash}").as_bytes(),
        );
        Self {
            hardware,
            display,
            sensors,
            network,
            hardware_hash,
            display_hash,
            sensors_hash,
            network_hash,
            composite_hash,
        }
    }

    /// Scores similarity against another fingerprint in `[0.0, 1.0]`.
    ///
    /// Sections are scored independently and combined with fixed weights:
    /// hardware 0.40, display 0.30, sensors 0.20, network 0.10. Hardware
    /// compares field by field with per-field weights; display is all or
    /// nothing; sensors use Jaccard similarity; network is the fraction of
    /// matching fields.
    #[must_use]
    pub fn similarity(&self, other: &Self) -> f64 {
        WEIGHT_HARDWARE * hardware_similarity(&self.hardware, &other.hardware)
            + WEIGHT_DISPLAY * display_similarity(&self.display, &other.display)
            + WEIGHT_SENSORS * jaccard(&self.sensors, &other.sensors)
            + WEIGHT_NETWORK * network_similarity(&self.network, &other.network)
    }

    /// Reports whether two fingerprints are byte-identical.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.composite_hash == other.composite_hash
    }
}

fn hardware_canonical(hw: &HardwareAttributes) -> String {
    [
        hw.manufacturer.as_str(),
        hw.model.as_str(),
        hw.device.as_str(),
        hw.board.as_str(),
        hw.cpu_arch.as_str(),
        hw.brand.as_str(),
    ]
    .join("|")
}

fn hardware_similarity(a: &HardwareAttributes, b: &HardwareAttributes) -> f64 {
    // Field weights: strong identifiers count triple, weak ones once.
    let fields: [(&str, &str, f64); 6] = [
        (&a.manufacturer, &b.manufacturer, 3.0),
        (&a.model, &b.model, 3.0),
        (&a.device, &b.device, 2.0),
        (&a.board, &b.board, 2.0),
        (&a.cpu_arch, &b.cpu_arch, 2.0),
        (&a.brand, &b.brand, 1.0),
    ];
    let total: f64 = fields.iter().map(|(_, _, w)| w).sum();
    let matched: f64 = fields
        .iter()
        .filter(|(x, y, _)| x == y)
        .map(|(_, _, w)| w)
        .sum();
    matched / total
}

fn display_similarity(a: &DisplayAttributes, b: &DisplayAttributes) -> f64 {
    if a == b {
        1.0
    } else {
        0.0
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

fn network_similarity(a: &NetworkAttributes, b: &NetworkAttributes) -> f64 {
    let matches = u32::from(a.network_country == b.network_country)
        + u32::from(a.network_operator == b.network_operator)
        + u32::from(a.phone_type == b.phone_type);
    f64::from(matches) / 3.0
}
