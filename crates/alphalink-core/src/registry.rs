//! Table of supported headsets.
//!
//! Identity is the `(vendor_id, product_id)` pair. Per-model protocol
//! differences live in [`ReportLayout`] and are dispatched by the codec.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::status::FeatureFlags;

/// Kingston USB Vendor ID (first-generation Cloud Alpha Wireless dongles)
pub const KINGSTON_VID: u16 = 0x0951;
/// HP USB Vendor ID (HyperX after the HP acquisition)
pub const HP_VID: u16 = 0x03f0;
/// Vendor-specific control interface on the dongle
pub const CONTROL_INTERFACE: i32 = 3;

/// Per-model report layout quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLayout {
    /// Kingston-era firmware: 32-byte output reports, no mic-monitor state query.
    AlphaWirelessLegacy,
    /// HP-era firmware: 4-byte output reports, full state queries.
    AlphaWireless,
}

impl ReportLayout {
    /// Two leading bytes every valid report starts with.
    #[must_use]
    pub const fn marker(self) -> [u8; 2] {
        [0x21, 0xbb]
    }

    /// Shortest input report that can be decoded.
    #[must_use]
    pub const fn min_report_len(self) -> usize {
        4
    }

    /// Size of every output report written to the device.
    #[must_use]
    pub const fn output_report_len(self) -> usize {
        match self {
            Self::AlphaWirelessLegacy => 32,
            Self::AlphaWireless => 4,
        }
    }

    /// Features the firmware exposes.
    #[must_use]
    pub fn features(self) -> FeatureFlags {
        match self {
            Self::AlphaWirelessLegacy => {
                FeatureFlags::SLEEP_TIMER | FeatureFlags::VOICE_PROMPT | FeatureFlags::MIC_MONITOR
            }
            Self::AlphaWireless => FeatureFlags::all(),
        }
    }
}

/// A headset model this crate knows how to talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompatibleModel {
    pub vendor_id: u16,
    pub product_id: u16,
    pub display_name: &'static str,
    pub layout: ReportLayout,
    /// HID interface carrying the vendor reports
    pub control_interface: i32,
}

impl CompatibleModel {
    /// Features the model's firmware exposes.
    #[must_use]
    pub fn features(&self) -> FeatureFlags {
        self.layout.features()
    }
}

impl fmt::Display for CompatibleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:04x}:{:04x})", self.display_name, self.vendor_id, self.product_id)
    }
}

static MODELS: &[CompatibleModel] = &[
    CompatibleModel {
        vendor_id: KINGSTON_VID,
        product_id: 0x1743,
        display_name: "HyperX Cloud Alpha Wireless",
        layout: ReportLayout::AlphaWirelessLegacy,
        control_interface: CONTROL_INTERFACE,
    },
    CompatibleModel {
        vendor_id: HP_VID,
        product_id: 0x098d,
        display_name: "HyperX Cloud Alpha Wireless",
        layout: ReportLayout::AlphaWireless,
        control_interface: CONTROL_INTERFACE,
    },
];

/// All supported models.
#[must_use]
pub fn compatible_models() -> &'static [CompatibleModel] {
    MODELS
}

/// Look up a model by its USB identifiers.
#[must_use]
pub fn lookup(vendor_id: u16, product_id: u16) -> Option<&'static CompatibleModel> {
    MODELS.iter().find(|m| m.vendor_id == vendor_id && m.product_id == product_id)
}

/// Look up a model and check that `interface` is its control interface.
///
/// Interface numbers below zero mean the platform did not report one, in
/// which case the entry is accepted.
#[must_use]
pub fn candidate(
    vendor_id: u16,
    product_id: u16,
    interface: i32,
) -> Option<&'static CompatibleModel> {
    lookup(vendor_id, product_id).filter(|m| interface < 0 || interface == m.control_interface)
}
