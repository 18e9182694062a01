// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// CPU family, affecting the default rack/slot encoding used in the COTP
/// connection request.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFamily {
    #[serde(rename = "S7-200", alias = "S7200", alias = "s7-200")]
    S7200,
    #[serde(rename = "S7-300", alias = "S7300", alias = "s7-300")]
    S7300,
    #[serde(rename = "S7-1200", alias = "S71200", alias = "s7-1200")]
    S71200,
    #[serde(rename = "S7-1500", alias = "S71500", alias = "s7-1500")]
    S71500,
    #[serde(rename = "S7-400", alias = "S7400", alias = "s7-400")]
    S7400,
    #[serde(rename = "LOGO!0BA8", alias = "LOGO_0BA8", alias = "logo_0ba8")]
    Logo0ba8,
}

impl fmt::Display for CpuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuFamily::S7200 => "S7-200",
            CpuFamily::S7300 => "S7-300",
            CpuFamily::S71200 => "S7-1200",
            CpuFamily::S71500 => "S7-1500",
            CpuFamily::S7400 => "S7-400",
            CpuFamily::Logo0ba8 => "LOGO!0BA8",
        })
    }
}

impl CpuFamily {
    /// Default rack/slot pair used when the caller does not override them.
    /// S7-1200/1500 CPUs commonly expose their PG/OP connection on slot 1
    /// of rack 0; S7-300/400 racks conventionally place the CPU in slot 2.
    pub const fn default_rack_slot(self) -> (u8, u8) {
        match self {
            CpuFamily::S7200 | CpuFamily::Logo0ba8 => (0, 1),
            CpuFamily::S71200 | CpuFamily::S71500 => (0, 1),
            CpuFamily::S7300 | CpuFamily::S7400 => (0, 2),
        }
    }
}
