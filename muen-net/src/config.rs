//! Per-interface configuration (addition, recovered from the module
//! parameter arrays `name[]`/`in[]`/`out[]`/... in `muennet/net.c`).
//!
//! Where the original read one array index per interface out of a set of
//! parallel module-parameter arrays, this crate takes one `InterfaceConfig`
//! per interface and deserializes a whole fleet as `Vec<InterfaceConfig>`,
//! the way `core/src/channel.rs` deserializes its sampling/queuing channel
//! tables.
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};

/// The `+`-separated flag set from the original's `parse_flags()`, checked
/// against `flag_names[]` (`net_hdr`, `eth_dev`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub net_hdr: bool,
    pub eth_dev: bool,
}

impl Flags {
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut flags = Flags::default();
        if s.is_empty() {
            return Ok(flags);
        }
        for name in s.split('+') {
            match name {
                "net_hdr" => flags.net_hdr = true,
                "eth_dev" => flags.eth_dev = true,
                other => return Err(format!("unknown interface flag {other:?}")),
            }
        }
        Ok(flags)
    }
}

impl<'de> Deserialize<'de> for Flags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlagsVisitor;

        impl<'de> Visitor<'de> for FlagsVisitor {
            type Value = Flags;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a '+'-separated list of interface flags")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Flags, E> {
                Flags::parse(v).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(FlagsVisitor)
    }
}

fn default_mtu() -> u32 {
    1500
}

/// One framer interface, carrying exactly the recognised options table plus
/// a name. `in`/`out` are Rust keywords, so the sinfo-name fields are
/// spelled out and renamed on (de)serialization to match the wire option
/// names.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,

    #[serde(rename = "in", default)]
    pub input: Option<String>,

    #[serde(rename = "out", default)]
    pub output: Option<String>,

    #[serde(default = "default_mtu")]
    pub mtu: u32,

    #[serde(default)]
    pub pmtu: Option<String>,

    #[serde(default)]
    pub flags: Flags,

    pub writer_protocol: u64,
    pub reader_protocol: u64,

    #[serde(default)]
    pub poll: u64,
}

impl InterfaceConfig {
    pub fn is_send_only(&self) -> bool {
        self.input.is_none()
    }

    pub fn is_recv_only(&self) -> bool {
        self.output.is_none()
    }
}
