//! Client-side shape of the binary key-value wire protocol: 24-byte
//! big-endian headers, optional flexible framing extras, opcodes, statuses,
//! feature negotiation values, sub-document specs and the server error map.

mod error_map;
mod frame;
mod hello;
mod opcode;
mod status;
pub mod subdoc;

pub use error_map::{ErrorMap, ErrorMapEntry};
pub use frame::{RequestFrame, ResponseFrame, HEADER_SIZE};
pub use hello::HelloFeature;
pub use opcode::Opcode;
pub use status::Status;

use bitflags::bitflags;

/// First header byte of each frame variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request = 0x80,
    FlexibleRequest = 0x08,
    Response = 0x81,
    FlexibleResponse = 0x18,
}

impl Magic {
    pub fn parse(raw: u8) -> Option<Magic> {
        Some(match raw {
            0x80 => Magic::Request,
            0x08 => Magic::FlexibleRequest,
            0x81 => Magic::Response,
            0x18 => Magic::FlexibleResponse,
            _ => return None,
        })
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Magic::Response | Magic::FlexibleResponse)
    }
}

bitflags! {
    /// Value datatype bits carried in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataType: u8 {
        const RAW = 0x00;
        const JSON = 0x01;
        const SNAPPY = 0x02;
        const XATTR = 0x04;
    }
}

/// Write-persistence guarantee requested for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityLevel {
    #[default]
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl DurabilityLevel {
    pub fn code(&self) -> u8 {
        match self {
            DurabilityLevel::None => 0x00,
            DurabilityLevel::Majority => 0x01,
            DurabilityLevel::MajorityAndPersistToActive => 0x02,
            DurabilityLevel::PersistToMajority => 0x03,
        }
    }
}
